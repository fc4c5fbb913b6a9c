// Stage dispatch
//
// Brackets the stages of a filament move with rewinder modes: the mode is set
// when a stage starts and the rewinder is stopped when it ends, on every exit
// path of the wrapped stage.

use std::collections::BTreeMap;
use std::error::Error;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::link::LinkError;
use crate::motor::{CommandSink, ProtocolError, RewindMode, Rewinder};

/// Stage identifiers used by the filament-handling host
pub mod stages {
    pub const COURSE_UNLOAD: &str = "Course unloading move from bowden";
    pub const COURSE_LOAD: &str = "Course loading move into bowden";
    pub const REVERSE_HOME_EXTRUDER: &str = "Reverse homing to extruder sensor";
    pub const REVERSE_HOME_TOOLHEAD: &str = "Reverse homing to toolhead sensor";
    pub const REVERSE_HOME_GATE: &str = "Reverse homing to gate sensor";
    pub const PRE_UNLOAD_TEST: &str = "Bowden pre-unload test";
    pub const UNLOAD_EXTRUDER: &str = "Unloading extruder";
    pub const FINAL_PARKING: &str = "Final parking";
}

/// What the dispatcher needs from the filament-handling host
pub trait FilamentHost {
    /// Gate currently selected, which is also the rewinder index
    fn selected_gate(&self) -> Option<usize>;

    /// Whether the selected gate is fed from a buffer
    fn gate_available(&self) -> bool;

    /// Block until the host's queued moves have finished
    fn wait_moves(&self);

    /// Hard pause of the filament-handling sequence
    fn pause(&self, reason: &str);
}

/// Chooses rewinder modes around filament-move stages
pub trait RewindModeProvider {
    /// Returns the mode set for this stage, `None` if the stage leaves the
    /// rewinder alone
    fn on_stage_enter(&mut self, stage: &str) -> Result<Option<RewindMode>, StageError>;

    fn on_stage_exit(&mut self, stage: &str) -> Result<(), StageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("No rewinder configured with index {0}")]
    UnknownRewinder(usize),

    #[error("Stage {stage:?} failed: {source}")]
    Move {
        stage: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

#[derive(Debug, Clone, Copy)]
enum ModeRule {
    Fixed(RewindMode),
    /// Depends on whether the gate is fed from a buffer
    Gate {
        available: RewindMode,
        unavailable: RewindMode,
    },
}

#[derive(Debug, Clone, Copy)]
struct StageRule {
    enter: ModeRule,
    exit: RewindMode,
    /// Wait for queued moves and commands after the exit
    terminal: bool,
}

impl StageRule {
    const fn fixed(mode: RewindMode) -> Self {
        Self {
            enter: ModeRule::Fixed(mode),
            exit: RewindMode::Stop,
            terminal: false,
        }
    }
}

fn stage_rule(stage: &str) -> Option<StageRule> {
    use stages::*;

    let rule = match stage {
        COURSE_UNLOAD => StageRule::fixed(RewindMode::RewindFast),
        REVERSE_HOME_EXTRUDER | REVERSE_HOME_TOOLHEAD | REVERSE_HOME_GATE | PRE_UNLOAD_TEST
        | UNLOAD_EXTRUDER => StageRule::fixed(RewindMode::RewindSlow),
        FINAL_PARKING => StageRule {
            terminal: true,
            ..StageRule::fixed(RewindMode::RewindSlow)
        },
        COURSE_LOAD => StageRule {
            enter: ModeRule::Gate {
                available: RewindMode::LoadFast,
                unavailable: RewindMode::LoadSlow,
            },
            ..StageRule::fixed(RewindMode::LoadSlow)
        },
        _ => return None,
    };
    Some(rule)
}

struct ActiveStage {
    stage: String,
    gate: usize,
    exit: RewindMode,
    terminal: bool,
    since: Instant,
}

pub struct PhaseDispatcher<H, S: CommandSink> {
    host: H,
    rewinders: BTreeMap<usize, Rewinder<S>>,
    active: Option<ActiveStage>,
    drain_timeout: Duration,
}

impl<H: FilamentHost, S: CommandSink> PhaseDispatcher<H, S> {
    pub fn new(
        host: H,
        rewinders: impl IntoIterator<Item = Rewinder<S>>,
        drain_timeout: Duration,
    ) -> Self {
        let rewinders = rewinders
            .into_iter()
            .map(|rewinder| (rewinder.index(), rewinder))
            .collect();
        Self {
            host,
            rewinders,
            active: None,
            drain_timeout,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn rewinder(&self, index: usize) -> Option<&Rewinder<S>> {
        self.rewinders.get(&index)
    }

    pub fn rewinders(&self) -> impl Iterator<Item = &Rewinder<S>> {
        self.rewinders.values()
    }

    pub fn rewinders_mut(&mut self) -> impl Iterator<Item = &mut Rewinder<S>> {
        self.rewinders.values_mut()
    }

    /// Name and age of the stage bracket currently open
    pub fn active_stage(&self) -> Option<(&str, Duration)> {
        self.active
            .as_ref()
            .map(|active| (active.stage.as_str(), active.since.elapsed()))
    }

    /// Mode a stage would set right now, without touching any motor
    pub fn resolve(&self, stage: &str) -> Option<RewindMode> {
        let rule = stage_rule(stage)?;
        Some(match rule.enter {
            ModeRule::Fixed(mode) => mode,
            ModeRule::Gate {
                available,
                unavailable,
            } => {
                if self.host.gate_available() {
                    available
                } else {
                    unavailable
                }
            }
        })
    }

    /// Run `body` as stage `stage`, bracketed by the stage's rewinder mode
    ///
    /// The exit runs exactly once, also when `body` fails or panics.
    pub fn run_stage<T, E, F>(&mut self, stage: &str, body: F) -> Result<T, StageError>
    where
        F: FnOnce() -> Result<T, E>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        if self.on_stage_enter(stage)?.is_none() {
            return body().map_err(|e| move_error(stage, e));
        }

        let guard = StageGuard {
            dispatcher: self,
            stage,
            armed: true,
        };
        let result = body();
        let exit = guard.finish();

        match (result, exit) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(move_error(stage, e)),
            (Err(e), Err(exit_error)) => {
                warn!("Exit of stage {:?} also failed: {}", stage, exit_error);
                Err(move_error(stage, e))
            }
        }
    }

    /// Set `mode` on the selected gate's rewinder, if any
    pub fn rewind_control(&mut self, mode: RewindMode) -> Result<(), StageError> {
        match self.host.selected_gate() {
            Some(gate) if self.rewinders.contains_key(&gate) => self.apply(gate, mode),
            _ => Ok(()),
        }
    }

    /// Set a mode given by name on rewinder `id`
    pub fn rewind_control_id(&mut self, id: usize, mode: &str) -> Result<(), StageError> {
        let mode: RewindMode = mode.parse()?;
        if !self.rewinders.contains_key(&id) {
            return Err(StageError::UnknownRewinder(id));
        }
        self.apply(id, mode)
    }

    /// Close the open stage bracket, if any
    pub fn force_release(&mut self) -> Result<(), StageError> {
        if let Some(active) = &self.active {
            warn!("Releasing stage {:?} without an exit", active.stage);
        }
        self.release()
    }

    fn release(&mut self) -> Result<(), StageError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        debug!("Leaving stage {:?} on gate {}", active.stage, active.gate);
        self.apply(active.gate, active.exit)?;

        if active.terminal {
            self.host.wait_moves();
            if let Some(rewinder) = self.rewinders.get(&active.gate) {
                rewinder
                    .drain(self.drain_timeout)
                    .map_err(|e| self.fault(e))?;
            }
            info!("Stage {:?} drained", active.stage);
        }
        Ok(())
    }

    fn apply(&mut self, gate: usize, mode: RewindMode) -> Result<(), StageError> {
        let rewinder = self
            .rewinders
            .get_mut(&gate)
            .ok_or(StageError::UnknownRewinder(gate))?;
        let result = rewinder.set_mode(mode);
        result.map(|_| ()).map_err(|e| self.fault(e))
    }

    /// The motor state is unknown after a link fault; stop the sequence
    fn fault(&self, error: LinkError) -> StageError {
        let reason = format!("Rewinder link fault: {}", error);
        error!("{}", reason);
        self.host.pause(&reason);
        StageError::Link(error)
    }
}

impl<H: FilamentHost, S: CommandSink> RewindModeProvider for PhaseDispatcher<H, S> {
    fn on_stage_enter(&mut self, stage: &str) -> Result<Option<RewindMode>, StageError> {
        let Some(rule) = stage_rule(stage) else {
            return Ok(None);
        };

        if let Some(active) = &self.active {
            warn!(
                "Stage {:?} entered while {:?} is still open",
                stage, active.stage
            );
            self.release()?;
        }

        let Some(gate) = self.host.selected_gate() else {
            debug!("No gate selected, stage {:?} leaves rewinders alone", stage);
            return Ok(None);
        };
        if !self.rewinders.contains_key(&gate) {
            debug!("No rewinder for gate {}", gate);
            return Ok(None);
        }

        let Some(mode) = self.resolve(stage) else {
            return Ok(None);
        };
        self.apply(gate, mode)?;
        self.active = Some(ActiveStage {
            stage: stage.to_string(),
            gate,
            exit: rule.exit,
            terminal: rule.terminal,
            since: Instant::now(),
        });
        debug!("Entered stage {:?}: gate {} {}", stage, gate, mode);
        Ok(Some(mode))
    }

    fn on_stage_exit(&mut self, stage: &str) -> Result<(), StageError> {
        if stage_rule(stage).is_none() {
            return Ok(());
        }
        if let Some(active) = &self.active {
            if active.stage != stage {
                warn!(
                    "Exit of {:?} while {:?} is open, stopping anyway",
                    stage, active.stage
                );
            }
        }
        self.release()
    }
}

fn move_error<E>(stage: &str, error: E) -> StageError
where
    E: Into<Box<dyn Error + Send + Sync>>,
{
    StageError::Move {
        stage: stage.to_string(),
        source: error.into(),
    }
}

/// Exits the stage when dropped unless `finish` ran first
struct StageGuard<'a, H: FilamentHost, S: CommandSink> {
    dispatcher: &'a mut PhaseDispatcher<H, S>,
    stage: &'a str,
    armed: bool,
}

impl<H: FilamentHost, S: CommandSink> StageGuard<'_, H, S> {
    fn finish(mut self) -> Result<(), StageError> {
        self.armed = false;
        self.dispatcher.on_stage_exit(self.stage)
    }
}

impl<H: FilamentHost, S: CommandSink> Drop for StageGuard<'_, H, S> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.dispatcher.on_stage_exit(self.stage) {
                error!("Failed to stop rewinder after stage {:?}: {}", self.stage, e);
            }
        }
    }
}
