// Per-motor command sequencing
//
// Turns velocity requests into timed duty-cycle steps, enforcing the driver's
// minimum switching period, and hands each accepted command to a sink.

use serde::Serialize;
use tracing::debug;

use super::encoder::{self, ChannelPair, DecayMode, EncoderParams};
use crate::config::{ConfigError, RewinderConfig};
use crate::link::LinkError;

/// Minimum time between two duty changes on the same motor, in seconds
pub const MIN_COMMAND_INTERVAL: f64 = 0.100;

/// A duty-cycle change scheduled at `at` seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DutyStep {
    pub at: f64,
    pub duty: ChannelPair,
}

/// One accepted `set_speed` request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorCommand {
    /// Requested velocity after clamping to [-1, 1]
    pub velocity: f32,
    /// Velocity after power limiting
    pub effective: f32,
    pub decay: DecayMode,
    /// Kick-start pulse, applied before `steady`
    pub kick: Option<DutyStep>,
    pub steady: DutyStep,
    /// Pulse magnitude after power limiting, 0 without kick
    pub kick_speed: f32,
    /// Pulse duration in seconds, 0 without kick
    pub kick_time: f32,
}

impl MotorCommand {
    /// Duty steps in application order
    pub fn steps(&self) -> impl Iterator<Item = DutyStep> + '_ {
        self.kick.iter().copied().chain(std::iter::once(self.steady))
    }
}

/// Receives the commands a controller issues
pub trait CommandSink {
    /// Whether commands can currently be delivered
    fn ready(&self) -> Result<(), LinkError> {
        Ok(())
    }

    /// Hand `cmd` over for delivery. On error the command is not issued.
    fn schedule(&mut self, cmd: &MotorCommand) -> Result<(), LinkError>;

    /// Wait until everything scheduled so far has been delivered
    fn drain(&self, _timeout: std::time::Duration) -> Result<(), LinkError> {
        Ok(())
    }
}

/// Last issued command of one motor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorState {
    pub last_velocity: f32,
    pub last_decay_mode: DecayMode,
    pub last_command_time: Option<f64>,
}

impl Default for MotorState {
    fn default() -> Self {
        Self {
            last_velocity: 0.0,
            last_decay_mode: DecayMode::Fast,
            last_command_time: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotorStatus {
    pub velocity: f32,
    pub decay_mode: DecayMode,
}

pub struct MotorController<S> {
    params: EncoderParams,
    state: MotorState,
    sink: S,
}

impl<S: CommandSink> MotorController<S> {
    pub fn new(params: EncoderParams, sink: S) -> Result<Self, ConfigError> {
        validate(&params)?;
        Ok(Self {
            params,
            state: MotorState::default(),
            sink,
        })
    }

    pub fn from_config(cfg: &RewinderConfig, sink: S) -> Result<Self, ConfigError> {
        Self::new(
            EncoderParams {
                max_power: cfg.max_power,
                kick_start_speed: cfg.startup_speed,
                kick_start_time: cfg.startup_duration,
            },
            sink,
        )
    }

    /// Request a new velocity no earlier than `requested_time`
    ///
    /// Returns the time at which the motor reaches the steady-state duty.
    /// Repeating the last issued velocity and decay mode is a no-op. If the
    /// sink rejects the command the state is left as it was.
    pub fn set_speed(
        &mut self,
        requested_time: f64,
        velocity: f32,
        decay: DecayMode,
    ) -> Result<f64, LinkError> {
        let velocity = encoder::clamp_velocity(velocity);
        let previous = self.state;

        // The first command always goes out: the driver state is unknown until then
        if let Some(last) = previous.last_command_time {
            if velocity == previous.last_velocity && decay == previous.last_decay_mode {
                return Ok(requested_time.max(last));
            }
        }

        let effective_time = match previous.last_command_time {
            Some(last) => requested_time.max(last + MIN_COMMAND_INTERVAL),
            None => requested_time,
        };

        let steady_duty = encoder::encode(velocity, decay, self.params.max_power);
        let kick = encoder::kick_start(previous.last_velocity, velocity, decay, &self.params);

        let cmd = match kick {
            Some(pulse) => {
                let kick_time = self.params.kick_start_time;
                MotorCommand {
                    velocity,
                    effective: velocity * self.params.max_power,
                    decay,
                    kick: Some(DutyStep {
                        at: effective_time,
                        duty: pulse,
                    }),
                    steady: DutyStep {
                        at: effective_time + f64::from(kick_time),
                        duty: steady_duty,
                    },
                    kick_speed: self.params.kick_start_speed.clamp(0.0, 1.0) * self.params.max_power,
                    kick_time,
                }
            }
            None => MotorCommand {
                velocity,
                effective: velocity * self.params.max_power,
                decay,
                kick: None,
                steady: DutyStep {
                    at: effective_time,
                    duty: steady_duty,
                },
                kick_speed: 0.0,
                kick_time: 0.0,
            },
        };

        self.sink.schedule(&cmd)?;
        debug!(
            "Motor command: velocity={:.3} decay={:?} at={:.3} kick={}",
            velocity,
            decay,
            effective_time,
            cmd.kick.is_some()
        );

        self.state = MotorState {
            last_velocity: velocity,
            last_decay_mode: decay,
            last_command_time: Some(cmd.steady.at),
        };
        Ok(cmd.steady.at)
    }

    /// Forget the last issued command, e.g. after the driver lost power or
    /// its link. The next command always goes out.
    pub fn reset(&mut self) {
        self.state = MotorState::default();
    }

    pub fn get_status(&self) -> MotorStatus {
        MotorStatus {
            velocity: self.state.last_velocity,
            decay_mode: self.state.last_decay_mode,
        }
    }

    pub fn state(&self) -> &MotorState {
        &self.state
    }

    pub fn params(&self) -> &EncoderParams {
        &self.params
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

fn validate(params: &EncoderParams) -> Result<(), ConfigError> {
    if !(params.max_power > 0.0 && params.max_power <= 1.0) {
        return Err(ConfigError::OutOfRange {
            field: "max_power",
            value: f64::from(params.max_power),
        });
    }
    if !(0.0..=1.0).contains(&params.kick_start_speed) {
        return Err(ConfigError::OutOfRange {
            field: "startup_speed",
            value: f64::from(params.kick_start_speed),
        });
    }
    if !(params.kick_start_time.is_finite() && params.kick_start_time >= 0.0) {
        return Err(ConfigError::OutOfRange {
            field: "startup_duration",
            value: f64::from(params.kick_start_time),
        });
    }
    Ok(())
}

/// Sink that keeps every command, for tests and dry runs
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub commands: Vec<MotorCommand>,
}

impl CommandSink for RecordingSink {
    fn schedule(&mut self, cmd: &MotorCommand) -> Result<(), LinkError> {
        self.commands.push(*cmd);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn controller() -> MotorController<RecordingSink> {
        MotorController::new(EncoderParams::default(), RecordingSink::default()).unwrap()
    }

    #[test]
    fn test_repeat_is_noop() {
        let mut motor = controller();
        let t1 = motor.set_speed(1.0, -0.4, DecayMode::Slow).unwrap();
        let t2 = motor.set_speed(1.05, -0.4, DecayMode::Slow).unwrap();
        assert_eq!(motor.sink().commands.len(), 1);
        assert_eq!(motor.state().last_command_time, Some(t1));
        assert!((t2 - 1.05).abs() < EPS);
    }

    #[test]
    fn test_first_stop_is_sent() {
        let mut motor = controller();
        motor.set_speed(0.0, 0.0, DecayMode::Fast).unwrap();
        motor.set_speed(0.5, 0.0, DecayMode::Fast).unwrap();
        assert_eq!(motor.sink().commands.len(), 1);
        assert_eq!(motor.sink().commands[0].steady.duty, ChannelPair::new(0.0, 0.0));
    }

    #[test]
    fn test_decay_change_is_not_noop() {
        let mut motor = controller();
        motor.set_speed(0.0, 0.0, DecayMode::Slow).unwrap();
        assert_eq!(motor.sink().commands.len(), 1);
        assert_eq!(motor.sink().commands[0].steady.duty, ChannelPair::new(1.0, 1.0));
    }

    #[test]
    fn test_min_interval() {
        let mut motor = controller();
        motor.set_speed(2.0, 1.0, DecayMode::Slow).unwrap();
        let t = motor.set_speed(2.01, 0.0, DecayMode::Fast).unwrap();
        assert!((t - 2.1).abs() < EPS, "got {t}");

        // requests far in the future are not delayed
        let t = motor.set_speed(5.0, 1.0, DecayMode::Slow).unwrap();
        assert!((t - 5.0).abs() < EPS, "got {t}");
    }

    #[test]
    fn test_kick_start_emits_two_steps() {
        let mut motor = controller();
        let steady = motor.set_speed(1.0, 0.8, DecayMode::Slow).unwrap();
        let cmd = motor.sink().commands[0];

        let steps: Vec<DutyStep> = cmd.steps().collect();
        assert_eq!(steps.len(), 2);
        assert!((steps[1].at - steps[0].at - 0.1).abs() < 1e-6);
        assert!((steady - steps[1].at).abs() < EPS);
        assert_eq!(steps[0].duty, ChannelPair::new(1.0, 0.0));
        assert_eq!(cmd.kick_speed, 1.0);
    }

    #[test]
    fn test_small_change_has_no_kick() {
        let mut motor = controller();
        motor.set_speed(1.0, 0.8, DecayMode::Slow).unwrap();
        motor.set_speed(2.0, 0.85, DecayMode::Slow).unwrap();

        let cmd = motor.sink().commands[1];
        assert_eq!(cmd.steps().count(), 1);
        assert_eq!(cmd.kick_time, 0.0);
    }

    #[test]
    fn test_status_reports_last_command() {
        let mut motor = controller();
        motor.set_speed(0.0, -2.0, DecayMode::Slow).unwrap();
        assert_eq!(
            motor.get_status(),
            MotorStatus {
                velocity: -1.0,
                decay_mode: DecayMode::Slow
            }
        );
    }

    struct RejectingSink;

    impl CommandSink for RejectingSink {
        fn schedule(&mut self, _cmd: &MotorCommand) -> Result<(), LinkError> {
            Err(LinkError::DeviceLost {
                address: "test".to_string(),
            })
        }
    }

    #[test]
    fn test_rejected_command_keeps_state() {
        let mut motor = MotorController::new(EncoderParams::default(), RejectingSink).unwrap();
        assert!(matches!(
            motor.set_speed(1.0, -1.0, DecayMode::Slow),
            Err(LinkError::DeviceLost { .. })
        ));
        assert_eq!(*motor.state(), MotorState::default());
    }

    #[test]
    fn test_reset_forgets_last_command() {
        let mut motor = controller();
        motor.set_speed(1.0, -1.0, DecayMode::Slow).unwrap();
        motor.reset();
        assert_eq!(motor.state().last_command_time, None);

        // the same target is no longer a repeat
        motor.set_speed(1.01, -1.0, DecayMode::Slow).unwrap();
        assert_eq!(motor.sink().commands.len(), 2);
        assert!((motor.sink().commands[1].steady.at - 1.01).abs() < EPS);
    }

    #[test]
    fn test_invalid_max_power() {
        for max_power in [0.0, -0.5, 1.5, f32::NAN] {
            let params = EncoderParams {
                max_power,
                ..EncoderParams::default()
            };
            let result = MotorController::new(params, RecordingSink::default());
            assert!(
                matches!(
                    result,
                    Err(ConfigError::OutOfRange {
                        field: "max_power",
                        ..
                    })
                ),
                "max_power {max_power} accepted"
            );
        }
    }

    #[test]
    fn test_power_limit_applies_to_effective() {
        let params = EncoderParams {
            max_power: 0.5,
            ..EncoderParams::default()
        };
        let mut motor = MotorController::new(params, RecordingSink::default()).unwrap();
        motor.set_speed(0.0, -1.0, DecayMode::Fast).unwrap();
        let cmd = motor.sink().commands[0];
        assert_eq!(cmd.velocity, -1.0);
        assert_eq!(cmd.effective, -0.5);
        assert_eq!(cmd.steady.duty, ChannelPair::new(0.0, 0.5));
        // a full-scale request already runs at max power
        assert!(cmd.kick.is_none());
    }
}
