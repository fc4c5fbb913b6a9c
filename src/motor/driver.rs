// High-level rewinder motor
//
// Maps rewinder modes onto a motor controller and keeps the motor's time base.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::controller::{CommandSink, MotorController, MotorStatus};
use super::mode::{ModeSpeeds, RewindMode};
use crate::config::{ConfigError, RewinderConfig};
use crate::link::LinkError;

/// One rewinder motor, addressed by its gate index
pub struct Rewinder<S: CommandSink> {
    index: usize,
    speeds: ModeSpeeds,
    controller: MotorController<S>,
    epoch: Instant,
    mode: RewindMode,
}

impl<S: CommandSink> Rewinder<S> {
    /// Build from config. `epoch` is the zero of the controller's time base
    /// and must match the one the sink uses.
    pub fn new(cfg: &RewinderConfig, sink: S, epoch: Instant) -> Result<Self, ConfigError> {
        let controller = MotorController::from_config(cfg, sink)?;
        Ok(Self {
            index: cfg.index,
            speeds: ModeSpeeds::from(cfg),
            controller,
            epoch,
            mode: RewindMode::Stop,
        })
    }

    /// Switch to `mode` as soon as the driver allows
    ///
    /// Fails without touching the motor state if the sink cannot deliver.
    pub fn set_mode(&mut self, mode: RewindMode) -> Result<f64, LinkError> {
        self.controller.sink().ready()?;
        let (velocity, decay) = mode.target(&self.speeds);
        let now = self.epoch.elapsed().as_secs_f64();
        let at = self.controller.set_speed(now, velocity, decay)?;
        if mode != self.mode {
            info!("Rewinder {}: {} -> {}", self.index, self.mode, mode);
        }
        self.mode = mode;
        Ok(at)
    }

    pub fn stop(&mut self) -> Result<f64, LinkError> {
        self.set_mode(RewindMode::Stop)
    }

    /// Motor state is unknown, e.g. after its device reconnected. The next
    /// mode is sent even if it matches the last one.
    pub fn reset(&mut self) {
        self.controller.reset();
        self.mode = RewindMode::Stop;
    }

    pub fn drain(&self, timeout: Duration) -> Result<(), LinkError> {
        self.controller.sink().drain(timeout)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn mode(&self) -> RewindMode {
        self.mode
    }

    pub fn status(&self) -> MotorStatus {
        self.controller.get_status()
    }

    pub fn controller(&self) -> &MotorController<S> {
        &self.controller
    }
}

impl<S: CommandSink> Drop for Rewinder<S> {
    fn drop(&mut self) {
        // Never leave a motor running when its owner goes away
        if self.mode != RewindMode::Stop {
            if let Err(e) = self.stop() {
                warn!("Failed to stop rewinder {} on drop: {}", self.index, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::controller::{MotorCommand, RecordingSink};
    use crate::motor::encoder::DecayMode;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<MotorCommand>>>);

    impl CommandSink for SharedSink {
        fn schedule(&mut self, cmd: &MotorCommand) -> Result<(), LinkError> {
            self.0.lock().unwrap().push(*cmd);
            Ok(())
        }
    }

    struct LostSink;

    impl CommandSink for LostSink {
        fn ready(&self) -> Result<(), LinkError> {
            Err(LinkError::DeviceLost {
                address: "test".to_string(),
            })
        }

        fn schedule(&mut self, _cmd: &MotorCommand) -> Result<(), LinkError> {
            panic!("scheduled on a lost device");
        }
    }

    #[test]
    fn test_modes_drive_controller() {
        let cfg = RewinderConfig::new(1, 3, 4);
        let mut rewinder = Rewinder::new(&cfg, RecordingSink::default(), Instant::now()).unwrap();

        rewinder.set_mode(RewindMode::RewindFast).unwrap();
        assert_eq!(rewinder.mode(), RewindMode::RewindFast);
        assert_eq!(
            rewinder.status(),
            MotorStatus {
                velocity: -1.0,
                decay_mode: DecayMode::Slow
            }
        );

        rewinder.stop().unwrap();
        let commands = &rewinder.controller().sink().commands;
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].velocity, 0.0);
        assert_eq!(commands[1].decay, DecayMode::Fast);
    }

    #[test]
    fn test_lost_sink_keeps_state() {
        let cfg = RewinderConfig::new(0, 3, 4);
        let mut rewinder = Rewinder::new(&cfg, LostSink, Instant::now()).unwrap();
        assert!(matches!(
            rewinder.set_mode(RewindMode::LoadFast),
            Err(LinkError::DeviceLost { .. })
        ));
        assert_eq!(rewinder.mode(), RewindMode::Stop);
    }

    #[test]
    fn test_drop_stops_running_motor() {
        let sink = SharedSink::default();
        let cfg = RewinderConfig::new(0, 3, 4);
        {
            let mut rewinder = Rewinder::new(&cfg, sink.clone(), Instant::now()).unwrap();
            rewinder.set_mode(RewindMode::LoadSlow).unwrap();
        }
        let commands = sink.0.lock().unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].velocity, 0.0);
    }

    #[test]
    fn test_reset_resends_same_mode() {
        let cfg = RewinderConfig::new(0, 3, 4);
        let mut rewinder = Rewinder::new(&cfg, RecordingSink::default(), Instant::now()).unwrap();
        rewinder.set_mode(RewindMode::RewindFast).unwrap();
        rewinder.set_mode(RewindMode::RewindFast).unwrap();
        assert_eq!(rewinder.controller().sink().commands.len(), 1);

        rewinder.reset();
        assert_eq!(rewinder.mode(), RewindMode::Stop);
        rewinder.set_mode(RewindMode::RewindFast).unwrap();
        assert_eq!(rewinder.controller().sink().commands.len(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = RewinderConfig::new(0, 3, 4);
        cfg.max_power = 0.0;
        assert!(Rewinder::new(&cfg, RecordingSink::default(), Instant::now()).is_err());
    }
}
