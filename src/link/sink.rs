// Delivers motor commands to one remote device as command frames

use std::time::{Duration, Instant};

use tracing::warn;

use super::{DeviceId, LinkError, LinkHandle, SharedBus};
use crate::config::RewinderConfig;
use crate::motor::frame::speed_to_wire;
use crate::motor::{CommandFrame, CommandSink, MotorCommand};

/// Sink for one rewinder on one remote driver board
///
/// The board runs the kick-start pulse itself, so each command becomes a
/// single frame released at the time the command starts.
pub struct DeviceSink {
    link: LinkHandle,
    device: DeviceId,
    pin_a: u8,
    pin_b: u8,
    pwm_freq: u32,
    soft_start_duration: f32,
    epoch: Instant,
}

impl DeviceSink {
    pub fn new(link: LinkHandle, device: DeviceId, cfg: &RewinderConfig, epoch: Instant) -> Self {
        Self {
            link,
            device,
            pin_a: cfg.pin_a,
            pin_b: cfg.pin_b,
            pwm_freq: cfg.pwm_freq,
            soft_start_duration: cfg.soft_start_duration,
            epoch,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn frame(&self, cmd: &MotorCommand) -> CommandFrame {
        CommandFrame {
            pin_a: self.pin_a,
            pin_b: self.pin_b,
            decay_mode: cmd.decay,
            speed: speed_to_wire(cmd.effective),
            startup_speed: speed_to_wire(cmd.kick_speed),
            pwm_freq: self.pwm_freq,
            startup_duration: cmd.kick_time,
            soft_start_duration: self.soft_start_duration,
        }
    }
}

impl CommandSink for DeviceSink {
    fn ready(&self) -> Result<(), LinkError> {
        self.link.check(self.device)
    }

    fn schedule(&mut self, cmd: &MotorCommand) -> Result<(), LinkError> {
        let start = cmd.kick.unwrap_or(cmd.steady).at;
        let not_before = self.epoch + Duration::try_from_secs_f64(start).unwrap_or_default();
        // The write outcome is not awaited; a device lost after this point is
        // reported through the fault handler
        let frames = vec![self.frame(cmd)];
        self.link
            .write_batch(self.device, frames, Some(not_before))
            .map(|_ticket| ())
            .inspect_err(|e| warn!("Dropping command for device {}: {}", self.device, e))
    }

    fn drain(&self, timeout: Duration) -> Result<(), LinkError> {
        self.link.drain(timeout)
    }
}
