// H-bridge velocity encoding for a DRV8833-style driver
// Converts a signed velocity + decay mode into the duty cycles of the two legs.

use serde::{Deserialize, Serialize};

/// Minimum change in commanded velocity that triggers a kick-start pulse
pub const KICK_START_THRESHOLD: f32 = 0.5;

/// How motor current decays while the driven leg is off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayMode {
    /// Coast: both legs low when idle
    Fast,
    /// Brake: both legs high when idle, complementary PWM while driving
    Slow,
}

/// Duty cycles of the two H-bridge legs, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelPair {
    pub a: f32,
    pub b: f32,
}

impl ChannelPair {
    pub fn new(a: f32, b: f32) -> Self {
        Self { a, b }
    }

    /// Number of legs that are actively modulated (strictly between 0 and 1)
    pub fn modulated_legs(&self) -> usize {
        [self.a, self.b]
            .iter()
            .filter(|&&d| d > 0.0 && d < 1.0)
            .count()
    }
}

/// Per-motor limits used by the encoder
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderParams {
    /// Scale applied to every commanded magnitude, in (0, 1]
    pub max_power: f32,
    /// Kick-start magnitude, in [0, 1]
    pub kick_start_speed: f32,
    /// Kick-start duration in seconds, 0 disables kick-start
    pub kick_start_time: f32,
}

impl Default for EncoderParams {
    fn default() -> Self {
        Self {
            max_power: 1.0,
            kick_start_speed: 1.0,
            kick_start_time: 0.1,
        }
    }
}

/// Clamp a requested velocity into [-1, 1]; non-finite input means stop
pub fn clamp_velocity(velocity: f32) -> f32 {
    if velocity.is_finite() {
        velocity.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Signed velocity after clamping and power limiting
pub fn effective_velocity(velocity: f32, max_power: f32) -> f32 {
    clamp_velocity(velocity) * max_power
}

/// Encode a signed velocity into the two leg duty cycles
///
/// Fast decay drives one leg and holds the other low. Slow decay holds the
/// non-driven leg high and drives the other with the complementary duty.
/// A zero velocity gives coast (fast) or brake (slow).
pub fn encode(velocity: f32, decay: DecayMode, max_power: f32) -> ChannelPair {
    let effective = effective_velocity(velocity, max_power);
    let magnitude = effective.abs();
    let forward = effective >= 0.0;

    match (decay, forward) {
        (DecayMode::Fast, true) => ChannelPair::new(magnitude, 0.0),
        (DecayMode::Fast, false) => ChannelPair::new(0.0, magnitude),
        (DecayMode::Slow, true) => ChannelPair::new(1.0, 1.0 - magnitude),
        (DecayMode::Slow, false) => ChannelPair::new(1.0 - magnitude, 1.0),
    }
}

/// Whether moving from `previous` to `next` needs a kick-start pulse
///
/// Only for a nonzero target below full power, with kick-start enabled, and
/// when the velocity jumps by more than `KICK_START_THRESHOLD`.
pub fn needs_kick_start(previous: f32, next: f32, params: &EncoderParams) -> bool {
    let next = clamp_velocity(next);
    let magnitude = (next * params.max_power).abs();
    magnitude > 0.0
        && magnitude < params.max_power
        && params.kick_start_time > 0.0
        && (next - clamp_velocity(previous)).abs() > KICK_START_THRESHOLD
}

/// Duty cycles of the kick-start pulse, if one is needed
pub fn kick_start(
    previous: f32,
    next: f32,
    decay: DecayMode,
    params: &EncoderParams,
) -> Option<ChannelPair> {
    if !needs_kick_start(previous, next, params) {
        return None;
    }
    let pulse = params.kick_start_speed.clamp(0.0, 1.0).copysign(next);
    Some(encode(pulse, decay, params.max_power))
}
