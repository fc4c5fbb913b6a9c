// Rewinder driver command frame
//
// Fixed 18-byte little-endian frame, no checksum:
// [0xEE, pin_a, pin_b, decay, speed(i8), startup_speed(i8),
//  pwm_freq(u32), startup_duration(f32), soft_start_duration(f32)]

use super::encoder::DecayMode;

/// Frame marker byte
pub const MAGIC: u8 = 0xEE;

/// Encoded frame length
pub const FRAME_LEN: usize = 18;

/// Scale between a velocity fraction and the signed byte on the wire
const SPEED_SCALE: f32 = 127.0;

/// Errors for malformed frames and mode names
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid rewind mode {0:?}")]
    UnknownMode(String),

    #[error("Frame length mismatch: expected {expected}, got {got}")]
    FrameLength { expected: usize, got: usize },

    #[error("Invalid frame marker: 0x{0:02X}")]
    BadMagic(u8),

    #[error("Invalid decay mode byte: {0}")]
    BadDecayMode(u8),
}

/// One motor command as sent to the remote driver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandFrame {
    pub pin_a: u8,
    pub pin_b: u8,
    pub decay_mode: DecayMode,
    /// Signed speed, -127..=127
    pub speed: i8,
    /// Kick-start magnitude, 0..=127
    pub startup_speed: i8,
    pub pwm_freq: u32,
    /// Kick-start duration in seconds
    pub startup_duration: f32,
    /// Ramp duration in seconds
    pub soft_start_duration: f32,
}

impl CommandFrame {
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0] = MAGIC;
        buf[1] = self.pin_a;
        buf[2] = self.pin_b;
        buf[3] = decay_to_byte(self.decay_mode);
        buf[4] = self.speed.to_le_bytes()[0];
        buf[5] = self.startup_speed.to_le_bytes()[0];
        buf[6..10].copy_from_slice(&self.pwm_freq.to_le_bytes());
        buf[10..14].copy_from_slice(&self.startup_duration.to_le_bytes());
        buf[14..18].copy_from_slice(&self.soft_start_duration.to_le_bytes());
        buf
    }

    /// Parse a frame as the receiving driver would
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let buf: &[u8; FRAME_LEN] = bytes.try_into().map_err(|_| ProtocolError::FrameLength {
            expected: FRAME_LEN,
            got: bytes.len(),
        })?;

        if buf[0] != MAGIC {
            return Err(ProtocolError::BadMagic(buf[0]));
        }

        Ok(Self {
            pin_a: buf[1],
            pin_b: buf[2],
            decay_mode: decay_from_byte(buf[3])?,
            speed: i8::from_le_bytes([buf[4]]),
            startup_speed: i8::from_le_bytes([buf[5]]),
            pwm_freq: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            startup_duration: f32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]),
            soft_start_duration: f32::from_le_bytes([buf[14], buf[15], buf[16], buf[17]]),
        })
    }
}

/// Scale a velocity fraction in [-1, 1] to the wire byte
pub fn speed_to_wire(velocity: f32) -> i8 {
    let scaled = (velocity * SPEED_SCALE).round();
    if scaled.is_finite() {
        scaled.clamp(-SPEED_SCALE, SPEED_SCALE) as i8
    } else {
        0
    }
}

fn decay_to_byte(decay: DecayMode) -> u8 {
    match decay {
        DecayMode::Slow => 0,
        DecayMode::Fast => 1,
    }
}

fn decay_from_byte(byte: u8) -> Result<DecayMode, ProtocolError> {
    match byte {
        0 => Ok(DecayMode::Slow),
        1 => Ok(DecayMode::Fast),
        other => Err(ProtocolError::BadDecayMode(other)),
    }
}
