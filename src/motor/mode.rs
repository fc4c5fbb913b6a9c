// Rewinder modes and their motor targets

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::encoder::DecayMode;
use super::frame::ProtocolError;
use crate::config::RewinderConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewindMode {
    Stop,
    Brake,
    RewindFast,
    RewindSlow,
    LoadFast,
    LoadSlow,
}

impl RewindMode {
    pub const ALL: [RewindMode; 6] = [
        RewindMode::Stop,
        RewindMode::Brake,
        RewindMode::RewindFast,
        RewindMode::RewindSlow,
        RewindMode::LoadFast,
        RewindMode::LoadSlow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RewindMode::Stop => "stop",
            RewindMode::Brake => "brake",
            RewindMode::RewindFast => "rewind_fast",
            RewindMode::RewindSlow => "rewind_slow",
            RewindMode::LoadFast => "load_fast",
            RewindMode::LoadSlow => "load_slow",
        }
    }

    /// Signed velocity and decay mode for this mode. Rewinding runs the motor
    /// backwards, loading forwards.
    pub fn target(&self, speeds: &ModeSpeeds) -> (f32, DecayMode) {
        match self {
            RewindMode::Stop => (0.0, DecayMode::Fast),
            RewindMode::Brake => (0.0, DecayMode::Slow),
            RewindMode::RewindFast => (-speeds.rewind_fast, DecayMode::Slow),
            RewindMode::RewindSlow => (-speeds.rewind_slow, DecayMode::Slow),
            RewindMode::LoadFast => (speeds.load_fast, DecayMode::Slow),
            RewindMode::LoadSlow => (speeds.load_slow, DecayMode::Slow),
        }
    }
}

impl fmt::Display for RewindMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RewindMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == name)
            .ok_or_else(|| ProtocolError::UnknownMode(s.to_string()))
    }
}

/// Per-rewinder speed for each moving mode, as fractions of full speed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeSpeeds {
    pub rewind_fast: f32,
    pub rewind_slow: f32,
    pub load_fast: f32,
    pub load_slow: f32,
}

impl Default for ModeSpeeds {
    fn default() -> Self {
        Self {
            rewind_fast: 1.0,
            rewind_slow: 0.4,
            load_fast: 0.4,
            load_slow: 0.2,
        }
    }
}

impl From<&RewinderConfig> for ModeSpeeds {
    fn from(cfg: &RewinderConfig) -> Self {
        Self {
            rewind_fast: cfg.rewind_fast_speed,
            rewind_slow: cfg.rewind_slow_speed,
            load_fast: cfg.load_fast_speed,
            load_slow: cfg.load_slow_speed,
        }
    }
}
