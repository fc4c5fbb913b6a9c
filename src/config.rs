// Timeouts, topics, rewinder configuration
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::link::serial::DEFAULT_BAUDRATE;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 20;

// A stage bracket left open this long is force-released
pub const STAGE_WATCHDOG: Duration = Duration::from_secs(300);

// Zenoh topics
pub const TOPIC_STAGE: &str = "rewinder/cmd/stage"; // stage enter/exit events
pub const TOPIC_CONTROL: &str = "rewinder/cmd/control"; // manual mode requests
pub const TOPIC_GATE: &str = "rewinder/state/gate"; // gate selection from the host
pub const TOPIC_RECONNECT: &str = "rewinder/cmd/reconnect"; // explicit device reconnect
pub const TOPIC_STATUS: &str = "rewinder/state/status"; // per-rewinder status
pub const TOPIC_HEALTH: &str = "rewinder/state/health"; // ok / paused

pub const DEFAULT_CONFIG_PATH: &str = "rewinder.toml";

/// Configuration errors. Rewinder-level errors only disable that rewinder.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("Rewinder {0} is configured twice")]
    DuplicateRewinder(usize),

    #[error("Rewinder {rewinder} refers to device {device}, only {available} configured")]
    UnknownDevice {
        rewinder: usize,
        device: usize,
        available: usize,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub link: LinkConfig,
    #[serde(default, rename = "rewinder")]
    pub rewinders: Vec<RewinderConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        text.parse()
    }

    /// Checks the link section and that rewinder indices are unique.
    /// Per-rewinder motor limits are checked when the motor is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link.validate()?;
        let mut seen = BTreeSet::new();
        for rewinder in &self.rewinders {
            if !seen.insert(rewinder.index) {
                return Err(ConfigError::DuplicateRewinder(rewinder.index));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

/// Command link settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// One address per remote driver board, in device index order
    pub addresses: Vec<String>,
    pub baud_rate: u32,
    pub connect_timeout_s: f64,
    pub health_interval_ms: u64,
    pub drain_timeout_s: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            baud_rate: DEFAULT_BAUDRATE,
            connect_timeout_s: 10.0,
            health_interval_ms: 500,
            drain_timeout_s: 5.0,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("connect_timeout_s", self.connect_timeout_s)?;
        positive("drain_timeout_s", self.drain_timeout_s)?;
        if self.health_interval_ms == 0 {
            return Err(ConfigError::OutOfRange {
                field: "health_interval_ms",
                value: 0.0,
            });
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_s)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.drain_timeout_s)
    }
}

/// One DRV8833 rewinder motor (`[[rewinder]]` table)
#[derive(Debug, Clone, Deserialize)]
pub struct RewinderConfig {
    /// Gate number this rewinder serves
    pub index: usize,
    pub pin_a: u8,
    pub pin_b: u8,
    #[serde(default = "default_pwm_freq")]
    pub pwm_freq: u32,
    #[serde(default = "default_rewind_fast_speed")]
    pub rewind_fast_speed: f32,
    #[serde(default = "default_rewind_slow_speed")]
    pub rewind_slow_speed: f32,
    #[serde(default = "default_load_fast_speed")]
    pub load_fast_speed: f32,
    #[serde(default = "default_load_slow_speed")]
    pub load_slow_speed: f32,
    /// Kick-start magnitude
    #[serde(default = "default_startup_speed")]
    pub startup_speed: f32,
    /// Kick-start duration in seconds, 0 disables kick-start
    #[serde(default = "default_startup_duration")]
    pub startup_duration: f32,
    #[serde(default)]
    pub soft_start_duration: f32,
    #[serde(default = "default_max_power")]
    pub max_power: f32,
    /// Index into `link.addresses`
    #[serde(default)]
    pub device: usize,
}

impl RewinderConfig {
    /// Config with defaults for everything except the pins
    pub fn new(index: usize, pin_a: u8, pin_b: u8) -> Self {
        Self {
            index,
            pin_a,
            pin_b,
            pwm_freq: default_pwm_freq(),
            rewind_fast_speed: default_rewind_fast_speed(),
            rewind_slow_speed: default_rewind_slow_speed(),
            load_fast_speed: default_load_fast_speed(),
            load_slow_speed: default_load_slow_speed(),
            startup_speed: default_startup_speed(),
            startup_duration: default_startup_duration(),
            soft_start_duration: 0.0,
            max_power: default_max_power(),
            device: 0,
        }
    }

    pub fn check_device(&self, available: usize) -> Result<(), ConfigError> {
        if self.device >= available {
            return Err(ConfigError::UnknownDevice {
                rewinder: self.index,
                device: self.device,
                available,
            });
        }
        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, value })
    }
}

fn default_pwm_freq() -> u32 {
    5000
}
fn default_rewind_fast_speed() -> f32 {
    1.0
}
fn default_rewind_slow_speed() -> f32 {
    0.4
}
fn default_load_fast_speed() -> f32 {
    0.4
}
fn default_load_slow_speed() -> f32 {
    0.2
}
fn default_startup_speed() -> f32 {
    1.0
}
fn default_startup_duration() -> f32 {
    0.1
}
fn default_max_power() -> f32 {
    1.0
}
