// Message types exchanged with the filament-handling host

use serde::{Deserialize, Serialize};

use crate::motor::{DecayMode, MotorStatus, RewindMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    Enter,
    Exit,
}

// Host -> runtime: a filament-move stage starts or ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage: String,
    pub phase: StagePhase,
}

// Host -> runtime: manual mode request for one rewinder
// Mode is kept as text so a bad name can be reported back instead of dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewindControl {
    pub id: usize,
    pub mode: String,
}

// Host -> runtime: current gate selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct GateStatus {
    pub selected: Option<usize>,
    pub available_from_buffer: bool,
}

// Host -> runtime: reconnect a lost device (index into link.addresses)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReconnectRequest {
    pub device: usize,
}

// Runtime -> host: last issued command per rewinder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RewinderStatus {
    pub id: usize,
    pub mode: RewindMode,
    pub velocity: f32,
    pub decay_mode: DecayMode,
    pub connected: bool,
}

impl RewinderStatus {
    pub fn new(id: usize, mode: RewindMode, status: MotorStatus, connected: bool) -> Self {
        Self {
            id,
            mode,
            velocity: status.velocity,
            decay_mode: status.decay_mode,
            connected,
        }
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    /// The host must pause the filament sequence
    Paused { reason: String },
}
