// Rewinder motor control
//
// Provides:
// - H-bridge velocity encoding (velocity + decay -> leg duty cycles)
// - Per-motor command timing with kick-start
// - Rewinder driver command frame
// - High-level rewinder API (modes, status)

pub mod controller;
mod driver;
pub mod encoder;
pub mod frame;
pub mod mode;

pub use controller::{
    CommandSink, DutyStep, MotorCommand, MotorController, MotorState, MotorStatus, RecordingSink,
    MIN_COMMAND_INTERVAL,
};
pub use driver::Rewinder;
pub use encoder::{ChannelPair, DecayMode, EncoderParams};
pub use frame::{CommandFrame, ProtocolError};
pub use mode::{ModeSpeeds, RewindMode};
