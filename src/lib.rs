// Filament rewinder runtime
//
// Drives DRV8833-style DC rewinder motors on a remote driver board and
// brackets the stages of a filament move with the matching rewinder mode.

pub mod config;
pub mod dispatch;
pub mod link;
pub mod messages;
pub mod motor;
pub mod runtime;
