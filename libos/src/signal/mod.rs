//! Chained signal dispatch
//!
//! This module lets independent subsystems share one hardware signal:
//! - Signal constants and chain positions
//! - The per-signal dispatch table (chained, direct and last-resort slots)
//! - The router installed with the OS for chained signals
//! - The `Trap` view handlers receive and the `Outcome` they return

pub mod chain;
pub mod constants;
pub mod table;
pub mod trap;

pub use chain::{
    disposition, register_chained, register_direct, register_last_resort, unregister_chained,
    unregister_direct, unregister_last_resort,
};
pub use constants::*;
pub use table::{DirectHandler, Disposition, LastResortHandler, SignalTable, Transition};
pub use trap::{ChainedHandler, Outcome, Trap};
