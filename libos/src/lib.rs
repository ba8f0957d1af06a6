//! libos: thread-stack regions and chained signal dispatch for a managed
//! runtime.
//!
//! Every managed thread runs on a power-of-two aligned region carved out of
//! one reserved virtual range. The region's two stacks are grown a page at
//! a time from SIGSEGV, which is shared with other subsystems through an
//! ordered handler chain.

#[macro_use]
pub mod fatal;

pub mod arch_impl;
pub mod error;
pub mod layout;
pub mod memory;
pub mod signal;
pub mod stack;
pub mod thread;

pub use error::{BootstrapError, MapError, RegionError, RegisterError, StackFault};
pub use memory::{create_region, delete_region, regions, Region, RegionHeader, StackRegions};
pub use signal::{ChainedHandler, Disposition, Outcome, Trap};
pub use thread::{
    register_death_hook, register_start_hook, run_main_on_region, run_on_region, spawn,
    Bootstrap, JoinHandle, ThreadHooks,
};
