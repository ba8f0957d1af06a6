//! Managed thread lifecycle on stack regions.

pub mod bootstrap;

pub use bootstrap::{
    bootstrap, register_death_hook, register_start_hook, run_main_on_region, run_on_region,
    spawn, Bootstrap, JoinHandle, LifecycleHook, ThreadHooks,
};
