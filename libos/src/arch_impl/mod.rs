//! Architecture abstraction layer for libos.
//!
//! This module provides the architecture-agnostic [`TrapFrame`] trait and
//! re-exports the current architecture's implementation as `current`. Code
//! outside this module should use the trait rather than register layouts.
//!
//! # Supported Architectures
//!
//! - `x86_64`: Linux
//! - `aarch64`: Linux

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64 as current;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64 as current;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("libos supports x86_64 and aarch64 only");

pub mod traits;
pub use traits::*;
