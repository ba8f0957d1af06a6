//! Signal dispatch constants

/// Highest signal number the dispatch table accepts
pub const MAX_SIGNAL: i32 = 64;

/// Chained slots per signal
pub const MAX_CHAINED_HANDLERS: usize = 5;

// Chain positions, consulted in increasing order.
pub const HANDLER_FIRST: usize = 0;
pub const HANDLER_SECOND: usize = 1;
pub const HANDLER_THIRD: usize = 2;
pub const HANDLER_FOURTH: usize = 3;
pub const HANDLER_FIFTH: usize = 4;

/// The signal stack growth rides on; chained-only
pub const STACK_GROWTH_SIGNAL: i32 = libc::SIGSEGV;

/// Chain position of the stack growth handler
pub const STACK_GROWTH_ORDER: usize = HANDLER_SECOND;

// si_code values (asm-generic/siginfo.h)
pub const SI_USER: i32 = 0;
pub const SI_KERNEL: i32 = 0x80;
