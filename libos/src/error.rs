//! Error types for recoverable libos operations.
//!
//! Conditions that cannot be recovered from (red zone collisions, nested
//! faults, unhandled traps) never surface here; they abort through
//! [`crate::fatal`].

use core::fmt;
use std::io;

/// A failed `mmap` on a page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapError {
    pub addr: usize,
    pub len: usize,
    pub errno: i32,
}

impl MapError {
    /// Capture `errno` for a call that just failed. Safe in signal context.
    pub(crate) fn last(addr: usize, len: usize) -> Self {
        MapError {
            addr,
            len,
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mmap of {:#x}+{:#x} failed (errno {})",
            self.addr, self.len, self.errno
        )
    }
}

impl std::error::Error for MapError {}

/// Failure to obtain a stack region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionError {
    /// Every region in the reserved range is in use
    Exhausted,
    /// The reserved range could not be set up
    Reserve(MapError),
    /// First-time initialization could not map the region
    Commit(MapError),
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::Exhausted => write!(f, "stack region space exhausted"),
            RegionError::Reserve(e) => write!(f, "could not reserve stack region space: {}", e),
            RegionError::Commit(e) => write!(f, "could not initialize stack region: {}", e),
        }
    }
}

impl std::error::Error for RegionError {}

/// Signal table registration failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// Signal number or chain order out of range, or a direct handler for
    /// the stack growth signal
    InvalidArgument,
    /// The slot is taken, or the signal is owned by the other dispatch model
    Exists,
    /// No matching handler is registered
    NotFound,
    /// `sigaction` refused the installation (errno)
    Install(i32),
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::InvalidArgument => write!(f, "invalid argument"),
            RegisterError::Exists => write!(f, "handler slot already occupied"),
            RegisterError::NotFound => write!(f, "handler not registered"),
            RegisterError::Install(errno) => write!(f, "sigaction failed (errno {})", errno),
        }
    }
}

impl std::error::Error for RegisterError {}

/// Why a stack fault could not be resolved by growing the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackFault {
    /// The trapped stack pointer lies in the region's dead zone
    SpInDeadZone { sp: usize },
    /// The fault hit the always-reserved low part of the region
    ForbiddenInterior { address: usize },
    /// The two stacks are within the red zone of each other
    RedZone { jex: usize, usr: usize },
    /// A page could not be mapped or unmapped
    MapFailed(MapError),
    /// The managed stack cursor is not in the stack pointer's region
    ForeignCursor { sp: usize, cursor: usize },
    /// The stack pointer is not on a managed region
    NotOnRegion { sp: usize },
}

impl From<MapError> for StackFault {
    fn from(e: MapError) -> Self {
        StackFault::MapFailed(e)
    }
}

impl fmt::Display for StackFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackFault::SpInDeadZone { sp } => {
                write!(f, "stack pointer {:#x} inside dead zone", sp)
            }
            StackFault::ForbiddenInterior { address } => {
                write!(f, "fault at {:#x} inside reserved region interior", address)
            }
            StackFault::RedZone { jex, usr } => {
                write!(f, "stack red zone reached (jex={} usr={})", jex, usr)
            }
            StackFault::MapFailed(e) => write!(f, "stack page mapping failed: {}", e),
            StackFault::ForeignCursor { sp, cursor } => write!(
                f,
                "managed stack cursor {:#x} not in region of sp {:#x}",
                cursor, sp
            ),
            StackFault::NotOnRegion { sp } => {
                write!(f, "stack pointer {:#x} is not on a stack region", sp)
            }
        }
    }
}

impl std::error::Error for StackFault {}

/// Thread bootstrap failures.
#[derive(Debug)]
pub enum BootstrapError {
    Region(RegionError),
    Register(RegisterError),
    /// `sigaltstack` failed (errno)
    AltStack(i32),
    /// The OS thread could not be started
    Spawn(io::Error),
}

impl From<RegionError> for BootstrapError {
    fn from(e: RegionError) -> Self {
        BootstrapError::Region(e)
    }
}

impl From<RegisterError> for BootstrapError {
    fn from(e: RegisterError) -> Self {
        BootstrapError::Register(e)
    }
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::Region(e) => write!(f, "{}", e),
            BootstrapError::Register(e) => write!(f, "stack growth handler: {}", e),
            BootstrapError::AltStack(errno) => write!(f, "sigaltstack failed (errno {})", errno),
            BootstrapError::Spawn(e) => write!(f, "thread spawn failed: {}", e),
        }
    }
}

impl std::error::Error for BootstrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BootstrapError::Region(e) => Some(e),
            BootstrapError::Register(e) => Some(e),
            BootstrapError::Spawn(e) => Some(e),
            BootstrapError::AltStack(_) => None,
        }
    }
}
