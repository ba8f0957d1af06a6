//! Stack region memory: page mapping, region handles and the allocator.

pub mod allocator;
pub mod region;

pub use allocator::{create_region, delete_region, regions, StackRegions};
pub use region::{Region, RegionHeader};

use crate::error::MapError;
use core::ptr;

/// Page range mapping primitives used by the stack growth logic.
///
/// Implementations must be callable from signal context.
pub trait PageOps {
    /// Back `[addr, addr + len)` with fresh zeroed read/write pages.
    fn commit(&self, addr: usize, len: usize) -> Result<(), MapError>;

    /// Drop the pages in `[addr, addr + len)`. Later accesses must fault.
    fn decommit(&self, addr: usize, len: usize) -> Result<(), MapError>;
}

/// `PageOps` over anonymous private `mmap`.
///
/// Decommitted pages are remapped `PROT_NONE` rather than unmapped so the
/// reserved range stays owned by us.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mmap;

impl Mmap {
    fn map_fixed(addr: usize, len: usize, prot: libc::c_int) -> Result<(), MapError> {
        // SAFETY: callers only pass page ranges inside the reservation.
        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(MapError::last(addr, len));
        }
        Ok(())
    }

    /// Reserve `[addr, addr + len)` inaccessible with no swap backing.
    pub fn reserve(addr: usize, len: usize) -> Result<(), MapError> {
        // SAFETY: MAP_FIXED_NOREPLACE never clobbers an existing mapping.
        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE
                    | libc::MAP_ANONYMOUS
                    | libc::MAP_NORESERVE
                    | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(MapError::last(addr, len));
        }
        if ret as usize != addr {
            // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
            // SAFETY: `ret` is the mapping just created above.
            unsafe { libc::munmap(ret, len) };
            return Err(MapError {
                addr,
                len,
                errno: libc::EEXIST,
            });
        }
        Ok(())
    }
}

impl PageOps for Mmap {
    fn commit(&self, addr: usize, len: usize) -> Result<(), MapError> {
        Self::map_fixed(addr, len, libc::PROT_READ | libc::PROT_WRITE)
    }

    fn decommit(&self, addr: usize, len: usize) -> Result<(), MapError> {
        Self::map_fixed(addr, len, libc::PROT_NONE)
    }
}

/// Zero `len` bytes at `addr`.
///
/// # Safety
///
/// The range must be mapped writable.
pub(crate) unsafe fn zero(addr: usize, len: usize) {
    ptr::write_bytes(addr as *mut u8, 0, len);
}
