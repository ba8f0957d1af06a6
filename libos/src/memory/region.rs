//! Stack region handle and the type-stable header at its base.

use crate::arch_impl::current;
use crate::layout::{
    region_base_of, ALT_SIGNAL_STACK_OFFSET, ALT_SIGNAL_STACK_SIZE, JEX_STACK_OFFSET,
    REGION_SHIFT, REGION_SIZE, REGION_START,
};
use crate::memory::allocator::regions;
use core::sync::atomic::{AtomicI16, AtomicI8, AtomicU8, AtomicUsize, Ordering};

/// Header flag: the thread is fully set up as an OS thread
pub const COMPLETE_THREAD: u8 = 1 << 0;
/// Header flag: the thread is fully set up as a managed thread
pub const COMPLETE_MANAGED_THREAD: u8 = 1 << 1;

/// Fixed-layout header at offset 0 of every region.
///
/// The allocator owns this memory for the lifetime of the process. It is
/// zeroed once when the region is first handed out and then survives every
/// reuse cycle; only `link` is overwritten while the region sits on the free
/// list. All fields are atomics so a signal handler on the owning thread and
/// the allocator can touch them through shared references.
#[repr(C)]
pub struct RegionHeader {
    /// Free-list link, must stay first
    link: AtomicUsize,
    pending_exception: AtomicUsize,
    fault_address: AtomicUsize,
    fault_pc: AtomicUsize,
    /// Pages mapped from the base for the managed stack
    jex_ext_count: AtomicI16,
    /// Page index where the native stack mapping starts
    usr_ext_count: AtomicI16,
    complete: AtomicU8,
    nio_access_type: AtomicI8,
    nested_fault: AtomicU8,
}

impl RegionHeader {
    #[cfg(test)]
    pub(crate) const fn zeroed() -> Self {
        RegionHeader {
            link: AtomicUsize::new(0),
            pending_exception: AtomicUsize::new(0),
            fault_address: AtomicUsize::new(0),
            fault_pc: AtomicUsize::new(0),
            jex_ext_count: AtomicI16::new(0),
            usr_ext_count: AtomicI16::new(0),
            complete: AtomicU8::new(0),
            nio_access_type: AtomicI8::new(0),
            nested_fault: AtomicU8::new(0),
        }
    }

    #[inline]
    pub(crate) fn link(&self) -> usize {
        self.link.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_link(&self, next: usize) {
        self.link.store(next, Ordering::Relaxed);
    }

    #[inline]
    pub fn jex_ext_count(&self) -> usize {
        self.jex_ext_count.load(Ordering::Relaxed) as usize
    }

    /// Only the owning thread may move its extension counts.
    #[inline]
    pub fn set_jex_ext_count(&self, pages: usize) {
        self.jex_ext_count.store(pages as i16, Ordering::Relaxed);
    }

    #[inline]
    pub fn usr_ext_count(&self) -> usize {
        self.usr_ext_count.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn set_usr_ext_count(&self, pages: usize) {
        self.usr_ext_count.store(pages as i16, Ordering::Relaxed);
    }

    /// Fault address recorded for the last-resort handler
    #[inline]
    pub fn fault_address(&self) -> usize {
        self.fault_address.load(Ordering::Relaxed)
    }

    /// Program counter recorded for the last-resort handler
    #[inline]
    pub fn fault_pc(&self) -> usize {
        self.fault_pc.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn record_fault(&self, address: usize, pc: usize) {
        self.fault_address.store(address, Ordering::Relaxed);
        self.fault_pc.store(pc, Ordering::Relaxed);
    }

    /// Marks a stack growth fault as in progress. Returns false if one
    /// already was.
    #[inline]
    pub(crate) fn enter_fault(&self) -> bool {
        self.nested_fault.swap(1, Ordering::Relaxed) == 0
    }

    #[inline]
    pub(crate) fn leave_fault(&self) {
        self.nested_fault.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn in_fault(&self) -> bool {
        self.nested_fault.load(Ordering::Relaxed) != 0
    }

    #[inline]
    pub fn complete_flags(&self) -> u8 {
        self.complete.load(Ordering::Relaxed)
    }

    pub fn set_complete_flag(&self, flag: u8, on: bool) {
        if on {
            self.complete.fetch_or(flag, Ordering::Relaxed);
        } else {
            self.complete.fetch_and(!flag, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn is_complete_thread(&self) -> bool {
        self.complete_flags() & COMPLETE_THREAD != 0
    }

    #[inline]
    pub fn is_complete_managed_thread(&self) -> bool {
        self.complete_flags() & COMPLETE_MANAGED_THREAD != 0
    }

    #[inline]
    pub fn nio_access_type(&self) -> i8 {
        self.nio_access_type.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_nio_access_type(&self, kind: i8) {
        self.nio_access_type.store(kind, Ordering::Relaxed);
    }

    #[inline]
    pub fn pending_exception(&self) -> usize {
        self.pending_exception.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_pending_exception(&self, value: usize) {
        self.pending_exception.store(value, Ordering::Relaxed);
    }
}

/// Handle to one thread-stack region, identified by its base address.
///
/// Handles are only minted by the allocator, so the header behind a handle
/// is always mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    base: usize,
}

impl Region {
    /// # Safety
    ///
    /// `base` must be a region base issued by a `StackRegions` allocator.
    #[inline]
    pub(crate) const unsafe fn from_base(base: usize) -> Self {
        Region { base }
    }

    /// The process-wide region holding `addr`, if it has ever been issued.
    pub fn containing(addr: usize) -> Option<Region> {
        if regions().owns(addr) {
            Some(Region {
                base: region_base_of(addr),
            })
        } else {
            None
        }
    }

    /// The region the calling thread is running on.
    #[inline(never)]
    pub fn current() -> Option<Region> {
        Self::containing(current::stack_pointer())
    }

    #[inline]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// One past the highest address of the region
    #[inline]
    pub const fn top(&self) -> usize {
        self.base + REGION_SIZE
    }

    /// Address of the first slot of the native stack
    #[inline]
    pub const fn stack_base(&self) -> usize {
        self.top() - core::mem::size_of::<usize>()
    }

    /// Start of the managed stack
    #[inline]
    pub const fn jex_stack_start(&self) -> usize {
        self.base + JEX_STACK_OFFSET
    }

    /// `(address, size)` of the alternate signal stack
    #[inline]
    pub const fn alt_signal_stack(&self) -> (usize, usize) {
        (self.base + ALT_SIGNAL_STACK_OFFSET, ALT_SIGNAL_STACK_SIZE)
    }

    /// Index of the region within the process-wide range.
    #[inline]
    pub const fn thread_id(&self) -> usize {
        self.base.wrapping_sub(REGION_START) >> REGION_SHIFT
    }

    #[inline]
    pub const fn contains(&self, addr: usize) -> bool {
        region_base_of(addr) == self.base
    }

    #[inline]
    pub fn header(&self) -> &'static RegionHeader {
        // SAFETY: the header page of an issued region is never unmapped and
        // the allocator zeroed it before the first handle was created.
        unsafe { &*(self.base as *const RegionHeader) }
    }

    /// Bytes left before the yellow zone; zero or negative inside it.
    pub fn stack_available(&self) -> isize {
        crate::stack::stack_available(self.header())
    }

    pub fn is_in_yellow_zone(&self) -> bool {
        crate::stack::is_in_yellow_zone(self.header())
    }
}
