//! Lock-free stack region allocator
//!
//! Regions come from two sources. A high-water mark walks forward through
//! the reserved range handing out never-used regions, which get first-time
//! initialization. Deleted regions go onto a Treiber stack threaded through
//! their headers and are handed out again with the header as they left it.
//! Regions are never returned to the OS.
//!
//! A region counts as issued only once its first-time initialization has
//! completed. A claim whose initialization fails hands its slot back to the
//! high-water mark when no later claim has moved past it.
//!
//! The free-list head keeps an ABA tag in the low `REGION_SHIFT` bits, which
//! are always zero in a region base.

use crate::error::{MapError, RegionError};
use crate::layout::{
    RegionSpace, DEAD_ZONE_OFFSET, DEAD_ZONE_SIZE, INITIAL_JEX_EXT_COUNT, INITIAL_USR_EXT_COUNT,
    LOCAL_DATA_OFFSET, LOCAL_DATA_SIZE, PAGE_SIZE, REGION_MASK, REGION_SHIFT, REGION_SIZE,
};
use crate::memory::region::{Region, RegionHeader};
use crate::memory::{zero, Mmap, PageOps};
use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Most regions a single allocator can track.
pub const MAX_REGIONS: usize = RegionSpace::DEFAULT.capacity();

const ISSUED_WORDS: usize = (MAX_REGIONS + 63) / 64;

/// Allocator over one reserved [`RegionSpace`].
pub struct StackRegions {
    space: RegionSpace,
    reservation: OnceCell<Result<(), MapError>>,
    /// Tagged free-list head, base bits zero when empty
    free_head: AtomicUsize,
    /// Lowest never-claimed region base
    high_water: AtomicUsize,
    /// One bit per region, set once it has been initialized
    issued: [AtomicU64; ISSUED_WORDS],
}

static REGIONS: StackRegions = StackRegions::with_space(RegionSpace::DEFAULT);

/// The process-wide allocator over the default reserved range.
#[inline]
pub fn regions() -> &'static StackRegions {
    &REGIONS
}

/// Obtain a region from the process-wide allocator.
pub fn create_region() -> Result<Region, RegionError> {
    REGIONS.create_region()
}

/// Return a region to the process-wide allocator.
pub fn delete_region(region: Region) {
    REGIONS.delete_region(region)
}

impl StackRegions {
    /// # Panics
    ///
    /// If `space` holds more than [`MAX_REGIONS`] regions.
    pub const fn with_space(space: RegionSpace) -> Self {
        assert!(space.capacity() <= MAX_REGIONS, "region space too large");
        StackRegions {
            space,
            reservation: OnceCell::uninit(),
            free_head: AtomicUsize::new(0),
            high_water: AtomicUsize::new(space.start()),
            issued: [const { AtomicU64::new(0) }; ISSUED_WORDS],
        }
    }

    #[inline]
    pub fn space(&self) -> RegionSpace {
        self.space
    }

    /// Base of the next never-claimed region
    #[inline]
    pub fn high_water_mark(&self) -> usize {
        self.high_water.load(Ordering::Acquire)
    }

    /// True if `addr` lies in a region this allocator has issued at least once.
    ///
    /// Such an address has a mapped header, so signal handlers use this to
    /// decide whether a trapped stack pointer is safe to inspect.
    #[inline]
    pub fn owns(&self, addr: usize) -> bool {
        if !self.reservation.is_initialized()
            || addr < self.space.start()
            || addr >= self.high_water.load(Ordering::Acquire)
        {
            return false;
        }
        let (word, bit) = self.issued_bit(addr);
        self.issued[word].load(Ordering::Acquire) & bit != 0
    }

    fn issued_bit(&self, addr: usize) -> (usize, u64) {
        let index = (addr - self.space.start()) >> REGION_SHIFT;
        (index / 64, 1 << (index % 64))
    }

    fn reserve(&self) -> Result<(), RegionError> {
        let reserved = self.reservation.get_or_init(|| {
            let result = Mmap::reserve(self.space.start(), self.space.len());
            match &result {
                Ok(()) => log::info!(
                    "Stack regions reserved: {:#x}-{:#x} ({} regions of {} KiB)",
                    self.space.start(),
                    self.space.end(),
                    self.space.capacity(),
                    REGION_SIZE / 1024
                ),
                Err(e) => log::error!("Stack region reservation failed: {}", e),
            }
            result
        });
        (*reserved).map_err(RegionError::Reserve)
    }

    /// Hand out a region, reusing a deleted one when available.
    ///
    /// A reused region keeps its header from its previous life. A fresh one
    /// has a zeroed header and the initial stack extents mapped.
    pub fn create_region(&self) -> Result<Region, RegionError> {
        self.create_with(&Mmap)
    }

    fn create_with(&self, pages: &impl PageOps) -> Result<Region, RegionError> {
        self.reserve()?;

        if let Some(base) = self.pop_free() {
            log::trace!("Reused stack region {:#x}", base);
            // SAFETY: only issued bases are ever pushed onto the free list.
            return Ok(unsafe { Region::from_base(base) });
        }

        let base = self.claim_fresh()?;
        if let Err(e) = self.initialize(base, pages) {
            self.unclaim(base);
            log::warn!("Stack region {:#x} failed to initialize: {}", base, e);
            return Err(e);
        }
        let (word, bit) = self.issued_bit(base);
        self.issued[word].fetch_or(bit, Ordering::Release);
        log::debug!("Initialized stack region {:#x}", base);
        // SAFETY: `base` was claimed from the high-water mark and initialized.
        Ok(unsafe { Region::from_base(base) })
    }

    /// Put a region back on the free list.
    ///
    /// The caller must already have torn down the thread using it; the
    /// region's first word is overwritten with the list link.
    pub fn delete_region(&self, region: Region) {
        let base = region.base();
        crate::guarantee!(
            base & REGION_MASK == 0 && self.owns(base),
            "delete of foreign stack region {:#x}",
            base
        );

        let header = region.header();
        let mut head = self.free_head.load(Ordering::Relaxed);
        loop {
            header.set_link(head & !REGION_MASK);
            let tagged = base | (head.wrapping_add(1) & REGION_MASK);
            match self.free_head.compare_exchange_weak(
                head,
                tagged,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        log::trace!("Freed stack region {:#x}", base);
    }

    fn pop_free(&self) -> Option<usize> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let base = head & !REGION_MASK;
            if base == 0 {
                return None;
            }
            // SAFETY: headers of listed regions stay mapped forever, so a
            // stale read is harmless and the tagged CAS below rejects it.
            let next = unsafe { &*(base as *const RegionHeader) }.link();
            let tagged = next | (head.wrapping_add(1) & REGION_MASK);
            match self.free_head.compare_exchange_weak(
                head,
                tagged,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(base),
                Err(current) => head = current,
            }
        }
    }

    fn claim_fresh(&self) -> Result<usize, RegionError> {
        let mut mark = self.high_water.load(Ordering::Relaxed);
        loop {
            if mark + REGION_SIZE > self.space.end() {
                log::warn!(
                    "Stack region space exhausted at {} regions",
                    self.space.capacity()
                );
                return Err(RegionError::Exhausted);
            }
            match self.high_water.compare_exchange_weak(
                mark,
                mark + REGION_SIZE,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(mark),
                Err(current) => mark = current,
            }
        }
    }

    /// Give back a claim that never became a region. If the mark has since
    /// moved past it the slot stays claimed but is never reported as owned.
    fn unclaim(&self, base: usize) {
        let _ = self.high_water.compare_exchange(
            base + REGION_SIZE,
            base,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// First-time setup of a freshly claimed region.
    fn initialize(&self, base: usize, pages: &impl PageOps) -> Result<(), RegionError> {
        pages.commit(base, REGION_SIZE).map_err(RegionError::Commit)?;
        // SAFETY: the header page was committed just above.
        unsafe { zero(base + LOCAL_DATA_OFFSET, LOCAL_DATA_SIZE) };

        pages
            .decommit(base + DEAD_ZONE_OFFSET, DEAD_ZONE_SIZE)
            .map_err(RegionError::Commit)?;

        // SAFETY: zeroed and mapped above.
        let header = unsafe { &*(base as *const RegionHeader) };
        header.set_jex_ext_count(INITIAL_JEX_EXT_COUNT);
        header.set_usr_ext_count(INITIAL_USR_EXT_COUNT);

        let gap_start = base + INITIAL_JEX_EXT_COUNT * PAGE_SIZE;
        let gap_end = base + INITIAL_USR_EXT_COUNT * PAGE_SIZE;
        pages
            .decommit(gap_start, gap_end - gap_start)
            .map_err(RegionError::Commit)
    }
}
