//! Canonical thread-stack region layout constants
//!
//! Every managed thread runs on one region carved out of a single reserved
//! virtual range. Regions are `REGION_SIZE` aligned, so any address inside a
//! region yields its base by masking off the low `REGION_SHIFT` bits.
//!
//! Per-region layout, low to high:
//!
//! ```text
//! +0x0000  header / local thread data   (1 page, always mapped)
//! +0x1000  dead zone 1                  (4 pages, never mapped)
//! +0x5000  alternate signal stack       (4 pages)
//! +0x9000  profiling tick buffer        (2 pages)
//! +0xb000  managed (JEX) stack, grows up
//!   ...    unmapped gap
//!   ...    native (user/C) stack, grows down to REGION_SIZE
//! ```

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// log2 of the region size (2 MiB regions)
pub const REGION_SHIFT: usize = 21;
pub const REGION_SIZE: usize = 1 << REGION_SHIFT;
pub const REGION_MASK: usize = REGION_SIZE - 1;
pub const REGION_PAGES: usize = REGION_SIZE / PAGE_SIZE;

// Fixed byte offsets inside a region. Stable for the whole reservation.
pub const LOCAL_DATA_OFFSET: usize = 0;
pub const LOCAL_DATA_SIZE: usize = PAGE_SIZE;
pub const DEAD_ZONE_OFFSET: usize = LOCAL_DATA_OFFSET + LOCAL_DATA_SIZE;
pub const DEAD_ZONE_SIZE: usize = 4 * PAGE_SIZE;
pub const ALT_SIGNAL_STACK_OFFSET: usize = DEAD_ZONE_OFFSET + DEAD_ZONE_SIZE;
pub const ALT_SIGNAL_STACK_SIZE: usize = 4 * PAGE_SIZE;
pub const TICK_BUFFER_OFFSET: usize = ALT_SIGNAL_STACK_OFFSET + ALT_SIGNAL_STACK_SIZE;
pub const TICK_BUFFER_SIZE: usize = 2 * PAGE_SIZE;
pub const JEX_STACK_OFFSET: usize = TICK_BUFFER_OFFSET + TICK_BUFFER_SIZE;

/// Page index of the first managed stack page
pub const JEX_FIRST_PAGE: usize = JEX_STACK_OFFSET >> PAGE_SHIFT;

/// Managed stack pages granted to a fresh region
pub const INITIAL_JEX_PAGES: usize = 1;

/// Native stack pages granted to a fresh region
pub const INITIAL_USR_PAGES: usize = 16;

/// Extension counts of a fresh region (pages mapped, counted from base)
pub const INITIAL_JEX_EXT_COUNT: usize = JEX_FIRST_PAGE + INITIAL_JEX_PAGES;
pub const INITIAL_USR_EXT_COUNT: usize = REGION_PAGES - INITIAL_USR_PAGES;

/// Warning margin between the two stacks, in pages
pub const YELLOW_ZONE_PAGES: usize = 10;

/// Hard minimum gap between the two stacks, in pages
pub const RED_ZONE_PAGES: usize = 2;

/// Pages kept mapped past the in-use point when reclaiming
pub const HYSTERESIS_PAGES: usize = 4;

/// Bytes below the supplied stack pointer left alone by a reclaim pass
pub const RECLAIM_SP_PAD: usize = 1000;

/// Process-wide reserved range: 16384 regions starting at 64 TiB
pub const REGION_START: usize = 0x4000_0000_0000;
pub const REGION_END: usize = 0x4008_0000_0000;

const _: () = assert!(REGION_START & REGION_MASK == 0);
const _: () = assert!(REGION_END & REGION_MASK == 0);
const _: () = assert!(INITIAL_USR_EXT_COUNT > INITIAL_JEX_EXT_COUNT + YELLOW_ZONE_PAGES);

/// An aligned `[start, end)` range that a region allocator carves regions from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSpace {
    start: usize,
    end: usize,
}

impl RegionSpace {
    /// The process-wide reserved range.
    pub const DEFAULT: RegionSpace = RegionSpace {
        start: REGION_START,
        end: REGION_END,
    };

    /// Returns `None` unless both bounds are region aligned, non-null and
    /// the range holds at least one region.
    pub const fn new(start: usize, end: usize) -> Option<Self> {
        if start == 0 || start & REGION_MASK != 0 || end & REGION_MASK != 0 || end <= start {
            return None;
        }
        Some(RegionSpace { start, end })
    }

    #[inline]
    pub const fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub const fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    /// Number of regions the range holds
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.len() >> REGION_SHIFT
    }

    #[inline]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Region base of any address inside it
#[inline]
pub const fn region_base_of(addr: usize) -> usize {
    addr & !REGION_MASK
}

/// Log the region layout during initialization
pub fn log_layout() {
    log::info!("LAYOUT: thread stack regions:");
    log::info!(
        "LAYOUT: range={:#x}-{:#x}, region={} KiB, regions={}",
        REGION_START,
        REGION_END,
        REGION_SIZE / 1024,
        RegionSpace::DEFAULT.capacity()
    );
    log::info!("LAYOUT: header       +{:#07x} ({} KiB)", LOCAL_DATA_OFFSET, LOCAL_DATA_SIZE / 1024);
    log::info!("LAYOUT: dead zone    +{:#07x} ({} KiB)", DEAD_ZONE_OFFSET, DEAD_ZONE_SIZE / 1024);
    log::info!(
        "LAYOUT: alt sigstack +{:#07x} ({} KiB)",
        ALT_SIGNAL_STACK_OFFSET,
        ALT_SIGNAL_STACK_SIZE / 1024
    );
    log::info!("LAYOUT: tick buffer  +{:#07x} ({} KiB)", TICK_BUFFER_OFFSET, TICK_BUFFER_SIZE / 1024);
    log::info!("LAYOUT: managed stk  +{:#07x} (grows up)", JEX_STACK_OFFSET);
    log::info!("LAYOUT: native stk   +{:#07x} (grows down)", REGION_SIZE);
    log::info!(
        "LAYOUT: initial extents jex={} usr={}, yellow={} red={} hysteresis={} pages",
        INITIAL_JEX_EXT_COUNT,
        INITIAL_USR_EXT_COUNT,
        YELLOW_ZONE_PAGES,
        RED_ZONE_PAGES,
        HYSTERESIS_PAGES
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_page_aligned_and_ordered() {
        for offset in [
            DEAD_ZONE_OFFSET,
            ALT_SIGNAL_STACK_OFFSET,
            TICK_BUFFER_OFFSET,
            JEX_STACK_OFFSET,
        ] {
            assert_eq!(offset % PAGE_SIZE, 0);
        }
        assert!(DEAD_ZONE_OFFSET < ALT_SIGNAL_STACK_OFFSET);
        assert!(TICK_BUFFER_OFFSET < JEX_STACK_OFFSET);
        assert_eq!(JEX_FIRST_PAGE, 11);
        assert_eq!(INITIAL_JEX_EXT_COUNT, 12);
        assert_eq!(INITIAL_USR_EXT_COUNT, 496);
    }

    #[test]
    fn region_space_rejects_misaligned_bounds() {
        assert!(RegionSpace::new(REGION_START + PAGE_SIZE, REGION_END).is_none());
        assert!(RegionSpace::new(REGION_START, REGION_START).is_none());
        assert!(RegionSpace::new(0, REGION_SIZE).is_none());

        let space = RegionSpace::new(REGION_START, REGION_START + 4 * REGION_SIZE).unwrap();
        assert_eq!(space.capacity(), 4);
        assert!(space.contains(REGION_START));
        assert!(!space.contains(REGION_START + 4 * REGION_SIZE));
        assert_eq!(RegionSpace::DEFAULT.capacity(), 16384);
    }

    #[test]
    fn base_of_interior_address() {
        let base = REGION_START + 7 * REGION_SIZE;
        assert_eq!(region_base_of(base), base);
        assert_eq!(region_base_of(base + JEX_STACK_OFFSET + 17), base);
        assert_eq!(region_base_of(base + REGION_SIZE - 1), base);
    }
}
