//! Demand-paged bidirectional stack growth.
//!
//! The managed stack grows up from `JEX_STACK_OFFSET` and the native stack
//! grows down from the region top. `jex_ext_count` is the number of pages
//! mapped from the base, `usr_ext_count` the page index where the native
//! mapping starts; everything in between is unmapped. A fault in the gap
//! maps one page on whichever side is nearer.
//!
//! The logic here is pure over a header, a base and a [`PageOps`] so it can
//! be exercised without taking real faults. [`handler`] wires it to SIGSEGV.

pub mod handler;

pub use handler::{install, reguard, reguard_at, StackGrowth};

use crate::error::StackFault;
use crate::layout::{
    region_base_of, DEAD_ZONE_OFFSET, DEAD_ZONE_SIZE, HYSTERESIS_PAGES, JEX_STACK_OFFSET,
    PAGE_SHIFT, PAGE_SIZE, RECLAIM_SP_PAD, RED_ZONE_PAGES, REGION_SIZE, YELLOW_ZONE_PAGES,
};
use crate::memory::{PageOps, RegionHeader};
use crate::signal::{Outcome, SI_KERNEL, SI_USER};

/// The parts of a SIGSEGV the growth logic looks at.
#[derive(Debug, Clone, Copy)]
pub struct Fault {
    pub address: usize,
    pub stack_pointer: usize,
    pub code: i32,
}

impl Fault {
    /// Kernel-originated null faults and user-sent signals are not stack
    /// faults and are resumed untouched.
    #[inline]
    pub fn is_benign(&self) -> bool {
        (self.address == 0 && self.code == SI_KERNEL) || self.code == SI_USER
    }
}

/// Bytes left before the yellow zone. Zero or negative inside it.
pub fn stack_available(header: &RegionHeader) -> isize {
    let gap = header.usr_ext_count() as isize
        - header.jex_ext_count() as isize
        - YELLOW_ZONE_PAGES as isize;
    gap << PAGE_SHIFT
}

#[inline]
pub fn is_in_yellow_zone(header: &RegionHeader) -> bool {
    stack_available(header) <= 0
}

/// Resolve a fault on the region at `base` by mapping one page.
///
/// Returns `Outcome::NotHandled` for faults outside the growth range, and
/// also when the stack stays in the yellow zone after reclaiming, so a later
/// chained handler can turn it into a stack overflow.
pub fn grow_for_fault(
    header: &RegionHeader,
    base: usize,
    fault: &Fault,
    pages: &impl PageOps,
) -> Result<Outcome, StackFault> {
    if fault.is_benign() {
        return Ok(Outcome::Resume);
    }

    let sp = fault.stack_pointer;
    let dead_zone = base + DEAD_ZONE_OFFSET..base + DEAD_ZONE_OFFSET + DEAD_ZONE_SIZE;
    if dead_zone.contains(&sp) {
        return Err(StackFault::SpInDeadZone { sp });
    }
    let address = fault.address;
    if (base..base + JEX_STACK_OFFSET).contains(&address) {
        return Err(StackFault::ForbiddenInterior { address });
    }
    if !(base + JEX_STACK_OFFSET..base + REGION_SIZE).contains(&address) {
        return Ok(Outcome::NotHandled);
    }

    let jex = header.jex_ext_count();
    let usr = header.usr_ext_count();
    if usr <= jex + RED_ZONE_PAGES {
        return Err(StackFault::RedZone { jex, usr });
    }

    // Last mapped byte of the managed stack, first mapped byte of the native.
    let mapped_jex_end = base + jex * PAGE_SIZE - 1;
    let mapped_usr_end = base + usr * PAGE_SIZE;
    if address <= mapped_jex_end || address >= mapped_usr_end {
        // Not in the gap, so not ours to grow.
        return Ok(Outcome::NotHandled);
    }

    let jex_cursor = if address - mapped_jex_end < mapped_usr_end - address {
        pages.commit(base + jex * PAGE_SIZE, PAGE_SIZE)?;
        header.set_jex_ext_count(jex + 1);
        address
    } else {
        pages.commit(base + (usr - 1) * PAGE_SIZE, PAGE_SIZE)?;
        header.set_usr_ext_count(usr - 1);
        mapped_jex_end
    };

    if reclaim(header, base, sp, jex_cursor, pages)? {
        Ok(Outcome::NotHandled)
    } else {
        Ok(Outcome::Resume)
    }
}

/// Map the native stack of the region at `base` down far enough to cover
/// `addr`.
///
/// Addresses outside the growth gap are left alone. Used before writing a
/// synthesized call frame below a trapped stack pointer.
pub fn extend_native_to(
    header: &RegionHeader,
    base: usize,
    addr: usize,
    pages: &impl PageOps,
) -> Result<(), StackFault> {
    let jex = header.jex_ext_count();
    let usr = header.usr_ext_count();
    if region_base_of(addr) != base || addr < base + jex * PAGE_SIZE || addr >= base + usr * PAGE_SIZE
    {
        return Ok(());
    }
    let page = (addr - base) >> PAGE_SHIFT;
    if page <= jex + RED_ZONE_PAGES {
        return Err(StackFault::RedZone { jex, usr });
    }
    pages.commit(base + page * PAGE_SIZE, (usr - page) * PAGE_SIZE)?;
    header.set_usr_ext_count(page);
    Ok(())
}

/// Unmap pages more than `HYSTERESIS_PAGES` past the in-use point on both
/// sides.
///
/// `sp` is the native stack pointer and `jex_cursor` the current top of the
/// managed stack; both must be in the region at `base`. Returns whether the
/// stack is still in the yellow zone.
pub fn reclaim(
    header: &RegionHeader,
    base: usize,
    sp: usize,
    jex_cursor: usize,
    pages: &impl PageOps,
) -> Result<bool, StackFault> {
    let sp = sp.saturating_sub(RECLAIM_SP_PAD);
    if region_base_of(sp) != base || region_base_of(jex_cursor) != base {
        return Err(StackFault::ForeignCursor {
            sp,
            cursor: jex_cursor,
        });
    }

    let keep_jex = ((jex_cursor - base) >> PAGE_SHIFT) + HYSTERESIS_PAGES;
    let jex = header.jex_ext_count();
    if jex > keep_jex {
        pages.decommit(base + keep_jex * PAGE_SIZE, (jex - keep_jex) * PAGE_SIZE)?;
        header.set_jex_ext_count(keep_jex);
    }

    let sp_page = (sp - base) >> PAGE_SHIFT;
    let usr = header.usr_ext_count();
    if usr + HYSTERESIS_PAGES < sp_page {
        let keep_usr = sp_page - HYSTERESIS_PAGES;
        pages.decommit(base + usr * PAGE_SIZE, (keep_usr - usr) * PAGE_SIZE)?;
        header.set_usr_ext_count(keep_usr);
    }

    Ok(is_in_yellow_zone(header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MapError;
    use crate::layout::{INITIAL_JEX_EXT_COUNT, INITIAL_USR_EXT_COUNT, REGION_PAGES};
    use std::cell::RefCell;

    // Never dereferenced: the header under test lives on the heap.
    const BASE: usize = 0x7f00_0000_0000;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        Commit(usize, usize),
        Decommit(usize, usize),
    }

    #[derive(Default)]
    struct RecordingPages {
        ops: RefCell<Vec<Op>>,
        fail: bool,
    }

    impl RecordingPages {
        fn decommitted_pages(&self) -> usize {
            self.ops
                .borrow()
                .iter()
                .map(|op| match op {
                    Op::Decommit(_, len) => len / PAGE_SIZE,
                    Op::Commit(..) => 0,
                })
                .sum()
        }
    }

    impl PageOps for RecordingPages {
        fn commit(&self, addr: usize, len: usize) -> Result<(), MapError> {
            if self.fail {
                return Err(MapError { addr, len, errno: libc::ENOMEM });
            }
            self.ops.borrow_mut().push(Op::Commit(addr, len));
            Ok(())
        }

        fn decommit(&self, addr: usize, len: usize) -> Result<(), MapError> {
            self.ops.borrow_mut().push(Op::Decommit(addr, len));
            Ok(())
        }
    }

    fn fresh_header() -> Box<RegionHeader> {
        let header = Box::new(RegionHeader::zeroed());
        header.set_jex_ext_count(INITIAL_JEX_EXT_COUNT);
        header.set_usr_ext_count(INITIAL_USR_EXT_COUNT);
        header
    }

    fn page(n: usize) -> usize {
        BASE + n * PAGE_SIZE
    }

    fn fault_at(address: usize, sp: usize) -> Fault {
        Fault {
            address,
            stack_pointer: sp,
            code: 2, // SEGV_ACCERR
        }
    }

    /// Native stack pointer just inside the initial native extent
    const SP: usize = BASE + INITIAL_USR_EXT_COUNT * PAGE_SIZE + 512;

    #[test]
    fn benign_faults_resume_untouched() {
        println!("Testing benign fault filtering...");
        let header = fresh_header();
        let pages = RecordingPages::default();
        let kernel_null = Fault { address: 0, stack_pointer: SP, code: SI_KERNEL };
        let user_sent = Fault { address: page(300), stack_pointer: SP, code: SI_USER };
        for fault in [kernel_null, user_sent] {
            assert_eq!(grow_for_fault(&header, BASE, &fault, &pages), Ok(Outcome::Resume));
        }
        assert!(pages.ops.borrow().is_empty());
        assert_eq!(header.usr_ext_count(), INITIAL_USR_EXT_COUNT);
        println!("✓ Benign fault filtering test passed");
    }

    #[test]
    fn native_side_grows_down_by_one_page() {
        println!("Testing native stack growth...");
        let header = fresh_header();
        let pages = RecordingPages::default();
        let target = page(INITIAL_USR_EXT_COUNT - 1) + 128;
        let outcome = grow_for_fault(&header, BASE, &fault_at(target, target + 64), &pages);

        assert_eq!(outcome, Ok(Outcome::Resume));
        assert_eq!(header.usr_ext_count(), INITIAL_USR_EXT_COUNT - 1);
        assert_eq!(header.jex_ext_count(), INITIAL_JEX_EXT_COUNT);
        assert_eq!(
            pages.ops.borrow()[0],
            Op::Commit(page(INITIAL_USR_EXT_COUNT - 1), PAGE_SIZE)
        );
        println!("✓ Native stack growth test passed");
    }

    #[test]
    fn managed_side_grows_up_when_nearer() {
        println!("Testing managed stack growth...");
        let header = fresh_header();
        let pages = RecordingPages::default();
        let target = page(INITIAL_JEX_EXT_COUNT) + 8;
        let outcome = grow_for_fault(&header, BASE, &fault_at(target, SP), &pages);

        assert_eq!(outcome, Ok(Outcome::Resume));
        assert_eq!(header.jex_ext_count(), INITIAL_JEX_EXT_COUNT + 1);
        assert_eq!(header.usr_ext_count(), INITIAL_USR_EXT_COUNT);
        assert_eq!(
            pages.ops.borrow()[0],
            Op::Commit(page(INITIAL_JEX_EXT_COUNT), PAGE_SIZE)
        );
        println!("✓ Managed stack growth test passed");
    }

    #[test]
    fn faults_outside_growth_range_are_declined() {
        let header = fresh_header();
        let pages = RecordingPages::default();
        let below = fault_at(BASE - 16, SP);
        let above = fault_at(BASE + REGION_SIZE + 16, SP);
        let mapped_native = fault_at(page(INITIAL_USR_EXT_COUNT) + 8, SP);
        for fault in [below, above, mapped_native] {
            assert_eq!(grow_for_fault(&header, BASE, &fault, &pages), Ok(Outcome::NotHandled));
        }
        assert!(pages.ops.borrow().is_empty());
    }

    #[test]
    fn interior_and_dead_zone_faults_are_fatal() {
        let header = fresh_header();
        let pages = RecordingPages::default();

        let in_alt_stack = fault_at(BASE + crate::layout::ALT_SIGNAL_STACK_OFFSET, SP);
        assert_eq!(
            grow_for_fault(&header, BASE, &in_alt_stack, &pages),
            Err(StackFault::ForbiddenInterior { address: in_alt_stack.address })
        );

        let sp = BASE + DEAD_ZONE_OFFSET + 64;
        assert_eq!(
            grow_for_fault(&header, BASE, &fault_at(page(200), sp), &pages),
            Err(StackFault::SpInDeadZone { sp })
        );
    }

    #[test]
    fn red_zone_collision_is_fatal() {
        println!("Testing red zone detection...");
        let header = fresh_header();
        let pages = RecordingPages::default();
        header.set_jex_ext_count(200);
        header.set_usr_ext_count(200 + RED_ZONE_PAGES);
        let target = page(201);
        assert_eq!(
            grow_for_fault(&header, BASE, &fault_at(target, target), &pages),
            Err(StackFault::RedZone { jex: 200, usr: 202 })
        );
        assert!(pages.ops.borrow().is_empty());
        println!("✓ Red zone detection test passed");
    }

    #[test]
    fn map_failure_is_reported() {
        let header = fresh_header();
        let pages = RecordingPages { fail: true, ..Default::default() };
        let target = page(INITIAL_USR_EXT_COUNT - 1);
        assert!(matches!(
            grow_for_fault(&header, BASE, &fault_at(target, target), &pages),
            Err(StackFault::MapFailed(_))
        ));
        assert_eq!(header.usr_ext_count(), INITIAL_USR_EXT_COUNT);
    }

    #[test]
    fn yellow_zone_growth_is_declined() {
        println!("Testing yellow zone hand-off...");
        let header = fresh_header();
        let pages = RecordingPages::default();
        header.set_jex_ext_count(100);
        header.set_usr_ext_count(100 + YELLOW_ZONE_PAGES + 1);
        let target = page(100 + YELLOW_ZONE_PAGES);
        // sp right at the fault keeps the reclaim pass from freeing anything
        let outcome = grow_for_fault(&header, BASE, &fault_at(target, target + 64), &pages);

        assert_eq!(outcome, Ok(Outcome::NotHandled));
        assert_eq!(header.usr_ext_count(), 100 + YELLOW_ZONE_PAGES);
        assert!(is_in_yellow_zone(&header));
        assert_eq!(stack_available(&header), 0);
        println!("✓ Yellow zone hand-off test passed");
    }

    #[test]
    fn managed_growth_round_trip_returns_to_hysteresis() {
        println!("Testing grow/shrink round trip...");
        let header = fresh_header();
        let pages = RecordingPages::default();
        let grown = 24;
        for n in 0..grown {
            let target = page(INITIAL_JEX_EXT_COUNT + n) + 16;
            let outcome = grow_for_fault(&header, BASE, &fault_at(target, SP), &pages);
            assert_eq!(outcome, Ok(Outcome::Resume));
        }
        assert_eq!(header.jex_ext_count(), INITIAL_JEX_EXT_COUNT + grown);
        assert_eq!(pages.decommitted_pages(), 0);

        // Usage falls back to the second managed page.
        let cursor = page(INITIAL_JEX_EXT_COUNT) + 8;
        let cursor_page = INITIAL_JEX_EXT_COUNT;
        let yellow = reclaim(&header, BASE, SP, cursor, &pages).unwrap();

        assert!(!yellow);
        assert_eq!(header.jex_ext_count(), cursor_page + HYSTERESIS_PAGES);
        assert_eq!(
            pages.decommitted_pages(),
            INITIAL_JEX_EXT_COUNT + grown - (cursor_page + HYSTERESIS_PAGES)
        );
        println!("✓ Grow/shrink round trip test passed");
    }

    #[test]
    fn native_side_reclaims_below_stack_pointer() {
        let header = fresh_header();
        let pages = RecordingPages::default();
        header.set_usr_ext_count(300);
        let sp = page(400) + 2048;
        let cursor = BASE + JEX_STACK_OFFSET;

        assert_eq!(reclaim(&header, BASE, sp, cursor, &pages), Ok(false));
        // (sp - pad) is still on page 400.
        assert_eq!(header.usr_ext_count(), 400 - HYSTERESIS_PAGES);
        assert_eq!(
            *pages.ops.borrow(),
            vec![Op::Decommit(page(300), (100 - HYSTERESIS_PAGES) * PAGE_SIZE)]
        );
        // Second pass has nothing left to do.
        assert_eq!(reclaim(&header, BASE, sp, cursor, &pages), Ok(false));
        assert_eq!(pages.ops.borrow().len(), 1);
        assert!(header.usr_ext_count() < REGION_PAGES);
    }

    #[test]
    fn call_slot_below_native_extent_is_mapped_first() {
        println!("Testing native extension for a call slot...");
        let header = fresh_header();
        let pages = RecordingPages::default();
        // Two pages below the first mapped native page.
        let slot = page(INITIAL_USR_EXT_COUNT - 2) + 4000;

        assert_eq!(extend_native_to(&header, BASE, slot, &pages), Ok(()));
        assert_eq!(header.usr_ext_count(), INITIAL_USR_EXT_COUNT - 2);
        assert_eq!(
            *pages.ops.borrow(),
            vec![Op::Commit(page(INITIAL_USR_EXT_COUNT - 2), 2 * PAGE_SIZE)]
        );

        // Already mapped now, and mapped managed pages are never touched.
        assert_eq!(extend_native_to(&header, BASE, slot - 8, &pages), Ok(()));
        assert_eq!(extend_native_to(&header, BASE, page(INITIAL_JEX_EXT_COUNT - 1), &pages), Ok(()));
        assert_eq!(pages.ops.borrow().len(), 1);
        println!("✓ Native extension for a call slot test passed");
    }

    #[test]
    fn call_slot_into_red_zone_is_refused() {
        let header = fresh_header();
        let pages = RecordingPages::default();
        header.set_jex_ext_count(100);
        header.set_usr_ext_count(110);
        assert_eq!(
            extend_native_to(&header, BASE, page(101) + 64, &pages),
            Err(StackFault::RedZone { jex: 100, usr: 110 })
        );
        assert!(pages.ops.borrow().is_empty());
        assert_eq!(header.usr_ext_count(), 110);
    }

    #[test]
    fn reclaim_rejects_cursor_from_another_region() {
        let header = fresh_header();
        let pages = RecordingPages::default();
        let cursor = BASE + REGION_SIZE + JEX_STACK_OFFSET;
        assert!(matches!(
            reclaim(&header, BASE, SP, cursor, &pages),
            Err(StackFault::ForeignCursor { .. })
        ));
    }
}
