//! Real stack growth on managed threads
//!
//! Every test body runs on a thread spawned onto a stack region, so its
//! faults go through the installed SIGSEGV chain.

mod child;

use libos::layout::{HYSTERESIS_PAGES, INITIAL_JEX_EXT_COUNT, PAGE_SIZE};
use libos::signal::{self, Disposition, STACK_GROWTH_SIGNAL};
use libos::{stack, Region};
use std::hint::black_box;
use std::ptr;

#[inline(never)]
fn dive(depth: usize) -> usize {
    let pad = black_box([depth as u8; 1024]);
    let deepest = if depth == 0 {
        Region::current().map_or(usize::MAX, |r| r.header().usr_ext_count())
    } else {
        dive(depth - 1)
    };
    black_box(&pad);
    deepest
}

fn on_region<T: Send + 'static>(f: impl FnOnce(Region) -> T + Send + 'static) -> T {
    let handle = libos::spawn(move || {
        let region = Region::current().expect("running on a region");
        f(region)
    })
    .expect("spawn on region");
    handle.join().expect("body panicked").expect("bootstrap")
}

#[test]
fn test_spawned_thread_runs_on_its_region() {
    println!("Testing spawn onto a region...");

    let handle = libos::spawn(|| Region::current()).expect("spawn");
    let region = handle.region();
    let seen = handle.join().unwrap().unwrap();
    assert_eq!(seen, Some(region));
    assert!(Region::current().is_none(), "test thread is not on a region");
    assert!(matches!(
        signal::disposition(STACK_GROWTH_SIGNAL),
        Disposition::Chained(n) if n >= 1
    ));

    println!("✓ Spawn onto a region test passed");
}

#[test]
fn test_native_stack_grows_on_deep_recursion() {
    println!("Testing native stack growth...");

    let (before, deepest, after) = on_region(|region| {
        let before = region.header().usr_ext_count();
        let deepest = dive(200);
        stack::reguard(region.jex_stack_start()).expect("reguard");
        (before, deepest, region.header().usr_ext_count())
    });
    assert!(deepest < before, "usr {} -> {} did not grow", before, deepest);
    assert!(after > deepest, "reguard left usr at {}", after);

    println!("✓ Native stack growth test passed ({} -> {} -> {})", before, deepest, after);
}

#[test]
fn test_managed_stack_grows_and_reclaims() {
    println!("Testing managed stack growth...");

    let (grown, reclaimed, kept) = on_region(|region| {
        let header = region.header();
        // A reused region may keep a few managed pages from its last thread.
        assert!(header.jex_ext_count() <= 20);
        for page in INITIAL_JEX_EXT_COUNT..=20 {
            let addr = region.base() + page * PAGE_SIZE;
            // SAFETY: the page lies in the growth gap of our own region; the
            // fault maps it before the write retires.
            unsafe { ptr::write_volatile(addr as *mut u64, page as u64) };
        }
        let grown = header.jex_ext_count();

        let yellow = stack::reguard(region.jex_stack_start()).expect("reguard");
        assert!(!yellow);
        let first = region.base() + INITIAL_JEX_EXT_COUNT * PAGE_SIZE;
        // SAFETY: still mapped after reclaiming to the hysteresis mark.
        let kept = unsafe { ptr::read_volatile(first as *const u64) };
        (grown, header.jex_ext_count(), kept)
    });

    assert_eq!(grown, 21);
    assert_eq!(
        reclaimed,
        libos::layout::JEX_STACK_OFFSET / PAGE_SIZE + HYSTERESIS_PAGES
    );
    assert_eq!(kept, INITIAL_JEX_EXT_COUNT as u64);

    println!("✓ Managed stack growth test passed");
}

#[test]
fn test_regrowth_after_reclaim_gives_zeroed_pages() {
    let value = on_region(|region| {
        let addr = region.base() + 18 * PAGE_SIZE;
        // SAFETY: as above, a managed-side gap page of our own region.
        unsafe { ptr::write_volatile(addr as *mut u64, 0xdead) };
        stack::reguard(region.jex_stack_start()).expect("reguard");
        // Page 18 was decommitted; touching it again maps a fresh page.
        unsafe { ptr::read_volatile(addr as *const u64) }
    });
    assert_eq!(value, 0);
}

#[test]
fn test_reguard_off_region_is_refused() {
    assert!(matches!(
        stack::reguard(0x1000),
        Err(libos::StackFault::NotOnRegion { .. })
    ));
}

#[test]
fn test_red_zone_collision_aborts() {
    const NAME: &str = "test_red_zone_collision_aborts";
    if child::is_child(NAME) {
        on_region(|region| {
            let header = region.header();
            header.set_jex_ext_count(200);
            header.set_usr_ext_count(202);
            let addr = region.base() + 201 * PAGE_SIZE;
            // SAFETY: unmapped, the resulting fault is the point of the test.
            unsafe { ptr::write_volatile(addr as *mut u64, 1) };
        });
        return;
    }

    let output = child::run(NAME);
    child::assert_aborted_with(&output, "stack red zone reached");
}

#[test]
fn test_fault_inside_region_interior_aborts() {
    const NAME: &str = "test_fault_inside_region_interior_aborts";
    if child::is_child(NAME) {
        on_region(|region| {
            let dead_zone = region.base() + libos::layout::DEAD_ZONE_OFFSET;
            // SAFETY: the dead zone is never mapped.
            unsafe { ptr::write_volatile(dead_zone as *mut u64, 1) };
        });
        return;
    }

    let output = child::run(NAME);
    child::assert_aborted_with(&output, "inside reserved region interior");
}
