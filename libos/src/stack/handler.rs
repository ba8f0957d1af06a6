//! SIGSEGV glue for stack growth and the explicit reguard entry points.

use super::{grow_for_fault, reclaim, Fault};
use crate::arch_impl::current;
use crate::error::{RegisterError, StackFault};
use crate::memory::{Mmap, Region};
use crate::signal::{self, ChainedHandler, Outcome, Trap, STACK_GROWTH_ORDER, STACK_GROWTH_SIGNAL};

/// Chained SIGSEGV handler that grows the faulting thread's region.
///
/// Declines faults from threads that are not on a region. Anything that
/// cannot be resolved safely aborts the process.
pub struct StackGrowth;

static STACK_GROWTH: StackGrowth = StackGrowth;

impl ChainedHandler for StackGrowth {
    fn handle(&self, trap: &mut Trap<'_>) -> Outcome {
        let fault = Fault {
            address: trap.fault_address(),
            stack_pointer: trap.stack_pointer(),
            code: trap.code(),
        };
        if fault.is_benign() {
            return Outcome::Resume;
        }
        let Some(region) = Region::containing(fault.stack_pointer) else {
            return Outcome::NotHandled;
        };
        match grow_for_fault(region.header(), region.base(), &fault, &Mmap) {
            Ok(outcome) => outcome,
            Err(e) => crate::fatal!(
                "stack growth at {:#x} (pc {:#x}): {}",
                fault.address,
                trap.instruction_pointer(),
                e
            ),
        }
    }
}

/// Register the stack growth handler for SIGSEGV. Repeat calls succeed.
pub fn install() -> Result<(), RegisterError> {
    signal::register_chained(STACK_GROWTH_SIGNAL, &STACK_GROWTH, STACK_GROWTH_ORDER)
}

/// Reclaim excess stack pages of the calling thread's region.
///
/// `jex_cursor` is the current top of the managed stack. Returns whether the
/// stack is in the yellow zone afterwards.
#[inline(never)]
pub fn reguard(jex_cursor: usize) -> Result<bool, StackFault> {
    reguard_at(current::stack_pointer(), jex_cursor)
}

/// [`reguard`] with an explicit native stack pointer.
pub fn reguard_at(sp: usize, jex_cursor: usize) -> Result<bool, StackFault> {
    let region = Region::containing(sp).ok_or(StackFault::NotOnRegion { sp })?;
    let yellow = reclaim(region.header(), region.base(), sp, jex_cursor, &Mmap)?;
    log::trace!(
        "Reguarded region {:#x}: jex={} usr={} yellow={}",
        region.base(),
        region.header().jex_ext_count(),
        region.header().usr_ext_count(),
        yellow
    );
    Ok(yellow)
}
