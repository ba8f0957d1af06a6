//! Process-wide signal chain: registration API and the OS-level router.
//!
//! The router is installed with `sigaction` when a signal first gets a
//! chained or last-resort handler and the previous action is restored once
//! its last handler is removed. Direct handlers are installed with the OS
//! themselves and never pass through the router.

use super::constants::{MAX_CHAINED_HANDLERS, MAX_SIGNAL, STACK_GROWTH_SIGNAL};
use super::table::{DirectHandler, Disposition, LastResortHandler, SignalTable, Transition};
use super::trap::{ChainedHandler, Trap};
use crate::arch_impl::TrapFrame;
use crate::error::RegisterError;
use crate::memory::{Mmap, Region};
use crate::stack;
use core::{mem, ptr};
use spin::Mutex;

static TABLE: SignalTable<MAX_CHAINED_HANDLERS> = SignalTable::new();

/// Actions displaced by our installations, indexed by signal number.
static SAVED: Mutex<[Option<libc::sigaction>; MAX_SIGNAL as usize + 1]> =
    Mutex::new([None; MAX_SIGNAL as usize + 1]);

type RawHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Install `handler` for `signum` with every signal masked except those in
/// `unmasked`.
fn install(
    signum: i32,
    handler: RawHandler,
    unmasked: &[i32],
    extra_flags: libc::c_int,
) -> Result<libc::sigaction, RegisterError> {
    // SAFETY: sigaction is plain data; all-zero is a valid empty action.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    let mut previous: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handler as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART | extra_flags;
    // SAFETY: both pointers refer to live locals.
    let ret = unsafe {
        libc::sigfillset(&mut action.sa_mask);
        for &unmasked in unmasked {
            libc::sigdelset(&mut action.sa_mask, unmasked);
        }
        libc::sigaction(signum, &action, &mut previous)
    };
    if ret != 0 {
        return Err(RegisterError::Install(last_errno()));
    }
    Ok(previous)
}

/// Chained handlers of any signal may run on a region and touch its stack
/// edge, so the growth signal stays deliverable inside all of them.
fn install_router(signum: i32) -> Result<libc::sigaction, RegisterError> {
    let flags = if signum == STACK_GROWTH_SIGNAL {
        // Growth may fault again while a growth fault is handled.
        libc::SA_NODEFER | libc::SA_ONSTACK
    } else {
        0
    };
    install(signum, route, &[STACK_GROWTH_SIGNAL], flags)
}

fn restore(saved: &mut [Option<libc::sigaction>], signum: i32) {
    if let Some(previous) = saved[signum as usize].take() {
        // SAFETY: `previous` was returned by sigaction for this signal.
        if unsafe { libc::sigaction(signum, &previous, ptr::null_mut()) } != 0 {
            log::warn!("signal {}: could not restore previous action", signum);
        }
    }
}

/// Apply a table change, installing or restoring the OS action as the
/// signal leaves or re-enters the unregistered state. A failed
/// installation is rolled back with `undo`.
fn commit(
    signum: i32,
    change: Result<Transition, RegisterError>,
    undo: impl FnOnce(),
    install_with: impl FnOnce(i32) -> Result<libc::sigaction, RegisterError>,
    saved: &mut [Option<libc::sigaction>],
) -> Result<(), RegisterError> {
    match change? {
        Transition::Left => match install_with(signum) {
            Ok(previous) => {
                saved[signum as usize] = Some(previous);
                Ok(())
            }
            Err(e) => {
                undo();
                log::warn!("signal {}: installation failed: {}", signum, e);
                Err(e)
            }
        },
        Transition::Entered => {
            restore(saved, signum);
            Ok(())
        }
        Transition::Unchanged => Ok(()),
    }
}

/// Register `handler` at chain position `order` for `signum`.
///
/// Re-registering the identical handler at the same position succeeds
/// without change.
pub fn register_chained<H: ChainedHandler>(
    signum: i32,
    handler: &'static H,
    order: usize,
) -> Result<(), RegisterError> {
    let mut saved = SAVED.lock();
    let change = TABLE.register_chained(signum, handler, order);
    commit(
        signum,
        change,
        || {
            let _ = TABLE.unregister_chained(signum, handler);
        },
        install_router,
        &mut *saved,
    )?;
    log::debug!("signal {}: chained handler at order {}", signum, order);
    Ok(())
}

/// Remove `handler` from the chain of `signum`.
pub fn unregister_chained<H: ChainedHandler>(
    signum: i32,
    handler: &'static H,
) -> Result<(), RegisterError> {
    let mut saved = SAVED.lock();
    let change = TABLE.unregister_chained(signum, handler);
    commit(signum, change, || {}, install_router, &mut *saved)?;
    log::debug!("signal {}: chained handler removed", signum);
    Ok(())
}

/// Give `handler` exclusive ownership of `signum`, running with every
/// signal masked.
pub fn register_direct(signum: i32, handler: DirectHandler) -> Result<(), RegisterError> {
    let mut saved = SAVED.lock();
    let change = TABLE.register_direct(signum, handler);
    commit(
        signum,
        change,
        || {
            let _ = TABLE.unregister_direct(signum, handler);
        },
        |signum| install(signum, handler, &[], 0),
        &mut *saved,
    )?;
    log::debug!("signal {}: direct handler installed", signum);
    Ok(())
}

pub fn unregister_direct(signum: i32, handler: DirectHandler) -> Result<(), RegisterError> {
    let mut saved = SAVED.lock();
    let change = TABLE.unregister_direct(signum, handler);
    commit(signum, change, || {}, install_router, &mut *saved)?;
    log::debug!("signal {}: direct handler removed", signum);
    Ok(())
}

/// Install the handler entered when no chained handler claims `signum`.
pub fn register_last_resort(signum: i32, handler: LastResortHandler) -> Result<(), RegisterError> {
    let mut saved = SAVED.lock();
    let change = TABLE.register_last_resort(signum, handler);
    commit(
        signum,
        change,
        || {
            let _ = TABLE.unregister_last_resort(signum, handler);
        },
        install_router,
        &mut *saved,
    )?;
    log::debug!("signal {}: last-resort handler installed", signum);
    Ok(())
}

pub fn unregister_last_resort(
    signum: i32,
    handler: LastResortHandler,
) -> Result<(), RegisterError> {
    let mut saved = SAVED.lock();
    let change = TABLE.unregister_last_resort(signum, handler);
    commit(signum, change, || {}, install_router, &mut *saved)
}

pub fn disposition(signum: i32) -> Disposition {
    TABLE.disposition(signum)
}

/// The handler the OS runs for every chained signal.
extern "C" fn route(signum: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    // SAFETY: SA_SIGINFO deliveries pass valid siginfo and ucontext pointers.
    let (info, uc) = unsafe { (&*info, &mut *(context as *mut libc::ucontext_t)) };
    let mut trap = Trap::new(signum, info, uc);

    let region = if signum == STACK_GROWTH_SIGNAL {
        Region::containing(trap.stack_pointer())
    } else {
        None
    };
    if let Some(region) = region {
        if !region.header().enter_fault() {
            crate::fatal!(
                "nested SEGV at {:#x} (pc {:#x}) on stack region {:#x}",
                trap.fault_address(),
                trap.instruction_pointer(),
                region.base()
            );
        }
    }

    let resume = match TABLE.dispatch(&mut trap) {
        Some(pc) => pc,
        None => match TABLE.last_resort(signum) {
            Some(handler) => {
                let fault_address = trap.fault_address();
                let fault_pc = trap.instruction_pointer();
                if let Some(region) = region {
                    let header = region.header();
                    header.record_fault(fault_address, fault_pc);
                    if let Some(slot) = trap.frame_mut().call_slot() {
                        // The slot may sit below a native stack that just overflowed.
                        let extended = stack::extend_native_to(header, region.base(), slot, &Mmap);
                        if let Err(e) = extended {
                            crate::fatal!("last-resort frame at {:#x}: {}", slot, e);
                        }
                    }
                }
                // SAFETY: the trapped stack is the faulting thread's own.
                unsafe {
                    trap.frame_mut()
                        .synthesize_call(handler as usize, fault_address, fault_pc)
                };
                handler as usize
            }
            None => crate::fatal!(
                "unhandled signal {} at pc {:#x} (address {:#x}, code {})",
                signum,
                trap.instruction_pointer(),
                trap.fault_address(),
                trap.code()
            ),
        },
    };

    trap.frame_mut().set_instruction_pointer(resume);
    if let Some(region) = region {
        region.header().leave_fault();
    }
}
