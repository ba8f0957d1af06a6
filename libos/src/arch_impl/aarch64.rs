//! aarch64 Linux signal frames and stack switching.

use super::traits::TrapFrame;
use core::arch::asm;

/// Trapped register state of a delivered signal.
pub struct SignalFrame<'a> {
    uc: &'a mut libc::ucontext_t,
}

impl<'a> SignalFrame<'a> {
    #[inline]
    pub fn new(uc: &'a mut libc::ucontext_t) -> Self {
        SignalFrame { uc }
    }
}

impl TrapFrame for SignalFrame<'_> {
    #[inline]
    fn instruction_pointer(&self) -> usize {
        self.uc.uc_mcontext.pc as usize
    }

    #[inline]
    fn stack_pointer(&self) -> usize {
        self.uc.uc_mcontext.sp as usize
    }

    #[inline]
    fn set_instruction_pointer(&mut self, addr: usize) {
        self.uc.uc_mcontext.pc = addr as u64;
    }

    #[inline]
    fn set_stack_pointer(&mut self, addr: usize) {
        self.uc.uc_mcontext.sp = addr as u64;
    }

    /// The return address goes in the link register.
    #[inline]
    fn call_slot(&self) -> Option<usize> {
        None
    }

    unsafe fn synthesize_call(&mut self, entry: usize, arg0: usize, arg1: usize) {
        let sp = self.stack_pointer() & !0xf;
        self.uc.uc_mcontext.regs[30] = self.instruction_pointer() as u64;
        self.uc.uc_mcontext.regs[0] = arg0 as u64;
        self.uc.uc_mcontext.regs[1] = arg1 as u64;
        self.set_stack_pointer(sp);
        self.set_instruction_pointer(entry);
    }
}

/// Current stack pointer of the caller.
#[inline(always)]
pub fn stack_pointer() -> usize {
    let sp: usize;
    // SAFETY: reads SP only.
    unsafe { asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags)) };
    sp
}

/// Run `entry(arg)` on the stack ending at `top`, then come back.
///
/// # Safety
///
/// `top` must be 16-byte aligned and the memory below it must be a usable
/// stack for everything `entry` does. `entry` must not unwind.
pub unsafe fn switch_stack(top: usize, entry: extern "C" fn(usize), arg: usize) {
    asm!(
        "mov x20, sp",
        "mov sp, {top}",
        "blr {entry}",
        "mov sp, x20",
        top = in(reg) top,
        entry = in(reg) entry,
        in("x0") arg,
        out("x20") _,
        clobber_abi("C"),
    );
}
