//! x86_64 Linux signal frames and stack switching.

use super::traits::TrapFrame;
use core::arch::asm;

/// SysV red zone below RSP that leaf code may use without adjusting RSP
const RED_ZONE: usize = 128;

/// Trapped register state of a delivered signal.
pub struct SignalFrame<'a> {
    uc: &'a mut libc::ucontext_t,
}

impl<'a> SignalFrame<'a> {
    #[inline]
    pub fn new(uc: &'a mut libc::ucontext_t) -> Self {
        SignalFrame { uc }
    }

    #[inline]
    fn reg(&self, index: libc::c_int) -> usize {
        self.uc.uc_mcontext.gregs[index as usize] as usize
    }

    /// Callee sees RSP = 8 mod 16 with the return address on top.
    #[inline]
    fn return_slot(&self) -> usize {
        ((self.stack_pointer() - RED_ZONE) & !0xf) - 8
    }

    #[inline]
    fn set_reg(&mut self, index: libc::c_int, value: usize) {
        self.uc.uc_mcontext.gregs[index as usize] = value as libc::greg_t;
    }
}

impl TrapFrame for SignalFrame<'_> {
    #[inline]
    fn instruction_pointer(&self) -> usize {
        self.reg(libc::REG_RIP)
    }

    #[inline]
    fn stack_pointer(&self) -> usize {
        self.reg(libc::REG_RSP)
    }

    #[inline]
    fn set_instruction_pointer(&mut self, addr: usize) {
        self.set_reg(libc::REG_RIP, addr);
    }

    #[inline]
    fn set_stack_pointer(&mut self, addr: usize) {
        self.set_reg(libc::REG_RSP, addr);
    }

    #[inline]
    fn call_slot(&self) -> Option<usize> {
        Some(self.return_slot())
    }

    unsafe fn synthesize_call(&mut self, entry: usize, arg0: usize, arg1: usize) {
        let sp = self.return_slot();
        (sp as *mut usize).write(self.instruction_pointer());
        self.set_stack_pointer(sp);
        self.set_reg(libc::REG_RDI, arg0);
        self.set_reg(libc::REG_RSI, arg1);
        self.set_instruction_pointer(entry);
    }
}

/// Current stack pointer of the caller.
#[inline(always)]
pub fn stack_pointer() -> usize {
    let sp: usize;
    // SAFETY: reads RSP only.
    unsafe { asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags)) };
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
        "mov r12, rsp",
        "mov rsp, {top}",
        "call {entry}",
        "mov rsp, r12",
        top = in(reg) top,
        entry = in(reg) entry,
        in("rdi") arg,
        out("r12") _,
        clobber_abi("C"),
    );
}
