//! The view of a delivered signal that chained handlers receive.

use crate::arch_impl::current::SignalFrame;
use crate::arch_impl::TrapFrame;

/// What a chained handler did with a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not this handler's concern; ask the next one
    NotHandled,
    /// Fixed; continue at the PC currently in the trap frame
    Resume,
    /// Fixed; continue at this address
    ResumeAt(usize),
}

/// A handler sharing a signal with others through the chain.
///
/// Runs in signal context: it must not block, allocate or log.
pub trait ChainedHandler: Sync + 'static {
    fn handle(&self, trap: &mut Trap<'_>) -> Outcome;
}

impl<F> ChainedHandler for F
where
    F: Fn(&mut Trap<'_>) -> Outcome + Sync + 'static,
{
    fn handle(&self, trap: &mut Trap<'_>) -> Outcome {
        self(trap)
    }
}

/// A delivered signal: number, siginfo and the trapped register state.
pub struct Trap<'a> {
    signum: i32,
    info: &'a libc::siginfo_t,
    frame: SignalFrame<'a>,
}

impl<'a> Trap<'a> {
    pub fn new(signum: i32, info: &'a libc::siginfo_t, uc: &'a mut libc::ucontext_t) -> Self {
        Trap {
            signum,
            info,
            frame: SignalFrame::new(uc),
        }
    }

    #[inline]
    pub fn signum(&self) -> i32 {
        self.signum
    }

    /// `si_code` of the delivery
    #[inline]
    pub fn code(&self) -> i32 {
        self.info.si_code
    }

    #[inline]
    pub fn siginfo(&self) -> &libc::siginfo_t {
        self.info
    }

    /// Faulting address for hardware traps, zero for everything else.
    pub fn fault_address(&self) -> usize {
        match self.signum {
            libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE | libc::SIGTRAP => {
                // SAFETY: si_addr is the active union member for these signals.
                unsafe { self.info.si_addr() as usize }
            }
            _ => 0,
        }
    }

    #[inline]
    pub fn instruction_pointer(&self) -> usize {
        self.frame.instruction_pointer()
    }

    #[inline]
    pub fn stack_pointer(&self) -> usize {
        self.frame.stack_pointer()
    }

    #[inline]
    pub fn frame_mut(&mut self) -> &mut SignalFrame<'a> {
        &mut self.frame
    }
}
