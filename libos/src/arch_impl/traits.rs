//! Architecture-agnostic traits for trapped CPU state.
//!
//! These traits define the interface between architecture-specific signal
//! context handling and the dispatch code. Each architecture must implement
//! them over its `ucontext_t` layout.

/// Register state saved by the kernel when a signal was delivered.
///
/// Writes take effect when the handler returns.
pub trait TrapFrame {
    /// Returns the instruction pointer (RIP on x86, PC on ARM).
    fn instruction_pointer(&self) -> usize;

    /// Returns the stack pointer (RSP on x86, SP on ARM).
    fn stack_pointer(&self) -> usize;

    /// Sets the instruction pointer.
    fn set_instruction_pointer(&mut self, addr: usize);

    /// Sets the stack pointer.
    fn set_stack_pointer(&mut self, addr: usize);

    /// Lowest address [`synthesize_call`](Self::synthesize_call) writes on
    /// the trapped stack, if it writes there at all.
    fn call_slot(&self) -> Option<usize>;

    /// Rewrite the frame so that resuming enters `entry(arg0, arg1)` as if
    /// the trapped instruction had called it.
    ///
    /// The trapped PC becomes the return address. `entry` must not return:
    /// the trapped frame below the synthesized one is not restored.
    ///
    /// # Safety
    ///
    /// The trapped stack must be writable at [`call_slot`](Self::call_slot).
    unsafe fn synthesize_call(&mut self, entry: usize, arg0: usize, arg1: usize);
}
