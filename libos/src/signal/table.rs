//! Per-signal dispatch table
//!
//! Each signal has `N` ordered chained slots, one direct slot and one
//! last-resort slot. A signal is in exactly one of three states:
//!
//! - unregistered: every slot empty
//! - chained: at least one chained or last-resort slot set, direct empty
//! - direct: only the direct slot set
//!
//! Readers (the router, in signal context) never lock. Writers must be
//! serialized by the caller. Cleared chained entries are never freed
//! because a delivery on another thread may still be running them. Up to
//! `N` of them per signal are parked and revived when the same handler is
//! registered again, so a handler cycling on and off reuses one entry.
//! Entries cleared while the parking slots are full stay leaked.

use super::constants::{MAX_SIGNAL, STACK_GROWTH_SIGNAL};
use super::trap::{ChainedHandler, Outcome, Trap};
use crate::error::RegisterError;
use core::any::TypeId;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Exclusive handler entered directly by the OS.
pub type DirectHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Handler entered through a synthesized call when no chained handler
/// claims a signal. Receives the fault address and the trapped PC.
pub type LastResortHandler = extern "C" fn(usize, usize) -> !;

const SIGNAL_SLOTS: usize = MAX_SIGNAL as usize + 1;

/// Identity of a registered handler: its concrete type, plus its address
/// unless it is zero-sized.
///
/// References to a zero-sized value (every fn item) carry no stable
/// address, so the type alone identifies them.
#[derive(Clone, Copy, PartialEq, Eq)]
struct HandlerId {
    addr: usize,
    type_id: TypeId,
}

impl HandlerId {
    fn of<H: ChainedHandler>(handler: &'static H) -> Self {
        let addr = if core::mem::size_of::<H>() == 0 {
            0
        } else {
            handler as *const H as usize
        };
        HandlerId {
            addr,
            type_id: TypeId::of::<H>(),
        }
    }
}

struct ChainEntry {
    id: HandlerId,
    handler: &'static dyn ChainedHandler,
}

struct SignalEntry<const N: usize> {
    chained: [AtomicPtr<ChainEntry>; N],
    retired: [AtomicPtr<ChainEntry>; N],
    direct: AtomicUsize,
    last_resort: AtomicUsize,
}

impl<const N: usize> SignalEntry<N> {
    const fn new() -> Self {
        SignalEntry {
            chained: [const { AtomicPtr::new(ptr::null_mut()) }; N],
            retired: [const { AtomicPtr::new(ptr::null_mut()) }; N],
            direct: AtomicUsize::new(0),
            last_resort: AtomicUsize::new(0),
        }
    }

    fn chained_count(&self) -> usize {
        self.chained
            .iter()
            .filter(|slot| !slot.load(Ordering::Acquire).is_null())
            .count()
    }

    /// Take back a parked entry for `id`, or allocate a new one.
    fn revive_or_leak(
        &self,
        id: HandlerId,
        handler: &'static dyn ChainedHandler,
    ) -> *mut ChainEntry {
        for slot in &self.retired {
            let parked = slot.load(Ordering::Acquire);
            // SAFETY: chain entries are never freed.
            if !parked.is_null() && unsafe { (*parked).id } == id {
                slot.store(ptr::null_mut(), Ordering::Release);
                return parked;
            }
        }
        Box::leak(Box::new(ChainEntry { id, handler }))
    }

    fn park(&self, cleared: *mut ChainEntry) {
        if let Some(slot) = self
            .retired
            .iter()
            .find(|slot| slot.load(Ordering::Acquire).is_null())
        {
            slot.store(cleared, Ordering::Release);
        }
    }

    fn is_unregistered(&self) -> bool {
        self.direct.load(Ordering::Acquire) == 0
            && self.last_resort.load(Ordering::Acquire) == 0
            && self.chained_count() == 0
    }
}

/// Registration state of one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Unregistered,
    /// Number of occupied chained slots, last-resort slot included
    Chained(usize),
    Direct,
}

/// Whether a registration change moved the signal into or out of
/// [`Disposition::Unregistered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Entered,
    Left,
    Unchanged,
}

pub struct SignalTable<const N: usize> {
    entries: [SignalEntry<N>; SIGNAL_SLOTS],
}

impl<const N: usize> SignalTable<N> {
    pub const fn new() -> Self {
        SignalTable {
            entries: [const { SignalEntry::new() }; SIGNAL_SLOTS],
        }
    }

    fn entry(&self, signum: i32) -> Result<&SignalEntry<N>, RegisterError> {
        if signum < 1 || signum > MAX_SIGNAL {
            return Err(RegisterError::InvalidArgument);
        }
        Ok(&self.entries[signum as usize])
    }

    pub fn disposition(&self, signum: i32) -> Disposition {
        let Ok(entry) = self.entry(signum) else {
            return Disposition::Unregistered;
        };
        if entry.direct.load(Ordering::Acquire) != 0 {
            return Disposition::Direct;
        }
        let count = entry.chained_count()
            + usize::from(entry.last_resort.load(Ordering::Acquire) != 0);
        if count == 0 {
            Disposition::Unregistered
        } else {
            Disposition::Chained(count)
        }
    }

    /// Put `handler` at chain position `order`.
    ///
    /// Registering the identical handler at the same position again is a
    /// no-op success.
    pub fn register_chained<H: ChainedHandler>(
        &self,
        signum: i32,
        handler: &'static H,
        order: usize,
    ) -> Result<Transition, RegisterError> {
        let entry = self.entry(signum)?;
        if order >= N {
            return Err(RegisterError::InvalidArgument);
        }
        if entry.direct.load(Ordering::Acquire) != 0 {
            return Err(RegisterError::Exists);
        }

        let id = HandlerId::of(handler);
        let slot = &entry.chained[order];
        let current = slot.load(Ordering::Acquire);
        if !current.is_null() {
            // SAFETY: chain entries are never freed.
            return if unsafe { (*current).id } == id {
                Ok(Transition::Unchanged)
            } else {
                Err(RegisterError::Exists)
            };
        }

        let was_unregistered = entry.is_unregistered();
        slot.store(entry.revive_or_leak(id, handler), Ordering::Release);
        Ok(if was_unregistered {
            Transition::Left
        } else {
            Transition::Unchanged
        })
    }

    /// Clear the first chained slot holding exactly `handler`.
    pub fn unregister_chained<H: ChainedHandler>(
        &self,
        signum: i32,
        handler: &'static H,
    ) -> Result<Transition, RegisterError> {
        let entry = self.entry(signum)?;
        let id = HandlerId::of(handler);
        for slot in &entry.chained {
            let current = slot.load(Ordering::Acquire);
            // SAFETY: chain entries are never freed.
            if !current.is_null() && unsafe { (*current).id } == id {
                slot.store(ptr::null_mut(), Ordering::Release);
                entry.park(current);
                return Ok(Self::settled(entry));
            }
        }
        Err(RegisterError::NotFound)
    }

    pub fn register_direct(
        &self,
        signum: i32,
        handler: DirectHandler,
    ) -> Result<Transition, RegisterError> {
        let entry = self.entry(signum)?;
        if signum == STACK_GROWTH_SIGNAL {
            return Err(RegisterError::InvalidArgument);
        }
        if !entry.is_unregistered() {
            return Err(RegisterError::Exists);
        }
        entry.direct.store(handler as usize, Ordering::Release);
        Ok(Transition::Left)
    }

    pub fn unregister_direct(
        &self,
        signum: i32,
        handler: DirectHandler,
    ) -> Result<Transition, RegisterError> {
        let entry = self.entry(signum)?;
        entry
            .direct
            .compare_exchange(handler as usize, 0, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RegisterError::NotFound)?;
        Ok(Transition::Entered)
    }

    pub fn direct(&self, signum: i32) -> Option<DirectHandler> {
        let addr = self.entry(signum).ok()?.direct.load(Ordering::Acquire);
        // SAFETY: non-zero values were stored from a `DirectHandler`.
        (addr != 0).then(|| unsafe { core::mem::transmute::<usize, DirectHandler>(addr) })
    }

    /// Install the handler entered when no chained handler claims `signum`.
    pub fn register_last_resort(
        &self,
        signum: i32,
        handler: LastResortHandler,
    ) -> Result<Transition, RegisterError> {
        let entry = self.entry(signum)?;
        if entry.direct.load(Ordering::Acquire) != 0 {
            return Err(RegisterError::Exists);
        }
        let was_unregistered = entry.is_unregistered();
        match entry.last_resort.compare_exchange(
            0,
            handler as usize,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) if was_unregistered => Ok(Transition::Left),
            Ok(_) => Ok(Transition::Unchanged),
            Err(current) if current == handler as usize => Ok(Transition::Unchanged),
            Err(_) => Err(RegisterError::Exists),
        }
    }

    pub fn unregister_last_resort(
        &self,
        signum: i32,
        handler: LastResortHandler,
    ) -> Result<Transition, RegisterError> {
        let entry = self.entry(signum)?;
        entry
            .last_resort
            .compare_exchange(handler as usize, 0, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RegisterError::NotFound)?;
        Ok(Self::settled(entry))
    }

    pub fn last_resort(&self, signum: i32) -> Option<LastResortHandler> {
        let addr = self.entry(signum).ok()?.last_resort.load(Ordering::Acquire);
        // SAFETY: non-zero values were stored from a `LastResortHandler`.
        (addr != 0).then(|| unsafe { core::mem::transmute::<usize, LastResortHandler>(addr) })
    }

    fn settled(entry: &SignalEntry<N>) -> Transition {
        if entry.is_unregistered() {
            Transition::Entered
        } else {
            Transition::Unchanged
        }
    }

    /// Offer the trap to the chained handlers in order.
    ///
    /// Returns the PC to resume at if one of them claimed it.
    pub fn dispatch(&self, trap: &mut Trap<'_>) -> Option<usize> {
        let entry = self.entry(trap.signum()).ok()?;
        for slot in &entry.chained {
            let current = slot.load(Ordering::Acquire);
            if current.is_null() {
                continue;
            }
            // SAFETY: chain entries are never freed.
            match unsafe { (*current).handler }.handle(trap) {
                Outcome::NotHandled => continue,
                Outcome::Resume => return Some(trap.instruction_pointer()),
                Outcome::ResumeAt(pc) => return Some(pc),
            }
        }
        None
    }
}

impl<const N: usize> Default for SignalTable<N> {
    fn default() -> Self {
        Self::new()
    }
}
