//! Thread bootstrap: run code on a stack region with lifecycle hooks.
//!
//! Ordering contract for one region:
//!
//! 1. stack growth handler registered (process-wide, idempotent)
//! 2. alternate signal stack installed inside the region
//! 3. start hook called with the region
//! 4. thread body runs on the region
//! 5. death hook called with the region
//! 6. alternate signal stack disabled
//! 7. region returned to the allocator

use crate::arch_impl::current;
use crate::error::BootstrapError;
use crate::memory::{regions, Region};
use crate::stack;
use core::ptr;
use spin::RwLock;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

/// Lifecycle hook, receives the thread's region.
pub type LifecycleHook = fn(Region);

/// Stack for the OS thread that only switches onto the region
const LAUNCH_STACK_SIZE: usize = 64 * 1024;

/// Keep the switched-to top 16-byte aligned with room for a return slot.
const REGION_TOP_RESERVE: usize = 64;

/// At most one hook of each kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadHooks {
    pub on_start: Option<LifecycleHook>,
    pub on_death: Option<LifecycleHook>,
}

impl ThreadHooks {
    pub const NONE: ThreadHooks = ThreadHooks {
        on_start: None,
        on_death: None,
    };
}

/// Starts and ends threads on regions from the process-wide allocator.
pub struct Bootstrap {
    hooks: RwLock<ThreadHooks>,
}

static BOOTSTRAP: Bootstrap = Bootstrap::new(ThreadHooks::NONE);

/// The process-wide bootstrap over the process-wide allocator.
#[inline]
pub fn bootstrap() -> &'static Bootstrap {
    &BOOTSTRAP
}

/// Set the process-wide start hook. The last registration wins.
pub fn register_start_hook(hook: LifecycleHook) {
    BOOTSTRAP.set_start_hook(Some(hook));
}

/// Set the process-wide death hook. The last registration wins.
pub fn register_death_hook(hook: LifecycleHook) {
    BOOTSTRAP.set_death_hook(Some(hook));
}

/// Spawn an OS thread whose body runs on a fresh region.
pub fn spawn<F, T>(f: F) -> Result<JoinHandle<T>, BootstrapError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    BOOTSTRAP.spawn(f)
}

/// Run `f` on `region` from the calling thread.
pub fn run_on_region<F, R>(region: Region, f: F) -> Result<R, BootstrapError>
where
    F: FnOnce() -> R,
{
    BOOTSTRAP.run_on_region(region, f)
}

/// Run `f` on a fresh region from the calling thread, typically `main`.
pub fn run_main_on_region<F, R>(f: F) -> Result<R, BootstrapError>
where
    F: FnOnce() -> R,
{
    BOOTSTRAP.run_on_new_region(f)
}

/// Handle to a thread started by [`Bootstrap::spawn`].
pub struct JoinHandle<T> {
    inner: thread::JoinHandle<Result<T, BootstrapError>>,
    region: Region,
}

impl<T> JoinHandle<T> {
    /// The region the thread runs on. Reused by another thread once joined.
    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    #[inline]
    pub fn thread(&self) -> &thread::Thread {
        self.inner.thread()
    }

    /// Wait for the thread. A panic in its body is returned as `Err`.
    pub fn join(self) -> thread::Result<Result<T, BootstrapError>> {
        self.inner.join()
    }
}

struct Launch<'a, F, R> {
    bootstrap: &'a Bootstrap,
    region: Region,
    body: Option<F>,
    started: bool,
    result: Option<Result<R, Box<dyn Any + Send>>>,
}

extern "C" fn trampoline<F, R>(launch: usize)
where
    F: FnOnce() -> R,
{
    // SAFETY: `launch` is the address of a live `Launch` on the switching
    // thread's previous stack, which stays intact until we return.
    let launch = unsafe { &mut *(launch as *mut Launch<'_, F, R>) };
    let Some(body) = launch.body.take() else {
        return;
    };
    let bootstrap = launch.bootstrap;
    let region = launch.region;
    let started = &mut launch.started;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        bootstrap.start_region(region, started).map(|()| body())
    }));
    launch.result = Some(match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Box::new(e) as Box<dyn Any + Send>),
        Err(payload) => Err(payload),
    });
}

impl Bootstrap {
    pub const fn new(hooks: ThreadHooks) -> Self {
        Bootstrap {
            hooks: RwLock::new(hooks),
        }
    }

    pub fn hooks(&self) -> ThreadHooks {
        *self.hooks.read()
    }

    pub fn set_start_hook(&self, hook: Option<LifecycleHook>) {
        self.hooks.write().on_start = hook;
    }

    pub fn set_death_hook(&self, hook: Option<LifecycleHook>) {
        self.hooks.write().on_death = hook;
    }

    /// Prepare the calling thread, already running on `region`, and fire
    /// the start hook. `started` is set once the alternate stack is live.
    fn start_region(&self, region: Region, started: &mut bool) -> Result<(), BootstrapError> {
        stack::install()?;
        install_alt_stack(region)?;
        *started = true;
        log::debug!("Thread {} started on region {:#x}", region.thread_id(), region.base());
        if let Some(hook) = self.hooks().on_start {
            hook(region);
        }
        Ok(())
    }

    /// Tear down a region whose thread has finished. Must not run on
    /// `region` itself.
    pub fn end_region(&self, region: Region) {
        let header = region.header();
        crate::guarantee!(
            !header.is_complete_thread() && !header.is_complete_managed_thread(),
            "region {:#x} ended with completion flags {:#x} still set",
            region.base(),
            header.complete_flags()
        );
        if let Some(hook) = self.hooks().on_death {
            hook(region);
        }
        self.release(region);
    }

    fn release(&self, region: Region) {
        disable_alt_stack();
        log::debug!("Thread {} left region {:#x}", region.thread_id(), region.base());
        regions().delete_region(region);
    }

    /// Switch the calling thread onto `region`, run `f`, switch back and
    /// end the region.
    ///
    /// A panic in `f` is re-raised here after the region is released.
    pub fn run_on_region<F, R>(&self, region: Region, f: F) -> Result<R, BootstrapError>
    where
        F: FnOnce() -> R,
    {
        let mut launch = Launch {
            bootstrap: self,
            region,
            body: Some(f),
            started: false,
            result: None,
        };
        let top = (region.top() - REGION_TOP_RESERVE) & !0xf;
        // SAFETY: the native stack of a region is mapped below its top and
        // grows on demand; the trampoline catches every unwind.
        unsafe {
            current::switch_stack(
                top,
                trampoline::<F, R>,
                ptr::addr_of_mut!(launch) as usize,
            )
        };

        if launch.started {
            self.end_region(region);
        } else {
            regions().delete_region(region);
        }

        match launch.result {
            Some(Ok(value)) => Ok(value),
            Some(Err(payload)) => match payload.downcast::<BootstrapError>() {
                Ok(e) => Err(*e),
                Err(payload) => panic::resume_unwind(payload),
            },
            None => unreachable!("trampoline returned without a result"),
        }
    }

    pub fn run_on_new_region<F, R>(&self, f: F) -> Result<R, BootstrapError>
    where
        F: FnOnce() -> R,
    {
        let region = regions().create_region()?;
        self.run_on_region(region, f)
    }

    /// Spawn an OS thread on a minimal launch stack that immediately
    /// switches onto a fresh region.
    pub fn spawn<F, T>(&'static self, f: F) -> Result<JoinHandle<T>, BootstrapError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let region = regions().create_region()?;
        let spawned = thread::Builder::new()
            .stack_size(LAUNCH_STACK_SIZE)
            .spawn(move || self.run_on_region(region, f));
        match spawned {
            Ok(inner) => Ok(JoinHandle { inner, region }),
            Err(e) => {
                regions().delete_region(region);
                Err(BootstrapError::Spawn(e))
            }
        }
    }
}

fn install_alt_stack(region: Region) -> Result<(), BootstrapError> {
    let (base, size) = region.alt_signal_stack();
    let stack = libc::stack_t {
        ss_sp: base as *mut libc::c_void,
        ss_flags: 0,
        ss_size: size,
    };
    // SAFETY: the alternate stack pages are mapped for the region's lifetime.
    if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(BootstrapError::AltStack(errno));
    }
    Ok(())
}

fn disable_alt_stack() {
    let stack = libc::stack_t {
        ss_sp: ptr::null_mut(),
        ss_flags: libc::SS_DISABLE,
        ss_size: 0,
    };
    // SAFETY: disabling takes no memory.
    if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
        log::warn!("sigaltstack disable failed: {}", std::io::Error::last_os_error());
    }
}
