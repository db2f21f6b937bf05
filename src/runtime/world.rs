//! Per-thread coroutine world storage.
//!
//! A [World] bundles everything one host thread's scheduler owns: the
//! first coroutine record (standing in for the thread itself), the
//! running and idle list heads, the scratch slot for value passing, and
//! the thread's stack reservation size. Storage is thread-local by
//! default; disabling threading support swaps in one process-global
//! world shared by contract with a single-threaded caller.
//!
//! Accessors are closure-based and no borrow is ever held across a
//! context switch: callers extract raw pointers inside the closure and
//! switch outside it.

use std::cell::RefCell;
use std::ptr;

use log::debug;

use super::stack;
use super::{Coroutine, CoroutineState, Passed};

pub(crate) struct World {
    first_storage: Coroutine,
    pub(crate) first: *mut Coroutine,
    pub(crate) running: *mut Coroutine,
    pub(crate) idle: *mut Coroutine,
    pub(crate) passed: Passed,
    pub(crate) stack_blocks: usize,
    pub(crate) configured: bool,
    pub(crate) live: bool,
}

impl World {
    const fn new() -> Self {
        World {
            first_storage: Coroutine::new(),
            first: ptr::null_mut(),
            running: ptr::null_mut(),
            idle: ptr::null_mut(),
            passed: Passed::Data(ptr::null_mut()),
            stack_blocks: stack::DEFAULT_STACK_BYTES / stack::BLOCK_BYTES,
            configured: false,
            live: false,
        }
    }

    /// Bind the world to its first coroutine on first use. The first
    /// record represents the host thread; it heads the running list
    /// until it resumes somebody.
    pub(crate) fn bootstrap(&mut self) {
        if self.live {
            return;
        }

        if self.first.is_null() {
            // Storage lives inside the world itself, which never moves
            // once its thread-local (or global) cell is initialized.
            self.first = &mut self.first_storage;
        }
        unsafe { (*self.first).state = CoroutineState::Running };
        self.running = self.first;
        self.live = true;
        freeze_threading_choice();

        debug!(
            "coroutine world bootstrapped, stack reservation {} bytes",
            self.stack_blocks * stack::BLOCK_BYTES
        );
    }
}

/// The process-global world. Only sound while every library call comes
/// from a single thread, which is the contract of disabling threading
/// support (and of the `single_core` build).
struct SharedShell(RefCell<World>);

unsafe impl Sync for SharedShell {}

static SHARED: SharedShell = SharedShell(RefCell::new(World::new()));

#[cfg(not(feature = "single_core"))]
mod storage {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::Status;

    /// Cache padded to avoid false sharing between per-thread worlds.
    #[repr(align(128))]
    struct Shell(RefCell<World>);

    thread_local! {
        /// Each thread gets its own independent world.
        static WORLD: Shell = const { Shell(RefCell::new(World::new())) };
    }

    static THREADING_ENABLED: AtomicBool = AtomicBool::new(true);
    static ANY_WORLD_LIVE: AtomicBool = AtomicBool::new(false);

    /// Runs a closure that's given a reference to this thread's world.
    pub(crate) fn with<T>(f: impl FnOnce(&mut World) -> T) -> T {
        if THREADING_ENABLED.load(Ordering::Acquire) {
            WORLD.with(|shell| {
                let mut world = shell.0.borrow_mut();
                f(&mut world)
            })
        } else {
            let mut world = SHARED.0.borrow_mut();
            f(&mut world)
        }
    }

    /// Choose between thread-local and process-global world storage.
    /// Process-wide, and frozen once any world has bootstrapped.
    pub(crate) fn set_threading_support_enabled(enabled: bool) -> Status {
        if ANY_WORLD_LIVE.load(Ordering::Acquire) {
            return Status::Busy;
        }

        THREADING_ENABLED.store(enabled, Ordering::Release);
        debug!("threading support {}", if enabled { "enabled" } else { "disabled" });
        Status::Success
    }

    pub(crate) fn freeze_threading_choice() {
        ANY_WORLD_LIVE.store(true, Ordering::Release);
    }
}

#[cfg(feature = "single_core")]
mod storage {
    use super::*;

    /// Runs a closure that's given a reference to the process world.
    pub(crate) fn with<T>(f: impl FnOnce(&mut World) -> T) -> T {
        let mut world = SHARED.0.borrow_mut();
        f(&mut world)
    }

    pub(crate) fn freeze_threading_choice() {}
}

pub(crate) use storage::with;

#[cfg(not(feature = "single_core"))]
pub(crate) use storage::set_threading_support_enabled;

use storage::freeze_threading_choice;
