//! Cooperative multitasking on a single host thread.
//!
//! A set of stackful coroutines share each host thread: control moves
//! only when a coroutine explicitly resumes another or yields back, so
//! between two suspension points nothing else runs. Coroutine stacks
//! are carved out of the host thread's own call stack and records are
//! reused after completion; the fast path never allocates.
//!
//! On top of the runtime sit coroutine-aware [sync] primitives
//! (mutexes and condition variables that block by yielding) and
//! per-coroutine [message] queues. Each host thread owns an isolated
//! coroutine world; nothing migrates between threads.
//!
//! ```
//! use std::ffi::c_void;
//!
//! fn double(arg: *mut c_void) -> *mut c_void {
//!     (arg as usize * 2) as *mut c_void
//! }
//!
//! let coroutine = loomy::create(double).unwrap();
//! assert_eq!(loomy::resume(coroutine, 21 as *mut c_void), 42 as *mut c_void);
//! ```

use std::ffi::c_void;

pub mod message;
pub mod runtime;
pub mod sync;
pub mod time;

pub use message::{Comessage, Payload};
#[cfg(not(feature = "single_core"))]
pub use runtime::set_threading_support_enabled;
pub use runtime::{
    configure, create, id, resumable, resume, set_id, state, terminate, yield_with, CoroHandle,
    Coroutine, CoroutineFunc, CoroutineId, CoroutineState, ID_NOT_SET,
};
pub use sync::condition::Cocondition;
pub use sync::mutex::{Comutex, MutexKind};

/// Outcome of a library call, as a closed set of codes.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Success = 0,
    Busy = 1,
    Error = 2,
    /// Retained for the closed set; no current path reports it.
    NoMem = 3,
    TimedOut = 4,
}

/// Returned by [resume] when the target is suspended inside a resume of
/// its own or has completed. Distinguishable from every valid pointer.
pub const NOT_RESUMABLE: *mut c_void = usize::MAX as *mut c_void;

/// Yielded by the blocking sync operations while they wait, and
/// therefore seen by whoever resumes the blocked coroutine.
pub const BLOCKED: *mut c_void = (usize::MAX - 1) as *mut c_void;
