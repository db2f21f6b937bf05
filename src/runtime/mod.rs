//! Cooperative coroutine runtime.
//!
//! Each host thread owns an isolated world of stackful coroutines that
//! hand the CPU to each other explicitly. Two LIFO lists drive
//! scheduling: the *running* list, whose head owns the CPU while
//! everything below it is suspended inside an outstanding [resume], and
//! the *idle* list of parked records waiting for [create] to hand them a
//! new function. A single scratch slot in the world carries the value
//! passed across every switch.
//!
//! Coroutine stacks are carved from the host thread's call stack (see
//! [stack]), so records live inside coroutine frames and are linked with
//! raw pointers; nothing here touches the heap.

use std::ffi::c_void;
use std::ptr;

use log::{debug, trace};

use crate::message::Comessage;
use crate::sync::condition::Cocondition;
use crate::sync::mutex::Comutex;
use crate::Status;

use context_switch::{Captured, Context};

pub(crate) mod context_switch;
pub(crate) mod stack;
pub(crate) mod world;

#[cfg(all(feature = "id_width_8", any(feature = "id_width_16", feature = "id_width_32")))]
compile_error!("select at most one id width feature");

#[cfg(all(feature = "id_width_16", feature = "id_width_32"))]
compile_error!("select at most one id width feature");

#[cfg(feature = "id_width_8")]
pub type CoroutineId = i8;
#[cfg(all(feature = "id_width_16", not(feature = "id_width_8")))]
pub type CoroutineId = i16;
#[cfg(all(feature = "id_width_32", not(any(feature = "id_width_8", feature = "id_width_16"))))]
pub type CoroutineId = i32;
#[cfg(not(any(feature = "id_width_8", feature = "id_width_16", feature = "id_width_32")))]
pub type CoroutineId = i64;

/// Id of a coroutine that has not been assigned one.
pub const ID_NOT_SET: CoroutineId = CoroutineId::MIN;

/// A function a coroutine runs to completion between activations.
pub type CoroutineFunc = fn(*mut c_void) -> *mut c_void;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoroutineState {
    NotRunning,
    Running,
    Blocked,
}

/// Bookkeeping record of a single coroutine.
///
/// Records live inside their coroutine's own carved stack frame, except
/// the first record of each thread, which lives in the world (or in
/// caller-managed storage handed to [configure]). A record whose `next`
/// link is non-null sits on the running or idle list and is not
/// externally resumable.
#[derive(Debug)]
pub struct Coroutine {
    pub(crate) context: Context,
    pub(crate) reset_context: Context,
    pub(crate) id: CoroutineId,
    pub(crate) state: CoroutineState,
    pub(crate) next: *mut Coroutine,
    pub(crate) next_to_signal: *mut Coroutine,
    pub(crate) prev_to_signal: *mut Coroutine,
    pub(crate) waiting_on: *mut Cocondition,
    pub(crate) inbox_head: *mut Comessage,
    pub(crate) inbox_tail: *mut Comessage,
}

impl Coroutine {
    pub const fn new() -> Self {
        Coroutine {
            context: Context::new(),
            reset_context: Context::new(),
            id: ID_NOT_SET,
            state: CoroutineState::NotRunning,
            next: ptr::null_mut(),
            next_to_signal: ptr::null_mut(),
            prev_to_signal: ptr::null_mut(),
            waiting_on: ptr::null_mut(),
            inbox_head: ptr::null_mut(),
            inbox_tail: ptr::null_mut(),
        }
    }
}

impl Default for Coroutine {
    fn default() -> Self {
        Coroutine::new()
    }
}

/// Handle to a coroutine record, handed out by [create].
///
/// Records are never freed (stacks stay carved for the lifetime of the
/// host thread), so a handle stays valid after its coroutine completes;
/// it just stops being resumable until [create] reactivates the record.
/// Handles are neither `Send` nor `Sync`: a coroutine belongs to the
/// host thread that created it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CoroHandle(ptr::NonNull<Coroutine>);

impl CoroHandle {
    pub(crate) fn new(raw: *mut Coroutine) -> Option<Self> {
        ptr::NonNull::new(raw).map(CoroHandle)
    }

    pub(crate) fn as_ptr(self) -> *mut Coroutine {
        self.0.as_ptr()
    }
}

/// Value carried through the world's scratch slot across one switch.
///
/// Function and data pointers are not interconvertible on every
/// platform, so the slot is a tagged view with an explicit selector
/// rather than a cast.
#[derive(Debug, Copy, Clone)]
pub(crate) enum Passed {
    Data(*mut c_void),
    Func(CoroutineFunc),
}

fn push(list: &mut *mut Coroutine, coroutine: *mut Coroutine) {
    unsafe { (*coroutine).next = *list };
    *list = coroutine;
}

fn pop(list: &mut *mut Coroutine) -> *mut Coroutine {
    let coroutine = *list;
    unsafe {
        *list = (*coroutine).next;
        (*coroutine).next = ptr::null_mut();
    }
    coroutine
}

fn remove(list: &mut *mut Coroutine, target: *mut Coroutine) -> bool {
    let mut link: *mut *mut Coroutine = list;
    unsafe {
        while !(*link).is_null() {
            if *link == target {
                *link = (*target).next;
                (*target).next = ptr::null_mut();
                return true;
            }
            link = &mut (**link).next;
        }
    }
    false
}

/// Pass a value and control to the coroutine at the head of the running
/// list, returning the value the next switch back carries.
fn pass(current: *mut Coroutine, arg: Passed) -> Passed {
    world::with(|world| world.passed = arg);

    unsafe {
        if context_switch::capture(&mut (*current).context) == Captured::Saved {
            let target = world::with(|world| world.running);
            context_switch::restore(&(*target).context);
        }
    }

    world::with(|world| world.passed)
}

/// The running coroutine's record.
pub(crate) fn current() -> *mut Coroutine {
    world::with(|world| {
        world.bootstrap();
        world.running
    })
}

/// Configure this thread's world before any coroutine exists on it.
///
/// `first` supplies caller-managed storage for the record representing
/// the host thread itself; without it the record lives inside the world.
/// `stack_size` is the per-coroutine stack reservation in bytes, rounded
/// up to 1 KiB granularity with a 1 KiB floor. Fails with Busy once the
/// world is live, and with Error on a second configure before that.
pub fn configure(first: Option<&'static mut Coroutine>, stack_size: Option<usize>) -> Status {
    world::with(|world| {
        if world.live {
            return Status::Busy;
        }
        if world.configured {
            return Status::Error;
        }

        if let Some(record) = first {
            world.first = record;
        }
        if let Some(bytes) = stack_size {
            world.stack_blocks = stack::blocks_for(bytes);
        }
        world.configured = true;

        debug!(
            "world configured, stack reservation {} bytes",
            world.stack_blocks * stack::BLOCK_BYTES
        );
        Status::Success
    })
}

/// Choose between thread-local and process-global world storage.
///
/// Process-wide, and must be decided before the first coroutine exists
/// on any thread; afterwards it fails with Busy.
#[cfg(not(feature = "single_core"))]
pub fn set_threading_support_enabled(enabled: bool) -> Status {
    world::set_threading_support_enabled(enabled)
}

/// Whether [resume] can transfer control to this coroutine.
///
/// A coroutine on the running or idle list (suspended inside an
/// outstanding resume, or parked after completing) is not resumable.
pub fn resumable(target: CoroHandle) -> bool {
    unsafe { (*target.as_ptr()).next.is_null() }
}

/// Create a coroutine that will run `func`, suspended until its first
/// [resume]. Completed records are reused from the idle list; a fresh
/// stack is carved only when that list is empty.
pub fn create(func: CoroutineFunc) -> Option<CoroHandle> {
    let (needs_carve, creator, blocks) = world::with(|world| {
        world.bootstrap();
        (world.idle.is_null(), world.running, world.stack_blocks)
    });

    if needs_carve {
        trace!("carving a coroutine stack, {} blocks", blocks);
        unsafe {
            if context_switch::capture(&mut (*creator).context) == Captured::Saved {
                stack::carve(blocks, ptr::null_mut());
            }
        }
        // The new coroutine parked itself on the idle list and restored
        // control here.
    }

    let fresh = world::with(|world| pop(&mut world.idle));

    // The activated coroutine immediately yields its own address.
    match resume_value(fresh, Passed::Func(func)) {
        Passed::Data(address) => CoroHandle::new(address.cast()),
        Passed::Func(_) => None,
    }
}

/// Transfer control to `target`, which resumes with `arg` as its yield's
/// return value (or its function argument on first activation).
///
/// Returns the value `target` next yields, its function's return value
/// if it runs to completion, or [crate::NOT_RESUMABLE] if `target` is
/// suspended inside a resume of its own or has already completed.
pub fn resume(target: CoroHandle, arg: *mut c_void) -> *mut c_void {
    if !resumable(target) {
        return crate::NOT_RESUMABLE;
    }

    match resume_value(target.as_ptr(), Passed::Data(arg)) {
        Passed::Data(value) => value,
        Passed::Func(_) => crate::NOT_RESUMABLE,
    }
}

fn resume_value(target: *mut Coroutine, arg: Passed) -> Passed {
    let current = world::with(|world| {
        let current = world.running;
        push(&mut world.running, target);
        current
    });

    unsafe { (*current).state = CoroutineState::Blocked };
    let passed = pass(current, arg);
    unsafe { (*current).state = CoroutineState::Running };
    passed
}

/// Suspend the running coroutine, transferring control (and `arg`) back
/// to whoever resumed it. Returns the argument of the next [resume] of
/// this coroutine.
///
/// The first coroutine of a thread has nobody to yield to; for it this
/// is a no-op returning null.
pub fn yield_with(arg: *mut c_void) -> *mut c_void {
    let current = world::with(|world| {
        world.bootstrap();
        if world.running == world.first {
            ptr::null_mut()
        } else {
            pop(&mut world.running)
        }
    });

    if current.is_null() {
        return ptr::null_mut();
    }

    unsafe { (*current).state = CoroutineState::Blocked };
    let passed = pass(current, Passed::Data(arg));
    unsafe { (*current).state = CoroutineState::Running };

    match passed {
        Passed::Data(value) => value,
        Passed::Func(_) => ptr::null_mut(),
    }
}

/// The id of `target`, or of the running coroutine when `target` is
/// `None`. [ID_NOT_SET] until assigned with [set_id].
pub fn id(target: Option<CoroHandle>) -> CoroutineId {
    let coroutine = target.map_or_else(current, CoroHandle::as_ptr);
    unsafe { (*coroutine).id }
}

/// Assign an id to `target`, or to the running coroutine when `target`
/// is `None`.
pub fn set_id(target: Option<CoroHandle>, id: CoroutineId) -> Status {
    let coroutine = target.map_or_else(current, CoroHandle::as_ptr);
    unsafe { (*coroutine).id = id };
    Status::Success
}

/// The state of `target`; `None` reads as NotRunning.
pub fn state(target: Option<CoroHandle>) -> CoroutineState {
    match target {
        Some(handle) => unsafe { (*handle.as_ptr()).state },
        None => CoroutineState::NotRunning,
    }
}

/// Forcibly end a coroutine, releasing every mutex in `mutexes` that it
/// owns, and park its record on the idle list for reuse.
///
/// The caller warrants that `mutexes` lists every mutex the target may
/// hold; unlisted ones stay owned by the dead coroutine forever. A
/// coroutine suspended inside a resume loses the coroutines stacked
/// above it, and locals on the abandoned frames never run their
/// destructors. Terminating the running coroutine or the first
/// coroutine of the thread is rejected with Error.
pub fn terminate(target: CoroHandle, mutexes: &[&Comutex]) -> Status {
    let target = target.as_ptr();
    let (running_head, first) = world::with(|world| {
        world.bootstrap();
        (world.running, world.first)
    });

    if target == running_head || target == first {
        return Status::Error;
    }

    for mutex in mutexes {
        mutex.release_if_owned(target);
    }

    unsafe {
        let condition = (*target).waiting_on;
        if !condition.is_null() {
            (*condition).unlink_waiter(target);
        }
    }

    world::with(|world| {
        remove(&mut world.running, target);
        remove(&mut world.idle, target);
    });

    unsafe {
        (*target).id = ID_NOT_SET;
        (*target).state = CoroutineState::NotRunning;
        // Reactivation re-enters the main loop on a clean frame.
        (*target).context = (*target).reset_context;
    }
    world::with(|world| push(&mut world.idle, target));

    debug!("terminated coroutine at {target:p}");
    Status::Success
}

fn receive_function(passed: Passed) -> CoroutineFunc {
    match passed {
        Passed::Func(func) => func,
        // Parked coroutines are only ever activated by create(), which
        // always sends a function.
        Passed::Data(_) => unreachable!(),
    }
}

/// Top-of-stack frame of every carved coroutine.
///
/// Parks the fresh record on the idle list, hands control back to the
/// forking capture point, and on first activation carves the next idle
/// coroutine before settling into its serve loop: yield own address to
/// the creator, run the received function, park for reuse.
pub(crate) fn coroutine_main(stack_marker: *mut u8) -> ! {
    let mut me = Coroutine::new();
    let me_ptr: *mut Coroutine = &mut me;
    world::with(|world| push(&mut world.idle, me_ptr));

    // Hand control back to the fork; the marker value is discarded when
    // the forking capture point is restored.
    let mut func = receive_function(pass(me_ptr, Passed::Data(stack_marker.cast())));

    // First activation. Carve the successor while this frame is still
    // shallow; its main loop passes control straight back here.
    let blocks = world::with(|world| world.stack_blocks);
    unsafe {
        if context_switch::capture(&mut (*me_ptr).context) == Captured::Saved {
            stack::carve(blocks, ptr::null_mut());
        }
    }

    // Re-entry point for every later activation: parking copied this
    // context into the live slot, so a reused record restarts here on a
    // clean frame at the same stack address, with its next function in
    // the scratch slot.
    unsafe {
        if context_switch::capture(&mut (*me_ptr).reset_context) == Captured::Restored {
            func = receive_function(world::with(|world| world.passed));
        }
    }

    // Expose our address so the creator can hand out a handle; the next
    // resume's argument becomes the function's argument.
    let calling_arg = yield_with(me_ptr.cast());
    let ret = func(calling_arg);

    // The function returned: park this record for reuse.
    world::with(|world| {
        pop(&mut world.running);
    });
    unsafe {
        (*me_ptr).id = ID_NOT_SET;
        (*me_ptr).state = CoroutineState::NotRunning;
        (*me_ptr).context = (*me_ptr).reset_context;
    }
    let resumer = world::with(|world| {
        push(&mut world.idle, me_ptr);
        world.passed = Passed::Data(ret);
        world.running
    });

    // Hand the return value to the resumer without saving a return
    // point; the next activation comes through the reset context.
    unsafe { context_switch::restore(&(*resumer).context) }
}
