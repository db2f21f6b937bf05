//! Condition variables with FIFO wakeup.

use std::cell::Cell;
use std::ffi::c_void;
use std::ptr;
use std::time::Instant;

use log::debug;

use crate::runtime::{self, Coroutine};
use crate::sync::mutex::Comutex;
use crate::time;
use crate::Status;

/// Sentinel left in the signal counter by [Cocondition::destroy].
const DESTROYED: i32 = -1;

/// A condition variable for coroutines.
///
/// Waiters queue in arrival order, doubly linked through their own
/// coroutine records, and only the queue head may consume a signal: a
/// single signal wakes the oldest waiter no matter which waiter the
/// driver resumes first, and waiters arriving after a broadcast cannot
/// steal the signals it granted to earlier ones.
///
/// The condition must not move while coroutines are queued on it; the
/// waiter records point back at it.
#[derive(Debug)]
pub struct Cocondition {
    last_yield_value: Cell<*mut c_void>,
    num_waiters: Cell<i32>,
    num_signals: Cell<i32>,
    head: Cell<*mut Coroutine>,
    tail: Cell<*mut Coroutine>,
}

impl Cocondition {
    pub const fn new() -> Self {
        Cocondition {
            last_yield_value: Cell::new(ptr::null_mut()),
            num_waiters: Cell::new(0),
            num_signals: Cell::new(0),
            head: Cell::new(ptr::null_mut()),
            tail: Cell::new(ptr::null_mut()),
        }
    }

    /// Wake the oldest waiter.
    ///
    /// The wakeup happens when that waiter is next resumed and finds
    /// the signal. Signals never exceed the number of waiters.
    pub fn signal(&self) -> Status {
        if self.num_signals.get() == DESTROYED {
            return Status::Error;
        }

        if self.num_signals.get() < self.num_waiters.get() {
            self.num_signals.set(self.num_signals.get() + 1);
        }
        Status::Success
    }

    /// Wake every coroutine currently waiting.
    pub fn broadcast(&self) -> Status {
        if self.num_signals.get() == DESTROYED {
            return Status::Error;
        }

        self.num_signals.set(self.num_waiters.get());
        Status::Success
    }

    /// Release `mutex` and wait for a signal, reacquiring the mutex
    /// before returning whatever the wait came to.
    ///
    /// Error if the caller does not hold `mutex`, or if the condition
    /// is destroyed while waiting.
    pub fn wait(&self, mutex: &Comutex) -> Status {
        self.wait_until(mutex, None)
    }

    /// Like [Cocondition::wait], but gives up with TimedOut once
    /// `deadline` is past. The mutex is reacquired either way.
    pub fn timed_wait(&self, mutex: &Comutex, deadline: Instant) -> Status {
        self.wait_until(mutex, Some(deadline))
    }

    fn wait_until(&self, mutex: &Comutex, deadline: Option<Instant>) -> Status {
        self.last_yield_value.set(ptr::null_mut());

        // Ownership is enforced by the unlock itself.
        if mutex.unlock() != Status::Success {
            return Status::Error;
        }

        if self.num_signals.get() == DESTROYED {
            mutex.lock();
            return Status::Error;
        }

        let me = runtime::current();
        self.enqueue(me);

        let status = loop {
            if self.num_signals.get() == DESTROYED {
                // destroy() already severed our queue links.
                break Status::Error;
            }

            if self.num_signals.get() > 0 && self.head.get() == me {
                self.num_signals.set(self.num_signals.get() - 1);
                unsafe { self.unlink_waiter(me) };
                break Status::Success;
            }

            if let Some(deadline) = deadline {
                if time::expired(deadline) {
                    unsafe { self.unlink_waiter(me) };
                    break Status::TimedOut;
                }
            }

            self.last_yield_value.set(runtime::yield_with(crate::BLOCKED));
        };

        mutex.lock();
        status
    }

    /// Mark the condition destroyed. Coroutines still waiting observe
    /// the sentinel and fail out with Error.
    pub fn destroy(&self) {
        // Sever every queued waiter's links so no record keeps pointing
        // into the dead queue (a later terminate of such a waiter must
        // not try to unlink it from here).
        let mut waiter = self.head.get();
        while !waiter.is_null() {
            unsafe {
                let next = (*waiter).next_to_signal;
                (*waiter).next_to_signal = ptr::null_mut();
                (*waiter).prev_to_signal = ptr::null_mut();
                (*waiter).waiting_on = ptr::null_mut();
                waiter = next;
            }
        }

        self.last_yield_value.set(ptr::null_mut());
        self.num_waiters.set(0);
        self.num_signals.set(DESTROYED);
        self.head.set(ptr::null_mut());
        self.tail.set(ptr::null_mut());
        debug!("condition at {:p} destroyed", self);
    }

    /// The last value a wait's yield returned, or null if no wait has
    /// yielded since the counter was cleared.
    pub fn last_yield_value(&self) -> *mut c_void {
        self.last_yield_value.get()
    }

    pub fn num_waiters(&self) -> i32 {
        self.num_waiters.get()
    }

    pub fn num_signals(&self) -> i32 {
        self.num_signals.get()
    }

    fn enqueue(&self, me: *mut Coroutine) {
        unsafe {
            (*me).prev_to_signal = self.tail.get();
            (*me).next_to_signal = ptr::null_mut();
            (*me).waiting_on = self as *const Cocondition as *mut Cocondition;

            if self.tail.get().is_null() {
                self.head.set(me);
            } else {
                (*self.tail.get()).next_to_signal = me;
            }
            self.tail.set(me);
        }
        self.num_waiters.set(self.num_waiters.get() + 1);
    }

    /// Unlink a queued waiter, repairing head and tail, clear the
    /// record's links, and reclaim any signal granted to it. Also used
    /// when a waiter is terminated.
    ///
    /// # Safety
    /// `coroutine` must be queued on this condition.
    pub(crate) unsafe fn unlink_waiter(&self, coroutine: *mut Coroutine) {
        let prev = (*coroutine).prev_to_signal;
        let next = (*coroutine).next_to_signal;

        if prev.is_null() {
            self.head.set(next);
        } else {
            (*prev).next_to_signal = next;
        }
        if next.is_null() {
            self.tail.set(prev);
        } else {
            (*next).prev_to_signal = prev;
        }

        (*coroutine).next_to_signal = ptr::null_mut();
        (*coroutine).prev_to_signal = ptr::null_mut();
        (*coroutine).waiting_on = ptr::null_mut();
        self.num_waiters.set(self.num_waiters.get() - 1);

        // A departing waiter may hold an unconsumed broadcast or signal
        // grant; hand it back so signals never outnumber waiters.
        if self.num_signals.get() > self.num_waiters.get() {
            self.num_signals.set(self.num_waiters.get());
        }
    }
}

impl Default for Cocondition {
    fn default() -> Self {
        Cocondition::new()
    }
}
