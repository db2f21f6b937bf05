//! Mutual exclusion between coroutines.

use std::cell::Cell;
use std::ffi::c_void;
use std::ptr;
use std::time::Instant;

use bitflags::bitflags;

use crate::runtime::{self, Coroutine};
use crate::time;
use crate::Status;

bitflags! {
    /// What a [Comutex] supports beyond plain mutual exclusion.
    /// `MutexKind::empty()` is a plain mutex.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct MutexKind: u32 {
        /// The owner may lock again; each lock needs a matching unlock.
        const RECURSIVE = 1 << 0;
        /// [Comutex::timed_lock] is permitted.
        const TIMED = 1 << 1;
    }
}

/// A mutex owned by at most one coroutine at a time.
///
/// There is no waiter queue: a blocking lock yields [crate::BLOCKED]
/// and retries when resumed, so contention order is whatever order the
/// driver resumes contenders in.
#[derive(Debug)]
pub struct Comutex {
    last_yield_value: Cell<*mut c_void>,
    kind: Cell<MutexKind>,
    owner: Cell<*mut Coroutine>,
    recursion_level: Cell<u32>,
}

impl Comutex {
    pub const fn new(kind: MutexKind) -> Self {
        Comutex {
            last_yield_value: Cell::new(ptr::null_mut()),
            kind: Cell::new(kind),
            owner: Cell::new(ptr::null_mut()),
            recursion_level: Cell::new(0),
        }
    }

    /// Make one attempt to take the lock.
    ///
    /// Success if the mutex is free, or already ours and recursive;
    /// Busy if another coroutine holds it; Error for a non-recursive
    /// relock by the owner.
    pub fn try_lock(&self) -> Status {
        let running = runtime::current();

        if self.owner.get().is_null() {
            self.owner.set(running);
            self.recursion_level.set(1);
            Status::Success
        } else if self.owner.get() == running && self.kind.get().contains(MutexKind::RECURSIVE) {
            self.recursion_level.set(self.recursion_level.get() + 1);
            Status::Success
        } else if self.owner.get() != running {
            Status::Busy
        } else {
            Status::Error
        }
    }

    /// Take the lock, yielding [crate::BLOCKED] between attempts while
    /// another coroutine holds it. Each value the yields return is kept
    /// in [Comutex::last_yield_value].
    pub fn lock(&self) -> Status {
        self.last_yield_value.set(ptr::null_mut());

        while self.try_lock() != Status::Success {
            self.last_yield_value.set(runtime::yield_with(crate::BLOCKED));
        }

        Status::Success
    }

    /// Like [Comutex::lock], but gives up once `deadline` is past.
    ///
    /// Requires the TIMED kind (Error otherwise). An already-expired
    /// deadline fails with TimedOut before the first yield.
    pub fn timed_lock(&self, deadline: Instant) -> Status {
        self.last_yield_value.set(ptr::null_mut());

        if !self.kind.get().contains(MutexKind::TIMED) {
            return Status::Error;
        }

        while self.try_lock() != Status::Success {
            if time::expired(deadline) {
                return Status::TimedOut;
            }
            self.last_yield_value.set(runtime::yield_with(crate::BLOCKED));
        }

        Status::Success
    }

    /// Release one level of the lock. Only the owner may unlock; the
    /// mutex is free again when the level reaches zero.
    pub fn unlock(&self) -> Status {
        let running = runtime::current();

        if self.owner.get() != running {
            return Status::Error;
        }

        let level = self.recursion_level.get() - 1;
        self.recursion_level.set(level);
        if level == 0 {
            self.owner.set(ptr::null_mut());
        }

        Status::Success
    }

    /// Reset to the state of a freshly created plain mutex.
    pub fn destroy(&self) {
        self.last_yield_value.set(ptr::null_mut());
        self.kind.set(MutexKind::empty());
        self.owner.set(ptr::null_mut());
        self.recursion_level.set(0);
    }

    /// The last value a blocking lock's yield returned, or null if the
    /// lock was acquired on the first attempt.
    pub fn last_yield_value(&self) -> *mut c_void {
        self.last_yield_value.get()
    }

    pub fn kind(&self) -> MutexKind {
        self.kind.get()
    }

    pub fn is_locked(&self) -> bool {
        !self.owner.get().is_null()
    }

    pub fn recursion_level(&self) -> u32 {
        self.recursion_level.get()
    }

    /// Forced release during termination of `coroutine`.
    pub(crate) fn release_if_owned(&self, coroutine: *mut Coroutine) {
        if self.owner.get() == coroutine {
            self.owner.set(ptr::null_mut());
            self.recursion_level.set(0);
        }
    }
}

// The parallel test harness needs per-thread worlds.
#[cfg(all(test, not(feature = "single_core")))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::runtime::{create, resume, yield_with};

    fn status_arg(status: Status) -> *mut c_void {
        status as usize as *mut c_void
    }

    fn as_mutex(arg: *mut c_void) -> &'static Comutex {
        unsafe { &*(arg as *const Comutex) }
    }

    /// Locks the mutex passed as the argument, parks once, unlocks.
    fn lock_park_unlock(arg: *mut c_void) -> *mut c_void {
        let mutex = as_mutex(arg);
        mutex.lock();
        yield_with(ptr::null_mut());
        mutex.unlock();
        ptr::null_mut()
    }

    mod try_lock {
        use super::*;

        #[test]
        fn claims_a_free_mutex() {
            let mutex = Comutex::new(MutexKind::empty());

            assert_eq!(mutex.try_lock(), Status::Success);

            assert!(mutex.is_locked());
            assert_eq!(mutex.recursion_level(), 1);
        }

        #[test]
        fn owner_relock_of_a_plain_mutex_is_an_error() {
            let mutex = Comutex::new(MutexKind::empty());
            mutex.try_lock();

            assert_eq!(mutex.try_lock(), Status::Error);
            assert_eq!(mutex.recursion_level(), 1);
        }

        #[test]
        fn reports_busy_while_another_coroutine_holds_it() {
            let mutex = Comutex::new(MutexKind::empty());
            let holder = create(lock_park_unlock).unwrap();
            resume(holder, &mutex as *const Comutex as *mut c_void);

            assert_eq!(mutex.try_lock(), Status::Busy);
        }
    }

    mod recursion {
        use super::*;

        #[test]
        fn nested_locks_need_matching_unlocks() {
            let mutex = Comutex::new(MutexKind::RECURSIVE);

            for _ in 0..3 {
                assert_eq!(mutex.try_lock(), Status::Success);
            }
            assert_eq!(mutex.recursion_level(), 3);

            for _ in 0..3 {
                assert_eq!(mutex.unlock(), Status::Success);
            }
            assert!(!mutex.is_locked());
            assert_eq!(mutex.recursion_level(), 0);
        }

        #[test]
        fn other_coroutines_stay_locked_out_until_the_last_unlock() {
            /// Locks three deep, backs out two, parks, then fully unlocks.
            fn lock_three_unlock_two(arg: *mut c_void) -> *mut c_void {
                let mutex = as_mutex(arg);
                for _ in 0..3 {
                    mutex.lock();
                }
                mutex.unlock();
                mutex.unlock();
                yield_with(ptr::null_mut());
                mutex.unlock();
                ptr::null_mut()
            }

            /// Probes the mutex once, parks, probes again.
            fn probe_twice(arg: *mut c_void) -> *mut c_void {
                let mutex = as_mutex(arg);
                let first = mutex.try_lock();
                yield_with(status_arg(first));
                status_arg(mutex.try_lock())
            }

            let mutex = Comutex::new(MutexKind::RECURSIVE);
            let mutex_arg = &mutex as *const Comutex as *mut c_void;

            let owner = create(lock_three_unlock_two).unwrap();
            let contender = create(probe_twice).unwrap();

            resume(owner, mutex_arg);
            assert_eq!(resume(contender, mutex_arg), status_arg(Status::Busy));

            resume(owner, ptr::null_mut());
            assert_eq!(resume(contender, ptr::null_mut()), status_arg(Status::Success));
        }
    }

    mod unlock {
        use super::*;

        #[test]
        fn by_a_non_owner_is_an_error() {
            let mutex = Comutex::new(MutexKind::empty());
            let holder = create(lock_park_unlock).unwrap();
            resume(holder, &mutex as *const Comutex as *mut c_void);

            assert_eq!(mutex.unlock(), Status::Error);

            assert!(mutex.is_locked());
        }

        #[test]
        fn of_a_free_mutex_is_an_error() {
            let mutex = Comutex::new(MutexKind::empty());

            assert_eq!(mutex.unlock(), Status::Error);
        }
    }

    mod timed_lock {
        use super::*;

        #[test]
        fn requires_the_timed_kind() {
            let mutex = Comutex::new(MutexKind::empty());

            let deadline = time::deadline_after(Duration::from_secs(1));
            assert_eq!(mutex.timed_lock(deadline), Status::Error);
        }

        #[test]
        fn past_deadline_times_out_without_yielding() {
            /// If the lock attempt yielded, resume() would observe
            /// BLOCKED instead of a completed function.
            fn timed_lock_expired(arg: *mut c_void) -> *mut c_void {
                let mutex = as_mutex(arg);
                let already_past = Instant::now() - Duration::from_millis(1);
                status_arg(mutex.timed_lock(already_past))
            }

            let mutex = Comutex::new(MutexKind::TIMED);
            let mutex_arg = &mutex as *const Comutex as *mut c_void;
            let holder = create(lock_park_unlock).unwrap();
            resume(holder, mutex_arg);

            let waiter = create(timed_lock_expired).unwrap();
            assert_eq!(resume(waiter, mutex_arg), status_arg(Status::TimedOut));
        }

        #[test]
        fn succeeds_once_the_holder_lets_go() {
            fn timed_locker(arg: *mut c_void) -> *mut c_void {
                let mutex = as_mutex(arg);
                let deadline = time::deadline_after(Duration::from_secs(1));
                status_arg(mutex.timed_lock(deadline))
            }

            let mutex = Comutex::new(MutexKind::TIMED);
            let mutex_arg = &mutex as *const Comutex as *mut c_void;
            let holder = create(lock_park_unlock).unwrap();
            resume(holder, mutex_arg);

            let waiter = create(timed_locker).unwrap();
            assert_eq!(resume(waiter, mutex_arg), crate::BLOCKED);

            resume(holder, ptr::null_mut());
            assert_eq!(resume(waiter, ptr::null_mut()), status_arg(Status::Success));
        }
    }

    mod blocking_lock {
        use super::*;

        #[test]
        fn acquires_after_the_holder_unlocks() {
            fn blocking_locker(arg: *mut c_void) -> *mut c_void {
                let mutex = as_mutex(arg);
                status_arg(mutex.lock())
            }

            let mutex = Comutex::new(MutexKind::empty());
            let mutex_arg = &mutex as *const Comutex as *mut c_void;
            let holder = create(lock_park_unlock).unwrap();
            resume(holder, mutex_arg);

            let waiter = create(blocking_locker).unwrap();
            assert_eq!(resume(waiter, mutex_arg), crate::BLOCKED);

            resume(holder, ptr::null_mut());
            assert_eq!(resume(waiter, ptr::null_mut()), status_arg(Status::Success));
            assert!(mutex.is_locked());
        }

        #[test]
        fn records_the_last_yield_value() {
            fn blocking_locker(arg: *mut c_void) -> *mut c_void {
                let mutex = as_mutex(arg);
                mutex.lock();
                ptr::null_mut()
            }

            let mutex = Comutex::new(MutexKind::empty());
            let mutex_arg = &mutex as *const Comutex as *mut c_void;
            let holder = create(lock_park_unlock).unwrap();
            resume(holder, mutex_arg);

            let waiter = create(blocking_locker).unwrap();
            resume(waiter, mutex_arg);
            resume(waiter, 77 as *mut c_void);
            resume(holder, ptr::null_mut());
            resume(waiter, 99 as *mut c_void);

            // The value of the resume that let the lock through.
            assert_eq!(mutex.last_yield_value(), 99 as *mut c_void);
        }

        #[test]
        fn uncontended_lock_leaves_no_yield_value() {
            let mutex = Comutex::new(MutexKind::empty());

            assert_eq!(mutex.lock(), Status::Success);

            assert!(mutex.last_yield_value().is_null());
        }
    }

    mod destroy {
        use super::*;

        #[test]
        fn matches_a_freshly_created_plain_mutex() {
            let mutex = Comutex::new(MutexKind::RECURSIVE | MutexKind::TIMED);
            mutex.try_lock();
            mutex.destroy();

            let fresh = Comutex::new(MutexKind::empty());
            assert_eq!(mutex.kind(), fresh.kind());
            assert_eq!(mutex.is_locked(), fresh.is_locked());
            assert_eq!(mutex.recursion_level(), fresh.recursion_level());
            assert_eq!(mutex.last_yield_value(), fresh.last_yield_value());
        }
    }
}
