//! Per-coroutine message queues.
//!
//! Every coroutine owns an inbox: a singly linked FIFO of caller-owned
//! [Comessage] records. Senders push onto the tail of a target's inbox;
//! the receiving coroutine peeks or pops from its own head. A message
//! stays marked in-use from push until the receiver releases it, and
//! must not move or be dropped in between.

use std::cell::Cell;
use std::ffi::c_void;
use std::ptr;
use std::ptr::NonNull;

use crate::runtime::{self, CoroHandle, Coroutine, CoroutineFunc};
use crate::Status;

/// What a message carries.
///
/// Function and data pointers are kept apart by an explicit selector
/// rather than a cast; small values travel inline without pointing at
/// sender storage.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Payload {
    None,
    Data(*mut c_void),
    Inline(u64),
    Func(CoroutineFunc),
}

/// A message in caller-owned storage.
#[derive(Debug)]
pub struct Comessage {
    next: Cell<*mut Comessage>,
    kind: Cell<i64>,
    payload: Cell<Payload>,
    from: Cell<*mut Coroutine>,
    in_use: Cell<bool>,
    handled: Cell<bool>,
}

impl Comessage {
    pub const fn new(kind: i64) -> Self {
        Comessage {
            next: Cell::new(ptr::null_mut()),
            kind: Cell::new(kind),
            payload: Cell::new(Payload::None),
            from: Cell::new(ptr::null_mut()),
            in_use: Cell::new(false),
            handled: Cell::new(false),
        }
    }

    pub fn kind(&self) -> i64 {
        self.kind.get()
    }

    pub fn set_kind(&self, kind: i64) {
        self.kind.set(kind);
    }

    pub fn payload(&self) -> Payload {
        self.payload.get()
    }

    pub fn set_payload(&self, payload: Payload) {
        self.payload.set(payload);
    }

    /// The coroutine that pushed this message, stamped on push.
    pub fn from(&self) -> Option<CoroHandle> {
        CoroHandle::new(self.from.get())
    }

    /// True from push until the receiver releases the message.
    pub fn is_in_use(&self) -> bool {
        self.in_use.get()
    }

    pub fn is_handled(&self) -> bool {
        self.handled.get()
    }

    /// Hand a popped message back to its owner, marking it handled.
    pub fn release(&self) {
        self.in_use.set(false);
        self.handled.set(true);
    }
}

/// Append a message to the tail of `target`'s inbox, so the oldest
/// message pops first. Stamps the sender and marks the message in-use;
/// a message already queued somewhere fails with Busy.
pub fn push(target: CoroHandle, message: &Comessage) -> Status {
    if message.in_use.get() {
        return Status::Busy;
    }

    message.next.set(ptr::null_mut());
    message.from.set(runtime::current());
    message.in_use.set(true);
    message.handled.set(false);

    let raw = message as *const Comessage as *mut Comessage;
    let target = target.as_ptr();
    unsafe {
        let tail = (*target).inbox_tail;
        if tail.is_null() {
            (*target).inbox_head = raw;
        } else {
            (*tail).next.set(raw);
        }
        (*target).inbox_tail = raw;
    }

    Status::Success
}

/// The oldest message in the calling coroutine's inbox, left in place.
pub fn peek() -> Option<NonNull<Comessage>> {
    let me = runtime::current();
    NonNull::new(unsafe { (*me).inbox_head })
}

/// Remove and return the oldest message in the calling coroutine's
/// inbox. The message stays in-use until released.
pub fn pop() -> Option<NonNull<Comessage>> {
    let me = runtime::current();
    unsafe {
        let head = (*me).inbox_head;
        if head.is_null() {
            return None;
        }

        let next = (*head).next.get();
        (*me).inbox_head = next;
        if next.is_null() {
            (*me).inbox_tail = ptr::null_mut();
        }
        (*head).next.set(ptr::null_mut());
        NonNull::new(head)
    }
}

/// Remove and return the oldest message of the given kind, keeping the
/// order of everything else.
pub fn pop_kind(kind: i64) -> Option<NonNull<Comessage>> {
    let me = runtime::current();
    unsafe {
        let mut link: *mut *mut Comessage = &mut (*me).inbox_head;
        let mut prev: *mut Comessage = ptr::null_mut();

        while !(*link).is_null() {
            let candidate = *link;
            if (*candidate).kind.get() == kind {
                *link = (*candidate).next.get();
                if (*me).inbox_tail == candidate {
                    (*me).inbox_tail = prev;
                }
                (*candidate).next.set(ptr::null_mut());
                return NonNull::new(candidate);
            }
            prev = candidate;
            link = (*candidate).next.as_ptr();
        }
    }

    None
}

// The parallel test harness needs per-thread worlds.
#[cfg(all(test, not(feature = "single_core")))]
mod tests {
    use super::*;
    use crate::runtime::{create, resume};

    fn own_inbox() -> CoroHandle {
        CoroHandle::new(runtime::current()).unwrap()
    }

    #[test]
    fn push_then_pop_returns_the_same_message() {
        let message = Comessage::new(1);

        assert_eq!(push(own_inbox(), &message), Status::Success);
        let popped = pop().unwrap();

        assert_eq!(popped.as_ptr().cast_const(), &message as *const Comessage);
        assert!(message.is_in_use());
        assert!(!message.is_handled());

        message.release();
        assert!(!message.is_in_use());
        assert!(message.is_handled());
    }

    #[test]
    fn pops_in_push_order() {
        let first = Comessage::new(1);
        let second = Comessage::new(2);
        let third = Comessage::new(3);
        for message in [&first, &second, &third] {
            push(own_inbox(), message);
        }

        assert_eq!(pop().unwrap().as_ptr().cast_const(), &first as *const _);
        assert_eq!(pop().unwrap().as_ptr().cast_const(), &second as *const _);
        assert_eq!(pop().unwrap().as_ptr().cast_const(), &third as *const _);
        assert!(pop().is_none());
    }

    #[test]
    fn peek_leaves_the_head_in_place() {
        let message = Comessage::new(9);
        push(own_inbox(), &message);

        assert_eq!(peek(), peek());
        assert_eq!(peek().unwrap().as_ptr(), pop().unwrap().as_ptr());
        assert!(peek().is_none());
    }

    #[test]
    fn empty_inbox_pops_none() {
        assert!(pop().is_none());
        assert!(peek().is_none());
        assert!(pop_kind(0).is_none());
    }

    #[test]
    fn pop_kind_preserves_the_order_of_the_rest() {
        let first = Comessage::new(1);
        let wanted = Comessage::new(2);
        let last = Comessage::new(1);
        for message in [&first, &wanted, &last] {
            push(own_inbox(), message);
        }

        assert_eq!(pop_kind(2).unwrap().as_ptr().cast_const(), &wanted as *const _);

        assert_eq!(pop().unwrap().as_ptr().cast_const(), &first as *const _);
        assert_eq!(pop().unwrap().as_ptr().cast_const(), &last as *const _);
    }

    #[test]
    fn pop_kind_of_the_tail_repairs_the_tail() {
        let first = Comessage::new(1);
        let tail = Comessage::new(2);
        push(own_inbox(), &first);
        push(own_inbox(), &tail);

        assert_eq!(pop_kind(2).unwrap().as_ptr().cast_const(), &tail as *const _);

        // Appending still works against the repaired tail.
        let after = Comessage::new(3);
        push(own_inbox(), &after);
        assert_eq!(pop().unwrap().as_ptr().cast_const(), &first as *const _);
        assert_eq!(pop().unwrap().as_ptr().cast_const(), &after as *const _);
    }

    #[test]
    fn push_stamps_the_sender() {
        let message = Comessage::new(1);

        push(own_inbox(), &message);

        assert_eq!(message.from().unwrap().as_ptr(), runtime::current());
    }

    #[test]
    fn pushing_a_queued_message_is_busy() {
        let message = Comessage::new(1);
        push(own_inbox(), &message);

        assert_eq!(push(own_inbox(), &message), Status::Busy);
    }

    #[test]
    fn payloads_survive_the_queue() {
        fn probe(_: *mut c_void) -> *mut c_void {
            ptr::null_mut()
        }

        let inline = Comessage::new(1);
        inline.set_payload(Payload::Inline(77));
        let func = Comessage::new(2);
        func.set_payload(Payload::Func(probe));
        push(own_inbox(), &inline);
        push(own_inbox(), &func);

        let received = pop().unwrap();
        assert_eq!(unsafe { received.as_ref() }.payload(), Payload::Inline(77));
        let received = pop().unwrap();
        assert_eq!(unsafe { received.as_ref() }.payload(), Payload::Func(probe));
    }

    #[test]
    fn coroutine_drains_its_own_inbox() {
        fn sum_inline_payloads(_: *mut c_void) -> *mut c_void {
            let mut sum = 0;
            while let Some(message) = pop() {
                let message = unsafe { message.as_ref() };
                if let Payload::Inline(value) = message.payload() {
                    sum += value;
                }
                message.release();
            }
            sum as usize as *mut c_void
        }

        let receiver = create(sum_inline_payloads).unwrap();
        let first = Comessage::new(1);
        first.set_payload(Payload::Inline(30));
        let second = Comessage::new(1);
        second.set_payload(Payload::Inline(12));
        push(receiver, &first);
        push(receiver, &second);

        assert_eq!(resume(receiver, ptr::null_mut()) as usize, 42);
        assert!(first.is_handled());
        assert!(second.is_handled());
    }
}
