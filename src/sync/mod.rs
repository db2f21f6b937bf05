//! Coroutine-aware synchronization primitives.
//!
//! These block by yielding, never by parking the host thread: a
//! contended lock or an unsignalled condition repeatedly yields the
//! [crate::BLOCKED] sentinel back to whoever resumes the coroutine, so
//! an outer driver decides when to retry. Everything here shares one
//! host thread with the coroutines it coordinates.

pub mod condition;
pub mod mutex;
