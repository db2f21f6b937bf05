//! Deadline plumbing for the timed operations.
//!
//! Deadlines are absolute points on the monotonic clock; the timed
//! mutex and condition operations compare against it between attempts.

use std::time::{Duration, Instant};

/// The absolute monotonic deadline `timeout` from now.
pub fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout
}

/// Whether a deadline lies in the past.
pub(crate) fn expired(deadline: Instant) -> bool {
    Instant::now() > deadline
}
