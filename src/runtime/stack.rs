//! Stack carving.
//!
//! Coroutine stacks are not allocated; they are carved out of the host
//! thread's own call stack. Each carve step reserves one block as an
//! automatic buffer and recurses, so the frame that finally enters the
//! coroutine main loop sits below the whole reservation. The coroutine
//! that triggered the carve keeps that reservation as headroom, and the
//! new coroutine's frames accumulate beneath it.

use std::hint;
use std::mem::MaybeUninit;

/// Carving granularity, and the smallest stack a thread can configure.
pub(crate) const BLOCK_BYTES: usize = 1024;

/// Reservation used by threads that never configure a stack size.
pub(crate) const DEFAULT_STACK_BYTES: usize = 16 * 1024;

/// Carve blocks for a requested stack size: rounded up to the block
/// granularity, with a single block as the floor.
pub(crate) fn blocks_for(bytes: usize) -> usize {
    bytes.div_ceil(BLOCK_BYTES).max(1)
}

/// Consume `blocks_remaining` blocks of the current call stack, then
/// enter the coroutine main loop at the bottom of the reservation.
///
/// The buffer address is passed through the recursive call so the
/// reservation cannot be optimized out. Pass null for `below` at the
/// outermost call.
#[inline(never)]
pub(crate) fn carve(blocks_remaining: usize, below: *mut u8) -> ! {
    let mut block = MaybeUninit::<[u8; BLOCK_BYTES]>::uninit();
    let marker = hint::black_box(block.as_mut_ptr().cast::<u8>());
    debug_assert!(below.is_null() || marker < below);

    if blocks_remaining > 1 {
        carve(blocks_remaining - 1, marker)
    } else {
        super::coroutine_main(marker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_block_aligned() {
        assert_eq!(DEFAULT_STACK_BYTES % BLOCK_BYTES, 0);
    }

    mod blocks_for {
        use super::*;

        #[test]
        fn exact_multiples() {
            assert_eq!(blocks_for(BLOCK_BYTES), 1);
            assert_eq!(blocks_for(DEFAULT_STACK_BYTES), 16);
        }

        #[test]
        fn rounds_up() {
            assert_eq!(blocks_for(BLOCK_BYTES + 1), 2);
            assert_eq!(blocks_for(3 * BLOCK_BYTES - 1), 3);
        }

        #[test]
        fn clamps_below_one_block() {
            assert_eq!(blocks_for(0), 1);
            assert_eq!(blocks_for(1), 1);
            assert_eq!(blocks_for(BLOCK_BYTES - 1), 1);
        }
    }
}
