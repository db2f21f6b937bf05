//! Abstraction over userspace multitasking.
//!
//! A [Context] is the callee-saved machine state of a suspended coroutine.
//! [capture] stores the caller's state and reports which way control
//! arrived; [restore] jumps non-locally to a previously captured state,
//! abandoning the native call stack above it without running destructors.
//! Code around a capture/restore pair must therefore hold only `Copy`
//! data and re-derive everything else after the switch.

use std::arch::global_asm;

/// Callee-saved registers plus stack pointer and resume address.
///
/// Layout is fixed by the assembly: rbx, rbp, r12, r13, r14, r15, rsp,
/// rip, in that order. Every slot is restored unconditionally, so no
/// per-platform fixups of the saved state are needed before a jump.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub(crate) struct Context {
    registers: [u64; 8],
}

impl Context {
    pub(crate) const fn new() -> Self {
        Context { registers: [0; 8] }
    }
}

/// How control arrived at the point after a [capture] call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Captured {
    /// The context was just stored; execution is falling through.
    Saved,
    /// A [restore] of this context brought execution back here.
    Restored,
}

extern "C" {
    /// Stores the current machine context, returning 0 on the storing
    /// pass and 1 when re-entered through [loomy_context_restore].
    fn loomy_context_capture(context: *mut Context) -> u64;

    /// Reloads a stored machine context and jumps to its resume address.
    fn loomy_context_restore(context: *const Context) -> !;
}

/// Save the caller's machine context into `context`.
///
/// # Safety
/// `context` must be valid for writes. A later [restore] of it is only
/// sound while the stack frames live at capture time are still intact.
pub(crate) unsafe fn capture(context: *mut Context) -> Captured {
    if loomy_context_capture(context) == 0 {
        Captured::Saved
    } else {
        Captured::Restored
    }
}

/// Jump to a previously captured context. Never returns.
///
/// # Safety
/// `context` must have been filled by [capture] and the stack it points
/// into must not have been repurposed since.
pub(crate) unsafe fn restore(context: *const Context) -> ! {
    loomy_context_restore(context)
}

#[cfg(not(target_arch = "x86_64"))]
compile_error!("loomy only supports x86_64");

#[cfg(target_arch = "x86_64")]
global_asm!(include_str!("assembly/x86_64.s"));
