//! # Thread Context
//!
//! The essence of a thread - its complete state at a moment in time.
//! When we preserve context, we capture everything the calling convention
//! asks a function to give back unchanged: the callee-saved registers, the
//! stack pointer, and the floating-point/SSE state.
//!
//! ## Philosophy
//! Context switches are not interruptions, but transitions.
//! We preserve the current moment with reverence, knowing we will
//! restore it faithfully when the thread's turn returns.
//!
//! This is the only module that touches registers directly. Everything
//! above it deals in `ThreadContext` values and never looks inside.

use core::arch::naked_asm;
use core::fmt;
use core::mem::offset_of;

use x86_64::VirtAddr;

use super::stack::Stack;

/// A function a freshly bootstrapped context enters, with its one argument
pub type ThreadEntry = extern "C" fn(usize) -> !;

/// Initial x87 control word: all exceptions masked, extended precision
const DEFAULT_FCW: u16 = 0x037F;

/// Initial MXCSR: all SSE exceptions masked, round to nearest
const DEFAULT_MXCSR: u32 = 0x1F80;

/// Bytes written above the initial stack pointer of a new thread
///
/// From the top of the stack downward: an 8-byte zero pad, a zero word
/// that terminates frame-pointer walks, and the trampoline address that
/// the first `ret` consumes.
const BOOTSTRAP_FRAME: u64 = 24;

/// The 512-byte FXSAVE image: x87, MMX and SSE state
///
/// Opaque to everything but the switch primitive, which saves and restores
/// it verbatim.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct ExtendedState(pub [u8; 512]);

impl ExtendedState {
    /// A save area holding the power-on control words and nothing else
    pub const fn initial() -> Self {
        let mut area = [0u8; 512];
        let fcw = DEFAULT_FCW.to_le_bytes();
        area[0] = fcw[0];
        area[1] = fcw[1];
        let mxcsr = DEFAULT_MXCSR.to_le_bytes();
        area[24] = mxcsr[0];
        area[25] = mxcsr[1];
        area[26] = mxcsr[2];
        area[27] = mxcsr[3];
        ExtendedState(area)
    }

    pub fn control_word(&self) -> u16 {
        u16::from_le_bytes([self.0[0], self.0[1]])
    }

    pub fn mxcsr(&self) -> u32 {
        u32::from_le_bytes([self.0[24], self.0[25], self.0[26], self.0[27]])
    }
}

/// The saved state of a suspended thread
///
/// The layout is fixed: `switch_context` addresses the fields by offset.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct ThreadContext {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    _reserved: u64,
    pub fx: ExtendedState,
}

// The offsets baked into the assembly below.
const _: () = {
    assert!(offset_of!(ThreadContext, rsp) == 0x00);
    assert!(offset_of!(ThreadContext, rbp) == 0x08);
    assert!(offset_of!(ThreadContext, rbx) == 0x10);
    assert!(offset_of!(ThreadContext, r12) == 0x18);
    assert!(offset_of!(ThreadContext, r13) == 0x20);
    assert!(offset_of!(ThreadContext, r14) == 0x28);
    assert!(offset_of!(ThreadContext, r15) == 0x30);
    assert!(offset_of!(ThreadContext, fx) == 0x40);
};

impl ThreadContext {
    /// Create an empty context
    ///
    /// Used for the original thread, whose real state is captured the first
    /// time it switches away.
    pub const fn empty() -> Self {
        ThreadContext {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            _reserved: 0,
            fx: ExtendedState::initial(),
        }
    }

    /// Build the context of a thread that has never run
    ///
    /// When first restored, the context `ret`s into [`thread_trampoline`],
    /// which calls `entry(arg)` on `stack` with the stack aligned as if by a
    /// normal call. `entry` must never return.
    ///
    /// # Arguments
    /// * `stack` - The thread's own stack; the bootstrap frame is written at its top
    /// * `entry` - Where the thread begins
    /// * `arg` - Passed to `entry` unchanged
    pub fn bootstrap(stack: &mut Stack, entry: ThreadEntry, arg: usize) -> Self {
        let top = stack.top().align_down(16u64);
        let frame = top - BOOTSTRAP_FRAME;
        let offset = (frame - stack.bottom()) as usize;

        // SAFETY: `frame..top` lies inside the mapping and is 8-byte aligned.
        unsafe {
            let slot = stack.as_mut_ptr().add(offset).cast::<u64>();
            slot.write(thread_trampoline as *const () as usize as u64);
            slot.add(1).write(0);
            slot.add(2).write(0);
        }

        ThreadContext {
            rsp: frame.as_u64(),
            r12: entry as *const () as usize as u64,
            r13: arg as u64,
            ..ThreadContext::empty()
        }
    }

    /// The saved stack pointer
    pub fn stack_pointer(&self) -> VirtAddr {
        VirtAddr::new(self.rsp)
    }
}

impl Default for ThreadContext {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("rsp", &format_args!("{:#x}", self.rsp))
            .field("rbp", &format_args!("{:#x}", self.rbp))
            .field("fcw", &format_args!("{:#06x}", self.fx.control_word()))
            .field("mxcsr", &format_args!("{:#x}", self.fx.mxcsr()))
            .finish_non_exhaustive()
    }
}

/// Switch from the current thread context to a new thread context
///
/// Saves the callee-saved registers, the stack pointer and the FXSAVE image
/// of the caller into `save_into`, restores the same from `restore_from` and
/// returns into whatever that context was doing. When `save_into` is later
/// restored, this call returns to its caller as if nothing happened.
///
/// # Safety
/// Both pointers must be valid and 16-byte aligned. `restore_from` must hold
/// either a context saved by this function or one built by
/// [`ThreadContext::bootstrap`] whose stack is still mapped. No Rust
/// reference to either context may be live across the call.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save_into: *mut ThreadContext, _restore_from: *const ThreadContext) {
    naked_asm!(
        // rdi = save_into, rsi = restore_from
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "fxsave64 [rdi + 0x40]",

        "fxrstor64 [rsi + 0x40]",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",

        // Saved context: back into the caller of its switch_context.
        // Fresh context: into thread_trampoline.
        "ret",
    );
}

/// The first code every new thread runs
///
/// Entered by `ret` with `r12` = entry function and `r13` = its argument.
/// The stack is 16-byte aligned here, so the `call` lands in `entry` exactly
/// as the calling convention expects. `entry` never returns; `ud2` traps if
/// it somehow does.
#[unsafe(naked)]
pub unsafe extern "C" fn thread_trampoline() -> ! {
    naked_asm!(
        "xor ebp, ebp",
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}
