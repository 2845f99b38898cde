//! Signals.
//!
//! Pending and blocked sets are per-task bitmasks; actions live in a small
//! table snapshot-copied on fork. Delivery happens only on the way back to
//! user mode: the trap-return path asks `next_deliverable` whether anything
//! fires, then either applies the default action or builds a handler frame
//! on the user stack. `sigreturn` unwinds that frame.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::{Task, TaskState};
use crate::errno::{KResult, EFAULT, EINVAL};
use crate::interrupts::TrapFrame;

pub const NSIG: u32 = 32;

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGABRT: u32 = 6;
pub const SIGBUS: u32 = 7;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGTTIN: u32 = 21;
pub const SIGTTOU: u32 = 22;
pub const SIGWINCH: u32 = 28;

/// Restart the interrupted syscall instead of failing with EINTR.
pub const SA_RESTART: u32 = 1 << 0;

const fn sig_bit(sig: u32) -> u64 {
    1 << (sig - 1)
}

/// Mask of signals that can never be caught, blocked, or ignored.
const UNBLOCKABLE: u64 = sig_bit(SIGKILL) | sig_bit(SIGSTOP);

pub fn valid_signal(sig: u32) -> bool {
    sig >= 1 && sig < NSIG
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigActionKind {
    Default,
    Ignore,
    /// User handler entry point.
    Handler(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    pub kind: SigActionKind,
    /// Extra signals blocked while the handler runs.
    pub mask: u64,
    pub flags: u32,
}

impl SigAction {
    pub const fn default_action() -> SigAction {
        SigAction {
            kind: SigActionKind::Default,
            mask: 0,
            flags: 0,
        }
    }
}

/// What a signal does when no handler is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    CoreDump,
    Ignore,
    Stop,
    Continue,
}

pub fn default_action(sig: u32) -> DefaultAction {
    match sig {
        SIGCHLD | SIGWINCH => DefaultAction::Ignore,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        SIGCONT => DefaultAction::Continue,
        SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGBUS | SIGFPE | SIGSEGV => DefaultAction::CoreDump,
        _ => DefaultAction::Terminate,
    }
}

pub struct SignalState {
    pending: AtomicU64,
    blocked: AtomicU64,
    actions: Mutex<[SigAction; NSIG as usize]>,
}

impl SignalState {
    pub fn new() -> SignalState {
        SignalState {
            pending: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            actions: Mutex::new([SigAction::default_action(); NSIG as usize]),
        }
    }

    /// An unblocked signal is waiting.
    pub fn has_pending(&self) -> bool {
        let pending = self.pending.load(Ordering::Acquire);
        let blocked = self.blocked.load(Ordering::Acquire) & !UNBLOCKABLE;
        pending & !blocked != 0
    }

    pub fn pending_mask(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn blocked_mask(&self) -> u64 {
        self.blocked.load(Ordering::Acquire)
    }

    pub fn set_blocked(&self, mask: u64) {
        self.blocked.store(mask & !UNBLOCKABLE, Ordering::Release);
    }

    pub fn action(&self, sig: u32) -> SigAction {
        self.actions.lock()[(sig - 1) as usize]
    }

    pub fn set_action(&self, sig: u32, action: SigAction) -> KResult<()> {
        if !valid_signal(sig) || sig == SIGKILL || sig == SIGSTOP {
            return Err(EINVAL);
        }
        self.actions.lock()[(sig - 1) as usize] = action;
        Ok(())
    }

    /// Fork snapshot: the parent's actions and blocked mask copy over,
    /// pending signals do not.
    pub fn copy_from(&self, other: &SignalState) {
        self.pending.store(0, Ordering::Release);
        self.blocked
            .store(other.blocked.load(Ordering::Acquire), Ordering::Release);
        *self.actions.lock() = *other.actions.lock();
    }

    /// Exec resets every caught handler to the default; ignored stays
    /// ignored.
    pub fn exec_reset(&self) {
        let mut actions = self.actions.lock();
        for action in actions.iter_mut() {
            if !matches!(action.kind, SigActionKind::Ignore) {
                *action = SigAction::default_action();
            }
        }
        self.pending.store(0, Ordering::Release);
    }

    /// Remove one signal from the pending set (sigwait).
    pub fn consume(&self, sig: u32) {
        self.pending.fetch_and(!sig_bit(sig), Ordering::AcqRel);
    }

    /// Lowest-numbered deliverable signal without consuming it.
    pub fn peek_deliverable(&self) -> Option<u32> {
        let pending = self.pending.load(Ordering::Acquire);
        let blocked = self.blocked.load(Ordering::Acquire) & !UNBLOCKABLE;
        let deliverable = pending & !blocked;
        if deliverable == 0 {
            None
        } else {
            Some(deliverable.trailing_zeros() + 1)
        }
    }

    /// Lowest-numbered pending signal that is deliverable, removed from the
    /// pending set.
    pub fn take_deliverable(&self) -> Option<u32> {
        loop {
            let pending = self.pending.load(Ordering::Acquire);
            let blocked = self.blocked.load(Ordering::Acquire) & !UNBLOCKABLE;
            let deliverable = pending & !blocked;
            if deliverable == 0 {
                return None;
            }
            let sig = deliverable.trailing_zeros() + 1;
            if self
                .pending
                .compare_exchange(
                    pending,
                    pending & !sig_bit(sig),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(sig);
            }
        }
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Post `sig` to `task` and give it a chance to run.
pub fn send(task: &Arc<Task>, sig: u32) {
    if !valid_signal(sig) {
        return;
    }

    // An ignored signal with no handler is dropped at send time unless it
    // is currently blocked (it might get unblocked and a handler installed).
    let action = task.sig.action(sig);
    if matches!(action.kind, SigActionKind::Ignore) && sig != SIGKILL && sig != SIGSTOP {
        return;
    }

    task.sig.pending.fetch_or(sig_bit(sig), Ordering::AcqRel);

    match sig {
        SIGKILL => {
            task.killed.store(true, Ordering::Release);
            task.wake();
        }
        SIGCONT => {
            // Continue a stopped task immediately.
            let _ = task.state.compare_exchange(
                TaskState::Stopped as u32,
                TaskState::Running as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            task.status_changed.store(true, Ordering::Release);
            task.intr_wake();
        }
        _ => task.intr_wake(),
    }
}

// ---------------------------------------------------------------------------
// Delivery (return-to-user path)
// ---------------------------------------------------------------------------

/// Extra signals masked while the handler runs, plus the delivered signal
/// itself, restored by sigreturn.
#[repr(C)]
struct SignalStackFrame {
    /// Handler return address: points at `stub` below.
    ret_addr: u64,
    signum: u64,
    old_mask: u64,
    saved: TrapFrame,
    /// `mov eax, SYS_SIGRETURN; int 0x80`, padded.
    stub: [u8; 8],
}

fn sigreturn_stub() -> [u8; 8] {
    let nr = crate::syscall::table::SYS_SIGRETURN as u32;
    let b = nr.to_le_bytes();
    [0xB8, b[0], b[1], b[2], b[3], 0xCD, 0x80, 0x90]
}

/// Deliver one pending signal, if any, just before returning to user mode.
/// Runs on the current task; may not return (default terminate/stop).
pub fn deliver_pending(frame: &mut TrapFrame) {
    let task = crate::task::scheduler::current();

    let sig = match task.sig.take_deliverable() {
        Some(sig) => sig,
        None => return,
    };

    let action = task.sig.action(sig);
    match action.kind {
        SigActionKind::Ignore => {}
        SigActionKind::Default => match default_action(sig) {
            DefaultAction::Ignore => {}
            DefaultAction::Terminate | DefaultAction::CoreDump => {
                super::sys::task_exit_signal(sig);
            }
            DefaultAction::Stop => {
                super::sys::task_stop(sig);
            }
            DefaultAction::Continue => {
                // The wake already happened in send(); nothing more here.
            }
        },
        SigActionKind::Handler(entry) => {
            if push_handler_frame(&task, frame, sig, entry, &action).is_err() {
                // Unwritable user stack: nothing sane to do but kill.
                super::sys::task_exit_signal(SIGSEGV);
            }
        }
    }
}

/// Build the handler frame on the user stack and redirect the trap frame
/// into the handler.
fn push_handler_frame(
    task: &Arc<Task>,
    frame: &mut TrapFrame,
    sig: u32,
    entry: u64,
    action: &SigAction,
) -> KResult<()> {
    let frame_size = core::mem::size_of::<SignalStackFrame>() as u64;
    // Keep the frame 16-byte aligned below the old stack pointer.
    let sp = (frame.rsp - frame_size) & !0xF;

    let old_mask = task.sig.blocked_mask();
    let stub_offset = core::mem::offset_of!(SignalStackFrame, stub) as u64;

    let sigframe = SignalStackFrame {
        ret_addr: sp + stub_offset,
        signum: sig as u64,
        old_mask,
        saved: *frame,
        stub: sigreturn_stub(),
    };

    crate::memory::user::copy_to_user_raw(
        sp as *mut u8,
        &sigframe as *const SignalStackFrame as *const u8,
        frame_size as usize,
    )?;

    // Handler runs with the signal itself plus the action's mask blocked.
    task.sig
        .set_blocked(old_mask | action.mask | sig_bit(sig));

    frame.rsp = sp;
    frame.rip = entry;
    frame.rdi = sig as u64;
    Ok(())
}

/// `sigreturn`: unwind the handler frame the kernel pushed. The user rsp
/// points at the `signum` slot (the handler's `ret` consumed `ret_addr`).
pub fn sigreturn(frame: &mut TrapFrame) -> KResult<()> {
    let task = crate::task::scheduler::current();

    let base = frame
        .rsp
        .checked_sub(core::mem::size_of::<u64>() as u64)
        .ok_or(EFAULT)?;

    let mut saved_frame = SignalStackFrame {
        ret_addr: 0,
        signum: 0,
        old_mask: 0,
        saved: *frame,
        stub: [0; 8],
    };
    crate::memory::user::copy_from_user_raw(
        &mut saved_frame as *mut SignalStackFrame as *mut u8,
        base as *const u8,
        core::mem::size_of::<SignalStackFrame>(),
    )?;

    task.sig.set_blocked(saved_frame.old_mask);
    *frame = saved_frame.saved;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn default_actions_match_posix() {
        assert_eq!(default_action(SIGCHLD), DefaultAction::Ignore);
        assert_eq!(default_action(SIGSTOP), DefaultAction::Stop);
        assert_eq!(default_action(SIGCONT), DefaultAction::Continue);
        assert_eq!(default_action(SIGSEGV), DefaultAction::CoreDump);
        assert_eq!(default_action(SIGTERM), DefaultAction::Terminate);
        assert_eq!(default_action(SIGPIPE), DefaultAction::Terminate);
    }

    #[test_case]
    fn kill_and_stop_cannot_be_caught() {
        let state = SignalState::new();
        assert!(state
            .set_action(
                SIGKILL,
                SigAction {
                    kind: SigActionKind::Ignore,
                    mask: 0,
                    flags: 0
                }
            )
            .is_err());
        assert!(state.set_action(SIGSTOP, SigAction::default_action()).is_err());
    }

    #[test_case]
    fn blocked_signals_are_not_deliverable() {
        let state = SignalState::new();
        state.set_blocked(sig_bit(SIGUSR1));
        state.pending.fetch_or(sig_bit(SIGUSR1), Ordering::AcqRel);
        assert!(!state.has_pending());
        assert_eq!(state.take_deliverable(), None);

        state.set_blocked(0);
        assert!(state.has_pending());
        assert_eq!(state.take_deliverable(), Some(SIGUSR1));
        assert!(!state.has_pending());
    }
}
