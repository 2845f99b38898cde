//! Syscall dispatch.
//!
//! The ABI: `int 0x80` with the syscall number in `rax` and arguments in
//! `rdi`, `rsi`, `rdx` (plus `r10`, `r8` for the wide calls); the return
//! value replaces `rax`. Unknown numbers return `-ENOSYS`.
//!
//! `ERESTARTSYS` never escapes to userspace: if the signal about to be
//! delivered has a handler with `SA_RESTART`, the instruction pointer is
//! rewound over the `int 0x80` so the call transparently re-issues after
//! the handler; otherwise the call fails with `EINTR`.

pub mod fs;
pub mod mm;
pub mod net;
pub mod signal;
pub mod table;
pub mod task;

use crate::errno::{EINTR, ERESTARTSYS, KResult};
use crate::interrupts::TrapFrame;
use crate::task::signal::{SigActionKind, SA_RESTART};

/// Size of the `int 0x80` instruction, for syscall restart.
const INT80_LEN: u64 = 2;

pub type SyscallHandler = fn(&mut TrapFrame) -> KResult<i64>;

/// Entry point from the trap stub.
pub fn dispatch(frame: &mut TrapFrame) {
    let nr = frame.rax as usize;
    let orig_rax = frame.rax;

    let result = match table::handler_for(nr) {
        Some(handler) => handler(frame),
        None => Err(crate::errno::ENOSYS),
    };

    match result {
        Ok(value) => frame.rax = value as u64,
        Err(err) if err == ERESTARTSYS => {
            if should_restart() {
                // Re-issue the syscall after the handler runs: restore the
                // number and back rip up over the trap instruction.
                frame.rax = orig_rax;
                frame.rip -= INT80_LEN;
            } else {
                frame.rax = EINTR.as_ret() as u64;
            }
        }
        Err(err) => frame.rax = err.as_ret() as u64,
    }
}

/// Restart policy: look at the signal that interrupted us. Only a caught
/// signal whose action carries `SA_RESTART` restarts the call.
fn should_restart() -> bool {
    let task = crate::task::scheduler::current();
    match task.sig.peek_deliverable() {
        Some(sig) => {
            let action = task.sig.action(sig);
            matches!(action.kind, SigActionKind::Handler(_)) && action.flags & SA_RESTART != 0
        }
        // Sleep ended with ERESTARTSYS but the signal is already gone
        // (raced sigprocmask): just re-issue.
        None => true,
    }
}
