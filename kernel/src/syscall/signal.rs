//! Signal syscall handlers.

use crate::errno::{KResult, EINVAL};
use crate::interrupts::TrapFrame;
use crate::memory::user::{copy_from_user, copy_to_user};
use crate::task::scheduler;
use crate::task::signal::{valid_signal, SigAction, SigActionKind};
use crate::sleep_event_intr;

pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

pub const SIG_BLOCK: u32 = 0;
pub const SIG_UNBLOCK: u32 = 1;
pub const SIG_SETMASK: u32 = 2;

/// Userspace sigaction record.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UserSigAction {
    pub handler: u64,
    pub mask: u64,
    pub flags: u32,
    pub _pad: u32,
}

fn kind_from_handler(handler: u64) -> SigActionKind {
    match handler {
        SIG_DFL => SigActionKind::Default,
        SIG_IGN => SigActionKind::Ignore,
        entry => SigActionKind::Handler(entry),
    }
}

fn handler_from_kind(kind: SigActionKind) -> u64 {
    match kind {
        SigActionKind::Default => SIG_DFL,
        SigActionKind::Ignore => SIG_IGN,
        SigActionKind::Handler(entry) => entry,
    }
}

/// signal(sig, handler): old-style interface. Returns the old handler.
pub fn sys_signal(frame: &mut TrapFrame) -> KResult<i64> {
    let sig = frame.rdi as u32;
    let handler = frame.rsi;

    if !valid_signal(sig) {
        return Err(EINVAL);
    }

    let task = scheduler::current();
    let old = task.sig.action(sig);
    task.sig.set_action(
        sig,
        SigAction {
            kind: kind_from_handler(handler),
            mask: 0,
            flags: 0,
        },
    )?;
    Ok(handler_from_kind(old.kind) as i64)
}

/// sigaction(sig, act_ptr, oldact_ptr)
pub fn sys_sigaction(frame: &mut TrapFrame) -> KResult<i64> {
    let sig = frame.rdi as u32;
    let act_ptr = frame.rsi;
    let old_ptr = frame.rdx;

    if !valid_signal(sig) {
        return Err(EINVAL);
    }

    let task = scheduler::current();
    let old = task.sig.action(sig);

    if old_ptr != 0 {
        let user_old = UserSigAction {
            handler: handler_from_kind(old.kind),
            mask: old.mask,
            flags: old.flags,
            _pad: 0,
        };
        copy_to_user(old_ptr, &user_old)?;
    }

    if act_ptr != 0 {
        let user_act: UserSigAction = copy_from_user(act_ptr)?;
        task.sig.set_action(
            sig,
            SigAction {
                kind: kind_from_handler(user_act.handler),
                mask: user_act.mask,
                flags: user_act.flags,
            },
        )?;
    }
    Ok(0)
}

/// sigprocmask(how, set_ptr, oldset_ptr)
pub fn sys_sigprocmask(frame: &mut TrapFrame) -> KResult<i64> {
    let how = frame.rdi as u32;
    let set_ptr = frame.rsi;
    let old_ptr = frame.rdx;

    let task = scheduler::current();
    let old = task.sig.blocked_mask();

    if old_ptr != 0 {
        copy_to_user(old_ptr, &old)?;
    }

    if set_ptr != 0 {
        let set: u64 = copy_from_user(set_ptr)?;
        let new = match how {
            SIG_BLOCK => old | set,
            SIG_UNBLOCK => old & !set,
            SIG_SETMASK => set,
            _ => return Err(EINVAL),
        };
        task.sig.set_blocked(new);
    }
    Ok(0)
}

/// sigpending(set_ptr)
pub fn sys_sigpending(frame: &mut TrapFrame) -> KResult<i64> {
    let pending = scheduler::current().sig.pending_mask();
    copy_to_user(frame.rdi, &pending)?;
    Ok(0)
}

/// sigwait(set_ptr, sig_ptr): block until one of `set` is pending, consume
/// it, and report which.
pub fn sys_sigwait(frame: &mut TrapFrame) -> KResult<i64> {
    let set: u64 = copy_from_user(frame.rdi)?;
    if set == 0 {
        return Err(EINVAL);
    }

    let task = scheduler::current();
    sleep_event_intr!(task.sig.pending_mask() & set != 0)?;

    let fired = task.sig.pending_mask() & set;
    let sig = fired.trailing_zeros() + 1;
    task.sig.consume(sig);

    copy_to_user(frame.rsi, &sig)?;
    Ok(0)
}

/// sigsuspend(mask_ptr)
pub fn sys_sigsuspend(frame: &mut TrapFrame) -> KResult<i64> {
    let mask: u64 = copy_from_user(frame.rdi)?;
    crate::task::sys::sys_sigsuspend(mask)?;
    Ok(0)
}

/// sigreturn(): unwind the handler frame.
pub fn sys_sigreturn(frame: &mut TrapFrame) -> KResult<i64> {
    crate::task::signal::sigreturn(frame)?;
    // rax was restored from the saved frame; keep it.
    Ok(frame.rax as i64)
}
