//! Process lifecycle: fork, exit, wait, job control, credentials.
//!
//! Fork copies the parent's open files (sharing the handles), cwd, signal
//! state, credentials, and address space (eager page copy), then hands the
//! child a trap frame identical to the parent's except for the zero return
//! value. Exit releases everything but the kernel stack, turns the task
//! into a zombie, and pokes the parent; wait reaps.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use super::scheduler;
use super::signal::{self, SIGCHLD, SIGHUP};
use super::{Pid, Task, TaskState};
use crate::errno::{KResult, ECHILD, EINVAL, ENOMEM, EPERM, ESRCH};
use crate::interrupts::TrapFrame;
use crate::sleep_event_intr;

// ---------------------------------------------------------------------------
// Wait-status encoding
// ---------------------------------------------------------------------------

pub const WNOHANG: u32 = 1;
pub const WUNTRACED: u32 = 2;
pub const WCONTINUED: u32 = 8;

/// Dedicated "continued" status value.
pub const WCONTINUED_BITS: i32 = 0xFFFF;

pub const fn wexit_make(code: i32) -> i32 {
    (code & 0xFF) << 8
}

pub const fn wsignaled_make(sig: u32) -> i32 {
    sig as i32 & 0x7F
}

pub const fn wstopped_make(sig: u32) -> i32 {
    ((sig as i32) << 8) | 0x7F
}

pub const fn wifexited(status: i32) -> bool {
    status & 0x7F == 0
}

pub const fn wifsignaled(status: i32) -> bool {
    ((status & 0x7F) + 1) >> 1 > 0
}

pub const fn wifstopped(status: i32) -> bool {
    status & 0xFF == 0x7F
}

pub const fn wifcontinued(status: i32) -> bool {
    status == WCONTINUED_BITS
}

pub const fn wexitstatus(status: i32) -> i32 {
    (status >> 8) & 0xFF
}

pub const fn wtermsig(status: i32) -> i32 {
    status & 0x7F
}

pub const fn wstopsig(status: i32) -> i32 {
    (status >> 8) & 0xFF
}

// ---------------------------------------------------------------------------
// fork
// ---------------------------------------------------------------------------

/// Create a child mirroring the caller. Returns the child pid; the child
/// itself resumes in user mode with a syscall return of 0.
pub fn sys_fork(frame: &TrapFrame) -> KResult<Pid> {
    let parent = scheduler::current();

    let name = parent.name.lock().clone();
    let child = Task::new(name, false).ok_or(ENOMEM)?;

    // Shared handles and snapshots.
    child.files.copy_from(&parent.files);
    *child.cwd.lock() = parent.cwd.lock().clone();
    child.sig.copy_from(&parent.sig);
    *child.creds.lock() = parent.creds.lock().clone();
    child
        .umask
        .store(parent.umask.load(Ordering::Relaxed), Ordering::Relaxed);
    child.pgid.store(parent.pgid(), Ordering::Relaxed);
    child.sid.store(parent.sid(), Ordering::Relaxed);
    *child.tty.lock() = parent.tty.lock().clone();

    *child.parent.lock() = Some(Arc::downgrade(&parent));
    parent.children.lock().push(child.clone());

    // Address space: eager deep copy.
    {
        let mut parent_space = parent.addr_space.lock();
        let space = parent_space.as_mut().ok_or(EINVAL)?;
        let child_space = space.fork_copy()?;
        *child.addr_space.lock() = Some(child_space);
    }

    // The child's first dispatch unwinds straight through trap_return with
    // the parent's register file and rax = 0.
    unsafe {
        build_fork_context(&child, frame);
    }

    scheduler::add_task(child.clone());
    Ok(child.pid)
}

/// Place a copy of `parent_frame` at the top of the child's kernel stack
/// and point the child's context at a bootstrap frame that returns into
/// `trap_return`.
///
/// # Safety
///
/// The child must not be runnable yet; its stack is written raw.
unsafe fn build_fork_context(child: &Arc<Task>, parent_frame: &TrapFrame) {
    let frame_size = core::mem::size_of::<TrapFrame>();
    let top = child.kstack.top().as_u64() & !0xF;
    let frame_ptr = (top - frame_size as u64) as *mut TrapFrame;

    let mut frame = *parent_frame;
    frame.rax = 0;
    frame_ptr.write(frame);

    // Bootstrap context below the frame: six zeroed callee-saved slots and
    // the return target.
    let ctx = (frame_ptr as u64 - 7 * 8) as *mut u64;
    for i in 0..6 {
        ctx.add(i).write(0);
    }
    ctx.add(6).write(crate::interrupts::trap_return_addr());

    child.context.set_rsp(ctx as u64);
}

// ---------------------------------------------------------------------------
// exit / wait
// ---------------------------------------------------------------------------

fn release_resources(task: &Arc<Task>) {
    // The address space is live on this CPU; step off it first.
    crate::memory::activate_boot_root();
    let old_space = task.addr_space.lock().take();
    drop(old_space);

    task.files.close_all();

    if let Some(cwd) = task.cwd.lock().take() {
        crate::fs::inode::inode_put(cwd);
    }
}

fn reparent_children(task: &Arc<Task>) {
    let init = scheduler::init_task();
    let mut children = task.children.lock();

    for child in children.drain(..) {
        if child.is_zombie() {
            // Nobody will wait for it now; release immediately.
            scheduler::task_mark_dead(&child);
            continue;
        }
        if let Some(init) = &init {
            *child.parent.lock() = Some(Arc::downgrade(init));
            init.children.lock().push(child);
        } else {
            *child.parent.lock() = None;
        }
    }
}

/// Terminate the current task with an already-encoded wait status.
pub fn task_exit(status: i32) -> ! {
    let task = scheduler::current();
    debug_assert!(!task.is_kernel(), "kernel thread exiting through task_exit");

    release_resources(&task);
    reparent_children(&task);

    // A session leader takes the controlling tty down with it.
    if task.sid() == task.pid {
        let tty = task.tty.lock().clone();
        if let Some(tty) = tty {
            crate::tty::clear_session_tty(&tty, task.pid);
            // The foreground loses its terminal.
            let _ = scheduler::send_signal_pgroup(task.pgid(), SIGHUP, true);
        }
    }

    task.wait_status.store(status, Ordering::Release);
    task.set_state(TaskState::Zombie);

    if let Some(parent) = task.parent.lock().as_ref().and_then(|w| w.upgrade()) {
        signal::send(&parent, SIGCHLD);
        parent.wake();
    }

    loop {
        // Zombies are never picked; one yield parks us until the reap.
        scheduler::yield_now();
    }
}

/// Default-action termination by `sig` (also the SIGSEGV/SIGILL path).
pub fn task_exit_signal(sig: u32) -> ! {
    task_exit(wsignaled_make(sig))
}

/// Normal exit(2).
pub fn sys_exit(code: i32) -> ! {
    task_exit(wexit_make(code))
}

/// Default-action stop. Returns when something continues us.
pub fn task_stop(sig: u32) {
    let task = scheduler::current();
    task.wait_status
        .store(wstopped_make(sig), Ordering::Release);
    task.status_changed.store(true, Ordering::Release);

    if let Some(parent) = task.parent.lock().as_ref().and_then(|w| w.upgrade()) {
        parent.wake();
    }

    task.set_state(TaskState::Stopped);
    scheduler::yield_now();
}

fn wait_matches(child: &Arc<Task>, pid: Pid, caller_pgid: Pid) -> bool {
    if pid > 0 {
        child.pid == pid
    } else if pid == 0 {
        child.pgid() == caller_pgid
    } else if pid == -1 {
        true
    } else {
        child.pgid() == -pid
    }
}

/// waitpid(2): reap a zombie child (or report stop/continue transitions
/// under the matching options). Blocks unless `WNOHANG`.
pub fn sys_waitpid(pid: Pid, options: u32) -> KResult<(Pid, i32)> {
    let task = scheduler::current();
    let caller_pgid = task.pgid();

    loop {
        let mut found_any = false;
        let mut result: Option<(Arc<Task>, i32, bool)> = None; // (child, status, reap)

        {
            let children = task.children.lock();
            for child in children.iter() {
                if !wait_matches(child, pid, caller_pgid) {
                    continue;
                }
                found_any = true;

                if child.is_zombie() {
                    let status = child.wait_status.load(Ordering::Acquire);
                    result = Some((child.clone(), status, true));
                    break;
                }
                if child.status_changed.load(Ordering::Acquire) {
                    let state = child.state();
                    if state == TaskState::Stopped && options & WUNTRACED != 0 {
                        child.status_changed.store(false, Ordering::Release);
                        let status = child.wait_status.load(Ordering::Acquire);
                        result = Some((child.clone(), status, false));
                        break;
                    }
                    if state != TaskState::Stopped && options & WCONTINUED != 0 {
                        child.status_changed.store(false, Ordering::Release);
                        result = Some((child.clone(), WCONTINUED_BITS, false));
                        break;
                    }
                }
            }
        }

        if let Some((child, status, reap)) = result {
            if reap {
                task.children.lock().retain(|c| !Arc::ptr_eq(c, &child));
                scheduler::task_mark_dead(&child);
            }
            return Ok((child.pid, status));
        }

        if !found_any {
            return Err(ECHILD);
        }
        if options & WNOHANG != 0 {
            return Ok((0, 0));
        }

        // Woken by child exit (direct wake) or SIGCHLD (intr wake).
        sleep_event_intr!(child_event_pending(&task, pid, caller_pgid))?;
    }
}

fn child_event_pending(task: &Arc<Task>, pid: Pid, caller_pgid: Pid) -> bool {
    let children = task.children.lock();
    children.iter().any(|child| {
        wait_matches(child, pid, caller_pgid)
            && (child.is_zombie() || child.status_changed.load(Ordering::Acquire))
    })
}

/// wait(2) is waitpid(-1, .., 0).
pub fn sys_wait() -> KResult<(Pid, i32)> {
    sys_waitpid(-1, 0)
}

// ---------------------------------------------------------------------------
// Sessions and process groups
// ---------------------------------------------------------------------------

/// setsid(2): become leader of a fresh session with no controlling tty.
pub fn sys_setsid() -> KResult<Pid> {
    let task = scheduler::current();

    // A process-group leader may not create a session.
    if task.pgid() == task.pid {
        return Err(EPERM);
    }

    task.sid.store(task.pid, Ordering::Relaxed);
    task.pgid.store(task.pid, Ordering::Relaxed);
    *task.tty.lock() = None;
    Ok(task.pid)
}

pub fn sys_getsid(pid: Pid) -> KResult<Pid> {
    if pid == 0 {
        return Ok(scheduler::current().sid());
    }
    scheduler::task_get(pid).map(|t| t.sid()).ok_or(ESRCH)
}

/// setpgid(2): move `pid` (self or a child) into `pgid` within the same
/// session.
pub fn sys_setpgid(pid: Pid, pgid: Pid) -> KResult<()> {
    if pgid < 0 {
        return Err(EINVAL);
    }

    let task = scheduler::current();
    let target = if pid == 0 || pid == task.pid {
        task.clone()
    } else {
        let target = scheduler::task_get(pid).ok_or(ESRCH)?;
        let is_child = task
            .children
            .lock()
            .iter()
            .any(|c| Arc::ptr_eq(c, &target));
        if !is_child {
            return Err(ESRCH);
        }
        target
    };

    if target.sid() != task.sid() {
        return Err(EPERM);
    }
    // Session leaders keep their group.
    if target.sid() == target.pid {
        return Err(EPERM);
    }

    let new_pgid = if pgid == 0 { target.pid } else { pgid };
    target.pgid.store(new_pgid, Ordering::Relaxed);
    Ok(())
}

pub fn sys_getpgrp() -> Pid {
    scheduler::current().pgid()
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

fn is_one_of(value: u32, creds: (u32, u32, u32)) -> bool {
    value == creds.0 || value == creds.1 || value == creds.2
}

pub fn sys_setuid(uid: u32) -> KResult<()> {
    let task = scheduler::current();
    let mut creds = task.creds.lock();
    if creds.euid == 0 {
        creds.ruid = uid;
        creds.euid = uid;
        creds.suid = uid;
        return Ok(());
    }
    if !is_one_of(uid, (creds.ruid, creds.euid, creds.suid)) {
        return Err(EPERM);
    }
    creds.euid = uid;
    Ok(())
}

pub fn sys_setreuid(ruid: i32, euid: i32) -> KResult<()> {
    let task = scheduler::current();
    let mut creds = task.creds.lock();
    let cur = (creds.ruid, creds.euid, creds.suid);
    let root = creds.euid == 0;

    if ruid >= 0 && !root && !is_one_of(ruid as u32, cur) {
        return Err(EPERM);
    }
    if euid >= 0 && !root && !is_one_of(euid as u32, cur) {
        return Err(EPERM);
    }

    if ruid >= 0 {
        creds.ruid = ruid as u32;
    }
    if euid >= 0 {
        creds.euid = euid as u32;
        // Changing euid away from ruid saves it.
        if creds.euid != creds.ruid {
            creds.suid = creds.euid;
        }
    }
    Ok(())
}

pub fn sys_setresuid(ruid: i32, euid: i32, suid: i32) -> KResult<()> {
    let task = scheduler::current();
    let mut creds = task.creds.lock();
    let cur = (creds.ruid, creds.euid, creds.suid);
    let root = creds.euid == 0;

    for v in [ruid, euid, suid] {
        if v >= 0 && !root && !is_one_of(v as u32, cur) {
            return Err(EPERM);
        }
    }

    if ruid >= 0 {
        creds.ruid = ruid as u32;
    }
    if euid >= 0 {
        creds.euid = euid as u32;
    }
    if suid >= 0 {
        creds.suid = suid as u32;
    }
    Ok(())
}

pub fn sys_setgid(gid: u32) -> KResult<()> {
    let task = scheduler::current();
    let mut creds = task.creds.lock();
    if creds.euid == 0 {
        creds.rgid = gid;
        creds.egid = gid;
        creds.sgid = gid;
        return Ok(());
    }
    if !is_one_of(gid, (creds.rgid, creds.egid, creds.sgid)) {
        return Err(EPERM);
    }
    creds.egid = gid;
    Ok(())
}

pub fn sys_setregid(rgid: i32, egid: i32) -> KResult<()> {
    let task = scheduler::current();
    let mut creds = task.creds.lock();
    let cur = (creds.rgid, creds.egid, creds.sgid);
    let root = creds.euid == 0;

    if rgid >= 0 && !root && !is_one_of(rgid as u32, cur) {
        return Err(EPERM);
    }
    if egid >= 0 && !root && !is_one_of(egid as u32, cur) {
        return Err(EPERM);
    }

    if rgid >= 0 {
        creds.rgid = rgid as u32;
    }
    if egid >= 0 {
        creds.egid = egid as u32;
        if creds.egid != creds.rgid {
            creds.sgid = creds.egid;
        }
    }
    Ok(())
}

pub fn sys_setresgid(rgid: i32, egid: i32, sgid: i32) -> KResult<()> {
    let task = scheduler::current();
    let mut creds = task.creds.lock();
    let cur = (creds.rgid, creds.egid, creds.sgid);
    let root = creds.euid == 0;

    for v in [rgid, egid, sgid] {
        if v >= 0 && !root && !is_one_of(v as u32, cur) {
            return Err(EPERM);
        }
    }

    if rgid >= 0 {
        creds.rgid = rgid as u32;
    }
    if egid >= 0 {
        creds.egid = egid as u32;
    }
    if sgid >= 0 {
        creds.sgid = sgid as u32;
    }
    Ok(())
}

pub fn sys_setgroups(groups: alloc::vec::Vec<u32>) -> KResult<()> {
    let task = scheduler::current();
    let mut creds = task.creds.lock();
    if creds.euid != 0 {
        return Err(EPERM);
    }
    creds.groups = groups;
    Ok(())
}

pub fn sys_getgroups() -> alloc::vec::Vec<u32> {
    scheduler::current().creds.lock().groups.clone()
}

// ---------------------------------------------------------------------------
// Sleeping and pausing
// ---------------------------------------------------------------------------

/// sleep(2): whole seconds; returns the unslept remainder on a signal.
pub fn sys_sleep(seconds: u32) -> u32 {
    match scheduler::waitms_intr(seconds as u64 * 1000) {
        Ok(()) => 0,
        Err(remaining_ms) => ((remaining_ms + 999) / 1000) as u32,
    }
}

pub fn sys_usleep(usecs: u64) -> KResult<()> {
    match scheduler::waitms_intr(usecs / 1000) {
        Ok(()) => Ok(()),
        Err(_) => Err(crate::errno::EINTR),
    }
}

/// pause(2): sleep until any signal is delivered; always -EINTR.
pub fn sys_pause() -> KResult<()> {
    let task = scheduler::current();
    loop {
        task.set_state(TaskState::IntrSleeping);
        if task.sig.has_pending() {
            break;
        }
        scheduler::yield_now();
    }
    task.set_state(TaskState::Running);
    Err(crate::errno::EINTR)
}

/// sigsuspend(2): wait with a temporary signal mask.
pub fn sys_sigsuspend(mask: u64) -> KResult<()> {
    let task = scheduler::current();
    let old = task.sig.blocked_mask();
    task.sig.set_blocked(mask);
    let result = sys_pause();
    task.sig.set_blocked(old);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn wait_status_codec() {
        let exited = wexit_make(42);
        assert!(wifexited(exited));
        assert!(!wifsignaled(exited));
        assert!(!wifstopped(exited));
        assert_eq!(wexitstatus(exited), 42);

        let signaled = wsignaled_make(9);
        assert!(wifsignaled(signaled));
        assert!(!wifexited(signaled));
        assert_eq!(wtermsig(signaled), 9);

        let stopped = wstopped_make(19);
        assert!(wifstopped(stopped));
        assert!(!wifexited(stopped));
        assert_eq!(wstopsig(stopped), 19);

        assert!(wifcontinued(WCONTINUED_BITS));
    }

    #[test_case]
    fn stopped_status_is_distinct_from_continued() {
        let st = wstopped_make(super::super::signal::SIGSTOP);
        assert!(wifstopped(st));
        assert_ne!(st, WCONTINUED_BITS);
    }
}
