//! The scheduler.
//!
//! One list holds every task in the system regardless of state; scheduling
//! is a round-robin scan for the first runnable entry, rotating the chosen
//! task to the tail. "Runnable" means `Running`, marked preempted, or
//! sleeping with an expired wake-up tick.
//!
//! The scheduler runs on its own context (the boot stack). A task switches
//! in via `arch_context_switch` and switches back out on yield; involuntary
//! preemption is a yield issued from the timer interrupt's tail while the
//! interrupt still executes on the task's kernel stack.
//!
//! Lost wake-ups are prevented by the state machine, not by holding the
//! list lock across switches: sleepers set their state to a sleeping value
//! *before* checking their condition, and `task_wake` flips the state back
//! to `Running`, so a wake between check and yield keeps the task eligible.

use alloc::sync::Arc;
use alloc::vec::Vec;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use super::{Pid, Task, TaskState};
use crate::errno::{KResult, EPERM, ESRCH};
use crate::spinlock::Spinlock;

struct SchedInner {
    /// Every task, in rotation order.
    list: VecDeque<Arc<Task>>,
    current: Option<Arc<Task>>,
}

static SCHED: Spinlock<SchedInner> = Spinlock::new(SchedInner {
    list: VecDeque::new(),
    current: None,
});

/// Saved scheduler-loop stack pointer; tasks switch back to it on yield.
static SCHED_CTX: AtomicU64 = AtomicU64::new(0);

static SCHEDULER_RUNNING: AtomicBool = AtomicBool::new(false);

/// Monotonic pid source, never reused within a boot.
static NEXT_PID: AtomicI32 = AtomicI32::new(1);

/// The init process; orphaned children are reparented to it.
static INIT_TASK: spin::Mutex<Option<Arc<Task>>> = spin::Mutex::new(None);

pub fn set_init_task(task: &Arc<Task>) {
    *INIT_TASK.lock() = Some(task.clone());
}

pub fn init_task() -> Option<Arc<Task>> {
    INIT_TASK.lock().clone()
}

pub fn next_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Whether the scheduler loop has started (blocking allocations check this).
pub fn is_running() -> bool {
    SCHEDULER_RUNNING.load(Ordering::Acquire)
}

/// Add a task to the rotation. The task must have an initialized context.
pub fn add_task(task: Arc<Task>) {
    task.set_state(TaskState::Running);
    SCHED.lock().list.push_back(task);
}

/// The currently running task. Panics outside task context; interrupt
/// handlers and early boot use `try_current`.
pub fn current() -> Arc<Task> {
    try_current().expect("no current task")
}

pub fn try_current() -> Option<Arc<Task>> {
    SCHED.lock().current.clone()
}

pub fn set_sleeping() {
    current().set_state(TaskState::Sleeping);
}

pub fn set_intr_sleeping() {
    current().set_state(TaskState::IntrSleeping);
}

pub fn set_running() {
    current().set_state(TaskState::Running);
}

/// Make a sleeping task runnable.
pub fn task_wake(task: &Task) {
    task.wake();
}

/// Wake only interruptible sleepers (signal delivery).
pub fn task_intr_wake(task: &Task) {
    task.intr_wake();
}

/// Find a task by pid.
pub fn task_get(pid: Pid) -> Option<Arc<Task>> {
    SCHED.lock().list.iter().find(|t| t.pid == pid).cloned()
}

pub fn task_exists(pid: Pid) -> bool {
    task_get(pid).is_some()
}

/// Snapshot of every task, for the /proc views.
pub fn task_list_snapshot() -> Vec<Arc<Task>> {
    SCHED.lock().list.iter().cloned().collect()
}

/// Every task in a process group.
pub fn tasks_in_pgroup(pgid: Pid) -> Vec<Arc<Task>> {
    SCHED
        .lock()
        .list
        .iter()
        .filter(|t| t.pgid() == pgid)
        .cloned()
        .collect()
}

/// Every task in a session.
pub fn tasks_in_session(sid: Pid) -> Vec<Arc<Task>> {
    SCHED
        .lock()
        .list
        .iter()
        .filter(|t| t.sid() == sid)
        .cloned()
        .collect()
}

/// Clear the controlling tty of every task in `sid` (session leader exit).
pub fn clear_session_tty(sid: Pid) {
    for task in tasks_in_session(sid) {
        *task.tty.lock() = None;
    }
}

/// Signal-permission check: root, or matching real/effective uid.
fn can_signal(sender: &Task, target: &Task) -> bool {
    let s = sender.creds.lock().clone();
    let t = target.creds.lock();
    s.euid == 0 || s.ruid == t.ruid || s.euid == t.ruid || s.ruid == t.suid || s.euid == t.suid
}

/// Deliver `signal` to the task with `pid`. `force` skips the permission
/// check (kernel-internal senders).
pub fn send_signal(pid: Pid, signal: u32, force: bool) -> KResult<()> {
    let target = task_get(pid).ok_or(ESRCH)?;

    if !force {
        let sender = current();
        if !can_signal(&sender, &target) {
            return Err(EPERM);
        }
    }

    super::signal::send(&target, signal);
    Ok(())
}

/// Deliver `signal` to every member of a process group.
pub fn send_signal_pgroup(pgid: Pid, signal: u32, force: bool) -> KResult<()> {
    let targets = tasks_in_pgroup(pgid);
    if targets.is_empty() {
        return Err(ESRCH);
    }
    let sender = current();
    let mut hit = false;
    for target in targets {
        if force || can_signal(&sender, &target) {
            super::signal::send(&target, signal);
            hit = true;
        }
    }
    if hit {
        Ok(())
    } else {
        Err(EPERM)
    }
}

/// Yield back to the scheduler context. Returns when this task is next
/// picked. Interrupts are disabled across the switch; the scheduler side
/// re-enables them when it next idles or dispatches.
pub fn yield_now() {
    let current = current();
    x86_64::instructions::interrupts::without_interrupts(|| unsafe {
        super::context::arch_context_switch(
            current.context.rsp_slot(),
            SCHED_CTX.load(Ordering::Acquire),
        );
    });
}

/// Timer-driven yield: keep the task `Running` but flag it preempted so the
/// rotation moves on. Called from the timer interrupt tail, on this task's
/// kernel stack, after EOI.
pub fn yield_preempt() {
    let task = match try_current() {
        Some(t) => t,
        None => return,
    };
    task.preempted.store(true, Ordering::Relaxed);
    unsafe {
        super::context::arch_context_switch(
            task.context.rsp_slot(),
            SCHED_CTX.load(Ordering::Acquire),
        );
    }
}

/// Timer interrupt hook: nothing to do beyond bookkeeping; sleepers with
/// expired ticks are noticed by the scheduling scan itself.
pub fn timer_tick() {}

/// Move the current task out of the rotation permanently. The final yield
/// never returns; the scheduler frees the task on its next pass.
pub fn task_dead() -> ! {
    let task = current();
    task.set_state(TaskState::Dead);
    yield_now();
    unreachable!("dead task rescheduled");
}

/// Mark some other task dead (reaped zombie).
pub fn task_mark_dead(task: &Task) {
    task.set_state(TaskState::Dead);
}

/// Sleep for at least `ms` milliseconds. Spurious wakes loop back to sleep.
pub fn waitms(ms: u64) {
    let deadline = crate::time::wakeup_tick(ms);
    let task = current();
    task.wake_up_tick.store(deadline, Ordering::Relaxed);
    loop {
        task.set_state(TaskState::Sleeping);
        if crate::time::ticks() >= deadline {
            break;
        }
        yield_now();
    }
    task.wake_up_tick.store(0, Ordering::Relaxed);
    task.set_state(TaskState::Running);
}

/// Interruptible sleep; returns remaining milliseconds if a signal ended it
/// early.
pub fn waitms_intr(ms: u64) -> Result<(), u64> {
    let deadline = crate::time::wakeup_tick(ms);
    let task = current();
    task.wake_up_tick.store(deadline, Ordering::Relaxed);
    let mut interrupted = false;
    loop {
        let sig_pending = task.sig.has_pending();
        task.set_state(TaskState::IntrSleeping);
        if crate::time::ticks() >= deadline {
            break;
        }
        if sig_pending {
            interrupted = true;
            break;
        }
        yield_now();
    }
    task.wake_up_tick.store(0, Ordering::Relaxed);
    task.set_state(TaskState::Running);

    if interrupted {
        let now = crate::time::ticks();
        Err(crate::time::ticks_to_ms(deadline.saturating_sub(now)))
    } else {
        Ok(())
    }
}

/// Pick the next task to run and rotate it to the tail. A set preempted
/// flag selects the task outright (consuming the flag); otherwise the
/// state decides, and the scan wakes sleepers whose deadline has passed as
/// a side effect.
fn pick_next(inner: &mut SchedInner) -> Option<Arc<Task>> {
    let now = crate::time::ticks();
    let len = inner.list.len();

    for idx in 0..len {
        let task = &inner.list[idx];

        let runnable = if task.preempted.swap(false, Ordering::Relaxed) {
            true
        } else {
            match task.state() {
                TaskState::Running => true,
                TaskState::Sleeping | TaskState::IntrSleeping => {
                    let wake = task.wake_up_tick.load(Ordering::Relaxed);
                    if wake != 0 && wake <= now {
                        task.set_state(TaskState::Running);
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };

        if runnable {
            let task = inner.list.remove(idx).unwrap();
            inner.list.push_back(task.clone());
            return Some(task);
        }
    }
    None
}

/// Free tasks marked `Dead`. Runs at the top of every scheduling pass.
fn reap_dead(inner: &mut SchedInner) {
    inner.list.retain(|t| t.state() != TaskState::Dead);
}

/// The scheduler loop; becomes the CPU's idle context. Never returns.
pub fn schedule_loop() -> ! {
    SCHEDULER_RUNNING.store(true, Ordering::Release);
    log::info!("scheduler: entering dispatch loop");

    loop {
        x86_64::instructions::interrupts::disable();

        let next = {
            let mut inner = SCHED.lock();
            reap_dead(&mut inner);
            pick_next(&mut inner)
        };

        match next {
            Some(task) => unsafe {
                dispatch(task);
            },
            None => {
                // Idle: wait for the next interrupt to make something
                // runnable.
                x86_64::instructions::interrupts::enable_and_hlt();
            }
        }
    }
}

/// Switch into `task` until it yields back.
unsafe fn dispatch(task: Arc<Task>) {
    {
        let mut inner = SCHED.lock();
        inner.current = Some(task.clone());
    }

    // User tasks run on their own page-table root; kernel mappings are
    // shared so kernel threads can stay on whatever root is loaded.
    if let Some(space) = task.addr_space.lock().as_ref() {
        space.activate();
    }
    crate::gdt::set_kernel_stack(task.kstack.top());

    super::context::arch_context_switch(sched_ctx_slot(), task.context.rsp());

    {
        let mut inner = SCHED.lock();
        inner.current = None;
    }
}

fn sched_ctx_slot() -> *mut u64 {
    SCHED_CTX.as_ptr()
}
