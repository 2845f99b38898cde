//! Scheduler and wait-queue behavior under real dispatch.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::task::kthread;
use crate::task::scheduler;
use crate::task::waitqueue::WaitQueue;

/// A wake issued between the condition check and the yield must not be
/// lost: the waker fires after a delay while the waiter is committed to
/// the register -> set-sleeping -> check -> yield sequence.
pub fn test_sleep_event_ordering() {
    static QUEUE: WaitQueue = WaitQueue::new();
    let flag = Arc::new(AtomicBool::new(false));

    let flag_for_waker = flag.clone();
    kthread::spawn("ktest-waker", move || {
        scheduler::waitms(50);
        flag_for_waker.store(true, Ordering::Release);
        QUEUE.wake();
        scheduler::task_dead();
    });

    QUEUE.wait_event(|| flag.load(Ordering::Acquire));
    assert!(flag.load(Ordering::Acquire));
}

pub fn test_waitms_advances() {
    let before = crate::time::ticks();
    scheduler::waitms(30);
    let after = crate::time::ticks();
    assert!(
        after >= before + crate::time::ms_to_ticks(30),
        "waitms returned early: {} -> {}",
        before,
        after
    );
}

/// A set preempted flag selects a task regardless of its state field: a
/// parked sleeper with no wake tick runs once the flag is raised.
pub fn test_preempted_flag_selects() {
    let ran = Arc::new(AtomicBool::new(false));

    let ran_for_child = ran.clone();
    let child = kthread::spawn("ktest-preempt", move || {
        // Park with no wake tick; only a wake or the preempted flag can
        // bring us back.
        scheduler::set_sleeping();
        scheduler::yield_now();
        ran_for_child.store(true, Ordering::Release);
        scheduler::task_dead();
    });

    // Give the child time to park.
    scheduler::waitms(20);
    assert!(!ran.load(Ordering::Acquire));

    child.preempted.store(true, Ordering::Relaxed);

    let deadline = crate::time::wakeup_tick(2000);
    while !ran.load(Ordering::Acquire) && crate::time::ticks() < deadline {
        scheduler::yield_now();
    }
    assert!(ran.load(Ordering::Acquire));
}
