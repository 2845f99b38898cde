//! Workqueue semantics: FIFO order, the SCHEDULED re-enqueue contract,
//! and delayed work.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::task::scheduler;
use crate::task::workqueue::{kwork, DelayWork, Work};

fn wait_until(cond: impl Fn() -> bool, timeout_ms: u64) -> bool {
    let deadline = crate::time::wakeup_tick(timeout_ms);
    while crate::time::ticks() < deadline {
        if cond() {
            return true;
        }
        scheduler::yield_now();
    }
    cond()
}

/// Items dequeue in enqueue order.
pub fn test_fifo_order() {
    static STAMP: AtomicU32 = AtomicU32::new(0);
    STAMP.store(0, Ordering::SeqCst);

    let order: Arc<[AtomicU32; 3]> = Arc::new([
        AtomicU32::new(u32::MAX),
        AtomicU32::new(u32::MAX),
        AtomicU32::new(u32::MAX),
    ]);

    for idx in 0..3 {
        let order = order.clone();
        let work = Work::new_kwork("ktest-fifo", move || {
            let stamp = STAMP.fetch_add(1, Ordering::SeqCst);
            order[idx].store(stamp, Ordering::SeqCst);
        });
        work.set_oneshot();
        kwork().add_work(work);
    }

    assert!(wait_until(
        || order.iter().all(|o| o.load(Ordering::SeqCst) != u32::MAX),
        2000
    ));
    let stamps: alloc::vec::Vec<u32> = order.iter().map(|o| o.load(Ordering::SeqCst)).collect();
    assert!(stamps[0] < stamps[1] && stamps[1] < stamps[2], "out of order: {:?}", stamps);
}

/// Scheduling a work item while it runs re-enqueues it exactly once.
pub fn test_reschedule_while_running() {
    let runs = Arc::new(AtomicUsize::new(0));

    let runs_for_work = runs.clone();
    let work = Work::new_kwork("ktest-resched", move || {
        runs_for_work.fetch_add(1, Ordering::SeqCst);
        // Hold the worker long enough for the second schedule to land
        // while we are on the running list.
        scheduler::waitms(30);
    });

    kwork().add_work(work.clone());
    scheduler::waitms(10);
    // The work is mid-run now; this must not be lost.
    kwork().add_work(work.clone());

    assert!(wait_until(|| runs.load(Ordering::SeqCst) >= 2, 2000));
}

pub fn test_delay_work_fires() {
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_for_work = fired.clone();

    let work = DelayWork::new("ktest-delay", move || {
        fired_for_work.fetch_add(1, Ordering::SeqCst);
    });

    work.schedule_ms(40);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(wait_until(|| fired.load(Ordering::SeqCst) == 1, 2000));
}
