//! Deferred work and kernel worker threads.
//!
//! A `Work` item is tagged with a dispatch kind: run the callback inline,
//! wake a task, or enqueue on a workqueue (the default kernel queue or a
//! named one). Wait queues schedule these on wake, so "waking" a waiter can
//! mean anything from a direct wakeup to kicking a worker thread.
//!
//! A particular `Work` only ever runs on one worker at a time. Scheduling a
//! work item that is currently running sets the `SCHEDULED` flag; when the
//! run finishes the worker re-enqueues it at the tail, so that wake-up is
//! not lost. `ONESHOT` work is removed entirely at dequeue instead of being
//! tracked on the running list.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::spinlock::Spinlock;
use crate::task::scheduler;
use crate::task::Task;

/// Re-enqueue when the current run completes.
const WORK_SCHEDULED: u32 = 1 << 0;
/// Drop from the queue entirely at dequeue.
const WORK_ONESHOT: u32 = 1 << 1;

type WorkFn = Box<dyn Fn() + Send + Sync>;

/// What `schedule()` does with this work item.
pub enum WorkKind {
    /// Nothing; placeholder for embedded, not-yet-wired work.
    None,
    /// Run the callback inline on the scheduling thread.
    Callback,
    /// Wake the attached task.
    WakeTask(Weak<Task>),
    /// Enqueue on the default kernel workqueue.
    Kwork,
    /// Enqueue on a specific workqueue.
    Queue(&'static Workqueue),
}

pub struct Work {
    kind: WorkKind,
    callback: Option<WorkFn>,
    flags: AtomicU32,
    name: &'static str,
}

impl Work {
    pub fn new_callback<F>(name: &'static str, func: F) -> Arc<Work>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Work {
            kind: WorkKind::Callback,
            callback: Some(Box::new(func)),
            flags: AtomicU32::new(0),
            name,
        })
    }

    /// Work that wakes `task` when scheduled. This is the node every task
    /// registers on wait queues; it holds a weak reference so a queue never
    /// keeps a dead task alive.
    pub fn new_task_wake(name: &'static str, task: Weak<Task>) -> Arc<Work> {
        Arc::new(Work {
            kind: WorkKind::WakeTask(task),
            callback: None,
            flags: AtomicU32::new(0),
            name,
        })
    }

    /// Work destined for the default kernel workqueue.
    pub fn new_kwork<F>(name: &'static str, func: F) -> Arc<Work>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Work {
            kind: WorkKind::Kwork,
            callback: Some(Box::new(func)),
            flags: AtomicU32::new(0),
            name,
        })
    }

    /// Work destined for a specific workqueue.
    pub fn new_on_queue<F>(name: &'static str, queue: &'static Workqueue, func: F) -> Arc<Work>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Work {
            kind: WorkKind::Queue(queue),
            callback: Some(Box::new(func)),
            flags: AtomicU32::new(0),
            name,
        })
    }

    pub fn set_oneshot(&self) {
        self.flags.fetch_or(WORK_ONESHOT, Ordering::Relaxed);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn run(&self) {
        if let Some(cb) = &self.callback {
            cb();
        }
    }
}

struct WorkqueueInner {
    work_list: VecDeque<Arc<Work>>,
    /// Non-oneshot work currently executing on some worker.
    running: Vec<Arc<Work>>,
    threads: Vec<Arc<Task>>,
    wake_next: usize,
}

pub struct Workqueue {
    name: &'static str,
    inner: Spinlock<WorkqueueInner>,
}

impl Workqueue {
    pub const fn new(name: &'static str) -> Workqueue {
        Workqueue {
            name,
            inner: Spinlock::new(WorkqueueInner {
                work_list: VecDeque::new(),
                running: Vec::new(),
                threads: Vec::new(),
                wake_next: 0,
            }),
        }
    }

    /// Spawn `count` worker threads consuming this queue.
    pub fn start(&'static self, count: usize) {
        let mut inner = self.inner.lock();
        for i in 0..count {
            let task = super::kthread::spawn_numbered(self.name, i + 1, move || {
                worker_thread(self);
            });
            inner.threads.push(task);
        }
    }

    /// Enqueue `work`, or arrange a re-run if it is already queued/running.
    pub fn add_work(&self, work: Arc<Work>) {
        let mut inner = self.inner.lock();
        work.flags.fetch_or(WORK_SCHEDULED, Ordering::Relaxed);

        let queued = inner
            .work_list
            .iter()
            .chain(inner.running.iter())
            .any(|w| Arc::ptr_eq(w, &work));
        if !queued {
            inner.work_list.push_back(work);
        }

        // Round-robin the wakeup over the workers.
        if !inner.threads.is_empty() {
            let idx = inner.wake_next % inner.threads.len();
            inner.wake_next = inner.wake_next.wrapping_add(1);
            let thread = inner.threads[idx].clone();
            drop(inner);
            scheduler::task_wake(&thread);
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().work_list.len()
    }
}

fn worker_thread(queue: &'static Workqueue) -> ! {
    let mut work: Option<Arc<Work>> = None;

    loop {
        // Finish bookkeeping for the previous item, then take the next one,
        // sleeping while the list is empty. State is set to sleeping before
        // the list check so an add_work between check and yield is not lost.
        let next = loop {
            scheduler::set_sleeping();

            let mut inner = queue.inner.lock();
            if let Some(prev) = work.take() {
                inner.running.retain(|w| !Arc::ptr_eq(w, &prev));
                if prev.flags.load(Ordering::Relaxed) & WORK_SCHEDULED != 0 {
                    inner.work_list.push_back(prev);
                }
            }

            if let Some(next) = inner.work_list.pop_front() {
                let oneshot = next.flags.load(Ordering::Relaxed) & WORK_ONESHOT != 0;
                if !oneshot {
                    inner.running.push(next.clone());
                }
                // Clearing here is fine; we are about to run it anyway.
                next.flags.fetch_and(!WORK_SCHEDULED, Ordering::Relaxed);
                drop(inner);
                scheduler::set_running();
                break (next, oneshot);
            }

            drop(inner);
            scheduler::yield_now();
        };

        let (item, oneshot) = next;
        item.run();

        if !oneshot {
            work = Some(item);
        }
    }
}

// ---------------------------------------------------------------------------
// Default kernel workqueue
// ---------------------------------------------------------------------------

static KWORK: Workqueue = Workqueue::new("kwork");

const KWORK_THREADS: usize = 4;

pub fn kwork() -> &'static Workqueue {
    &KWORK
}

/// Start the default kernel workqueue workers. Must run after the scheduler
/// is accepting tasks.
pub fn kwork_init() {
    KWORK.start(KWORK_THREADS);
    log::info!("kwork started with {} threads", KWORK_THREADS);
}

/// Dispatch a work item according to its kind. Safe from interrupt context
/// for the queued kinds.
pub fn work_schedule(work: &Arc<Work>) {
    match &work.kind {
        WorkKind::None => {}
        WorkKind::Callback => work.run(),
        WorkKind::WakeTask(weak) => {
            if let Some(task) = weak.upgrade() {
                scheduler::task_wake(&task);
            }
        }
        WorkKind::Kwork => kwork().add_work(work.clone()),
        WorkKind::Queue(queue) => queue.add_work(work.clone()),
    }
}

// ---------------------------------------------------------------------------
// Delayed work
// ---------------------------------------------------------------------------

/// A work item that fires on the default workqueue after a timeout.
pub struct DelayWork {
    pub work: Arc<Work>,
    timer: Arc<crate::time::timer::Timer>,
}

impl DelayWork {
    pub fn new<F>(name: &'static str, func: F) -> DelayWork
    where
        F: Fn() + Send + Sync + 'static,
    {
        let work = Work::new_kwork(name, func);
        let timer_work = work.clone();
        let timer = crate::time::timer::Timer::new(name, move || {
            kwork().add_work(timer_work.clone());
        });
        DelayWork { work, timer }
    }

    /// Arm the timer; on expiry the work lands on the kernel workqueue.
    pub fn schedule_ms(&self, delay_ms: u64) {
        crate::time::timer::timer_add(&self.timer, delay_ms);
    }

    /// Disarm. Idempotent; work already queued still runs.
    pub fn unschedule(&self) {
        crate::time::timer::timer_del(&self.timer);
    }
}
