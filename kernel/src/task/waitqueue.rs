//! Wait queues.
//!
//! A wait queue is an ordered list of registered work items; waking the
//! queue schedules every one of them. Tasks wait by registering their wake
//! work, setting themselves sleeping, and only then checking the condition,
//! so a wake issued after the condition becomes true is never lost:
//! either the task sees the condition, or it is on the queue (and already
//! marked sleeping) when the wake fires.
//!
//! The `sleep_event!`/`sleep_event_intr!` macros implement the same
//! register-free idiom for conditions woken by a direct `task_wake`.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errno::{Errno, ERESTARTSYS};
use crate::spinlock::Spinlock;
use crate::task::scheduler;
use crate::task::workqueue::Work;

pub struct WaitQueue {
    queue: Spinlock<Vec<Arc<Work>>>,
}

impl WaitQueue {
    pub const fn new() -> WaitQueue {
        WaitQueue {
            queue: Spinlock::new(Vec::new()),
        }
    }

    /// Register a work item to be scheduled on the next wake. Registering an
    /// already-registered item is a no-op; a wake drops the registration, so
    /// loops must re-register each iteration.
    pub fn register(&self, work: &Arc<Work>) {
        let mut queue = self.queue.lock();
        if !queue.iter().any(|w| Arc::ptr_eq(w, work)) {
            queue.push(work.clone());
        }
    }

    pub fn unregister(&self, work: &Arc<Work>) {
        self.queue.lock().retain(|w| !Arc::ptr_eq(w, work));
    }

    /// Schedule every registered work item. Returns how many fired.
    pub fn wake(&self) -> usize {
        let woken: Vec<Arc<Work>> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        for work in &woken {
            crate::task::workqueue::work_schedule(work);
        }
        woken.len()
    }

    pub fn waiting(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Sleep until `cond` returns true. The condition runs with the task
    /// already registered and marked sleeping.
    pub fn wait_event<F: FnMut() -> bool>(&self, mut cond: F) {
        let current = scheduler::current();
        loop {
            self.register(&current.wait);
            scheduler::set_sleeping();

            if cond() {
                break;
            }

            scheduler::yield_now();
        }
        self.unregister(&current.wait);
        scheduler::set_running();
    }

    /// Interruptible variant: returns `ERESTARTSYS` if an unblocked signal
    /// is pending when the task would otherwise sleep.
    pub fn wait_event_intr<F: FnMut() -> bool>(&self, mut cond: F) -> Result<(), Errno> {
        let current = scheduler::current();
        let mut ret = Ok(());
        loop {
            let sig_pending = current.sig.has_pending();

            self.register(&current.wait);
            scheduler::set_intr_sleeping();

            if cond() {
                break;
            }

            if sig_pending {
                ret = Err(ERESTARTSYS);
                break;
            }

            scheduler::yield_now();
        }
        self.unregister(&current.wait);
        scheduler::set_running();
        ret
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep until `$cond` is true, woken by a direct `task_wake` on this task.
///
/// The task state is set to sleeping before the condition is evaluated;
/// a wake between the check and the yield flips the state back to running,
/// so the yield does not sleep. This ordering must be preserved.
#[macro_export]
macro_rules! sleep_event {
    ($cond:expr) => {{
        loop {
            $crate::task::scheduler::set_sleeping();
            if $cond {
                break;
            }
            $crate::task::scheduler::yield_now();
        }
        $crate::task::scheduler::set_running();
    }};
}

/// Interruptible `sleep_event!`; evaluates to `Result<(), Errno>` with
/// `Err(ERESTARTSYS)` when a pending unblocked signal cut the sleep short.
#[macro_export]
macro_rules! sleep_event_intr {
    ($cond:expr) => {{
        let mut __ret: Result<(), $crate::errno::Errno> = Ok(());
        loop {
            let __sig_pending = $crate::task::scheduler::current().sig.has_pending();
            $crate::task::scheduler::set_intr_sleeping();
            if $cond {
                break;
            }
            if __sig_pending {
                __ret = Err($crate::errno::ERESTARTSYS);
                break;
            }
            $crate::task::scheduler::yield_now();
        }
        $crate::task::scheduler::set_running();
        __ret
    }};
}
