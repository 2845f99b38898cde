//! poll(2) support.
//!
//! Each file's `poll` op registers the caller's poll table on the wait
//! queues that may become ready and reports the currently-ready events.
//! The table's wake work sets a private event flag and wakes the poller;
//! keeping the flag separate from the normal task wake means intermediate
//! sleeps (a lock taken inside some other path) cannot consume the
//! readiness notification.
//!
//! The table is unregistered from every queue before `sys_poll` returns on
//! any path, including error and signal.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use super::file::File;
use crate::errno::{KResult, EINTR};
use crate::task::waitqueue::WaitQueue;
use crate::task::workqueue::Work;
use crate::task::TaskState;

pub const POLLIN: u16 = 0x0001;
pub const POLLOUT: u16 = 0x0004;
pub const POLLERR: u16 = 0x0008;
pub const POLLHUP: u16 = 0x0010;
pub const POLLNVAL: u16 = 0x0020;

/// Userspace pollfd record.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PollFd {
    pub fd: i32,
    pub events: i16,
    pub revents: i16,
}

pub struct PollTable {
    /// Queues this table is registered on. The raw pointers stay valid
    /// because the poll loop holds the `File` references owning them until
    /// after `unregister_all`.
    queues: Vec<*const WaitQueue>,
    wake_work: Arc<Work>,
    event: Arc<AtomicBool>,
}

impl PollTable {
    pub fn new() -> PollTable {
        let event = Arc::new(AtomicBool::new(false));
        let event_for_wake = event.clone();
        let task = Arc::downgrade(&crate::task::scheduler::current());

        // The wake path sets the event flag first, then wakes the poller;
        // the poll loop checks the flag, not its own task state, so a wake
        // consumed by an unrelated sleep is still observed.
        let wake_work = Work::new_callback("poll-wake", move || {
            event_for_wake.store(true, Ordering::Release);
            if let Some(task) = task.upgrade() {
                task.intr_wake();
            }
        });

        PollTable {
            queues: Vec::new(),
            wake_work,
            event,
        }
    }

    /// Called from file `poll` ops for every queue that may signal
    /// readiness.
    pub fn add_queue(&mut self, queue: &WaitQueue) {
        queue.register(&self.wake_work);
        self.queues.push(queue as *const WaitQueue);
    }

    pub fn event_fired(&self) -> bool {
        self.event.swap(false, Ordering::AcqRel)
    }

    /// Drop every registration. Must run before the owning files are
    /// released.
    pub fn unregister_all(&mut self) {
        for queue in self.queues.drain(..) {
            // SAFETY: the poll loop keeps the files (and thus the queues)
            // alive until this completes; see sys_poll below.
            unsafe { (*queue).unregister(&self.wake_work) };
        }
    }
}

impl Drop for PollTable {
    fn drop(&mut self) {
        self.unregister_all();
    }
}

/// Poll result for one file: consult its `poll` op and mask with the
/// requested events (plus the always-reported error states).
fn poll_one(file: &Arc<File>, table: &mut PollTable, events: u16) -> u16 {
    let ready = file.ops.poll(file, table, events);
    ready & (events | POLLERR | POLLHUP | POLLNVAL)
}

/// The core poll loop over resolved files. `timeout_ms` of `None` blocks
/// indefinitely; `Some(0)` is a pure non-blocking check.
pub fn vfs_poll(
    entries: &mut [(Option<Arc<File>>, u16, u16)], // (file, events, revents out)
    timeout_ms: Option<u64>,
) -> KResult<usize> {
    let task = crate::task::scheduler::current();
    let deadline = timeout_ms.map(crate::time::wakeup_tick);

    let mut table = PollTable::new();

    let result = loop {
        // (Re-)register and evaluate every file. Registration is
        // idempotent per iteration because wakes unregister the work.
        let mut ready = 0;
        for (file, events, revents) in entries.iter_mut() {
            match file {
                Some(file) => {
                    *revents = poll_one(file, &mut table, *events);
                    if *revents != 0 {
                        ready += 1;
                    }
                }
                // Zero requested events marks an ignored slot (negative
                // fd); anything else without a file is a bad descriptor.
                None if *events == 0 => {
                    *revents = 0;
                }
                None => {
                    *revents = POLLNVAL;
                    ready += 1;
                }
            }
        }

        if ready > 0 {
            break Ok(ready);
        }
        if let Some(deadline) = deadline {
            if crate::time::ticks() >= deadline {
                break Ok(0);
            }
            task.wake_up_tick.store(deadline, Ordering::Relaxed);
        }

        // Sleep until the table's event, the timeout, or a signal.
        let sig_pending = task.sig.has_pending();
        task.set_state(TaskState::IntrSleeping);

        if self_event_or_timeout(&table, deadline) {
            task.set_state(TaskState::Running);
            continue;
        }
        if sig_pending {
            task.set_state(TaskState::Running);
            break Err(EINTR);
        }

        crate::task::scheduler::yield_now();
        task.set_state(TaskState::Running);
    };

    task.wake_up_tick.store(0, Ordering::Relaxed);
    // Every exit path unregisters before the files drop.
    table.unregister_all();
    result
}

fn self_event_or_timeout(table: &PollTable, deadline: Option<u64>) -> bool {
    if table.event_fired() {
        return true;
    }
    matches!(deadline, Some(d) if crate::time::ticks() >= d)
}
