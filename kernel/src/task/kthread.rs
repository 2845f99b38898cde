//! Kernel thread creation.
//!
//! Kernel threads are ordinary tasks without an address space. The entry
//! closure is boxed and smuggled through the bootstrap frame; workqueue
//! workers and the init bring-up thread are the main customers.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

use super::scheduler;
use super::Task;

struct KthreadStart {
    func: Box<dyn FnOnce() + Send + 'static>,
}

extern "C" fn kthread_entry(arg: usize) -> ! {
    // SAFETY: `arg` is the Box::into_raw of the KthreadStart built in
    // `spawn_named`, passed exactly once through the bootstrap frame.
    let start = unsafe { Box::from_raw(arg as *mut KthreadStart) };
    (start.func)();

    // Thread function finished: become dead and let the scheduler reap us.
    scheduler::task_dead();
}

/// Spawn a kernel thread running `func`.
pub fn spawn_named<F>(name: String, func: F) -> Arc<Task>
where
    F: FnOnce() + Send + 'static,
{
    let task = Task::new(name, true).expect("out of memory spawning kernel thread");

    let start = Box::new(KthreadStart {
        func: Box::new(func),
    });
    task.context.init(
        task.kstack.top(),
        kthread_entry,
        Box::into_raw(start) as usize,
    );

    scheduler::add_task(task.clone());
    task
}

pub fn spawn<F>(name: &str, func: F) -> Arc<Task>
where
    F: FnOnce() + Send + 'static,
{
    spawn_named(name.to_string(), func)
}

/// Worker-pool naming convention: `name/1`, `name/2`, ...
pub fn spawn_numbered<F>(name: &str, index: usize, func: F) -> Arc<Task>
where
    F: FnOnce() + Send + 'static,
{
    spawn_named(format!("{}/{}", name, index), func)
}
