//! Process lifecycle: exit/wait reaping and brk/sbrk arithmetic.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::memory::address_space::AddressSpace;
use crate::task::scheduler;
use crate::task::sys::{
    sys_waitpid, wexit_make, wexitstatus, wifexited, WNOHANG,
};
use crate::task::Task;

extern "C" fn exiting_child_entry(code: usize) -> ! {
    crate::task::sys::task_exit(wexit_make(code as i32))
}

/// A child that exits with 42 is reaped by waitpid with a status that
/// decodes back to 42.
pub fn test_exit_and_waitpid() {
    let parent = scheduler::current();

    // Hand-built process child (no user image needed to exercise the
    // zombie/reap machinery).
    let child = Task::new(String::from("ktest-child"), false).unwrap();
    child
        .context
        .init(child.kstack.top(), exiting_child_entry, 42);
    *child.parent.lock() = Some(Arc::downgrade(&parent));
    child.pgid.store(parent.pgid(), Ordering::Relaxed);
    child.sid.store(parent.sid(), Ordering::Relaxed);
    parent.children.lock().push(child.clone());

    let child_pid = child.pid;
    scheduler::add_task(child.clone());
    drop(child);

    let (pid, status) = sys_waitpid(child_pid, 0).unwrap();
    assert_eq!(pid, child_pid);
    assert!(wifexited(status));
    assert_eq!(wexitstatus(status), 42);

    // Reaped: a second wait has nothing to find.
    assert!(sys_waitpid(child_pid, WNOHANG).is_err());
}

/// setsid: a non-group-leader becomes leader of a fresh session with its
/// own pid and no controlling tty.
pub fn test_setsid_new_session() {
    use core::sync::atomic::AtomicI32;

    let parent = scheduler::current();
    let result = Arc::new(AtomicI32::new(0));

    let result_for_child = result.clone();
    let parent_pgid = parent.pgid();
    let child = crate::task::kthread::spawn("ktest-setsid", move || {
        let me = scheduler::current();
        // Leave the leader position our own spawn gave us.
        me.pgid.store(parent_pgid, Ordering::Relaxed);
        *me.tty.lock() = None;

        let sid = crate::task::sys::sys_setsid().unwrap();
        assert_eq!(sid, me.pid);
        assert_eq!(crate::task::sys::sys_getsid(0).unwrap(), me.pid);
        assert_eq!(me.pgid(), me.pid);
        assert!(me.tty.lock().is_none());

        result_for_child.store(sid, Ordering::Release);
        scheduler::task_dead();
    });

    let child_pid = child.pid;
    drop(child);

    let deadline = crate::time::wakeup_tick(2000);
    while result.load(Ordering::Acquire) == 0 && crate::time::ticks() < deadline {
        scheduler::yield_now();
    }
    assert_eq!(result.load(Ordering::Acquire), child_pid);
}

/// sbrk arithmetic: sbrk(0) observes, sbrk(n) returns the old break, and
/// the new break is exactly n higher.
pub fn test_sbrk_semantics() {
    let mut space = AddressSpace::new().unwrap();
    space
        .set_brk(x86_64::VirtAddr::new(0x4000_0000))
        .unwrap();

    let a = space.sbrk(0).unwrap();
    let b = space.sbrk(4096).unwrap();
    let c = space.sbrk(0).unwrap();

    assert_eq!(a, b);
    assert_eq!(c, a + 4096u64);

    // The bss region grew to cover the new break.
    let region = space
        .region(crate::memory::address_space::RegionKind::Bss)
        .unwrap();
    assert!(region.end >= c);
}
