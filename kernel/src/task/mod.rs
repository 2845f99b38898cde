//! The task model.
//!
//! Kernel threads and user processes share one `Task` abstraction and one
//! scheduler. A task owns its kernel stack and (for user tasks) an address
//! space; everything else it holds is a counted reference into some cache
//! (open files, cwd inode, controlling tty).

pub mod context;
pub mod kthread;
pub mod scheduler;
pub mod signal;
pub mod sys;
pub mod waitqueue;
pub mod workqueue;

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::fs::fd::FdTable;
use crate::fs::inode::Inode;
use crate::memory::address_space::AddressSpace;
use crate::memory::buddy::{self, PageRef, PAL_KERNEL};
use crate::task::signal::SignalState;
use crate::task::workqueue::Work;
use crate::tty::Tty;

pub type Pid = i32;

/// Lifecycle states. `Dead` tasks sit on the scheduler list only until the
/// next scheduling pass frees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskState {
    None = 0,
    /// Sleeping; only an explicit wake or timeout makes it runnable.
    Sleeping = 1,
    /// Sleeping, but a signal also wakes it (`ERESTARTSYS` path).
    IntrSleeping = 2,
    Running = 3,
    Stopped = 4,
    /// Exited; holds only its kernel stack until the parent reaps it.
    Zombie = 5,
    Dead = 6,
}

impl TaskState {
    fn from_raw(raw: u32) -> TaskState {
        match raw {
            1 => TaskState::Sleeping,
            2 => TaskState::IntrSleeping,
            3 => TaskState::Running,
            4 => TaskState::Stopped,
            5 => TaskState::Zombie,
            6 => TaskState::Dead,
            _ => TaskState::None,
        }
    }
}

/// POSIX credentials, the full three-uid/three-gid set.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub ruid: u32,
    pub euid: u32,
    pub suid: u32,
    pub rgid: u32,
    pub egid: u32,
    pub sgid: u32,
    pub groups: Vec<u32>,
}

impl Credentials {
    pub fn root() -> Credentials {
        Credentials {
            ruid: 0,
            euid: 0,
            suid: 0,
            rgid: 0,
            egid: 0,
            sgid: 0,
            groups: Vec::new(),
        }
    }

    /// Whether `gid` is the effective gid or any supplementary group.
    pub fn in_group(&self, gid: u32) -> bool {
        self.egid == gid || self.groups.contains(&gid)
    }
}

/// Order of the kernel stack page run (16 KiB).
const KSTACK_ORDER: usize = 2;

/// A task's kernel stack, an owned page run freed with the task.
pub struct KernelStack {
    pages: PageRef,
}

impl KernelStack {
    pub fn alloc() -> Option<KernelStack> {
        buddy::pzalloc(KSTACK_ORDER, PAL_KERNEL).map(|pages| KernelStack { pages })
    }

    pub fn top(&self) -> x86_64::VirtAddr {
        self.pages.virt() + (crate::memory::PG_SIZE << KSTACK_ORDER) as u64
    }

    pub fn bottom(&self) -> x86_64::VirtAddr {
        self.pages.virt()
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        buddy::pfree(self.pages, KSTACK_ORDER);
    }
}

pub struct Task {
    pub pid: Pid,
    pub name: Mutex<String>,
    /// Kernel thread: no address space, never returns to user mode. The
    /// init bootstrap clears this when it execs into userspace.
    kernel: AtomicBool,

    state: AtomicU32,
    /// Set when the timer involuntarily switched this task away.
    pub preempted: AtomicBool,
    /// Absolute tick at which a sleeping task becomes runnable (0 = none).
    pub wake_up_tick: AtomicU64,

    pub pgid: AtomicI32,
    pub sid: AtomicI32,
    pub parent: Mutex<Option<Weak<Task>>>,
    pub children: Mutex<Vec<Arc<Task>>>,

    pub addr_space: Mutex<Option<AddressSpace>>,
    pub files: FdTable,
    pub cwd: Mutex<Option<Arc<Inode>>>,
    pub umask: AtomicU32,
    pub creds: Mutex<Credentials>,
    pub sig: SignalState,
    pub tty: Mutex<Option<Arc<Tty>>>,

    /// Encoded wait status once this task is a zombie or stopped.
    pub wait_status: AtomicI32,
    /// A stop/continue transition not yet reported through waitpid.
    pub status_changed: AtomicBool,
    pub killed: AtomicBool,

    /// Fixup RIP for the user-copy helpers; consulted by the page-fault
    /// handler when a fault hits kernel code touching user memory.
    pub fault_recovery: AtomicU64,

    /// Saved kernel stack pointer while not running. Only the scheduler
    /// touches it, and only while the task is switched out.
    pub context: context::TaskContext,
    pub kstack: KernelStack,

    /// This task's wake work item, registered on wait queues.
    pub wait: Arc<Work>,
}

impl Task {
    /// Allocate a bare task. Callers fill in the context before it is
    /// handed to the scheduler.
    pub fn new(name: String, kernel: bool) -> Option<Arc<Task>> {
        let kstack = KernelStack::alloc()?;
        let pid = scheduler::next_pid();

        Some(Arc::new_cyclic(|weak: &Weak<Task>| Task {
            pid,
            name: Mutex::new(name),
            kernel: AtomicBool::new(kernel),
            state: AtomicU32::new(TaskState::None as u32),
            preempted: AtomicBool::new(false),
            wake_up_tick: AtomicU64::new(0),
            pgid: AtomicI32::new(pid),
            sid: AtomicI32::new(pid),
            parent: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            addr_space: Mutex::new(None),
            files: FdTable::new(),
            cwd: Mutex::new(None),
            umask: AtomicU32::new(0o022),
            creds: Mutex::new(Credentials::root()),
            sig: SignalState::new(),
            tty: Mutex::new(None),
            wait_status: AtomicI32::new(0),
            status_changed: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            fault_recovery: AtomicU64::new(0),
            context: context::TaskContext::new(),
            kstack,
            wait: Work::new_task_wake("task-wake", weak.clone()),
        }))
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel.load(Ordering::Relaxed)
    }

    /// The init bootstrap becomes a user process at its first exec.
    pub fn mark_user(&self) {
        self.kernel.store(false, Ordering::Relaxed);
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Wake from either sleeping state.
    pub fn wake(&self) {
        let _ = self.state.compare_exchange(
            TaskState::Sleeping as u32,
            TaskState::Running as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.state.compare_exchange(
            TaskState::IntrSleeping as u32,
            TaskState::Running as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Wake only from interruptible sleep (signal delivery).
    pub fn intr_wake(&self) {
        let _ = self.state.compare_exchange(
            TaskState::IntrSleeping as u32,
            TaskState::Running as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn is_zombie(&self) -> bool {
        self.state() == TaskState::Zombie
    }

    /// Session id accessor used all over job control.
    pub fn sid(&self) -> Pid {
        self.sid.load(Ordering::Relaxed)
    }

    pub fn pgid(&self) -> Pid {
        self.pgid.load(Ordering::Relaxed)
    }

    pub fn parent_pid(&self) -> Pid {
        self.parent
            .lock()
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(|p| p.pid)
            .unwrap_or(0)
    }
}

// SAFETY: every mutable field is behind a lock or atomic; `context` is only
// touched by the scheduler while the task is switched out, and the kernel
// stack is exclusively the task's own.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}
