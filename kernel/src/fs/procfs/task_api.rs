//! /proc/task_api: a binary stream of `TaskApiInfo` records, one per task,
//! gated by the reader's iteration cursor, plus ioctls for per-task memory
//! and file-table detail.

use alloc::sync::Arc;
use spin::Mutex;

use super::{ProcEntry, ProcKind};
use crate::errno::{KResult, EINVAL, ESRCH};
use crate::fs::file::{File, FileOps, FilePrivate};
use crate::memory::user::{copy_from_user, copy_to_user};

pub const TASK_API_NAME_LEN: usize = 32;

/// One record of the binary stream.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TaskApiInfo {
    pub pid: i32,
    pub ppid: i32,
    pub pgid: i32,
    pub sid: i32,
    pub state: u32,
    pub is_kernel: u32,
    pub name: [u8; TASK_API_NAME_LEN],
}

/// ioctl: fetch memory detail for the pid in the passed struct.
pub const TASK_API_MEM_INFO: u32 = 0x7401;
/// ioctl: fetch file-table detail for the pid in the passed struct.
pub const TASK_API_FILE_INFO: u32 = 0x7402;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TaskApiMemInfo {
    pub pid: i32,
    pub region_count: u32,
    pub resident_bytes: u64,
    pub brk: u64,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TaskApiFileInfo {
    pub pid: i32,
    pub open_files: u32,
    pub close_on_exec: u32,
}

fn fill_info(task: &Arc<crate::task::Task>) -> TaskApiInfo {
    let mut name = [0u8; TASK_API_NAME_LEN];
    let task_name = task.name.lock();
    let bytes = task_name.as_bytes();
    let n = bytes.len().min(TASK_API_NAME_LEN - 1);
    name[..n].copy_from_slice(&bytes[..n]);

    TaskApiInfo {
        pid: task.pid,
        ppid: task.parent_pid(),
        pgid: task.pgid(),
        sid: task.sid(),
        state: task.state() as u32,
        is_kernel: task.is_kernel() as u32,
        name,
    }
}

struct TaskApiFileOps;
static TASK_API_FILE_OPS: TaskApiFileOps = TaskApiFileOps;

pub static TASK_API_ENTRY: ProcEntry = ProcEntry {
    name: "task_api",
    kind: ProcKind::File(&TASK_API_FILE_OPS),
};

pub fn private_for(entry: &'static ProcEntry) -> FilePrivate {
    if core::ptr::eq(entry, &TASK_API_ENTRY) {
        FilePrivate::TaskApi(Mutex::new(0))
    } else {
        FilePrivate::None
    }
}

fn cursor_of(file: &File) -> KResult<&Mutex<usize>> {
    match &file.private {
        FilePrivate::TaskApi(cursor) => Ok(cursor),
        _ => Err(EINVAL),
    }
}

impl FileOps for TaskApiFileOps {
    fn read(&self, file: &File, buf: &mut [u8]) -> KResult<usize> {
        let record_size = core::mem::size_of::<TaskApiInfo>();
        if buf.len() < record_size {
            return Err(EINVAL);
        }

        let mut cursor = cursor_of(file)?.lock();
        let tasks = crate::task::scheduler::task_list_snapshot();

        let task = match tasks.get(*cursor) {
            Some(task) => task,
            None => return Ok(0),
        };
        *cursor += 1;

        let info = fill_info(task);
        // SAFETY: TaskApiInfo is repr(C) plain data; buf has room.
        let raw = unsafe {
            core::slice::from_raw_parts(&info as *const TaskApiInfo as *const u8, record_size)
        };
        buf[..record_size].copy_from_slice(raw);
        Ok(record_size)
    }

    fn ioctl(&self, _file: &File, cmd: u32, arg: u64) -> KResult<i64> {
        match cmd {
            TASK_API_MEM_INFO => {
                let mut info: TaskApiMemInfo = copy_from_user(arg)?;
                let task =
                    crate::task::scheduler::task_get(info.pid).ok_or(ESRCH)?;

                let space = task.addr_space.lock();
                match space.as_ref() {
                    Some(space) => {
                        info.region_count = space.regions().len() as u32;
                        info.resident_bytes = space
                            .regions()
                            .iter()
                            .map(|r| r.len())
                            .sum();
                        info.brk = space.brk.as_u64();
                    }
                    None => {
                        info.region_count = 0;
                        info.resident_bytes = 0;
                        info.brk = 0;
                    }
                }
                copy_to_user(arg, &info)?;
                Ok(0)
            }
            TASK_API_FILE_INFO => {
                let mut info: TaskApiFileInfo = copy_from_user(arg)?;
                let task =
                    crate::task::scheduler::task_get(info.pid).ok_or(ESRCH)?;
                info.open_files = task.files.open_count() as u32;
                info.close_on_exec = 0;
                for fd in 0..crate::fs::fd::NOFILE {
                    if task.files.is_cloexec(fd) {
                        info.close_on_exec |= 1 << fd;
                    }
                }
                copy_to_user(arg, &info)?;
                Ok(0)
            }
            _ => Err(crate::errno::ENOTTY),
        }
    }
}
