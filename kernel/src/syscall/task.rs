//! Process-management syscall handlers.

use alloc::string::String;
use alloc::vec::Vec;

use crate::errno::{KResult, EINVAL, EPERM, ESRCH};
use crate::interrupts::TrapFrame;
use crate::memory::user::{
    copy_from_user, copy_string_from_user, copy_to_user,
};
use crate::task::scheduler;
use crate::task::sys;
use crate::task::Pid;

const PATH_MAX: usize = 4096;
const ARG_MAX_COUNT: usize = 256;

// reboot(2) magic values.
pub const PROTURA_REBOOT_MAGIC1: u64 = 0xABCDBEEF;
pub const PROTURA_REBOOT_MAGIC2: u64 = 152182804;
pub const PROTURA_REBOOT_RESTART: u64 = 0x12341234;

pub fn sys_exit(frame: &mut TrapFrame) -> KResult<i64> {
    sys::sys_exit(frame.rdi as i32)
}

pub fn sys_fork(frame: &mut TrapFrame) -> KResult<i64> {
    sys::sys_fork(frame).map(|pid| pid as i64)
}

pub fn sys_getpid(_frame: &mut TrapFrame) -> KResult<i64> {
    Ok(scheduler::current().pid as i64)
}

pub fn sys_getppid(_frame: &mut TrapFrame) -> KResult<i64> {
    Ok(scheduler::current().parent_pid() as i64)
}

/// wait(status_ptr)
pub fn sys_wait(frame: &mut TrapFrame) -> KResult<i64> {
    let status_ptr = frame.rdi;
    let (pid, status) = sys::sys_wait()?;
    if status_ptr != 0 {
        copy_to_user(status_ptr, &status)?;
    }
    Ok(pid as i64)
}

/// waitpid(pid, status_ptr, options)
pub fn sys_waitpid(frame: &mut TrapFrame) -> KResult<i64> {
    let pid = frame.rdi as i64 as Pid;
    let status_ptr = frame.rsi;
    let options = frame.rdx as u32;

    let (pid, status) = sys::sys_waitpid(pid, options)?;
    if status_ptr != 0 && pid != 0 {
        copy_to_user(status_ptr, &status)?;
    }
    Ok(pid as i64)
}

/// Read a NULL-terminated array of user string pointers.
fn copy_user_string_array(array_ptr: u64) -> KResult<Vec<String>> {
    let mut strings = Vec::new();
    if array_ptr == 0 {
        return Ok(strings);
    }

    for idx in 0..ARG_MAX_COUNT {
        let slot = array_ptr + (idx * 8) as u64;
        let ptr: u64 = copy_from_user(slot)?;
        if ptr == 0 {
            return Ok(strings);
        }
        strings.push(copy_string_from_user(ptr, PATH_MAX)?);
    }
    Err(crate::errno::E2BIG)
}

/// execve(path, argv, envp)
pub fn sys_execve(frame: &mut TrapFrame) -> KResult<i64> {
    let path = copy_string_from_user(frame.rdi, PATH_MAX)?;
    let argv = copy_user_string_array(frame.rsi)?;
    let envp = copy_user_string_array(frame.rdx)?;

    let inode = crate::fs::namei::namei(&path)?;
    crate::fs::access::may_exec(&inode)?;
    let file = crate::fs::file::vfs_open(inode, crate::fs::file::O_RDONLY)?;

    let name = path
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(&path);

    let params = crate::exec::ParamStrings::new(argv, envp)?;
    crate::exec::exec_image(file, String::from(name), params, frame)?;

    // The frame now enters the new image; rax of the frame is already 0.
    Ok(0)
}

/// kill(pid, sig)
pub fn sys_kill(frame: &mut TrapFrame) -> KResult<i64> {
    let pid = frame.rdi as i64 as Pid;
    let sig = frame.rsi as u32;

    if sig == 0 {
        // Existence probe.
        let target = if pid > 0 {
            scheduler::task_exists(pid)
        } else if pid < -1 {
            !scheduler::tasks_in_pgroup(-pid).is_empty()
        } else {
            true
        };
        return if target { Ok(0) } else { Err(ESRCH) };
    }
    if !crate::task::signal::valid_signal(sig) {
        return Err(EINVAL);
    }

    if pid > 0 {
        scheduler::send_signal(pid, sig, false)?;
    } else if pid == 0 {
        let pgid = scheduler::current().pgid();
        scheduler::send_signal_pgroup(pgid, sig, false)?;
    } else if pid == -1 {
        // Everyone we may signal except init and ourselves.
        let me = scheduler::current();
        let mut hit = false;
        for task in scheduler::task_list_snapshot() {
            if task.pid <= 1 || task.pid == me.pid || task.is_kernel() {
                continue;
            }
            if scheduler::send_signal(task.pid, sig, false).is_ok() {
                hit = true;
            }
        }
        if !hit {
            return Err(EPERM);
        }
    } else {
        scheduler::send_signal_pgroup(-pid, sig, false)?;
    }
    Ok(0)
}

pub fn sys_yield(_frame: &mut TrapFrame) -> KResult<i64> {
    scheduler::yield_now();
    Ok(0)
}

pub fn sys_sleep(frame: &mut TrapFrame) -> KResult<i64> {
    Ok(sys::sys_sleep(frame.rdi as u32) as i64)
}

pub fn sys_usleep(frame: &mut TrapFrame) -> KResult<i64> {
    sys::sys_usleep(frame.rdi)?;
    Ok(0)
}

pub fn sys_pause(_frame: &mut TrapFrame) -> KResult<i64> {
    sys::sys_pause()?;
    Ok(0)
}

pub fn sys_setsid(_frame: &mut TrapFrame) -> KResult<i64> {
    sys::sys_setsid().map(|pid| pid as i64)
}

pub fn sys_getsid(frame: &mut TrapFrame) -> KResult<i64> {
    sys::sys_getsid(frame.rdi as i64 as Pid).map(|pid| pid as i64)
}

pub fn sys_setpgid(frame: &mut TrapFrame) -> KResult<i64> {
    sys::sys_setpgid(frame.rdi as i64 as Pid, frame.rsi as i64 as Pid)?;
    Ok(0)
}

pub fn sys_getpgrp(_frame: &mut TrapFrame) -> KResult<i64> {
    Ok(sys::sys_getpgrp() as i64)
}

pub fn sys_setuid(frame: &mut TrapFrame) -> KResult<i64> {
    sys::sys_setuid(frame.rdi as u32)?;
    Ok(0)
}

pub fn sys_setreuid(frame: &mut TrapFrame) -> KResult<i64> {
    sys::sys_setreuid(frame.rdi as i64 as i32, frame.rsi as i64 as i32)?;
    Ok(0)
}

pub fn sys_setresuid(frame: &mut TrapFrame) -> KResult<i64> {
    sys::sys_setresuid(
        frame.rdi as i64 as i32,
        frame.rsi as i64 as i32,
        frame.rdx as i64 as i32,
    )?;
    Ok(0)
}

pub fn sys_getuid(_frame: &mut TrapFrame) -> KResult<i64> {
    Ok(scheduler::current().creds.lock().ruid as i64)
}

pub fn sys_geteuid(_frame: &mut TrapFrame) -> KResult<i64> {
    Ok(scheduler::current().creds.lock().euid as i64)
}

pub fn sys_setgid(frame: &mut TrapFrame) -> KResult<i64> {
    sys::sys_setgid(frame.rdi as u32)?;
    Ok(0)
}

pub fn sys_setregid(frame: &mut TrapFrame) -> KResult<i64> {
    sys::sys_setregid(frame.rdi as i64 as i32, frame.rsi as i64 as i32)?;
    Ok(0)
}

pub fn sys_setresgid(frame: &mut TrapFrame) -> KResult<i64> {
    sys::sys_setresgid(
        frame.rdi as i64 as i32,
        frame.rsi as i64 as i32,
        frame.rdx as i64 as i32,
    )?;
    Ok(0)
}

pub fn sys_getgid(_frame: &mut TrapFrame) -> KResult<i64> {
    Ok(scheduler::current().creds.lock().rgid as i64)
}

pub fn sys_getegid(_frame: &mut TrapFrame) -> KResult<i64> {
    Ok(scheduler::current().creds.lock().egid as i64)
}

/// setgroups(count, groups_ptr)
pub fn sys_setgroups(frame: &mut TrapFrame) -> KResult<i64> {
    let count = frame.rdi as usize;
    let ptr = frame.rsi;
    if count > 32 {
        return Err(EINVAL);
    }

    let mut groups = Vec::with_capacity(count);
    for idx in 0..count {
        let gid: u32 = copy_from_user(ptr + (idx * 4) as u64)?;
        groups.push(gid);
    }
    sys::sys_setgroups(groups)?;
    Ok(0)
}

/// getgroups(count, groups_ptr) -> number of groups
pub fn sys_getgroups(frame: &mut TrapFrame) -> KResult<i64> {
    let count = frame.rdi as usize;
    let ptr = frame.rsi;

    let groups = sys::sys_getgroups();
    if count == 0 {
        return Ok(groups.len() as i64);
    }
    if count < groups.len() {
        return Err(EINVAL);
    }
    for (idx, gid) in groups.iter().enumerate() {
        copy_to_user(ptr + (idx * 4) as u64, gid)?;
    }
    Ok(groups.len() as i64)
}

/// reboot(magic1, magic2, cmd)
pub fn sys_reboot(frame: &mut TrapFrame) -> KResult<i64> {
    if frame.rdi != PROTURA_REBOOT_MAGIC1 || frame.rsi != PROTURA_REBOOT_MAGIC2 {
        return Err(EINVAL);
    }
    if scheduler::current().creds.lock().euid != 0 {
        return Err(EPERM);
    }

    match frame.rdx {
        PROTURA_REBOOT_RESTART => {
            log::warn!("reboot requested; syncing and resetting");
            let _ = crate::fs::sync::vfs_sync_all(true);
            unsafe {
                // Keyboard-controller CPU reset line.
                let mut port = x86_64::instructions::port::Port::<u8>::new(0x64);
                port.write(0xFE);
            }
            // The reset pulse takes effect asynchronously.
            loop {
                x86_64::instructions::hlt();
            }
        }
        _ => Err(EINVAL),
    }
}
