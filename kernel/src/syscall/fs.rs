//! Filesystem syscall handlers.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errno::{KResult, EEXIST, EINVAL, EISDIR, ENOENT, ENOTDIR, ENOTTY, ENXIO, EPERM};
use crate::fs::access::{apply_umask, may_read, may_write};
use crate::fs::fd::NOFILE;
use crate::fs::file::{vfs_open, File, O_ACCMODE, O_CLOEXEC, O_CREAT, O_EXCL, O_RDONLY, O_WRONLY};
use crate::fs::inode::{s_isblk, s_isdir};
use crate::fs::namei::{namei, namei_parent};
use crate::fs::poll::PollFd;
use crate::interrupts::TrapFrame;
use crate::memory::user::{
    copy_from_user, copy_string_from_user, copy_to_user, copy_to_user_raw, copy_vec_from_user,
};
use crate::task::scheduler;

const PATH_MAX: usize = 4096;
const IO_MAX: usize = 1 << 20;
const POLL_MAX_FDS: usize = NOFILE;

fn current_fd(fd: u64) -> KResult<Arc<File>> {
    scheduler::current().files.get(fd as usize)
}

/// open(path, flags, mode)
pub fn sys_open(frame: &mut TrapFrame) -> KResult<i64> {
    let path = copy_string_from_user(frame.rdi, PATH_MAX)?;
    let flags = frame.rsi as u32;
    let mode = frame.rdx as u32;

    let mut created = false;
    let inode = match namei(&path) {
        Ok(inode) => {
            if flags & (O_CREAT | O_EXCL) == O_CREAT | O_EXCL {
                return Err(EEXIST);
            }
            inode
        }
        Err(err) if err == ENOENT && flags & O_CREAT != 0 => {
            let (dir, name) = namei_parent(&path)?;
            may_write(&dir)?;
            created = true;
            dir.ops.create(&dir, &name, apply_umask(mode))?
        }
        Err(err) => return Err(err),
    };

    // Access checks against the resolved inode; a freshly created file is
    // open regardless of the mode it was created with.
    if !created {
        match flags & O_ACCMODE {
            O_RDONLY => may_read(&inode)?,
            O_WRONLY => may_write(&inode)?,
            _ => {
                may_read(&inode)?;
                may_write(&inode)?;
            }
        }
    }

    let task = scheduler::current();
    let fd = task.files.get_empty()?;

    match vfs_open(inode, flags) {
        Ok(file) => {
            task.files.assign(fd, file);
            if flags & O_CLOEXEC != 0 {
                task.files.set_cloexec(fd);
            }
            Ok(fd as i64)
        }
        Err(err) => {
            task.files.unreserve(fd);
            Err(err)
        }
    }
}

pub fn sys_close(frame: &mut TrapFrame) -> KResult<i64> {
    let task = scheduler::current();
    let file = task.files.remove(frame.rdi as usize)?;
    drop(file);
    Ok(0)
}

pub fn sys_read(frame: &mut TrapFrame) -> KResult<i64> {
    let file = current_fd(frame.rdi)?;
    let len = (frame.rdx as usize).min(IO_MAX);

    let mut buf = alloc::vec![0u8; len];
    let n = file.read(&mut buf)?;
    copy_to_user_raw(frame.rsi as *mut u8, buf.as_ptr(), n)?;
    Ok(n as i64)
}

pub fn sys_write(frame: &mut TrapFrame) -> KResult<i64> {
    let file = current_fd(frame.rdi)?;
    let len = (frame.rdx as usize).min(IO_MAX);

    let buf = copy_vec_from_user(frame.rsi, len)?;
    let n = file.write(&buf)?;
    Ok(n as i64)
}

/// lseek(fd, offset, whence)
pub fn sys_lseek(frame: &mut TrapFrame) -> KResult<i64> {
    let file = current_fd(frame.rdi)?;
    let offset = frame.rsi as i64;
    let whence = frame.rdx as u32;
    file.lseek(offset, whence).map(|pos| pos as i64)
}

/// pipe(fds[2])
pub fn sys_pipe(frame: &mut TrapFrame) -> KResult<i64> {
    let fds_ptr = frame.rdi;
    let task = scheduler::current();

    let (read_file, write_file) = crate::fs::pipe::create_pipe()?;

    let read_fd = task.files.get_empty()?;
    let write_fd = match task.files.get_empty() {
        Ok(fd) => fd,
        Err(err) => {
            task.files.unreserve(read_fd);
            return Err(err);
        }
    };

    task.files.assign(read_fd, read_file);
    task.files.assign(write_fd, write_file);

    let pair = [read_fd as i32, write_fd as i32];
    if let Err(err) = copy_to_user(fds_ptr, &pair) {
        let _ = task.files.remove(read_fd);
        let _ = task.files.remove(write_fd);
        return Err(err);
    }
    Ok(0)
}

pub fn sys_dup(frame: &mut TrapFrame) -> KResult<i64> {
    let task = scheduler::current();
    let file = task.files.get(frame.rdi as usize)?;
    let fd = task.files.get_empty()?;
    task.files.assign(fd, file);
    Ok(fd as i64)
}

pub fn sys_dup2(frame: &mut TrapFrame) -> KResult<i64> {
    let task = scheduler::current();
    let old_fd = frame.rdi as usize;
    let new_fd = frame.rsi as usize;

    let file = task.files.get(old_fd)?;
    if old_fd == new_fd {
        return Ok(new_fd as i64);
    }
    task.files.replace(new_fd, file)?;
    Ok(new_fd as i64)
}

pub fn sys_chdir(frame: &mut TrapFrame) -> KResult<i64> {
    let path = copy_string_from_user(frame.rdi, PATH_MAX)?;
    let inode = namei(&path)?;
    if !inode.is_dir() {
        return Err(ENOTDIR);
    }
    crate::fs::access::may_exec(&inode)?;

    let task = scheduler::current();
    let old = task.cwd.lock().replace(inode);
    if let Some(old) = old {
        crate::fs::inode::inode_put(old);
    }
    Ok(0)
}

pub fn sys_truncate(frame: &mut TrapFrame) -> KResult<i64> {
    let path = copy_string_from_user(frame.rdi, PATH_MAX)?;
    let size = frame.rsi;

    let inode = namei(&path)?;
    if inode.is_dir() {
        return Err(EISDIR);
    }
    may_write(&inode)?;
    inode.ops.truncate(&inode, size)?;
    Ok(0)
}

pub fn sys_ftruncate(frame: &mut TrapFrame) -> KResult<i64> {
    let file = current_fd(frame.rdi)?;
    if !file.writable() {
        return Err(EINVAL);
    }
    file.inode.ops.truncate(&file.inode, frame.rsi)?;
    Ok(0)
}

/// link(existing, new)
pub fn sys_link(frame: &mut TrapFrame) -> KResult<i64> {
    let old_path = copy_string_from_user(frame.rdi, PATH_MAX)?;
    let new_path = copy_string_from_user(frame.rsi, PATH_MAX)?;

    let inode = namei(&old_path)?;
    if inode.is_dir() {
        return Err(EPERM);
    }
    let (dir, name) = namei_parent(&new_path)?;
    may_write(&dir)?;
    if dir.sb_id != inode.sb_id {
        return Err(crate::errno::EXDEV);
    }

    dir.ops.link(&dir, &name, &inode)?;
    Ok(0)
}

pub fn sys_unlink(frame: &mut TrapFrame) -> KResult<i64> {
    let path = copy_string_from_user(frame.rdi, PATH_MAX)?;
    let (dir, name) = namei_parent(&path)?;
    may_write(&dir)?;
    dir.ops.unlink(&dir, &name)?;
    Ok(0)
}

pub fn sys_stat(frame: &mut TrapFrame) -> KResult<i64> {
    let path = copy_string_from_user(frame.rdi, PATH_MAX)?;
    let inode = namei(&path)?;
    let stat = crate::fs::stat::stat_fill(&inode);
    copy_to_user(frame.rsi, &stat)?;
    Ok(0)
}

pub fn sys_fstat(frame: &mut TrapFrame) -> KResult<i64> {
    let file = current_fd(frame.rdi)?;
    let stat = crate::fs::stat::stat_fill(&file.inode);
    copy_to_user(frame.rsi, &stat)?;
    Ok(0)
}

pub fn sys_sync(_frame: &mut TrapFrame) -> KResult<i64> {
    crate::fs::sync::vfs_sync_all(true)?;
    Ok(0)
}

/// Userspace directory-entry record for read_dent.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct UserDirEnt {
    pub ino: u64,
    pub name_len: u32,
    pub name: [u8; 256],
}

/// read_dent(fd, dent_ptr): one entry per call; 1 on success, 0 at end.
pub fn sys_read_dent(frame: &mut TrapFrame) -> KResult<i64> {
    let file = current_fd(frame.rdi)?;
    if !s_isdir(file.inode.mode()) {
        return Err(ENOTDIR);
    }

    match file.ops.readdir(&file)? {
        Some(entry) => {
            let mut dent = UserDirEnt {
                ino: entry.ino,
                name_len: 0,
                name: [0; 256],
            };
            let bytes = entry.name.as_bytes();
            let n = bytes.len().min(255);
            dent.name[..n].copy_from_slice(&bytes[..n]);
            dent.name_len = n as u32;

            copy_to_user(frame.rsi, &dent)?;
            Ok(1)
        }
        None => Ok(0),
    }
}

/// poll(pollfd_ptr, nfds, timeout_ms)
pub fn sys_poll(frame: &mut TrapFrame) -> KResult<i64> {
    let fds_ptr = frame.rdi;
    let nfds = frame.rsi as usize;
    let timeout_ms = frame.rdx as i64;

    if nfds > POLL_MAX_FDS {
        return Err(EINVAL);
    }

    let task = scheduler::current();
    let mut pollfds: Vec<PollFd> = Vec::with_capacity(nfds);
    for idx in 0..nfds {
        let pfd: PollFd = copy_from_user(fds_ptr + (idx * core::mem::size_of::<PollFd>()) as u64)?;
        pollfds.push(pfd);
    }

    let mut entries: Vec<(Option<Arc<File>>, u16, u16)> = pollfds
        .iter()
        .map(|pfd| {
            if pfd.fd < 0 {
                // Ignored slot: no file, no requested events.
                (None, 0u16, 0u16)
            } else {
                (
                    task.files.get(pfd.fd as usize).ok(),
                    pfd.events as u16,
                    0u16,
                )
            }
        })
        .collect();

    let timeout = if timeout_ms < 0 {
        None
    } else {
        Some(timeout_ms as u64)
    };

    let ready = crate::fs::poll::vfs_poll(&mut entries, timeout)?;

    for (idx, pfd) in pollfds.iter_mut().enumerate() {
        // Negative fds are ignored, not invalid.
        pfd.revents = if pfd.fd < 0 {
            0
        } else {
            entries[idx].2 as i16
        };
        copy_to_user(
            fds_ptr + (idx * core::mem::size_of::<PollFd>()) as u64,
            pfd,
        )?;
    }

    Ok(ready as i64)
}

/// mount(source, target, fstype, flags, data)
pub fn sys_mount(frame: &mut TrapFrame) -> KResult<i64> {
    if scheduler::current().creds.lock().euid != 0 {
        return Err(EPERM);
    }

    let source = copy_string_from_user(frame.rdi, PATH_MAX)?;
    let target = copy_string_from_user(frame.rsi, PATH_MAX)?;
    let fstype = copy_string_from_user(frame.rdx, PATH_MAX)?;

    let fs = crate::fs::find_filesystem(&fstype)?;

    let bdev = if fs.nodev() {
        None
    } else {
        let source_inode = namei(&source)?;
        let rdev = {
            let body = source_inode.body.lock();
            if !s_isblk(body.mode) {
                return Err(ENXIO);
            }
            body.rdev.ok_or(ENXIO)?
        };
        let bdev = crate::block::block_dev_get(rdev)?;
        bdev.open();
        Some(bdev)
    };

    let covered = namei(&target)?;
    if !covered.is_dir() {
        return Err(ENOTDIR);
    }

    let sb = fs.read_super(bdev)?;
    crate::fs::super_block::vfs_mount(Some(covered), sb, source, target)?;
    Ok(0)
}

/// umount(target)
pub fn sys_umount(frame: &mut TrapFrame) -> KResult<i64> {
    if scheduler::current().creds.lock().euid != 0 {
        return Err(EPERM);
    }

    let target = copy_string_from_user(frame.rdi, PATH_MAX)?;
    let root = namei(&target)?;
    let sb = root.superblock().ok_or(EINVAL)?;
    if root.ino != sb.root_ino {
        return Err(EINVAL);
    }

    crate::fs::super_block::vfs_umount(&sb)?;
    Ok(0)
}

/// ioctl(fd, cmd, arg): file ops first, then the controlling tty for the
/// terminal commands.
pub fn sys_ioctl(frame: &mut TrapFrame) -> KResult<i64> {
    let file = current_fd(frame.rdi)?;
    let cmd = frame.rsi as u32;
    let arg = frame.rdx;

    match file.ops.ioctl(&file, cmd, arg) {
        Err(err) if err == ENOTTY => {
            let tty = scheduler::current().tty.lock().clone();
            match tty {
                Some(tty) => tty.ioctl(cmd, arg),
                None => Err(ENOTTY),
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn user_dirent_layout() {
        assert_eq!(core::mem::size_of::<UserDirEnt>(), 8 + 4 + 256 + 4);
        assert_eq!(core::mem::offset_of!(UserDirEnt, name), 12);
    }
}
