//! Open files.
//!
//! A `File` is one open-file handle: inode, offset, access flags, and an
//! operations vtable chosen from the inode type at open. Dup and fork share
//! the handle (reference counted); the last close runs `release`.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use super::inode::{s_isblk, s_isdir, s_isfifo, Inode};
use crate::errno::{KResult, EACCES, EBADF, EINVAL, EISDIR, ENOTSUP, ENOTTY, ESPIPE};

// open(2) flag bits.
pub const O_RDONLY: u32 = 0o0;
pub const O_WRONLY: u32 = 0o1;
pub const O_RDWR: u32 = 0o2;
pub const O_ACCMODE: u32 = 0o3;
pub const O_CREAT: u32 = 0o100;
pub const O_EXCL: u32 = 0o200;
pub const O_TRUNC: u32 = 0o1000;
pub const O_APPEND: u32 = 0o2000;
pub const O_NONBLOCK: u32 = 0o4000;
pub const O_CLOEXEC: u32 = 0o2000000;

// lseek whence.
pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

// Internal file-state bits.
const FILE_READABLE: u32 = 1 << 0;
const FILE_WRITABLE: u32 = 1 << 1;
const FILE_APPEND: u32 = 1 << 2;
const FILE_NONBLOCK: u32 = 1 << 3;

/// Per-handle private state, fixed at open.
pub enum FilePrivate {
    None,
    Pipe(super::pipe::PipeEnd),
    Seq(Mutex<super::seq_file::SeqState>),
    /// Iteration cursor of /proc/task_api readers.
    TaskApi(Mutex<usize>),
}

/// File operations vtable.
#[allow(unused_variables)]
pub trait FileOps: Send + Sync {
    fn open(&self, file: &File) -> KResult<()> {
        Ok(())
    }
    /// Called once, when the last reference drops.
    fn release(&self, file: &File) {}
    fn read(&self, file: &File, buf: &mut [u8]) -> KResult<usize> {
        Err(ENOTSUP)
    }
    fn write(&self, file: &File, buf: &[u8]) -> KResult<usize> {
        Err(ENOTSUP)
    }
    /// Positional read; never moves the offset.
    fn pread(&self, file: &File, buf: &mut [u8], offset: u64) -> KResult<usize> {
        Err(ENOTSUP)
    }
    fn lseek(&self, file: &File, offset: i64, whence: u32) -> KResult<u64> {
        default_lseek(file, offset, whence)
    }
    /// One directory entry per call; the offset advances by one entry.
    fn readdir(&self, file: &File) -> KResult<Option<super::inode::DirEnt>> {
        Err(ENOTSUP)
    }
    fn ioctl(&self, file: &File, cmd: u32, arg: u64) -> KResult<i64> {
        Err(ENOTTY)
    }
    /// Register interest and report currently-ready events.
    fn poll(&self, file: &File, table: &mut super::poll::PollTable, events: u16) -> u16 {
        0
    }
}

/// Size-based seek shared by regular files.
pub fn default_lseek(file: &File, offset: i64, whence: u32) -> KResult<u64> {
    let mut off = file.offset.lock();
    let base = match whence {
        SEEK_SET => 0,
        SEEK_CUR => *off as i64,
        SEEK_END => file.inode.size() as i64,
        _ => return Err(EINVAL),
    };
    let target = base.checked_add(offset).ok_or(EINVAL)?;
    if target < 0 {
        return Err(EINVAL);
    }
    *off = target as u64;
    Ok(*off)
}

pub struct File {
    pub inode: Arc<Inode>,
    flags: AtomicU32,
    pub offset: Mutex<u64>,
    pub ops: &'static dyn FileOps,
    pub private: FilePrivate,
}

impl File {
    pub fn new(
        inode: Arc<Inode>,
        ops: &'static dyn FileOps,
        open_flags: u32,
        private: FilePrivate,
    ) -> Arc<File> {
        let mut bits = 0;
        match open_flags & O_ACCMODE {
            O_RDONLY => bits |= FILE_READABLE,
            O_WRONLY => bits |= FILE_WRITABLE,
            _ => bits |= FILE_READABLE | FILE_WRITABLE,
        }
        if open_flags & O_APPEND != 0 {
            bits |= FILE_APPEND;
        }
        if open_flags & O_NONBLOCK != 0 {
            bits |= FILE_NONBLOCK;
        }

        Arc::new(File {
            inode,
            flags: AtomicU32::new(bits),
            offset: Mutex::new(0),
            ops,
            private,
        })
    }

    pub fn readable(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FILE_READABLE != 0
    }

    pub fn writable(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FILE_WRITABLE != 0
    }

    pub fn append(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FILE_APPEND != 0
    }

    pub fn nonblock(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FILE_NONBLOCK != 0
    }

    pub fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        if !self.readable() {
            return Err(EBADF);
        }
        self.ops.read(self, buf)
    }

    pub fn write(&self, buf: &[u8]) -> KResult<usize> {
        if !self.writable() {
            return Err(EBADF);
        }
        self.ops.write(self, buf)
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> KResult<usize> {
        self.ops.pread(self, buf, offset)
    }

    pub fn lseek(&self, offset: i64, whence: u32) -> KResult<u64> {
        if s_isfifo(self.inode.mode()) {
            return Err(ESPIPE);
        }
        self.ops.lseek(self, offset, whence)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.ops.release(self);
    }
}

/// Open `inode` with `flags`: enforce type/access compatibility, pick the
/// file ops from the inode, and run their `open`.
pub fn vfs_open(inode: Arc<Inode>, flags: u32) -> KResult<Arc<File>> {
    let mode = inode.mode();
    let wants_write = flags & O_ACCMODE != O_RDONLY;

    if s_isdir(mode) && wants_write {
        return Err(EISDIR);
    }

    // Access against credentials happens in the caller (sys_open) where the
    // path walk already proved search permission; here we only reconcile
    // the handle flags with the inode type.
    let (ops, private): (&'static dyn FileOps, FilePrivate) = if s_isfifo(mode) {
        return super::pipe::open_fifo(inode, flags);
    } else if s_isblk(mode) {
        let rdev = inode.body.lock().rdev.ok_or(EACCES)?;
        let bdev = crate::block::block_dev_get(rdev)?;
        bdev.open();
        (crate::block::fops::block_file_ops(), FilePrivate::None)
    } else if let super::inode::InodeData::Proc(entry) = &inode.data {
        entry.file_setup()
    } else {
        (inode.ops.file_ops(&inode), FilePrivate::None)
    };

    if flags & O_TRUNC != 0 && wants_write {
        inode.ops.truncate(&inode, 0)?;
    }

    let file = File::new(inode, ops, flags, private);
    file.ops.open(&file)?;
    Ok(file)
}
