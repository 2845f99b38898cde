//! Pipes and FIFOs.
//!
//! A pipe is a bounded byte channel with reader/writer end counts. Reads on
//! an empty pipe block (or `EAGAIN` when nonblocking) unless every writer
//! is gone, which reads as EOF. Writes with no readers raise `SIGPIPE` and
//! fail with `EPIPE`. Anonymous pipes live on the pipefs superblock, which
//! exists only to give them inode identity on an anonymous device.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::file::{File, FileOps, FilePrivate, O_RDONLY, O_WRONLY};
use super::inode::{Inode, InodeData, InodeOps, S_IFIFO};
use super::poll::{PollTable, POLLHUP, POLLIN, POLLOUT};
use super::super_block::{SbData, SuperBlock, SuperBlockOps};
use crate::errno::{KResult, EAGAIN, EPIPE, ENOTSUP};
use crate::task::waitqueue::WaitQueue;

pub const PIPE_BUF_SIZE: usize = 16384;

struct PipeInner {
    buf: VecDeque<u8>,
    readers: usize,
    writers: usize,
}

pub struct PipeChannel {
    inner: Mutex<PipeInner>,
    read_queue: WaitQueue,
    write_queue: WaitQueue,
}

impl PipeChannel {
    pub fn new() -> Arc<PipeChannel> {
        Arc::new(PipeChannel {
            inner: Mutex::new(PipeInner {
                buf: VecDeque::with_capacity(PIPE_BUF_SIZE),
                readers: 0,
                writers: 0,
            }),
            read_queue: WaitQueue::new(),
            write_queue: WaitQueue::new(),
        })
    }

    fn attach(&self, end: PipeEnd) {
        let mut inner = self.inner.lock();
        match end {
            PipeEnd::Read => inner.readers += 1,
            PipeEnd::Write => inner.writers += 1,
        }
    }

    fn detach(&self, end: PipeEnd) {
        let mut inner = self.inner.lock();
        match end {
            PipeEnd::Read => {
                inner.readers -= 1;
                if inner.readers == 0 {
                    // Writers must learn the pipe broke.
                    drop(inner);
                    self.write_queue.wake();
                    return;
                }
            }
            PipeEnd::Write => {
                inner.writers -= 1;
                if inner.writers == 0 {
                    // Readers drain to EOF.
                    drop(inner);
                    self.read_queue.wake();
                    return;
                }
            }
        }
    }

    fn read(&self, buf: &mut [u8], nonblock: bool) -> KResult<usize> {
        loop {
            {
                let mut inner = self.inner.lock();
                if !inner.buf.is_empty() {
                    let n = buf.len().min(inner.buf.len());
                    for slot in buf[..n].iter_mut() {
                        *slot = inner.buf.pop_front().unwrap();
                    }
                    drop(inner);
                    self.write_queue.wake();
                    return Ok(n);
                }
                if inner.writers == 0 {
                    return Ok(0);
                }
            }

            if nonblock {
                return Err(EAGAIN);
            }

            self.read_queue.wait_event_intr(|| {
                let inner = self.inner.lock();
                !inner.buf.is_empty() || inner.writers == 0
            })?;
        }
    }

    fn write(&self, buf: &[u8], nonblock: bool) -> KResult<usize> {
        let mut written = 0;

        while written < buf.len() {
            {
                let mut inner = self.inner.lock();
                if inner.readers == 0 {
                    // Broken pipe: the writer gets both the signal and the
                    // error (the error only if nothing was written yet).
                    drop(inner);
                    let task = crate::task::scheduler::current();
                    crate::task::signal::send(&task, crate::task::signal::SIGPIPE);
                    if written > 0 {
                        return Ok(written);
                    }
                    return Err(EPIPE);
                }

                let space = PIPE_BUF_SIZE - inner.buf.len();
                if space > 0 {
                    let n = space.min(buf.len() - written);
                    inner.buf.extend(buf[written..written + n].iter().copied());
                    written += n;
                    drop(inner);
                    self.read_queue.wake();
                    continue;
                }
            }

            if nonblock {
                if written > 0 {
                    return Ok(written);
                }
                return Err(EAGAIN);
            }

            self.write_queue.wait_event_intr(|| {
                let inner = self.inner.lock();
                inner.buf.len() < PIPE_BUF_SIZE || inner.readers == 0
            })?;
        }

        Ok(written)
    }

    fn poll_mask(&self, end: PipeEnd) -> u16 {
        let inner = self.inner.lock();
        let mut mask = 0;
        match end {
            PipeEnd::Read => {
                if !inner.buf.is_empty() {
                    mask |= POLLIN;
                }
                if inner.writers == 0 {
                    mask |= POLLHUP;
                }
            }
            PipeEnd::Write => {
                if inner.buf.len() < PIPE_BUF_SIZE {
                    mask |= POLLOUT;
                }
                if inner.readers == 0 {
                    mask |= POLLHUP;
                }
            }
        }
        mask
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

fn channel_of(file: &File) -> &Arc<PipeChannel> {
    match &file.inode.data {
        InodeData::Pipe(channel) => channel,
        _ => panic!("pipe file ops on non-pipe inode"),
    }
}

fn end_of(file: &File) -> PipeEnd {
    match &file.private {
        FilePrivate::Pipe(end) => *end,
        _ => panic!("pipe file without pipe private data"),
    }
}

struct PipeFileOps;

static PIPE_FILE_OPS: PipeFileOps = PipeFileOps;

impl FileOps for PipeFileOps {
    fn read(&self, file: &File, buf: &mut [u8]) -> KResult<usize> {
        channel_of(file).read(buf, file.nonblock())
    }

    fn write(&self, file: &File, buf: &[u8]) -> KResult<usize> {
        channel_of(file).write(buf, file.nonblock())
    }

    fn poll(&self, file: &File, table: &mut PollTable, _events: u16) -> u16 {
        let channel = channel_of(file);
        let end = end_of(file);
        match end {
            PipeEnd::Read => table.add_queue(&channel.read_queue),
            PipeEnd::Write => table.add_queue(&channel.write_queue),
        }
        channel.poll_mask(end)
    }

    fn release(&self, file: &File) {
        channel_of(file).detach(end_of(file));
    }
}

// ---------------------------------------------------------------------------
// pipefs: anonymous-device superblock giving pipes inode identity
// ---------------------------------------------------------------------------

struct PipefsSbOps;
static PIPEFS_SB_OPS: PipefsSbOps = PipefsSbOps;

impl SuperBlockOps for PipefsSbOps {
    fn inode_alloc(&self, sb: &Arc<SuperBlock>, ino: u64) -> KResult<Arc<Inode>> {
        Ok(Inode::new(
            sb,
            ino,
            &PIPEFS_INODE_OPS,
            InodeData::Pipe(PipeChannel::new()),
        ))
    }

    fn inode_read(&self, _sb: &Arc<SuperBlock>, _inode: &Arc<Inode>) -> KResult<()> {
        // Pipe inodes are only ever created, never looked up from storage.
        Err(ENOTSUP)
    }
}

struct PipefsInodeOps;
static PIPEFS_INODE_OPS: PipefsInodeOps = PipefsInodeOps;

impl InodeOps for PipefsInodeOps {
    fn file_ops(&self, _inode: &Arc<Inode>) -> &'static dyn FileOps {
        &PIPE_FILE_OPS
    }
}

static PIPEFS_SB: conquer_once::spin::OnceCell<Arc<SuperBlock>> =
    conquer_once::spin::OnceCell::uninit();
static PIPEFS_NEXT_INO: AtomicU64 = AtomicU64::new(1);

fn pipefs_sb() -> KResult<Arc<SuperBlock>> {
    // Lazily bring up the pipefs superblock on its anonymous device.
    if let Ok(sb) = PIPEFS_SB.try_get() {
        return Ok(sb.clone());
    }
    let bdev = crate::block::block_dev_anon_get()?;
    let sb = PIPEFS_SB.get_or_init(|| {
        SuperBlock::new(Some(bdev), 0, &PIPEFS_SB_OPS, "pipefs", SbData::None)
    });
    Ok(sb.clone())
}

/// Build a connected pipe: `(read_end, write_end)`.
pub fn create_pipe() -> KResult<(Arc<File>, Arc<File>)> {
    let sb = pipefs_sb()?;
    let ino = PIPEFS_NEXT_INO.fetch_add(1, Ordering::Relaxed);

    let inode = super::inode::inode_get_invalid(&sb, ino)?;
    {
        let mut body = inode.body.lock();
        body.mode = S_IFIFO | 0o600;
        body.nlinks = 1;
    }
    inode.mark_valid();

    let channel = match &inode.data {
        InodeData::Pipe(channel) => channel.clone(),
        _ => unreachable!(),
    };

    channel.attach(PipeEnd::Read);
    channel.attach(PipeEnd::Write);

    let read_file = File::new(
        inode.clone(),
        &PIPE_FILE_OPS,
        O_RDONLY,
        FilePrivate::Pipe(PipeEnd::Read),
    );
    let write_file = File::new(
        inode,
        &PIPE_FILE_OPS,
        O_WRONLY,
        FilePrivate::Pipe(PipeEnd::Write),
    );
    Ok((read_file, write_file))
}

/// Open a FIFO inode through the VFS.
pub fn open_fifo(inode: Arc<Inode>, flags: u32) -> KResult<Arc<File>> {
    let channel = match &inode.data {
        InodeData::Pipe(channel) => channel.clone(),
        _ => return Err(crate::errno::EINVAL),
    };

    let end = match flags & super::file::O_ACCMODE {
        O_WRONLY => PipeEnd::Write,
        _ => PipeEnd::Read,
    };
    channel.attach(end);

    let file = File::new(inode, &PIPE_FILE_OPS, flags, FilePrivate::Pipe(end));
    Ok(file)
}

/// Dup of a pipe fd shares the `File`, so end counts only move on open and
/// release; nothing extra to do here, the hook exists for fork accounting.
pub fn pipe_dup(_file: &File) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn write_then_read_round_trips() {
        let channel = PipeChannel::new();
        channel.attach(PipeEnd::Read);
        channel.attach(PipeEnd::Write);

        let n = channel.write(b"hello", true).unwrap();
        assert_eq!(n, 5);

        let mut buf = [0u8; 8];
        let n = channel.read(&mut buf, true).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test_case]
    fn empty_nonblocking_read_is_eagain() {
        let channel = PipeChannel::new();
        channel.attach(PipeEnd::Read);
        channel.attach(PipeEnd::Write);

        let mut buf = [0u8; 4];
        assert_eq!(channel.read(&mut buf, true), Err(EAGAIN));
    }

    #[test_case]
    fn eof_after_last_writer_detaches() {
        let channel = PipeChannel::new();
        channel.attach(PipeEnd::Read);
        channel.attach(PipeEnd::Write);
        channel.write(b"x", true).unwrap();
        channel.detach(PipeEnd::Write);

        let mut buf = [0u8; 4];
        assert_eq!(channel.read(&mut buf, true).unwrap(), 1);
        assert_eq!(channel.read(&mut buf, true).unwrap(), 0);
    }
}
