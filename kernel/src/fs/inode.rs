//! The inode cache.
//!
//! In-memory inodes are keyed by `(superblock, ino)` in a global hash.
//! Lifecycle flags:
//!
//! - `VALID`: the body has been read from the filesystem; sticky.
//! - `DIRTY`: body differs from disk; the inode sits on its superblock's
//!   dirty list until written back.
//! - `SYNC`: write-back in progress.
//! - `FREEING`: final teardown started; concurrent `inode_get` callers wait
//!   and then re-resolve from the hash.
//! - `BAD`: initialization failed; never handed out, freed on last put.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use spin::Mutex;

use super::super_block::SuperBlock;
use crate::block::DevId;
use crate::errno::{KResult, EIO, ENOTSUP};
use crate::spinlock::Spinlock;
use crate::task::waitqueue::WaitQueue;

pub type Ino = u64;

// Mode bits (POSIX layout).
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

pub const S_ISUID: u32 = 0o4000;
pub const S_ISGID: u32 = 0o2000;
pub const S_ISVTX: u32 = 0o1000;

pub const fn s_isdir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub const fn s_isreg(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

pub const fn s_islnk(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

pub const fn s_isblk(mode: u32) -> bool {
    mode & S_IFMT == S_IFBLK
}

pub const fn s_ischr(mode: u32) -> bool {
    mode & S_IFMT == S_IFCHR
}

pub const fn s_isfifo(mode: u32) -> bool {
    mode & S_IFMT == S_IFIFO
}

const INODE_VALID: u8 = 1 << 0;
const INODE_DIRTY: u8 = 1 << 1;
const INODE_SYNC: u8 = 1 << 2;
const INODE_FREEING: u8 = 1 << 3;
const INODE_BAD: u8 = 1 << 4;

/// Mutable inode body, guarded by the per-inode lock.
#[derive(Debug, Clone)]
pub struct InodeBody {
    pub mode: u32,
    pub size: u64,
    pub nlinks: u32,
    pub blocks: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    /// Device identity for device-special inodes.
    pub rdev: Option<DevId>,
}

impl InodeBody {
    pub fn empty() -> InodeBody {
        InodeBody {
            mode: 0,
            size: 0,
            nlinks: 0,
            blocks: 0,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            rdev: None,
        }
    }
}

/// Filesystem-private payload attached at allocation.
pub enum InodeData {
    None,
    /// In-memory filesystem node (directory map, file bytes, or symlink).
    Ram(Mutex<crate::fs::ramfs::RamNode>),
    /// Pipe/FIFO channel.
    Pipe(Arc<crate::fs::pipe::PipeChannel>),
    /// procfs entry backing.
    Proc(&'static crate::fs::procfs::ProcEntry),
}

/// Directory entry record surfaced by `read_dent`, one at a time.
#[derive(Debug, Clone)]
pub struct DirEnt {
    pub ino: Ino,
    pub name: String,
}

/// Inode operations vtable (superset; filesystems implement a subset).
#[allow(unused_variables)]
pub trait InodeOps: Send + Sync {
    fn lookup(&self, dir: &Arc<Inode>, name: &str) -> KResult<Arc<Inode>> {
        Err(ENOTSUP)
    }
    fn create(&self, dir: &Arc<Inode>, name: &str, mode: u32) -> KResult<Arc<Inode>> {
        Err(ENOTSUP)
    }
    fn mkdir(&self, dir: &Arc<Inode>, name: &str, mode: u32) -> KResult<Arc<Inode>> {
        Err(ENOTSUP)
    }
    fn mknod(&self, dir: &Arc<Inode>, name: &str, mode: u32, dev: DevId) -> KResult<Arc<Inode>> {
        Err(ENOTSUP)
    }
    fn link(&self, dir: &Arc<Inode>, name: &str, inode: &Arc<Inode>) -> KResult<()> {
        Err(ENOTSUP)
    }
    fn unlink(&self, dir: &Arc<Inode>, name: &str) -> KResult<()> {
        Err(ENOTSUP)
    }
    fn rmdir(&self, dir: &Arc<Inode>, name: &str) -> KResult<()> {
        Err(ENOTSUP)
    }
    fn rename(
        &self,
        old_dir: &Arc<Inode>,
        old_name: &str,
        new_dir: &Arc<Inode>,
        new_name: &str,
    ) -> KResult<()> {
        Err(ENOTSUP)
    }
    fn symlink(&self, dir: &Arc<Inode>, name: &str, target: &str) -> KResult<Arc<Inode>> {
        Err(ENOTSUP)
    }
    fn readlink(&self, inode: &Arc<Inode>) -> KResult<String> {
        Err(ENOTSUP)
    }
    fn truncate(&self, inode: &Arc<Inode>, size: u64) -> KResult<()> {
        Err(ENOTSUP)
    }
    /// Map a file block index to a device sector (read path).
    fn bmap(&self, inode: &Arc<Inode>, block: u64) -> KResult<crate::block::Sector> {
        Err(ENOTSUP)
    }
    /// Like `bmap` but allocates the block when absent (write path).
    fn bmap_alloc(&self, inode: &Arc<Inode>, block: u64) -> KResult<crate::block::Sector> {
        Err(ENOTSUP)
    }
    /// Directory iteration: entry at `offset`, or None past the end.
    fn dirent_at(&self, dir: &Arc<Inode>, offset: usize) -> KResult<Option<DirEnt>> {
        Err(ENOTSUP)
    }
    /// File operations for open files of this inode.
    fn file_ops(&self, inode: &Arc<Inode>) -> &'static dyn crate::fs::file::FileOps;
}

pub struct Inode {
    pub ino: Ino,
    pub sb: Weak<SuperBlock>,
    /// Copy of the superblock id for hashing without upgrading `sb`.
    pub sb_id: u64,
    pub ops: &'static dyn InodeOps,

    /// The body lock; `flags` may be taken while holding it, not the
    /// reverse.
    pub body: Mutex<InodeBody>,
    flags: Spinlock<u8>,
    flags_queue: WaitQueue,

    pub data: InodeData,
}

impl Inode {
    /// Build a fresh, not-yet-valid inode. Filesystem `inode_alloc`
    /// implementations call this.
    pub fn new(
        sb: &Arc<SuperBlock>,
        ino: Ino,
        ops: &'static dyn InodeOps,
        data: InodeData,
    ) -> Arc<Inode> {
        Arc::new(Inode {
            ino,
            sb: Arc::downgrade(sb),
            sb_id: sb.id,
            ops,
            body: Mutex::new(InodeBody::empty()),
            flags: Spinlock::new(0),
            flags_queue: WaitQueue::new(),
            data,
        })
    }

    pub fn superblock(&self) -> Option<Arc<SuperBlock>> {
        self.sb.upgrade()
    }

    pub fn is_valid(&self) -> bool {
        *self.flags.lock() & INODE_VALID != 0
    }

    pub fn is_dirty(&self) -> bool {
        *self.flags.lock() & INODE_DIRTY != 0
    }

    pub fn is_bad(&self) -> bool {
        *self.flags.lock() & INODE_BAD != 0
    }

    fn is_freeing(&self) -> bool {
        *self.flags.lock() & INODE_FREEING != 0
    }

    /// VALID is sticky: set once the body is populated.
    pub fn mark_valid(&self) {
        *self.flags.lock() |= INODE_VALID;
        self.flags_queue.wake();
    }

    fn mark_bad(&self) {
        *self.flags.lock() |= INODE_BAD;
        self.flags_queue.wake();
    }

    pub fn mode(&self) -> u32 {
        self.body.lock().mode
    }

    pub fn size(&self) -> u64 {
        self.body.lock().size
    }

    pub fn is_dir(&self) -> bool {
        s_isdir(self.mode())
    }
}

/// Flag the body as modified and queue it on its superblock's dirty list.
pub fn inode_set_dirty(inode: &Arc<Inode>) {
    {
        let mut flags = inode.flags.lock();
        if *flags & INODE_DIRTY != 0 {
            return;
        }
        *flags |= INODE_DIRTY;
    }
    if let Some(sb) = inode.superblock() {
        sb.add_dirty(inode);
    }
}

/// Write-back protocol: mark in-flight, write, clear both flags, wake the
/// inode's queue.
pub fn inode_sync_body(inode: &Arc<Inode>, sb: &Arc<SuperBlock>) -> KResult<()> {
    {
        let mut flags = inode.flags.lock();
        if *flags & INODE_DIRTY == 0 {
            return Ok(());
        }
        *flags |= INODE_SYNC;
    }

    let result = sb.ops.inode_write(sb, inode);

    {
        let mut flags = inode.flags.lock();
        *flags &= !INODE_SYNC;
        if result.is_ok() {
            *flags &= !INODE_DIRTY;
        }
    }
    inode.flags_queue.wake();
    result
}

struct InodeCache {
    map: BTreeMap<(u64, Ino), Arc<Inode>>,
}

static ICACHE: Mutex<InodeCache> = Mutex::new(InodeCache {
    map: BTreeMap::new(),
});

/// Fetch the inode `(sb, ino)`, reading the body if it is not cached.
pub fn inode_get(sb: &Arc<SuperBlock>, ino: Ino) -> KResult<Arc<Inode>> {
    loop {
        let existing = {
            let cache = ICACHE.lock();
            cache.map.get(&(sb.id, ino)).cloned()
        };

        if let Some(inode) = existing {
            if inode.is_bad() {
                return Err(EIO);
            }
            if inode.is_freeing() {
                // Wait out the teardown, then resolve fresh from the hash.
                inode.flags_queue.wait_event(|| !inode.is_freeing());
                continue;
            }
            if !inode.is_valid() {
                // Another task is reading the body right now.
                inode
                    .flags_queue
                    .wait_event(|| inode.is_valid() || inode.is_bad());
                if inode.is_bad() {
                    return Err(EIO);
                }
            }
            return Ok(inode);
        }

        // Miss: allocate, insert invalid, then read the body outside the
        // cache lock. Waiters pile up on the flags queue meanwhile.
        let inode = sb.ops.inode_alloc(sb, ino)?;
        {
            let mut cache = ICACHE.lock();
            if cache.map.contains_key(&(sb.id, ino)) {
                // Lost the race; retry against the winner's entry.
                continue;
            }
            cache.map.insert((sb.id, ino), inode.clone());
        }

        return match sb.ops.inode_read(sb, &inode) {
            Ok(()) => {
                inode.mark_valid();
                Ok(inode)
            }
            Err(err) => {
                inode.mark_bad();
                ICACHE.lock().map.remove(&(sb.id, ino));
                Err(err)
            }
        };
    }
}

/// Allocate-and-insert without reading the body: the caller fills it and
/// calls `mark_valid`. Used when creating brand-new filesystem objects.
pub fn inode_get_invalid(sb: &Arc<SuperBlock>, ino: Ino) -> KResult<Arc<Inode>> {
    let inode = sb.ops.inode_alloc(sb, ino)?;
    let mut cache = ICACHE.lock();
    if cache.map.contains_key(&(sb.id, ino)) {
        return Err(EIO);
    }
    cache.map.insert((sb.id, ino), inode.clone());
    Ok(inode)
}

/// Drop a reference. When the caller held the last outside reference and
/// the object is unlinked, tear it down: mark FREEING, unhash, sync if
/// needed, and let the filesystem deallocate.
pub fn inode_put(inode: Arc<Inode>) {
    let sb = match inode.superblock() {
        Some(sb) => sb,
        None => return,
    };

    {
        let cache = ICACHE.lock();
        // Two references: ours and the cache's. More means other users.
        if Arc::strong_count(&inode) > 2 {
            return;
        }
        if inode.is_valid() && inode.body.lock().nlinks > 0 {
            // Still linked: stays cached for the next lookup.
            return;
        }
        drop(cache);
    }

    // Last reference to an unlinked (or BAD) inode: free it.
    {
        let mut flags = inode.flags.lock();
        if *flags & INODE_FREEING != 0 {
            return;
        }
        *flags |= INODE_FREEING;
    }

    ICACHE.lock().map.remove(&(inode.sb_id, inode.ino));

    if inode.is_dirty() {
        let _ = inode_sync_body(&inode, &sb);
    }
    sb.remove_dirty(&inode);
    let _ = sb.ops.inode_dealloc(&sb, &inode);

    {
        let mut flags = inode.flags.lock();
        *flags &= !INODE_FREEING;
    }
    inode.flags_queue.wake();
}

/// Memory-pressure hook: evict clean, unused, linked inodes.
pub fn inode_oom() -> usize {
    let mut cache = ICACHE.lock();
    let before = cache.map.len();
    cache.map.retain(|_, inode| {
        Arc::strong_count(inode) > 1
            || inode.is_dirty()
            || !inode.is_valid()
            || inode.body.lock().nlinks == 0
    });
    before - cache.map.len()
}

/// Drop every cached inode of one superblock (umount path). Fails the
/// caller's drain if anything is still referenced.
pub fn inode_cache_drain(sb: &Arc<SuperBlock>) -> KResult<()> {
    let mut cache = ICACHE.lock();
    let busy = cache
        .map
        .iter()
        .any(|((sb_id, _), inode)| *sb_id == sb.id && Arc::strong_count(inode) > 1);
    if busy {
        return Err(crate::errno::EBUSY);
    }
    cache.map.retain(|(sb_id, _), _| *sb_id != sb.id);
    Ok(())
}

pub fn cached_inode_count() -> usize {
    ICACHE.lock().map.len()
}
