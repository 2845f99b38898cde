//! Superblocks and the mount table.
//!
//! One superblock per mounted filesystem: device, root inode number, ops
//! vtable, and the filesystem's dirty-inode list. Mount entries pair a
//! superblock's root with the inode it covers; the root mount covers
//! nothing. `umount_lock` is the outer lock of every mount/umount flow.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use super::inode::{inode_get, Ino, Inode};
use crate::block::BlockDevice;
use crate::errno::{KResult, EBUSY, EINVAL};

/// Superblock operations vtable.
#[allow(unused_variables)]
pub trait SuperBlockOps: Send + Sync {
    /// Build a fresh in-memory inode shell for `ino` (not yet valid).
    fn inode_alloc(&self, sb: &Arc<SuperBlock>, ino: Ino) -> KResult<Arc<Inode>>;
    /// Populate the inode body from the filesystem.
    fn inode_read(&self, sb: &Arc<SuperBlock>, inode: &Arc<Inode>) -> KResult<()>;
    /// Write a dirty inode body back.
    fn inode_write(&self, sb: &Arc<SuperBlock>, inode: &Arc<Inode>) -> KResult<()> {
        Ok(())
    }
    /// Release filesystem storage for an unlinked inode.
    fn inode_dealloc(&self, sb: &Arc<SuperBlock>, inode: &Arc<Inode>) -> KResult<()> {
        Ok(())
    }
    /// Flush superblock metadata.
    fn sb_write(&self, sb: &Arc<SuperBlock>) -> KResult<()> {
        Ok(())
    }
    /// Final teardown at umount.
    fn sb_put(&self, sb: &Arc<SuperBlock>) -> KResult<()> {
        Ok(())
    }
}

/// Filesystem-private superblock payload.
pub enum SbData {
    None,
    /// In-memory filesystem state (inode table + ino counter).
    Ramfs(super::ramfs::RamfsSb),
}

pub struct SuperBlock {
    /// Process-wide unique id; the inode cache hashes on it.
    pub id: u64,
    pub dev: Option<Arc<BlockDevice>>,
    pub root_ino: Ino,
    pub ops: &'static dyn SuperBlockOps,
    pub fs_name: &'static str,
    pub data: SbData,

    unmounting: AtomicBool,
    dirty_inodes: Mutex<Vec<Arc<Inode>>>,
}

static NEXT_SB_ID: AtomicU64 = AtomicU64::new(1);

impl SuperBlock {
    pub fn new(
        dev: Option<Arc<BlockDevice>>,
        root_ino: Ino,
        ops: &'static dyn SuperBlockOps,
        fs_name: &'static str,
        data: SbData,
    ) -> Arc<SuperBlock> {
        Arc::new(SuperBlock {
            id: NEXT_SB_ID.fetch_add(1, Ordering::Relaxed),
            dev,
            root_ino,
            ops,
            fs_name,
            data,
            unmounting: AtomicBool::new(false),
            dirty_inodes: Mutex::new(Vec::new()),
        })
    }

    pub fn is_unmounting(&self) -> bool {
        self.unmounting.load(Ordering::Acquire)
    }

    pub fn add_dirty(&self, inode: &Arc<Inode>) {
        let mut dirty = self.dirty_inodes.lock();
        if !dirty.iter().any(|i| Arc::ptr_eq(i, inode)) {
            dirty.push(inode.clone());
        }
    }

    pub fn remove_dirty(&self, inode: &Arc<Inode>) {
        self.dirty_inodes.lock().retain(|i| !Arc::ptr_eq(i, inode));
    }

    /// Device name for /proc/mounts.
    pub fn dev_name(&self) -> String {
        use alloc::format;
        match &self.dev {
            Some(bdev) => format!("dev({:?})", bdev.dev),
            None => String::from("none"),
        }
    }
}

/// Root inode of a superblock, through the inode cache.
pub fn sb_root(sb: &Arc<SuperBlock>) -> KResult<Arc<Inode>> {
    inode_get(sb, sb.root_ino)
}

/// Write back every dirty inode of one filesystem.
pub fn sb_sync_inodes(sb: &Arc<SuperBlock>) -> KResult<()> {
    let dirty: Vec<Arc<Inode>> = {
        let mut list = sb.dirty_inodes.lock();
        core::mem::take(&mut *list)
    };

    let mut err = Ok(());
    for inode in dirty {
        if let Err(e) = super::inode::inode_sync_body(&inode, sb) {
            // Keep it queued and report the first failure.
            sb.add_dirty(&inode);
            if err.is_ok() {
                err = Err(e);
            }
        }
    }
    err
}

/// One mount-table entry.
pub struct Mount {
    pub sb: Arc<SuperBlock>,
    pub root: Arc<Inode>,
    /// Inode this mount sits on; `None` only for the root mount.
    pub covered: Option<Arc<Inode>>,
    pub source: String,
    pub target: String,
}

static MOUNTS: Mutex<Vec<Mount>> = Mutex::new(Vec::new());

/// Outer lock serializing mount/umount flows.
static UMOUNT_LOCK: Mutex<()> = Mutex::new(());

/// Mount `sb` over `covered`. The root mount passes `covered = None`.
pub fn vfs_mount(
    covered: Option<Arc<Inode>>,
    sb: Arc<SuperBlock>,
    source: String,
    target: String,
) -> KResult<()> {
    let _outer = UMOUNT_LOCK.lock();
    let mut mounts = MOUNTS.lock();

    if let Some(covered_inode) = &covered {
        let duplicate = mounts.iter().any(|m| {
            m.covered
                .as_ref()
                .map_or(false, |c| Arc::ptr_eq(c, covered_inode))
        });
        if duplicate {
            return Err(EBUSY);
        }
    } else if !mounts.is_empty() {
        // Only the first mount may be rootless.
        return Err(EINVAL);
    }

    let root = sb_root(&sb)?;
    log::info!(
        "mount: {} on {} type {}",
        source,
        if target.is_empty() { "/" } else { &target },
        sb.fs_name
    );
    mounts.push(Mount {
        sb,
        root,
        covered,
        source,
        target,
    });
    Ok(())
}

/// Unmount `sb`: flag it, drain cached inodes, sync, and drop the entry.
pub fn vfs_umount(sb: &Arc<SuperBlock>) -> KResult<()> {
    let _outer = UMOUNT_LOCK.lock();

    sb.unmounting.store(true, Ordering::Release);

    let undo = |e| {
        sb.unmounting.store(false, Ordering::Release);
        Err(e)
    };

    let _ = sb_sync_inodes(sb);
    if let Err(e) = sb.ops.sb_write(sb) {
        return undo(e);
    }

    {
        let mut mounts = MOUNTS.lock();
        let idx = match mounts.iter().position(|m| Arc::ptr_eq(&m.sb, sb)) {
            Some(idx) => idx,
            None => return undo(EINVAL),
        };

        // Anything mounted on top of us must go first.
        let busy = mounts.iter().any(|m| {
            m.covered
                .as_ref()
                .and_then(|c| c.superblock())
                .map_or(false, |csb| Arc::ptr_eq(&csb, sb))
        });
        if busy {
            return undo(EBUSY);
        }

        mounts.remove(idx);
    }

    if let Err(e) = super::inode::inode_cache_drain(sb) {
        return undo(e);
    }

    sb.ops.sb_put(sb)?;
    if let Some(bdev) = &sb.dev {
        crate::block::bcache::block_dev_clear(bdev);
        bdev.close();
    }
    log::info!("umount: {} ({})", sb.dev_name(), sb.fs_name);
    Ok(())
}

/// Root inode of the root mount; the initial cwd of PID 1.
pub fn root_inode() -> KResult<Arc<Inode>> {
    let mounts = MOUNTS.lock();
    mounts
        .first()
        .map(|m| m.root.clone())
        .ok_or(crate::errno::ENOENT)
}

/// If `inode` is a mount point, follow to the mounted filesystem's root.
pub fn mount_resolve(inode: &Arc<Inode>) -> Arc<Inode> {
    let mounts = MOUNTS.lock();
    for mount in mounts.iter() {
        if let Some(covered) = &mount.covered {
            if Arc::ptr_eq(covered, inode) {
                return mount.root.clone();
            }
        }
    }
    inode.clone()
}

/// Snapshot for /proc/mounts: (source, target, fstype).
pub fn mount_list() -> Vec<(String, String, &'static str)> {
    let mounts = MOUNTS.lock();
    mounts
        .iter()
        .map(|m| {
            let target = if m.target.is_empty() {
                String::from("/")
            } else {
                m.target.clone()
            };
            (m.source.clone(), target, m.sb.fs_name)
        })
        .collect()
}

/// Every mounted superblock, for sync passes.
pub fn mounted_superblocks() -> Vec<Arc<SuperBlock>> {
    MOUNTS.lock().iter().map(|m| m.sb.clone()).collect()
}
