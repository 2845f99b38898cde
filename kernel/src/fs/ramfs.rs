//! ramfs: the in-memory filesystem.
//!
//! Backs the root mount. Nodes live entirely in their inodes: directories
//! are name→ino maps, files are byte vectors, symlinks are target strings.
//! The superblock keeps a strong table of every live inode so cache
//! eviction can never drop file content; `inode_alloc` hands back the
//! existing object when the cache re-requests a known ino.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::file::{File, FileOps};
use super::inode::{
    inode_get, inode_get_invalid, inode_set_dirty, s_isdir, DirEnt, Ino, Inode, InodeData,
    InodeOps, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
};
use super::super_block::{SbData, SuperBlock, SuperBlockOps};
use crate::block::DevId;
use crate::errno::{
    KResult, EEXIST, EINVAL, EIO, EISDIR, ENOENT, ENOTDIR, ENOTEMPTY, EPERM,
};

pub const RAMFS_ROOT_INO: Ino = 1;

/// Per-inode payload.
pub enum RamNode {
    Empty,
    Dir(BTreeMap<String, Ino>),
    File(Vec<u8>),
    Link(String),
}

/// Superblock-private state: inode table plus the ino counter.
pub struct RamfsSb {
    pub next_ino: core::sync::atomic::AtomicU64,
    pub inodes: Mutex<BTreeMap<Ino, Arc<Inode>>>,
}

fn sb_state(sb: &Arc<SuperBlock>) -> KResult<&RamfsSb> {
    match &sb.data {
        SbData::Ramfs(state) => Ok(state),
        _ => Err(EINVAL),
    }
}

fn node_of(inode: &Inode) -> &Mutex<RamNode> {
    match &inode.data {
        InodeData::Ram(node) => node,
        _ => panic!("ramfs inode without ram node"),
    }
}

fn with_dir<R>(
    dir: &Arc<Inode>,
    f: impl FnOnce(&mut BTreeMap<String, Ino>) -> KResult<R>,
) -> KResult<R> {
    let mut node = node_of(dir).lock();
    match &mut *node {
        RamNode::Dir(entries) => f(entries),
        _ => Err(ENOTDIR),
    }
}

struct RamfsSbOps;
static RAMFS_SB_OPS: RamfsSbOps = RamfsSbOps;

impl SuperBlockOps for RamfsSbOps {
    fn inode_alloc(&self, sb: &Arc<SuperBlock>, ino: Ino) -> KResult<Arc<Inode>> {
        let state = sb_state(sb)?;
        let mut inodes = state.inodes.lock();
        if let Some(existing) = inodes.get(&ino) {
            return Ok(existing.clone());
        }
        let inode = Inode::new(sb, ino, &RAMFS_INODE_OPS, InodeData::Ram(Mutex::new(RamNode::Empty)));
        inodes.insert(ino, inode.clone());
        Ok(inode)
    }

    fn inode_read(&self, _sb: &Arc<SuperBlock>, inode: &Arc<Inode>) -> KResult<()> {
        // Everything lives in memory; the only inode ever "read" cold is
        // the root on first mount.
        let mut node = node_of(inode).lock();
        if matches!(*node, RamNode::Empty) {
            if inode.ino != RAMFS_ROOT_INO {
                return Err(ENOENT);
            }
            let mut entries = BTreeMap::new();
            entries.insert(String::from("."), RAMFS_ROOT_INO);
            entries.insert(String::from(".."), RAMFS_ROOT_INO);
            *node = RamNode::Dir(entries);

            let mut body = inode.body.lock();
            body.mode = S_IFDIR | 0o755;
            body.nlinks = 2;
        }
        Ok(())
    }

    fn inode_dealloc(&self, sb: &Arc<SuperBlock>, inode: &Arc<Inode>) -> KResult<()> {
        sb_state(sb)?.inodes.lock().remove(&inode.ino);
        Ok(())
    }
}

/// Create a ramfs superblock on an anonymous device.
pub fn ramfs_create_sb() -> KResult<Arc<SuperBlock>> {
    let bdev = crate::block::block_dev_anon_get()?;
    Ok(SuperBlock::new(
        Some(bdev),
        RAMFS_ROOT_INO,
        &RAMFS_SB_OPS,
        "ramfs",
        SbData::Ramfs(RamfsSb {
            next_ino: core::sync::atomic::AtomicU64::new(RAMFS_ROOT_INO + 1),
            inodes: Mutex::new(BTreeMap::new()),
        }),
    ))
}

fn new_inode(
    dir: &Arc<Inode>,
    name: &str,
    mode: u32,
    node: RamNode,
    rdev: Option<DevId>,
) -> KResult<Arc<Inode>> {
    if name.is_empty() || name.contains('/') {
        return Err(EINVAL);
    }
    let sb = dir.superblock().ok_or(EIO)?;
    let state = sb_state(&sb)?;

    with_dir(dir, |entries| {
        if entries.contains_key(name) {
            return Err(EEXIST);
        }
        Ok(())
    })?;

    let ino = state
        .next_ino
        .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    let inode = inode_get_invalid(&sb, ino)?;

    let is_dir = s_isdir(mode);
    {
        let mut n = node_of(&inode).lock();
        *n = node;
    }
    {
        let mut body = inode.body.lock();
        body.mode = mode;
        body.nlinks = if is_dir { 2 } else { 1 };
        body.rdev = rdev;
        let creds = crate::task::scheduler::current().creds.lock().clone();
        body.uid = creds.euid;
        body.gid = creds.egid;
    }
    inode.mark_valid();

    with_dir(dir, |entries| {
        entries.insert(name.to_string(), ino);
        Ok(())
    })?;
    if is_dir {
        dir.body.lock().nlinks += 1;
    }
    inode_set_dirty(dir);

    Ok(inode)
}

struct RamfsInodeOps;
static RAMFS_INODE_OPS: RamfsInodeOps = RamfsInodeOps;

impl InodeOps for RamfsInodeOps {
    fn lookup(&self, dir: &Arc<Inode>, name: &str) -> KResult<Arc<Inode>> {
        let sb = dir.superblock().ok_or(EIO)?;
        let ino = with_dir(dir, |entries| {
            entries.get(name).copied().ok_or(ENOENT)
        })?;
        inode_get(&sb, ino)
    }

    fn create(&self, dir: &Arc<Inode>, name: &str, mode: u32) -> KResult<Arc<Inode>> {
        let mode = (mode & !S_IFMT) | S_IFREG;
        new_inode(dir, name, mode, RamNode::File(Vec::new()), None)
    }

    fn mkdir(&self, dir: &Arc<Inode>, name: &str, mode: u32) -> KResult<Arc<Inode>> {
        let mode = (mode & !S_IFMT) | S_IFDIR;
        let mut entries = BTreeMap::new();
        entries.insert(String::from(".."), dir.ino);
        let inode = new_inode(dir, name, mode, RamNode::Dir(entries), None)?;
        // "." needs the new ino, known only now.
        with_dir(&inode, |entries| {
            entries.insert(String::from("."), inode.ino);
            Ok(())
        })?;
        Ok(inode)
    }

    fn mknod(&self, dir: &Arc<Inode>, name: &str, mode: u32, dev: DevId) -> KResult<Arc<Inode>> {
        new_inode(dir, name, mode, RamNode::Empty, Some(dev))
    }

    fn link(&self, dir: &Arc<Inode>, name: &str, inode: &Arc<Inode>) -> KResult<()> {
        if inode.is_dir() {
            return Err(EPERM);
        }
        with_dir(dir, |entries| {
            if entries.contains_key(name) {
                return Err(EEXIST);
            }
            entries.insert(name.to_string(), inode.ino);
            Ok(())
        })?;
        inode.body.lock().nlinks += 1;
        inode_set_dirty(&inode);
        Ok(())
    }

    fn unlink(&self, dir: &Arc<Inode>, name: &str) -> KResult<()> {
        let sb = dir.superblock().ok_or(EIO)?;
        let ino = with_dir(dir, |entries| {
            entries.get(name).copied().ok_or(ENOENT)
        })?;
        let inode = inode_get(&sb, ino)?;
        if inode.is_dir() {
            return Err(EISDIR);
        }

        with_dir(dir, |entries| {
            entries.remove(name);
            Ok(())
        })?;
        inode.body.lock().nlinks -= 1;
        inode_set_dirty(&inode);
        inode_set_dirty(dir);
        super::inode::inode_put(inode);
        Ok(())
    }

    fn rmdir(&self, dir: &Arc<Inode>, name: &str) -> KResult<()> {
        if name == "." || name == ".." {
            return Err(EINVAL);
        }
        let sb = dir.superblock().ok_or(EIO)?;
        let ino = with_dir(dir, |entries| {
            entries.get(name).copied().ok_or(ENOENT)
        })?;
        let inode = inode_get(&sb, ino)?;
        if !inode.is_dir() {
            return Err(ENOTDIR);
        }

        with_dir(&inode, |entries| {
            if entries.keys().any(|k| k != "." && k != "..") {
                return Err(ENOTEMPTY);
            }
            Ok(())
        })?;

        with_dir(dir, |entries| {
            entries.remove(name);
            Ok(())
        })?;
        dir.body.lock().nlinks -= 1;
        inode.body.lock().nlinks = 0;
        super::inode::inode_put(inode);
        Ok(())
    }

    fn rename(
        &self,
        old_dir: &Arc<Inode>,
        old_name: &str,
        new_dir: &Arc<Inode>,
        new_name: &str,
    ) -> KResult<()> {
        if old_dir.sb_id != new_dir.sb_id {
            return Err(crate::errno::EXDEV);
        }
        let ino = with_dir(old_dir, |entries| {
            entries.get(old_name).copied().ok_or(ENOENT)
        })?;
        with_dir(new_dir, |entries| {
            entries.insert(new_name.to_string(), ino);
            Ok(())
        })?;
        with_dir(old_dir, |entries| {
            entries.remove(old_name);
            Ok(())
        })?;
        inode_set_dirty(old_dir);
        inode_set_dirty(new_dir);
        Ok(())
    }

    fn symlink(&self, dir: &Arc<Inode>, name: &str, target: &str) -> KResult<Arc<Inode>> {
        let inode = new_inode(
            dir,
            name,
            S_IFLNK | 0o777,
            RamNode::Link(target.to_string()),
            None,
        )?;
        inode.body.lock().size = target.len() as u64;
        Ok(inode)
    }

    fn readlink(&self, inode: &Arc<Inode>) -> KResult<String> {
        let node = node_of(inode).lock();
        match &*node {
            RamNode::Link(target) => Ok(target.clone()),
            _ => Err(EINVAL),
        }
    }

    fn truncate(&self, inode: &Arc<Inode>, size: u64) -> KResult<()> {
        {
            let mut node = node_of(inode).lock();
            match &mut *node {
                RamNode::File(bytes) => bytes.resize(size as usize, 0),
                _ => return Err(EINVAL),
            }
        }
        inode.body.lock().size = size;
        inode_set_dirty(&inode);
        Ok(())
    }

    fn dirent_at(&self, dir: &Arc<Inode>, offset: usize) -> KResult<Option<DirEnt>> {
        with_dir(dir, |entries| {
            Ok(entries
                .iter()
                .nth(offset)
                .map(|(name, ino)| DirEnt {
                    ino: *ino,
                    name: name.clone(),
                }))
        })
    }

    fn file_ops(&self, _inode: &Arc<Inode>) -> &'static dyn FileOps {
        &RAMFS_FILE_OPS
    }
}

struct RamfsFileOps;
static RAMFS_FILE_OPS: RamfsFileOps = RamfsFileOps;

impl RamfsFileOps {
    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> KResult<usize> {
        let node = node_of(&file.inode).lock();
        match &*node {
            RamNode::File(bytes) => {
                let start = (offset as usize).min(bytes.len());
                let n = buf.len().min(bytes.len() - start);
                buf[..n].copy_from_slice(&bytes[start..start + n]);
                Ok(n)
            }
            RamNode::Dir(_) => Err(EISDIR),
            _ => Err(EINVAL),
        }
    }
}

impl FileOps for RamfsFileOps {
    fn read(&self, file: &File, buf: &mut [u8]) -> KResult<usize> {
        let mut offset = file.offset.lock();
        let n = self.read_at(file, buf, *offset)?;
        *offset += n as u64;
        Ok(n)
    }

    fn pread(&self, file: &File, buf: &mut [u8], offset: u64) -> KResult<usize> {
        self.read_at(file, buf, offset)
    }

    fn write(&self, file: &File, buf: &[u8]) -> KResult<usize> {
        let mut offset = file.offset.lock();
        let new_size = {
            let mut node = node_of(&file.inode).lock();
            match &mut *node {
                RamNode::File(bytes) => {
                    if file.append() {
                        *offset = bytes.len() as u64;
                    }
                    let start = *offset as usize;
                    if start + buf.len() > bytes.len() {
                        bytes.resize(start + buf.len(), 0);
                    }
                    bytes[start..start + buf.len()].copy_from_slice(buf);
                    bytes.len() as u64
                }
                RamNode::Dir(_) => return Err(EISDIR),
                _ => return Err(EINVAL),
            }
        };

        *offset += buf.len() as u64;
        {
            let mut body = file.inode.body.lock();
            body.size = new_size;
        }
        inode_set_dirty(&file.inode);
        Ok(buf.len())
    }

    fn readdir(&self, file: &File) -> KResult<Option<DirEnt>> {
        let mut offset = file.offset.lock();
        let entry = file.inode.ops.dirent_at(&file.inode, *offset as usize)?;
        if entry.is_some() {
            *offset += 1;
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sb() -> Arc<SuperBlock> {
        ramfs_create_sb().expect("no anon devices left")
    }

    #[test_case]
    fn root_is_a_directory() {
        let sb = test_sb();
        let root = crate::fs::super_block::sb_root(&sb).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.body.lock().nlinks, 2);
    }

    #[test_case]
    fn create_then_lookup() {
        let sb = test_sb();
        let root = crate::fs::super_block::sb_root(&sb).unwrap();
        let created = RAMFS_INODE_OPS.create(&root, "hello", 0o644).unwrap();
        let found = RAMFS_INODE_OPS.lookup(&root, "hello").unwrap();
        assert!(Arc::ptr_eq(&created, &found));
        assert!(RAMFS_INODE_OPS.lookup(&root, "missing").is_err());
    }

    #[test_case]
    fn rmdir_rejects_nonempty() {
        let sb = test_sb();
        let root = crate::fs::super_block::sb_root(&sb).unwrap();
        let dir = RAMFS_INODE_OPS.mkdir(&root, "d", 0o755).unwrap();
        RAMFS_INODE_OPS.create(&dir, "f", 0o644).unwrap();
        assert_eq!(RAMFS_INODE_OPS.rmdir(&root, "d"), Err(ENOTEMPTY));
        RAMFS_INODE_OPS.unlink(&dir, "f").unwrap();
        RAMFS_INODE_OPS.rmdir(&root, "d").unwrap();
    }
}
