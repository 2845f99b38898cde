//! procfs: a read-mostly view of kernel state.
//!
//! A nodev filesystem on an anonymous device. The entry table is static at
//! its core (mounts, tasks, task_api) and open for registration, which is
//! how external subsystems (the network stack's netdev/route views) attach
//! their own entries without the core knowing about them.

pub mod mounts;
pub mod task_api;
pub mod tasks;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::file::{FileOps, FilePrivate};
use super::inode::{inode_get, DirEnt, Ino, Inode, InodeData, InodeOps, S_IFDIR, S_IFREG};
use super::seq_file::{SeqFileOps, SeqState};
use super::super_block::{SbData, SuperBlock, SuperBlockOps};
use crate::errno::{KResult, EIO, ENOENT, ENOTSUP};

pub const PROCFS_ROOT_INO: Ino = 1;
const PROCFS_FIRST_ENTRY_INO: Ino = 2;

/// How an entry produces its file.
pub enum ProcKind {
    /// Rendered text through the seq_file scaffold.
    Seq(&'static SeqFileOps),
    /// Fully custom file operations (binary streams, ioctl surfaces).
    File(&'static dyn FileOps),
}

pub struct ProcEntry {
    pub name: &'static str,
    pub kind: ProcKind,
}

impl ProcEntry {
    pub fn file_setup(&'static self) -> (&'static dyn FileOps, FilePrivate) {
        match &self.kind {
            ProcKind::Seq(seq_ops) => (*seq_ops, FilePrivate::Seq(Mutex::new(SeqState::new()))),
            ProcKind::File(ops) => (*ops, task_api::private_for(self)),
        }
    }
}

static ENTRIES: Mutex<Vec<&'static ProcEntry>> = Mutex::new(Vec::new());

/// Register a proc entry. Core entries register at init; collaborator
/// subsystems may add theirs at any point before first lookup.
pub fn proc_register(entry: &'static ProcEntry) {
    let mut entries = ENTRIES.lock();
    if entries.iter().any(|e| e.name == entry.name) {
        log::warn!("procfs: duplicate entry '{}' ignored", entry.name);
        return;
    }
    entries.push(entry);
}

fn entry_by_ino(ino: Ino) -> Option<&'static ProcEntry> {
    let idx = ino.checked_sub(PROCFS_FIRST_ENTRY_INO)? as usize;
    ENTRIES.lock().get(idx).copied()
}

fn entry_ino_by_name(name: &str) -> Option<Ino> {
    let entries = ENTRIES.lock();
    entries
        .iter()
        .position(|e| e.name == name)
        .map(|idx| idx as Ino + PROCFS_FIRST_ENTRY_INO)
}

struct ProcfsSbOps;
static PROCFS_SB_OPS: ProcfsSbOps = ProcfsSbOps;

impl SuperBlockOps for ProcfsSbOps {
    fn inode_alloc(&self, sb: &Arc<SuperBlock>, ino: Ino) -> KResult<Arc<Inode>> {
        let data = if ino == PROCFS_ROOT_INO {
            InodeData::None
        } else {
            InodeData::Proc(entry_by_ino(ino).ok_or(ENOENT)?)
        };
        Ok(Inode::new(sb, ino, &PROCFS_INODE_OPS, data))
    }

    fn inode_read(&self, _sb: &Arc<SuperBlock>, inode: &Arc<Inode>) -> KResult<()> {
        let mut body = inode.body.lock();
        if inode.ino == PROCFS_ROOT_INO {
            body.mode = S_IFDIR | 0o555;
            body.nlinks = 2;
        } else {
            entry_by_ino(inode.ino).ok_or(ENOENT)?;
            body.mode = S_IFREG | 0o444;
            body.nlinks = 1;
        }
        Ok(())
    }
}

struct ProcfsInodeOps;
static PROCFS_INODE_OPS: ProcfsInodeOps = ProcfsInodeOps;

impl InodeOps for ProcfsInodeOps {
    fn lookup(&self, dir: &Arc<Inode>, name: &str) -> KResult<Arc<Inode>> {
        if dir.ino != PROCFS_ROOT_INO {
            return Err(ENOENT);
        }
        let sb = dir.superblock().ok_or(EIO)?;
        let ino = entry_ino_by_name(name).ok_or(ENOENT)?;
        inode_get(&sb, ino)
    }

    fn dirent_at(&self, dir: &Arc<Inode>, offset: usize) -> KResult<Option<DirEnt>> {
        if dir.ino != PROCFS_ROOT_INO {
            return Err(ENOTSUP);
        }
        match offset {
            0 => Ok(Some(DirEnt {
                ino: PROCFS_ROOT_INO,
                name: String::from("."),
            })),
            1 => Ok(Some(DirEnt {
                ino: PROCFS_ROOT_INO,
                name: String::from(".."),
            })),
            n => {
                let entries = ENTRIES.lock();
                Ok(entries.get(n - 2).map(|e| DirEnt {
                    ino: (n - 2) as Ino + PROCFS_FIRST_ENTRY_INO,
                    name: e.name.to_string(),
                }))
            }
        }
    }

    fn file_ops(&self, inode: &Arc<Inode>) -> &'static dyn FileOps {
        match &inode.data {
            InodeData::Proc(entry) => match &entry.kind {
                ProcKind::Seq(seq_ops) => *seq_ops,
                ProcKind::File(ops) => *ops,
            },
            // The root directory only needs readdir.
            _ => &PROCFS_DIR_FILE_OPS,
        }
    }
}

struct ProcfsDirFileOps;
static PROCFS_DIR_FILE_OPS: ProcfsDirFileOps = ProcfsDirFileOps;

impl FileOps for ProcfsDirFileOps {
    fn readdir(
        &self,
        file: &super::file::File,
    ) -> KResult<Option<DirEnt>> {
        let mut offset = file.offset.lock();
        let entry = file.inode.ops.dirent_at(&file.inode, *offset as usize)?;
        if entry.is_some() {
            *offset += 1;
        }
        Ok(entry)
    }
}

/// Create the procfs superblock (nodev, anonymous device) and register the
/// core entries.
pub fn procfs_create_sb() -> KResult<Arc<SuperBlock>> {
    proc_register(&mounts::MOUNTS_ENTRY);
    proc_register(&tasks::TASKS_ENTRY);
    proc_register(&task_api::TASK_API_ENTRY);

    let bdev = crate::block::block_dev_anon_get()?;
    Ok(SuperBlock::new(
        Some(bdev),
        PROCFS_ROOT_INO,
        &PROCFS_SB_OPS,
        "procfs",
        SbData::None,
    ))
}

impl core::fmt::Debug for ProcEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ProcEntry({})", self.name)
    }
}
