//! The virtual file system.
//!
//! Filesystem types register by name; `nodev` types (ramfs, procfs) take
//! no source device and get an anonymous one from the block layer. The
//! root mount is bootstrapped at init and seeds PID 1's cwd.

pub mod access;
pub mod fd;
pub mod file;
pub mod inode;
pub mod namei;
pub mod pipe;
pub mod poll;
pub mod procfs;
pub mod ramfs;
pub mod seq_file;
pub mod stat;
pub mod super_block;
pub mod sync;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::block::BlockDevice;
use crate::errno::{KResult, ENODEV};
use super_block::SuperBlock;

/// A mountable filesystem type.
pub trait FilesystemType: Send + Sync {
    fn name(&self) -> &'static str;
    /// nodev types accept no source device.
    fn nodev(&self) -> bool;
    /// Build the superblock. `bdev` is `None` exactly for nodev types.
    fn read_super(&self, bdev: Option<Arc<BlockDevice>>) -> KResult<Arc<SuperBlock>>;
}

static FILESYSTEMS: Mutex<Vec<&'static dyn FilesystemType>> = Mutex::new(Vec::new());

pub fn register_filesystem(fs: &'static dyn FilesystemType) {
    log::info!("vfs: filesystem '{}' registered", fs.name());
    FILESYSTEMS.lock().push(fs);
}

pub fn find_filesystem(name: &str) -> KResult<&'static dyn FilesystemType> {
    FILESYSTEMS
        .lock()
        .iter()
        .copied()
        .find(|fs| fs.name() == name)
        .ok_or(ENODEV)
}

struct RamfsType;
static RAMFS_TYPE: RamfsType = RamfsType;

impl FilesystemType for RamfsType {
    fn name(&self) -> &'static str {
        "ramfs"
    }
    fn nodev(&self) -> bool {
        true
    }
    fn read_super(&self, _bdev: Option<Arc<BlockDevice>>) -> KResult<Arc<SuperBlock>> {
        ramfs::ramfs_create_sb()
    }
}

struct ProcfsType;
static PROCFS_TYPE: ProcfsType = ProcfsType;

impl FilesystemType for ProcfsType {
    fn name(&self) -> &'static str {
        "procfs"
    }
    fn nodev(&self) -> bool {
        true
    }
    fn read_super(&self, _bdev: Option<Arc<BlockDevice>>) -> KResult<Arc<SuperBlock>> {
        procfs::procfs_create_sb()
    }
}

/// Register the built-in filesystems and bring up the root mount (ramfs)
/// with /proc mounted on top.
pub fn init() -> KResult<()> {
    register_filesystem(&RAMFS_TYPE);
    register_filesystem(&PROCFS_TYPE);

    // Root mount: ramfs, no covered inode.
    let root_sb = RAMFS_TYPE.read_super(None)?;
    super_block::vfs_mount(None, root_sb, String::from("none"), String::new())?;

    // Skeleton tree + /proc.
    let root = super_block::root_inode()?;
    let proc_dir = root.ops.mkdir(&root, "proc", 0o555)?;
    root.ops.mkdir(&root, "dev", 0o755)?;
    root.ops.mkdir(&root, "tmp", 0o777)?;

    let proc_sb = PROCFS_TYPE.read_super(None)?;
    super_block::vfs_mount(
        Some(proc_dir),
        proc_sb,
        String::from("proc"),
        String::from("/proc"),
    )?;

    log::info!("vfs: root filesystem mounted");
    Ok(())
}
