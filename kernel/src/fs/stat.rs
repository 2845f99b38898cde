//! stat(2) structures.

use alloc::sync::Arc;

use super::inode::Inode;

/// Userspace stat record.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Stat {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u64,
    pub st_size: u64,
    pub st_blksize: u32,
    pub st_blocks: u64,
    pub st_atime: u64,
    pub st_mtime: u64,
    pub st_ctime: u64,
}

fn dev_encode(dev: crate::block::DevId) -> u64 {
    ((dev.major as u64) << 32) | dev.minor as u64
}

/// Fill a stat record from an inode.
pub fn stat_fill(inode: &Arc<Inode>) -> Stat {
    let body = inode.body.lock();
    let st_dev = inode
        .superblock()
        .and_then(|sb| sb.dev.as_ref().map(|d| dev_encode(d.dev)))
        .unwrap_or(0);

    Stat {
        st_dev,
        st_ino: inode.ino,
        st_mode: body.mode,
        st_nlink: body.nlinks,
        st_uid: body.uid,
        st_gid: body.gid,
        st_rdev: body.rdev.map(dev_encode).unwrap_or(0),
        st_size: body.size,
        st_blksize: crate::block::DEFAULT_BLOCK_SIZE as u32,
        st_blocks: body.blocks,
        st_atime: body.atime,
        st_mtime: body.mtime,
        st_ctime: body.ctime,
    }
}
