//! Filesystem-wide sync.
//!
//! `sys_sync` makes a blocking pass: write back every superblock's dirty
//! inodes, flush superblock metadata, then push all dirty cache blocks to
//! their devices and wait. The periodic variant is the block cache's
//! bdflush delayed work.

use crate::errno::KResult;

pub fn vfs_sync_all(wait: bool) -> KResult<()> {
    let mut err = Ok(());

    for sb in super::super_block::mounted_superblocks() {
        if let Err(e) = super::super_block::sb_sync_inodes(&sb) {
            if err.is_ok() {
                err = Err(e);
            }
        }
        if let Err(e) = sb.ops.sb_write(&sb) {
            if err.is_ok() {
                err = Err(e);
            }
        }
    }

    crate::block::bcache::block_sync_all(wait);
    err
}
