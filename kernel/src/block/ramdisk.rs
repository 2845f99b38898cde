//! Memory-backed disk.
//!
//! Backs the root filesystem image and the block-layer tests. I/O is
//! synchronous: `sync_block` copies between the block buffer and the
//! backing store, marks the block synced, and unlocks it before returning,
//! which satisfies the async completion contract trivially.

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::bcache::Block;
use super::{disk_register, Disk, DiskOps, DEFAULT_BLOCK_SIZE, DISK_MAJOR};

pub struct RamDisk {
    store: Mutex<Vec<u8>>,
}

impl RamDisk {
    fn byte_range(&self, block: &Block) -> (usize, usize) {
        let start = block.real_sector as usize * block.block_size;
        (start, start + block.block_size)
    }
}

impl DiskOps for RamDisk {
    fn sync_block(&self, _disk: &Disk, block: &Arc<Block>) {
        let (start, end) = self.byte_range(block);
        let mut store = self.store.lock();

        if end > store.len() {
            // Past-capacity I/O reads as a zero-filled hole.
            store.resize(end, 0);
        }

        // SAFETY: the locker handed us this block via submit(); we act as
        // its delegate until we unlock below.
        let data = unsafe { block.data() };

        if block.is_dirty() {
            store[start..end].copy_from_slice(data);
        } else if !block.is_valid() {
            data.copy_from_slice(&store[start..end]);
        }

        block.mark_synced();
        block.unlock();
    }
}

/// Create and register a ramdisk of `blocks` cache blocks.
pub fn ramdisk_register(index: u32, blocks: u64) -> Arc<Disk> {
    let bytes = blocks as usize * DEFAULT_BLOCK_SIZE;
    let disk = Disk {
        name: format!("rd{}", index),
        major: DISK_MAJOR + index,
        ops: Box::new(RamDisk {
            store: Mutex::new(vec![0u8; bytes]),
        }),
        partitions: Vec::new(),
        capacity: blocks,
    };
    disk_register(disk)
}
