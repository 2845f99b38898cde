//! Block cache coherency over the ramdisk.

use alloc::sync::Arc;

use crate::block::bcache::{
    block_dev_clear, block_get, block_getlock, block_read, block_sync_all, block_unlockput,
};
use crate::block::{block_dev_get, BlockDevice, DevId, DISK_MAJOR};

fn test_bdev() -> Arc<BlockDevice> {
    block_dev_get(DevId::new(DISK_MAJOR, 0)).expect("ramdisk not registered")
}

/// Write through the cache, sync, drop the cached copy, and read back from
/// the device.
pub fn test_write_back_coherency() {
    let bdev = test_bdev();

    let block = block_getlock(&bdev, 0);
    {
        // SAFETY: we hold the block lock.
        let data = unsafe { block.data() };
        data[..4].copy_from_slice(b"abcd");
    }
    block.mark_dirty();
    block_unlockput(block);

    block_sync_all(true);
    block_dev_clear(&bdev);

    let reread = block_read(&bdev, 0);
    {
        // SAFETY: block_read hands the block back locked by us.
        let data = unsafe { reread.data() };
        assert_eq!(&data[..4], b"abcd");
    }
    block_unlockput(reread);
}

pub fn test_unlockput_leaves_unlocked() {
    let bdev = test_bdev();

    let block = block_getlock(&bdev, 7);
    assert!(block.is_locked());
    let probe = block.clone();
    block_unlockput(block);
    assert!(!probe.is_locked());

    // A second lock round-trip must go through cleanly.
    let again = block_get(&bdev, 7);
    assert!(again.try_lock());
    again.unlock();
}

/// The byte-stream file ops split offsets across block boundaries.
pub fn test_byte_stream_fops() {
    let bdev = test_bdev();
    let block_size = bdev.block_size() as u64;

    // Straddle the 2/3 block boundary.
    let payload = b"boundary-crossing-payload";
    let offset = block_size * 3 - 10;

    // Write through the cache directly, as the raw device file would.
    let mut written = 0usize;
    while written < payload.len() {
        let pos = offset + written as u64;
        let sector = pos / block_size;
        let in_block = (pos % block_size) as usize;
        let chunk = (block_size as usize - in_block).min(payload.len() - written);

        let block = block_read(&bdev, sector);
        {
            // SAFETY: locked by block_read.
            let data = unsafe { block.data() };
            data[in_block..in_block + chunk]
                .copy_from_slice(&payload[written..written + chunk]);
        }
        block.mark_dirty();
        block_unlockput(block);
        written += chunk;
    }

    block_sync_all(true);
    block_dev_clear(&bdev);

    // Read back across the boundary.
    let mut readback = alloc::vec![0u8; payload.len()];
    let mut done = 0usize;
    while done < payload.len() {
        let pos = offset + done as u64;
        let sector = pos / block_size;
        let in_block = (pos % block_size) as usize;
        let chunk = (block_size as usize - in_block).min(payload.len() - done);

        let block = block_read(&bdev, sector);
        {
            // SAFETY: locked by block_read.
            let data = unsafe { block.data() };
            readback[done..done + chunk].copy_from_slice(&data[in_block..in_block + chunk]);
        }
        block_unlockput(block);
        done += chunk;
    }

    assert_eq!(&readback[..], payload);
}
