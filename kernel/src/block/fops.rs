//! Block-device file operations.
//!
//! Exposes a block device as a seekable byte stream: an offset splits into
//! `(sector, offset_in_block)` and each iteration copies at most one block,
//! so every access goes through the cache and participates in write-back.

use alloc::sync::Arc;

use super::bcache::{block_read, block_unlockput};
use super::BlockDevice;
use crate::errno::{KResult, ENXIO};
use crate::fs::file::{File, FileOps, SEEK_CUR, SEEK_END, SEEK_SET};

fn bdev_of(file: &File) -> KResult<Arc<BlockDevice>> {
    let rdev = file.inode.body.lock().rdev.ok_or(ENXIO)?;
    super::block_dev_get(rdev)
}

fn rw_at(
    bdev: &Arc<BlockDevice>,
    offset: u64,
    buf: &mut [u8],
    write_data: Option<&[u8]>,
) -> KResult<usize> {
    let block_size = bdev.block_size() as u64;
    let capacity_bytes = bdev.capacity_blocks() * block_size;
    let len = match write_data {
        Some(data) => data.len(),
        None => buf.len(),
    };

    if offset >= capacity_bytes {
        return Ok(0);
    }
    let len = len.min((capacity_bytes - offset) as usize);

    let mut done = 0usize;
    while done < len {
        let pos = offset + done as u64;
        let sector = pos / block_size;
        let in_block = (pos % block_size) as usize;
        let chunk = (block_size as usize - in_block).min(len - done);

        let block = block_read(bdev, sector);
        // SAFETY: block_read returned the block locked by us.
        let data = unsafe { block.data() };

        match write_data {
            Some(src) => {
                data[in_block..in_block + chunk].copy_from_slice(&src[done..done + chunk]);
                block.mark_dirty();
            }
            None => {
                buf[done..done + chunk].copy_from_slice(&data[in_block..in_block + chunk]);
            }
        }

        block_unlockput(block);
        done += chunk;
    }

    Ok(done)
}

struct BlockFileOps;
static BLOCK_FILE_OPS: BlockFileOps = BlockFileOps;

pub fn block_file_ops() -> &'static dyn FileOps {
    &BLOCK_FILE_OPS
}

impl FileOps for BlockFileOps {
    fn read(&self, file: &File, buf: &mut [u8]) -> KResult<usize> {
        let bdev = bdev_of(file)?;
        let mut offset = file.offset.lock();
        let n = rw_at(&bdev, *offset, buf, None)?;
        *offset += n as u64;
        Ok(n)
    }

    fn pread(&self, file: &File, buf: &mut [u8], offset: u64) -> KResult<usize> {
        let bdev = bdev_of(file)?;
        rw_at(&bdev, offset, buf, None)
    }

    fn write(&self, file: &File, buf: &[u8]) -> KResult<usize> {
        let bdev = bdev_of(file)?;
        let mut offset = file.offset.lock();
        let n = rw_at(&bdev, *offset, &mut [], Some(buf))?;
        *offset += n as u64;
        Ok(n)
    }

    fn lseek(&self, file: &File, offset: i64, whence: u32) -> KResult<u64> {
        let bdev = bdev_of(file)?;
        let size = bdev.capacity_blocks() * bdev.block_size() as u64;

        let mut off = file.offset.lock();
        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => *off as i64,
            SEEK_END => size as i64,
            _ => return Err(crate::errno::EINVAL),
        };
        let target = base.checked_add(offset).ok_or(crate::errno::EINVAL)?;
        if target < 0 {
            return Err(crate::errno::EINVAL);
        }
        *off = target as u64;
        Ok(*off)
    }

    fn release(&self, file: &File) {
        if let Ok(bdev) = bdev_of(file) {
            bdev.close();
        }
    }
}
