//! Block devices.
//!
//! A `Disk` is the whole-device abstraction a driver registers: a name, a
//! capacity, an optional partition table, and the one operation the cache
//! needs, `sync_block`. Each registered disk produces one `BlockDevice` per
//! partition plus one for the whole disk, addressed by `(major, minor)`.
//!
//! Anonymous devices have no disk at all; they exist to give in-memory
//! filesystems a unique device identity, with minors handed out of a
//! bitmap.

pub mod bcache;
pub mod fops;
pub mod ramdisk;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use spin::Mutex;

use crate::errno::{KResult, EBUSY, ENODEV, ENXIO};

pub type Sector = u64;

/// Device identity, `(major, minor)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevId {
    pub major: u32,
    pub minor: u32,
}

impl DevId {
    pub const fn new(major: u32, minor: u32) -> DevId {
        DevId { major, minor }
    }
}

impl fmt::Debug for DevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Major reserved for anonymous (in-memory) devices.
pub const ANON_MAJOR: u32 = 0;
/// First real disk major.
pub const DISK_MAJOR: u32 = 8;

/// Default block size of cached devices.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// One partition: a sector window onto the disk.
#[derive(Debug, Clone, Copy)]
pub struct Partition {
    pub start: Sector,
    pub sectors: u64,
}

/// The single operation the core requires of a disk driver: bring `block`
/// in sync with the medium. Read when the block is not VALID, write when it
/// is DIRTY. The driver must mark the block synced and unlock it when the
/// I/O completes; completion may be asynchronous.
pub trait DiskOps: Send + Sync {
    fn sync_block(&self, disk: &Disk, block: &Arc<bcache::Block>);
}

pub struct Disk {
    pub name: String,
    pub major: u32,
    pub ops: alloc::boxed::Box<dyn DiskOps>,
    pub partitions: Vec<Partition>,
    /// Whole-disk capacity in sectors of `DEFAULT_BLOCK_SIZE`.
    pub capacity: u64,
}

/// A named endpoint over a disk (whole disk or one partition), or an
/// anonymous in-memory device.
pub struct BlockDevice {
    pub dev: DevId,
    disk: Option<Arc<Disk>>,
    /// `None` = whole disk.
    partition: Option<usize>,
    block_size: AtomicUsize,
    open_refs: AtomicU32,
}

impl BlockDevice {
    pub fn block_size(&self) -> usize {
        self.block_size.load(Ordering::Relaxed)
    }

    /// Change the cached block size; only valid with no cached blocks.
    pub fn set_block_size(&self, size: usize) {
        self.block_size.store(size, Ordering::Relaxed);
    }

    pub fn disk(&self) -> Option<&Arc<Disk>> {
        self.disk.as_ref()
    }

    pub fn is_anon(&self) -> bool {
        self.disk.is_none()
    }

    /// Capacity of this device in blocks.
    pub fn capacity_blocks(&self) -> u64 {
        match (&self.disk, self.partition) {
            (Some(disk), Some(idx)) => disk.partitions[idx].sectors,
            (Some(disk), None) => disk.capacity,
            (None, _) => 0,
        }
    }

    /// Translate a device-relative sector to a whole-disk sector.
    pub fn real_sector(&self, sector: Sector) -> Sector {
        match (&self.disk, self.partition) {
            (Some(disk), Some(idx)) => disk.partitions[idx].start + sector,
            _ => sector,
        }
    }

    pub fn open(&self) {
        self.open_refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn close(&self) {
        let prev = self.open_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced block device close");
    }
}

static DEVICES: Mutex<BTreeMap<DevId, Arc<BlockDevice>>> = Mutex::new(BTreeMap::new());

/// Register a disk; creates the whole-disk device at minor 0 and one device
/// per partition at the following minors.
pub fn disk_register(disk: Disk) -> Arc<Disk> {
    let disk = Arc::new(disk);
    let mut devices = DEVICES.lock();

    let whole = DevId::new(disk.major, 0);
    devices.insert(
        whole,
        Arc::new(BlockDevice {
            dev: whole,
            disk: Some(disk.clone()),
            partition: None,
            block_size: AtomicUsize::new(DEFAULT_BLOCK_SIZE),
            open_refs: AtomicU32::new(0),
        }),
    );

    for (idx, _part) in disk.partitions.iter().enumerate() {
        let dev = DevId::new(disk.major, idx as u32 + 1);
        devices.insert(
            dev,
            Arc::new(BlockDevice {
                dev,
                disk: Some(disk.clone()),
                partition: Some(idx),
                block_size: AtomicUsize::new(DEFAULT_BLOCK_SIZE),
                open_refs: AtomicU32::new(0),
            }),
        );
    }

    log::info!(
        "block: registered disk '{}' major {} ({} partitions, {} sectors)",
        disk.name,
        disk.major,
        disk.partitions.len(),
        disk.capacity
    );
    disk
}

/// Look up a device by id.
pub fn block_dev_get(dev: DevId) -> KResult<Arc<BlockDevice>> {
    DEVICES.lock().get(&dev).cloned().ok_or(ENODEV)
}

// ---------------------------------------------------------------------------
// Anonymous devices
// ---------------------------------------------------------------------------

const ANON_MINORS: usize = 256;

static ANON_BITMAP: Mutex<[u64; ANON_MINORS / 64]> = Mutex::new([0; ANON_MINORS / 64]);

/// Allocate an anonymous device for an in-memory filesystem.
pub fn block_dev_anon_get() -> KResult<Arc<BlockDevice>> {
    let minor = {
        let mut bitmap = ANON_BITMAP.lock();
        let mut found = None;
        'scan: for (word_idx, word) in bitmap.iter_mut().enumerate() {
            if *word != u64::MAX {
                for bit in 0..64 {
                    if *word & (1 << bit) == 0 {
                        *word |= 1 << bit;
                        found = Some(word_idx * 64 + bit);
                        break 'scan;
                    }
                }
            }
        }
        found.ok_or(ENXIO)?
    };

    let dev = DevId::new(ANON_MAJOR, minor as u32);
    let bdev = Arc::new(BlockDevice {
        dev,
        disk: None,
        partition: None,
        block_size: AtomicUsize::new(DEFAULT_BLOCK_SIZE),
        open_refs: AtomicU32::new(0),
    });
    DEVICES.lock().insert(dev, bdev.clone());
    Ok(bdev)
}

/// Release an anonymous device minor.
pub fn block_dev_anon_put(bdev: &Arc<BlockDevice>) -> KResult<()> {
    if !bdev.is_anon() {
        return Err(ENODEV);
    }
    if bdev.open_refs.load(Ordering::Acquire) != 0 {
        return Err(EBUSY);
    }

    DEVICES.lock().remove(&bdev.dev);
    let minor = bdev.dev.minor as usize;
    let mut bitmap = ANON_BITMAP.lock();
    bitmap[minor / 64] &= !(1 << (minor % 64));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn anon_minors_are_unique() {
        let a = block_dev_anon_get().unwrap();
        let b = block_dev_anon_get().unwrap();
        assert_ne!(a.dev, b.dev);
        assert_eq!(a.dev.major, ANON_MAJOR);

        block_dev_anon_put(&a).unwrap();
        block_dev_anon_put(&b).unwrap();
    }

    #[test_case]
    fn anon_minor_is_reused_after_put() {
        let a = block_dev_anon_get().unwrap();
        let minor = a.dev.minor;
        block_dev_anon_put(&a).unwrap();
        let b = block_dev_anon_get().unwrap();
        assert_eq!(b.dev.minor, minor);
        block_dev_anon_put(&b).unwrap();
    }
}
