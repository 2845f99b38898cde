//! The block cache.
//!
//! Cached blocks are keyed by `(device, sector)` in a global hash map with
//! a global LRU. Block state is three flags with a small legal transition
//! set:
//!
//! ```text
//!    {0} -> LOCKED <-> VALID -> VALID+LOCKED <-> VALID+DIRTY
//!                                 <-> VALID+DIRTY+LOCKED
//! ```
//!
//! `VALID` means the data mirrors the disk, `DIRTY` that it has been
//! modified since, `LOCKED` that exactly one holder may touch the data.
//! Only the locker may set or clear `VALID`/`DIRTY`; the flags word itself
//! is protected by the per-block flags lock, and lock waiters queue on the
//! block's flags queue.
//!
//! The cache is bounded: past `BLOCK_CACHE_MAX_SIZE` entries a shrink pass
//! walks the LRU tail and drops up to `BLOCK_CACHE_SHRINK_COUNT` blocks
//! that are unlocked, unwaited, clean, and unreferenced. Under sustained
//! lock pressure the pass may free nothing; that matches the source and is
//! deliberate.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use spin::Mutex;

use super::{BlockDevice, DevId, Sector};
use crate::spinlock::Spinlock;
use crate::task::waitqueue::WaitQueue;
use crate::task::workqueue::DelayWork;

pub const BLOCK_CACHE_MAX_SIZE: usize = 4096;
pub const BLOCK_CACHE_SHRINK_COUNT: usize = 64;

/// Write-back cadence of the background flush.
const BDFLUSH_INTERVAL_MS: u64 = 5000;

const BLOCK_VALID: u8 = 1 << 0;
const BLOCK_DIRTY: u8 = 1 << 1;
const BLOCK_LOCKED: u8 = 1 << 2;

pub struct Block {
    pub sector: Sector,
    /// Sector with partition offset applied; what the driver seeks to.
    pub real_sector: Sector,
    pub block_size: usize,
    bdev: Arc<BlockDevice>,

    flags: Spinlock<u8>,
    flags_queue: WaitQueue,

    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: `data` is only touched by the holder of BLOCK_LOCKED (enforced by
// convention across the cache and the disk drivers); all other fields are
// locked or immutable.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    fn new(bdev: &Arc<BlockDevice>, sector: Sector) -> Arc<Block> {
        let block_size = bdev.block_size();
        Arc::new(Block {
            sector,
            real_sector: bdev.real_sector(sector),
            block_size,
            bdev: bdev.clone(),
            flags: Spinlock::new(0),
            flags_queue: WaitQueue::new(),
            data: UnsafeCell::new(vec![0u8; block_size].into_boxed_slice()),
        })
    }

    pub fn bdev(&self) -> &Arc<BlockDevice> {
        &self.bdev
    }

    /// Raw data access.
    ///
    /// # Safety
    ///
    /// The caller must hold this block's lock (`BLOCK_LOCKED` set by it).
    pub unsafe fn data(&self) -> &mut [u8] {
        &mut *self.data.get()
    }

    pub fn is_valid(&self) -> bool {
        *self.flags.lock() & BLOCK_VALID != 0
    }

    pub fn is_dirty(&self) -> bool {
        *self.flags.lock() & BLOCK_DIRTY != 0
    }

    pub fn is_locked(&self) -> bool {
        *self.flags.lock() & BLOCK_LOCKED != 0
    }

    pub fn has_waiters(&self) -> bool {
        self.flags_queue.waiting()
    }

    /// Mark modified since disk. Locker only.
    pub fn mark_dirty(&self) {
        *self.flags.lock() |= BLOCK_DIRTY;
    }

    /// Mark in sync with disk (driver I/O completion). Locker only.
    pub fn mark_synced(&self) {
        let mut flags = self.flags.lock();
        *flags |= BLOCK_VALID;
        *flags &= !BLOCK_DIRTY;
    }

    /// Wait until this block is unlocked, then lock it.
    pub fn lock(&self) {
        self.flags_queue.wait_event(|| {
            let mut flags = self.flags.lock();
            if *flags & BLOCK_LOCKED == 0 {
                *flags |= BLOCK_LOCKED;
                true
            } else {
                false
            }
        });
    }

    pub fn try_lock(&self) -> bool {
        let mut flags = self.flags.lock();
        if *flags & BLOCK_LOCKED == 0 {
            *flags |= BLOCK_LOCKED;
            true
        } else {
            false
        }
    }

    /// Unlock and wake lock/sync waiters.
    pub fn unlock(&self) {
        {
            let mut flags = self.flags.lock();
            debug_assert!(*flags & BLOCK_LOCKED != 0);
            *flags &= !BLOCK_LOCKED;
        }
        self.flags_queue.wake();
    }

    /// Block until `VALID && !DIRTY` holds.
    pub fn wait_for_sync(&self) {
        self.flags_queue.wait_event(|| {
            let flags = self.flags.lock();
            *flags & BLOCK_VALID != 0 && *flags & BLOCK_DIRTY == 0
        });
    }
}

struct BcacheInner {
    map: BTreeMap<(DevId, Sector), Arc<Block>>,
    /// Most-recently used at the back.
    lru: VecDeque<(DevId, Sector)>,
}

static BCACHE: Mutex<BcacheInner> = Mutex::new(BcacheInner {
    map: BTreeMap::new(),
    lru: VecDeque::new(),
});

fn lru_touch(inner: &mut BcacheInner, key: (DevId, Sector)) {
    if let Some(pos) = inner.lru.iter().position(|k| *k == key) {
        inner.lru.remove(pos);
    }
    inner.lru.push_back(key);
}

/// Drop up to `BLOCK_CACHE_SHRINK_COUNT` evictable blocks from the LRU
/// tail. A block is evictable when nothing references it beyond the cache,
/// it is unlocked, clean, and nobody waits on it.
fn shrink(inner: &mut BcacheInner) {
    let mut freed = 0;
    let mut idx = 0;
    while idx < inner.lru.len() && freed < BLOCK_CACHE_SHRINK_COUNT {
        let key = inner.lru[idx];
        let evictable = match inner.map.get(&key) {
            Some(block) => {
                Arc::strong_count(block) == 1
                    && !block.is_locked()
                    && !block.has_waiters()
                    && !block.is_dirty()
            }
            None => true,
        };
        if evictable {
            inner.map.remove(&key);
            inner.lru.remove(idx);
            freed += 1;
        } else {
            idx += 1;
        }
    }
}

/// Look up or create the cached block for `(bdev, sector)`. The returned
/// block holds a new reference and is not locked.
pub fn block_get(bdev: &Arc<BlockDevice>, sector: Sector) -> Arc<Block> {
    let key = (bdev.dev, sector);
    let mut inner = BCACHE.lock();

    if let Some(block) = inner.map.get(&key).cloned() {
        lru_touch(&mut inner, key);
        return block;
    }

    let block = Block::new(bdev, sector);
    inner.map.insert(key, block.clone());
    inner.lru.push_back(key);

    if inner.map.len() > BLOCK_CACHE_MAX_SIZE {
        shrink(&mut inner);
    }

    block
}

/// `block_get` followed by `lock`.
pub fn block_getlock(bdev: &Arc<BlockDevice>, sector: Sector) -> Arc<Block> {
    let block = block_get(bdev, sector);
    block.lock();
    block
}

/// Unlock then drop the reference.
pub fn block_unlockput(block: Arc<Block>) {
    block.unlock();
    drop(block);
}

/// Hand a locked block to its driver if it needs I/O, else just unlock.
/// The driver marks it synced and unlocks when the I/O completes.
pub fn block_submit(block: &Arc<Block>) {
    debug_assert!(block.is_locked());

    let needs_io = {
        let flags = block.flags.lock();
        *flags & BLOCK_VALID == 0 || *flags & BLOCK_DIRTY != 0
    };

    if !needs_io {
        block.unlock();
        return;
    }

    match block.bdev.disk() {
        Some(disk) => disk.ops.sync_block(disk, block),
        None => {
            // Anonymous devices have no medium; their blocks are always in
            // sync by definition.
            block.mark_synced();
            block.unlock();
        }
    }
}

/// Fetch a block with valid contents: lock it, issue the read if needed,
/// and return it locked.
pub fn block_read(bdev: &Arc<BlockDevice>, sector: Sector) -> Arc<Block> {
    let block = block_getlock(bdev, sector);
    if !block.is_valid() {
        block_submit(&block);
        block.wait_for_sync();
        block.lock();
    }
    block
}

/// Write back every dirty block; with `wait`, don't return until each one
/// has hit the medium.
pub fn block_sync_all(wait: bool) {
    let blocks: Vec<Arc<Block>> = {
        let inner = BCACHE.lock();
        inner.map.values().cloned().collect()
    };

    for block in blocks {
        if !block.is_dirty() {
            continue;
        }
        block.lock();
        block_submit(&block);
        if wait {
            block.wait_for_sync();
        }
    }
}

/// Drop every cached block of one device. Callers must have synced first;
/// locked or dirty blocks are skipped.
pub fn block_dev_clear(bdev: &Arc<BlockDevice>) {
    let mut inner = BCACHE.lock();
    let keys: Vec<(DevId, Sector)> = inner
        .map
        .iter()
        .filter(|((dev, _), block)| {
            *dev == bdev.dev
                && Arc::strong_count(block) == 1
                && !block.is_locked()
                && !block.is_dirty()
                && !block.has_waiters()
        })
        .map(|(key, _)| *key)
        .collect();
    for key in keys {
        inner.map.remove(&key);
        if let Some(pos) = inner.lru.iter().position(|k| *k == key) {
            inner.lru.remove(pos);
        }
    }
}

pub fn cached_block_count() -> usize {
    BCACHE.lock().map.len()
}

// ---------------------------------------------------------------------------
// Background flush
// ---------------------------------------------------------------------------

static BDFLUSH: conquer_once::spin::OnceCell<DelayWork> = conquer_once::spin::OnceCell::uninit();

/// Start the periodic write-back: a delayed work item that re-arms itself.
pub fn bdflush_init() {
    let work = BDFLUSH.get_or_init(|| {
        DelayWork::new("bdflush", || {
            block_sync_all(false);
            if let Ok(work) = BDFLUSH.try_get() {
                work.schedule_ms(BDFLUSH_INTERVAL_MS);
            }
        })
    });
    work.schedule_ms(BDFLUSH_INTERVAL_MS);
    log::info!("bdflush armed ({} ms interval)", BDFLUSH_INTERVAL_MS);
}
