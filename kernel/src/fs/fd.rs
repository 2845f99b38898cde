//! Per-task file-descriptor tables.
//!
//! A fixed array of `NOFILE` slots plus a close-on-exec bitset. Slot
//! reservation takes the table lock, stores a sentinel, and releases; the
//! caller installs the real file afterwards, so a concurrent opener can
//! never be handed the same index.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use super::file::File;
use crate::errno::{KResult, EBADF, EMFILE};

pub const NOFILE: usize = 32;

enum Slot {
    Empty,
    /// Index reserved by an in-flight open.
    Reserved,
    Open(Arc<File>),
}

impl Slot {
    fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }
}

pub struct FdTable {
    slots: Mutex<[Slot; NOFILE]>,
    close_on_exec: AtomicU32,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable {
            slots: Mutex::new(core::array::from_fn(|_| Slot::Empty)),
            close_on_exec: AtomicU32::new(0),
        }
    }

    /// Reserve the lowest empty slot; the caller must `assign` or `release`
    /// it.
    pub fn get_empty(&self) -> KResult<usize> {
        let mut slots = self.slots.lock();
        for (fd, slot) in slots.iter_mut().enumerate() {
            if slot.is_empty() {
                *slot = Slot::Reserved;
                return Ok(fd);
            }
        }
        Err(EMFILE)
    }

    /// Like `get_empty` but starting the scan at `min` (dup fcntl-style).
    pub fn get_empty_from(&self, min: usize) -> KResult<usize> {
        if min >= NOFILE {
            return Err(EMFILE);
        }
        let mut slots = self.slots.lock();
        for fd in min..NOFILE {
            if slots[fd].is_empty() {
                slots[fd] = Slot::Reserved;
                return Ok(fd);
            }
        }
        Err(EMFILE)
    }

    /// Install `file` into a reserved or empty slot.
    pub fn assign(&self, fd: usize, file: Arc<File>) {
        let mut slots = self.slots.lock();
        debug_assert!(!matches!(slots[fd], Slot::Open(_)), "fd {} double assign", fd);
        slots[fd] = Slot::Open(file);
    }

    /// Drop a reservation without installing a file.
    pub fn unreserve(&self, fd: usize) {
        let mut slots = self.slots.lock();
        if matches!(slots[fd], Slot::Reserved) {
            slots[fd] = Slot::Empty;
        }
    }

    pub fn get(&self, fd: usize) -> KResult<Arc<File>> {
        if fd >= NOFILE {
            return Err(EBADF);
        }
        match &self.slots.lock()[fd] {
            Slot::Open(file) => Ok(file.clone()),
            _ => Err(EBADF),
        }
    }

    /// Clear a slot, returning the file (the caller drops the reference).
    pub fn remove(&self, fd: usize) -> KResult<Arc<File>> {
        if fd >= NOFILE {
            return Err(EBADF);
        }
        let mut slots = self.slots.lock();
        match core::mem::replace(&mut slots[fd], Slot::Empty) {
            Slot::Open(file) => {
                self.clear_cloexec(fd);
                Ok(file)
            }
            other => {
                slots[fd] = other;
                Err(EBADF)
            }
        }
    }

    /// Replace a slot's file (dup2 target), returning any previous file.
    pub fn replace(&self, fd: usize, file: Arc<File>) -> KResult<Option<Arc<File>>> {
        if fd >= NOFILE {
            return Err(EBADF);
        }
        let mut slots = self.slots.lock();
        let prev = match core::mem::replace(&mut slots[fd], Slot::Open(file)) {
            Slot::Open(prev) => Some(prev),
            _ => None,
        };
        self.clear_cloexec(fd);
        Ok(prev)
    }

    pub fn set_cloexec(&self, fd: usize) {
        self.close_on_exec.fetch_or(1 << fd, Ordering::Relaxed);
    }

    pub fn clear_cloexec(&self, fd: usize) {
        self.close_on_exec.fetch_and(!(1 << fd), Ordering::Relaxed);
    }

    pub fn is_cloexec(&self, fd: usize) -> bool {
        self.close_on_exec.load(Ordering::Relaxed) & (1 << fd) != 0
    }

    /// Fork: share every open file (bumping refcounts) and copy the
    /// close-on-exec bits from the parent's table.
    pub fn copy_from(&self, other: &FdTable) {
        let other_slots = other.slots.lock();
        let mut slots = self.slots.lock();
        for fd in 0..NOFILE {
            slots[fd] = match &other_slots[fd] {
                Slot::Open(file) => Slot::Open(file.clone()),
                _ => Slot::Empty,
            };
        }
        self.close_on_exec.store(
            other.close_on_exec.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
    }

    /// Exec: close every descriptor flagged close-on-exec.
    pub fn close_cloexec(&self) {
        let bits = self.close_on_exec.swap(0, Ordering::Relaxed);
        let mut slots = self.slots.lock();
        for fd in 0..NOFILE {
            if bits & (1 << fd) != 0 {
                slots[fd] = Slot::Empty;
            }
        }
    }

    /// Exit: drop everything.
    pub fn close_all(&self) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            *slot = Slot::Empty;
        }
        self.close_on_exec.store(0, Ordering::Relaxed);
    }

    pub fn open_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| matches!(s, Slot::Open(_)))
            .count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
