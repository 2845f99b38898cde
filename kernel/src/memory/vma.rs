//! Virtual memory regions.
//!
//! A `VmMap` is one contiguous, disjoint `[start, end)` slice of a user
//! address space. Pages materialize lazily: the fault handler asks the
//! owning region to fill the faulting page, which either zero-fills or
//! reads from the backing file at the region's page offset.

use alloc::sync::Arc;
use core::fmt;

use x86_64::VirtAddr;

use super::buddy::{self, PageRef, PAL_KERNEL};
use super::{pg_align_down, PG_SIZE};
use crate::errno::{KResult, ENOMEM};
use crate::fs::file::File;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VmFlags(u32);

impl VmFlags {
    pub const READ: VmFlags = VmFlags(1 << 0);
    pub const WRITE: VmFlags = VmFlags(1 << 1);
    pub const EXEC: VmFlags = VmFlags(1 << 2);

    pub const fn empty() -> VmFlags {
        VmFlags(0)
    }

    pub const fn union(self, other: VmFlags) -> VmFlags {
        VmFlags(self.0 | other.0)
    }

    pub const fn contains(self, other: VmFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn readable(self) -> bool {
        self.contains(VmFlags::READ)
    }

    pub const fn writable(self) -> bool {
        self.contains(VmFlags::WRITE)
    }

    pub const fn executable(self) -> bool {
        self.contains(VmFlags::EXEC)
    }
}

impl core::ops::BitOr for VmFlags {
    type Output = VmFlags;
    fn bitor(self, rhs: VmFlags) -> VmFlags {
        self.union(rhs)
    }
}

impl fmt::Debug for VmFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.readable() { "r" } else { "-" },
            if self.writable() { "w" } else { "-" },
            if self.executable() { "x" } else { "-" }
        )
    }
}

/// File backing for demand-faulted regions (code/data from the executable).
pub struct FileBacking {
    pub file: Arc<File>,
    /// Byte offset into the file of this region's first page.
    pub file_page_offset: u64,
}

pub struct VmMap {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub flags: VmFlags,
    pub backing: Option<FileBacking>,
}

impl VmMap {
    pub fn new(start: VirtAddr, end: VirtAddr, flags: VmFlags) -> VmMap {
        debug_assert!(start <= end);
        debug_assert_eq!(start.as_u64() % PG_SIZE as u64, 0);
        debug_assert_eq!(end.as_u64() % PG_SIZE as u64, 0);
        VmMap {
            start,
            end,
            flags,
            backing: None,
        }
    }

    pub fn new_backed(
        start: VirtAddr,
        end: VirtAddr,
        flags: VmFlags,
        file: Arc<File>,
        file_page_offset: u64,
    ) -> VmMap {
        let mut map = VmMap::new(start, end, flags);
        map.backing = Some(FileBacking {
            file,
            file_page_offset,
        });
        map
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn contains_range(&self, addr: VirtAddr, len: u64) -> bool {
        addr >= self.start && addr.as_u64().saturating_add(len) <= self.end.as_u64()
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Produce the page backing `addr`: zero-filled, then overlaid with file
    /// contents when the region is file-backed. The caller maps it.
    pub fn fill_page(&self, addr: VirtAddr) -> KResult<PageRef> {
        let page_base = VirtAddr::new(pg_align_down(addr.as_u64()));
        let page = buddy::pzalloc(0, PAL_KERNEL).ok_or(ENOMEM)?;

        if let Some(backing) = &self.backing {
            let file_off = backing.file_page_offset + (page_base - self.start);
            let buf = unsafe {
                core::slice::from_raw_parts_mut(page.virt().as_mut_ptr::<u8>(), PG_SIZE)
            };
            // Short reads leave the zero-filled tail in place (bss overlap).
            let mut read = 0;
            while read < PG_SIZE {
                let n = backing
                    .file
                    .pread(&mut buf[read..], file_off + read as u64)?;
                if n == 0 {
                    break;
                }
                read += n;
            }
        }

        Ok(page)
    }
}

impl fmt::Debug for VmMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VmMap({:#x}..{:#x} {:?}{})",
            self.start.as_u64(),
            self.end.as_u64(),
            self.flags,
            if self.backing.is_some() { " file" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn contains_is_closed_open() {
        let map = VmMap::new(
            VirtAddr::new(0x1000),
            VirtAddr::new(0x3000),
            VmFlags::READ | VmFlags::WRITE,
        );
        assert!(map.contains(VirtAddr::new(0x1000)));
        assert!(map.contains(VirtAddr::new(0x2FFF)));
        assert!(!map.contains(VirtAddr::new(0x3000)));
        assert!(map.contains_range(VirtAddr::new(0x1000), 0x2000));
        assert!(!map.contains_range(VirtAddr::new(0x2000), 0x1001));
    }

    #[test_case]
    fn flags_compose() {
        let rw = VmFlags::READ | VmFlags::WRITE;
        assert!(rw.readable() && rw.writable() && !rw.executable());
        assert!(rw.contains(VmFlags::READ));
        assert!(!rw.contains(VmFlags::EXEC));
    }
}
