//! Per-task address spaces.
//!
//! An address space owns a page-table root and a list of disjoint `VmMap`
//! regions, plus named handles to the canonical code/data/bss/stack regions
//! and the current program break. Page-table entries exist only for
//! addresses some region covers; everything else faults.
//!
//! The kernel half of every root is shared: the top 256 PML4 entries are
//! copied from the boot page table at creation, so kernel mappings stay
//! identical across address spaces.

use alloc::vec::Vec;

use x86_64::registers::control::Cr3;
use x86_64::structures::paging::mapper::{Mapper, OffsetPageTable, TranslateResult};
use x86_64::structures::paging::{
    Page, PageTable, PageTableFlags, PhysFrame, Size4KiB, Translate,
};
use x86_64::VirtAddr;

use super::buddy::{self, PageRef, PAL_KERNEL};
use super::vma::{VmFlags, VmMap};
use super::{pg_align, pg_align_down, PG_SIZE, USER_SPACE_END};
use crate::errno::{KResult, EFAULT, EINVAL, ENOMEM};

/// Named handles to the canonical regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Code,
    Data,
    Bss,
    Stack,
}

pub struct AddressSpace {
    root: PhysFrame,
    regions: Vec<VmMap>,
    code: Option<usize>,
    data: Option<usize>,
    bss: Option<usize>,
    stack: Option<usize>,
    /// Current program break (end of the bss region once one exists).
    pub brk: VirtAddr,
}

impl AddressSpace {
    /// Fresh address space with empty user half and shared kernel half.
    pub fn new() -> KResult<AddressSpace> {
        let root_page = buddy::pzalloc(0, PAL_KERNEL).ok_or(ENOMEM)?;
        let root = root_page.frame();

        // Copy the kernel-half PML4 entries from the live root.
        unsafe {
            let (current, _) = Cr3::read();
            let src = super::phys_to_virt(current.start_address()).as_ptr::<PageTable>();
            let dst = super::phys_to_virt(root.start_address()).as_mut_ptr::<PageTable>();
            for i in 256..512 {
                (&mut *dst)[i] = (&*src)[i].clone();
            }
        }

        Ok(AddressSpace {
            root,
            regions: Vec::new(),
            code: None,
            data: None,
            bss: None,
            stack: None,
            brk: VirtAddr::new(0),
        })
    }

    /// Load this space's root into CR3.
    pub fn activate(&self) {
        unsafe {
            let (current, flags) = Cr3::read();
            if current != self.root {
                Cr3::write(self.root, flags);
            }
        }
    }

    fn mapper(&mut self) -> OffsetPageTable<'_> {
        let offset = super::physical_memory_offset();
        // SAFETY: `root` is a live PML4 owned by this address space and all
        // physical memory is mapped at `offset`.
        unsafe {
            let table = super::phys_to_virt(self.root.start_address()).as_mut_ptr::<PageTable>();
            OffsetPageTable::new(&mut *table, offset)
        }
    }

    pub fn regions(&self) -> &[VmMap] {
        &self.regions
    }

    pub fn region(&self, kind: RegionKind) -> Option<&VmMap> {
        let idx = match kind {
            RegionKind::Code => self.code,
            RegionKind::Data => self.data,
            RegionKind::Bss => self.bss,
            RegionKind::Stack => self.stack,
        }?;
        self.regions.get(idx)
    }

    pub fn find_region(&self, addr: VirtAddr) -> Option<&VmMap> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.regions
            .iter()
            .any(|r| start < r.end && r.start < end)
    }

    /// Insert a region; regions must stay disjoint and inside the user half.
    pub fn add_map(&mut self, map: VmMap, kind: Option<RegionKind>) -> KResult<()> {
        if map.end.as_u64() > USER_SPACE_END || self.overlaps(map.start, map.end) {
            return Err(EINVAL);
        }
        let idx = self.regions.len();
        self.regions.push(map);
        match kind {
            Some(RegionKind::Code) => self.code = Some(idx),
            Some(RegionKind::Data) => self.data = Some(idx),
            Some(RegionKind::Bss) => {
                self.bss = Some(idx);
                self.brk = self.regions[idx].end;
            }
            Some(RegionKind::Stack) => self.stack = Some(idx),
            None => {}
        }
        Ok(())
    }

    /// Map `page` at `addr` with the region's access flags.
    fn map_page(&mut self, addr: VirtAddr, page: PageRef, flags: VmFlags) -> KResult<()> {
        let mut pt_flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if flags.writable() {
            pt_flags |= PageTableFlags::WRITABLE;
        }
        if !flags.executable() {
            pt_flags |= PageTableFlags::NO_EXECUTE;
        }

        let virt_page = Page::<Size4KiB>::containing_address(addr);
        let mut mapper = self.mapper();
        unsafe {
            mapper
                .map_to(
                    virt_page,
                    page.frame(),
                    pt_flags,
                    &mut buddy::GlobalFrameAllocator,
                )
                .map_err(|_| ENOMEM)?
                .flush();
        }
        Ok(())
    }

    /// Install an eagerly filled page at `addr` (loader boundary pages).
    /// `addr` must fall inside an existing region.
    pub fn map_filled_page(
        &mut self,
        addr: VirtAddr,
        page: PageRef,
        flags: VmFlags,
    ) -> KResult<()> {
        if self.find_region(addr).is_none() {
            return Err(EINVAL);
        }
        self.map_page(VirtAddr::new(pg_align_down(addr.as_u64())), page, flags)
    }

    /// Drop every mapping in `[start, end)`, freeing the backing frames.
    fn unmap_range(&mut self, start: VirtAddr, end: VirtAddr) {
        let mut mapper = self.mapper();
        let mut addr = start;
        while addr < end {
            let page = Page::<Size4KiB>::containing_address(addr);
            if let Ok((frame, flush)) = mapper.unmap(page) {
                flush.flush();
                buddy::pfree(PageRef::from_phys(frame.start_address()), 0);
            }
            addr += PG_SIZE as u64;
        }
    }

    /// Physical frame currently mapped at `addr`, if any.
    fn translate_page(&mut self, addr: VirtAddr) -> Option<PhysFrame> {
        match self.mapper().translate(addr) {
            TranslateResult::Mapped { frame, .. } => {
                PhysFrame::from_start_address(frame.start_address()).ok()
            }
            _ => None,
        }
    }

    /// Demand-fault entry point: fill and map the page backing `addr`.
    pub fn handle_fault(&mut self, addr: VirtAddr, write: bool) -> KResult<()> {
        let region_idx = self
            .regions
            .iter()
            .position(|r| r.contains(addr))
            .ok_or(EFAULT)?;

        {
            let region = &self.regions[region_idx];
            if write && !region.flags.writable() {
                return Err(EFAULT);
            }
        }

        // A second fault on the same page (racing copy helpers) is benign:
        // re-check the mapping before filling.
        let page_base = VirtAddr::new(pg_align_down(addr.as_u64()));
        if self.translate_page(page_base).is_some() {
            return Ok(());
        }

        let (page, flags) = {
            let region = &self.regions[region_idx];
            (region.fill_page(addr)?, region.flags)
        };
        self.map_page(page_base, page, flags)
    }

    /// Resize a region in place, freeing pages a shrink drops.
    pub fn resize_map(&mut self, idx: usize, new_end: VirtAddr) -> KResult<()> {
        if idx >= self.regions.len() {
            return Err(EINVAL);
        }
        let (start, old_end) = (self.regions[idx].start, self.regions[idx].end);
        if new_end < start || new_end.as_u64() > USER_SPACE_END {
            return Err(EINVAL);
        }
        if new_end > old_end
            && self
                .regions
                .iter()
                .enumerate()
                .any(|(i, r)| i != idx && old_end < r.end && r.start < new_end)
        {
            return Err(ENOMEM);
        }

        if new_end < old_end {
            self.unmap_range(new_end, old_end);
        }
        self.regions[idx].end = new_end;
        Ok(())
    }

    /// `sbrk`: grow (or create) the bss region; returns the previous break.
    pub fn sbrk(&mut self, increment: i64) -> KResult<VirtAddr> {
        let old_brk = self.brk;

        if increment == 0 {
            return Ok(old_brk);
        }

        let new_brk = if increment > 0 {
            old_brk + increment as u64
        } else {
            let dec = (-increment) as u64;
            if dec > old_brk.as_u64() {
                return Err(EINVAL);
            }
            old_brk - dec
        };

        self.set_brk(VirtAddr::new(new_brk.as_u64()))?;
        Ok(old_brk)
    }

    /// `brk`: absolute form. The bss region always ends page-aligned at or
    /// above the break.
    pub fn set_brk(&mut self, new_brk: VirtAddr) -> KResult<()> {
        let aligned_end = VirtAddr::new(pg_align(new_brk.as_u64()));

        let idx = match self.bss {
            Some(idx) => idx,
            None => {
                // No bss yet (odd, but legal): carve one starting at the
                // current break location, after the data region.
                let start = self
                    .region(RegionKind::Data)
                    .map(|r| r.end)
                    .unwrap_or(VirtAddr::new(pg_align(new_brk.as_u64())));
                let map = VmMap::new(start, start, VmFlags::READ | VmFlags::WRITE);
                self.add_map(map, Some(RegionKind::Bss))?;
                self.bss.unwrap()
            }
        };

        if self.regions[idx].end != aligned_end {
            self.resize_map(idx, aligned_end)?;
        }
        self.brk = new_brk;
        Ok(())
    }

    /// Eager-copy fork: duplicate every region (sharing file references) and
    /// deep-copy every mapped page. Writes in either task stay invisible to
    /// the other.
    pub fn fork_copy(&mut self) -> KResult<AddressSpace> {
        let mut child = AddressSpace::new()?;

        for idx in 0..self.regions.len() {
            let (start, end, flags) = {
                let r = &self.regions[idx];
                (r.start, r.end, r.flags)
            };
            let backing = self.regions[idx].backing.as_ref().map(|b| {
                (b.file.clone(), b.file_page_offset)
            });

            let map = match backing {
                Some((file, off)) => VmMap::new_backed(start, end, flags, file, off),
                None => VmMap::new(start, end, flags),
            };

            let kind = if Some(idx) == self.code {
                Some(RegionKind::Code)
            } else if Some(idx) == self.data {
                Some(RegionKind::Data)
            } else if Some(idx) == self.bss {
                Some(RegionKind::Bss)
            } else if Some(idx) == self.stack {
                Some(RegionKind::Stack)
            } else {
                None
            };
            child.add_map(map, kind)?;

            // Copy only the pages the parent actually faulted in; the rest
            // keep demand-faulting in the child too.
            let mut addr = start;
            while addr < end {
                if let Some(frame) = self.translate_page(addr) {
                    let page = buddy::palloc(0, PAL_KERNEL).ok_or(ENOMEM)?;
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            super::phys_to_virt(frame.start_address()).as_ptr::<u8>(),
                            page.virt().as_mut_ptr::<u8>(),
                            PG_SIZE,
                        );
                    }
                    child.map_page(addr, page, flags)?;
                }
                addr += PG_SIZE as u64;
            }
        }

        child.brk = self.brk;
        Ok(child)
    }

    fn free_page_tables(&mut self) {
        // Leaf frames are gone (regions were unmapped); release the
        // intermediate tables of the user half, then the root itself.
        let offset = super::physical_memory_offset();
        unsafe {
            let root = super::phys_to_virt(self.root.start_address()).as_mut_ptr::<PageTable>();
            for l4_idx in 0..256 {
                let l4e = &(&*root)[l4_idx];
                if l4e.is_unused() {
                    continue;
                }
                let l3 = (offset + l4e.addr().as_u64()).as_mut_ptr::<PageTable>();
                for l3_idx in 0..512 {
                    let l3e = &(&*l3)[l3_idx];
                    if l3e.is_unused() {
                        continue;
                    }
                    let l2 = (offset + l3e.addr().as_u64()).as_mut_ptr::<PageTable>();
                    for l2_idx in 0..512 {
                        let l2e = &(*l2)[l2_idx];
                        if l2e.is_unused() {
                            continue;
                        }
                        buddy::pfree(PageRef::from_phys(l2e.addr()), 0);
                    }
                    buddy::pfree(PageRef::from_phys(l3e.addr()), 0);
                }
                buddy::pfree(PageRef::from_phys(l4e.addr()), 0);
            }
        }
        buddy::pfree(PageRef::from_phys(self.root.start_address()), 0);
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Never tear down the live root.
        unsafe {
            let (current, _) = Cr3::read();
            debug_assert_ne!(
                current, self.root,
                "dropping the active address space"
            );
        }

        let ranges: Vec<(VirtAddr, VirtAddr)> = self
            .regions
            .iter()
            .map(|r| (r.start, r.end))
            .collect();
        for (start, end) in ranges {
            self.unmap_range(start, end);
        }
        self.regions.clear();
        self.free_page_tables();
    }
}

/// User-pointer validation: some region must fully contain `[ptr, ptr+len)`
/// with at least `access` rights.
pub fn user_check_region(
    space: &AddressSpace,
    ptr: VirtAddr,
    len: u64,
    access: VmFlags,
) -> KResult<()> {
    if ptr.as_u64().saturating_add(len) > USER_SPACE_END {
        return Err(EFAULT);
    }
    for region in space.regions() {
        if region.contains_range(ptr, len) {
            if region.flags.contains(access) {
                return Ok(());
            }
            return Err(EFAULT);
        }
    }
    Err(EFAULT)
}
