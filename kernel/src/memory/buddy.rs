//! Buddy physical page allocator.
//!
//! A dense `Page` array indexed by physical page number backs a classic buddy
//! allocator with one free list per order. A page's buddy differs from it
//! only in bit `order` of the page number, so coalescing is an XOR and a
//! free-list check.
//!
//! Callers that can sleep get a guaranteed allocation: when the free count
//! drops below the request the task waits on the allocator's wait queue,
//! which is woken on every free.

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use super::{phys_to_virt, PG_SHIFT, PG_SIZE};
use crate::task::waitqueue::WaitQueue;

/// Number of buddy free lists; the largest run is `2^(ORDER_MAX-1)` pages.
pub const ORDER_MAX: usize = 6;

/// Don't sleep waiting for pages; fail with `None` instead.
pub const PAL_NOWAIT: u32 = 1 << 0;
/// Normal kernel allocation, may sleep until pages are freed.
pub const PAL_KERNEL: u32 = 0;

const PN_NONE: u32 = u32::MAX;

/// Physical page number.
pub type Pn = usize;

/// Per-frame descriptor. All fields except `refs` are protected by the
/// allocator lock; an `order` of -1 means the page is allocated.
struct Page {
    order: i8,
    invalid: bool,
    refs: u32,
    /// Free-list linkage (page numbers; PN_NONE terminates)
    next: u32,
    prev: u32,
}

struct FreeList {
    head: u32,
    count: usize,
}

struct BuddyInner {
    /// Dense frame array, indexed by page number. Carved out of boot memory
    /// before the heap exists.
    pages: &'static mut [Page],
    free_lists: [FreeList; ORDER_MAX],
    free_pages: usize,
}

struct BuddyAllocator {
    inner: Mutex<Option<BuddyInner>>,
    wait_for_free: WaitQueue,
}

static BUDDY: BuddyAllocator = BuddyAllocator {
    inner: Mutex::new(None),
    wait_for_free: WaitQueue::new(),
};

/// A run of `2^order` physically contiguous pages handed out by `palloc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRef {
    pn: Pn,
}

impl PageRef {
    pub fn pn(&self) -> Pn {
        self.pn
    }

    pub fn phys(&self) -> PhysAddr {
        PhysAddr::new((self.pn << PG_SHIFT) as u64)
    }

    /// Kernel virtual address through the physical-memory offset map.
    pub fn virt(&self) -> VirtAddr {
        phys_to_virt(self.phys())
    }

    pub fn frame(&self) -> PhysFrame {
        PhysFrame::containing_address(self.phys())
    }

    pub fn from_phys(phys: PhysAddr) -> PageRef {
        PageRef {
            pn: (phys.as_u64() as usize) >> PG_SHIFT,
        }
    }
}

fn buddy_pn(pn: Pn, order: usize) -> Pn {
    pn ^ (1 << order)
}

impl BuddyInner {
    fn list_push(&mut self, order: usize, pn: Pn) {
        let old_head = self.free_lists[order].head;
        self.pages[pn].next = old_head;
        self.pages[pn].prev = PN_NONE;
        if old_head != PN_NONE {
            self.pages[old_head as usize].prev = pn as u32;
        }
        self.free_lists[order].head = pn as u32;
        self.free_lists[order].count += 1;
        self.pages[pn].order = order as i8;
    }

    fn list_remove(&mut self, order: usize, pn: Pn) {
        let (next, prev) = (self.pages[pn].next, self.pages[pn].prev);
        if prev != PN_NONE {
            self.pages[prev as usize].next = next;
        } else {
            self.free_lists[order].head = next;
        }
        if next != PN_NONE {
            self.pages[next as usize].prev = prev;
        }
        self.free_lists[order].count -= 1;
        self.pages[pn].next = PN_NONE;
        self.pages[pn].prev = PN_NONE;
        self.pages[pn].order = -1;
    }

    fn list_pop(&mut self, order: usize) -> Option<Pn> {
        let head = self.free_lists[order].head;
        if head == PN_NONE {
            return None;
        }
        let pn = head as usize;
        self.list_remove(order, pn);
        Some(pn)
    }

    /// Free a run, coalescing with buddies as far as possible.
    fn add_free_pages(&mut self, pn: Pn, order: usize) {
        let original_order = order;
        let mut cur = pn;
        let mut order = order;

        while order < ORDER_MAX - 1 {
            let buddy = buddy_pn(cur, order);
            if buddy >= self.pages.len() {
                break;
            }
            // The buddy must itself be a free run at exactly this order.
            if self.pages[buddy].order != order as i8 || self.pages[buddy].invalid {
                break;
            }

            self.list_remove(order, buddy);

            // The lower of the pair heads the merged run.
            cur &= !(1 << order);
            order += 1;
        }

        self.list_push(order, cur);
        self.free_pages += 1 << original_order;
    }

    /// Take a run of `2^order` pages, splitting higher orders as needed.
    fn take_pages(&mut self, order: usize) -> Option<Pn> {
        if let Some(pn) = self.list_pop(order) {
            self.free_pages -= 1 << order;
            return Some(pn);
        }

        // Split the lowest non-empty higher order down to the requested one.
        let mut split_from = None;
        for higher in (order + 1)..ORDER_MAX {
            if self.free_lists[higher].head != PN_NONE {
                split_from = Some(higher);
                break;
            }
        }
        let mut cur_order = split_from?;
        let pn = self.list_pop(cur_order)?;

        while cur_order > order {
            cur_order -= 1;
            // Push the upper half back as a free run one order down.
            self.list_push(cur_order, buddy_pn(pn, cur_order));
        }

        self.free_pages -= 1 << order;
        Some(pn)
    }
}

/// Populate the allocator from the bootloader memory map.
///
/// Two contiguous carve-outs come off the front of the largest usable
/// region before anything hits the free lists: the `Page` array itself
/// (the heap does not exist yet) and the kernel heap's backing. The heap
/// range is returned for `heap::init`.
pub fn init(memory_regions: &'static MemoryRegions, heap_bytes: usize) -> (VirtAddr, usize) {
    let max_pfn = memory_regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .map(|r| (r.end as usize) >> PG_SHIFT)
        .max()
        .unwrap_or(0);

    let array_bytes = max_pfn * core::mem::size_of::<Page>();
    let array_pages = (array_bytes + PG_SIZE - 1) / PG_SIZE;
    let heap_pages = (heap_bytes + PG_SIZE - 1) / PG_SIZE;
    let carve_pages = array_pages + heap_pages;

    let carve_region = memory_regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .max_by_key(|r| r.end - r.start)
        .expect("no usable memory regions");
    assert!(
        (carve_region.end - carve_region.start) as usize > carve_pages * PG_SIZE,
        "largest memory region cannot hold the page array and heap"
    );

    let array_phys = PhysAddr::new(carve_region.start);
    let array_virt = phys_to_virt(array_phys);
    let heap_virt = phys_to_virt(array_phys + (array_pages * PG_SIZE) as u64);

    let pages: &'static mut [Page] =
        unsafe { core::slice::from_raw_parts_mut(array_virt.as_mut_ptr(), max_pfn) };

    for page in pages.iter_mut() {
        *page = Page {
            order: -1,
            invalid: true,
            refs: 0,
            next: PN_NONE,
            prev: PN_NONE,
        };
    }

    const EMPTY: FreeList = FreeList {
        head: PN_NONE,
        count: 0,
    };
    let mut inner = BuddyInner {
        pages,
        free_lists: [EMPTY; ORDER_MAX],
        free_pages: 0,
    };

    let carve_start_pn = (carve_region.start as usize) >> PG_SHIFT;
    let carve_end_pn = carve_start_pn + carve_pages;

    let mut total = 0usize;
    for region in memory_regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
    {
        let start_pn = ((region.start as usize) + PG_SIZE - 1) >> PG_SHIFT;
        let end_pn = (region.end as usize) >> PG_SHIFT;
        for pn in start_pn..end_pn {
            if pn == 0 || pn >= max_pfn {
                continue;
            }
            // Frames backing the page array and heap stay allocated.
            if pn >= carve_start_pn && pn < carve_end_pn {
                inner.pages[pn].invalid = false;
                continue;
            }
            inner.pages[pn].invalid = false;
            inner.add_free_pages(pn, 0);
            total += 1;
        }
    }

    *BUDDY.inner.lock() = Some(inner);
    log::info!(
        "buddy: {} pages managed, page array {} KiB, heap carve {} KiB",
        total,
        array_pages * PG_SIZE / 1024,
        heap_pages * PG_SIZE / 1024
    );

    (heap_virt, heap_pages * PG_SIZE)
}

/// Mark a single boot-time frame free without taking the allocator lock in
/// the blocking path. Only valid during early bring-up.
pub fn mark_page_free(phys: PhysAddr) {
    let mut guard = BUDDY.inner.lock();
    let inner = guard.as_mut().expect("buddy not initialized");
    let pn = (phys.as_u64() as usize) >> PG_SHIFT;
    inner.pages[pn].invalid = false;
    inner.add_free_pages(pn, 0);
}

/// Allocate `2^order` physically contiguous pages.
///
/// With `PAL_NOWAIT` returns `None` when nothing suitable is free. Otherwise
/// the caller sleeps on the allocator's wait queue until `free` makes enough
/// pages available; a blocking `palloc` always eventually succeeds.
pub fn palloc(order: usize, flags: u32) -> Option<PageRef> {
    assert!(order < ORDER_MAX);

    loop {
        {
            let mut guard = BUDDY.inner.lock();
            let inner = guard.as_mut().expect("buddy not initialized");
            if let Some(pn) = inner.take_pages(order) {
                return Some(PageRef { pn });
            }
        }

        if flags & PAL_NOWAIT != 0 {
            return None;
        }
        if !crate::task::scheduler::is_running() {
            panic!("out of memory during early boot (order {})", order);
        }

        BUDDY
            .wait_for_free
            .wait_event(|| free_page_count() >= (1 << order));
    }
}

/// Allocate and zero.
pub fn pzalloc(order: usize, flags: u32) -> Option<PageRef> {
    let page = palloc(order, flags)?;
    unsafe {
        core::ptr::write_bytes(page.virt().as_mut_ptr::<u8>(), 0, PG_SIZE << order);
    }
    Some(page)
}

/// Allocate a single zeroed page and return its kernel virtual address.
pub fn pzalloc_va(flags: u32) -> Option<VirtAddr> {
    pzalloc(0, flags).map(|p| p.virt())
}

/// Free a run previously returned by `palloc(order, ..)`.
pub fn pfree(page: PageRef, order: usize) {
    {
        let mut guard = BUDDY.inner.lock();
        let inner = guard.as_mut().expect("buddy not initialized");
        debug_assert_eq!(
            inner.pages[page.pn].order, -1,
            "pfree of page {:#x} that is already free",
            page.pn
        );
        inner.add_free_pages(page.pn, order);
    }
    BUDDY.wait_for_free.wake();
}

/// Free by kernel virtual address (offset-map addresses only).
pub fn pfree_va(virt: VirtAddr, order: usize) {
    let phys = PhysAddr::new(virt.as_u64() - super::physical_memory_offset().as_u64());
    pfree(PageRef::from_phys(phys), order);
}

/// Grab a reference on a frame shared between owners (block cache pages).
pub fn page_inc_ref(page: PageRef) {
    let mut guard = BUDDY.inner.lock();
    let inner = guard.as_mut().expect("buddy not initialized");
    inner.pages[page.pn].refs += 1;
}

/// Drop a reference; frees the frame when the count hits zero.
pub fn page_dec_ref(page: PageRef) {
    let free_now = {
        let mut guard = BUDDY.inner.lock();
        let inner = guard.as_mut().expect("buddy not initialized");
        let refs = &mut inner.pages[page.pn].refs;
        debug_assert!(*refs > 0);
        *refs -= 1;
        *refs == 0
    };
    if free_now {
        pfree(page, 0);
    }
}

pub fn free_page_count() -> usize {
    BUDDY
        .inner
        .lock()
        .as_ref()
        .map(|inner| inner.free_pages)
        .unwrap_or(0)
}

/// Frame allocator handle for the `x86_64` paging code (page-table frames).
pub struct GlobalFrameAllocator;

unsafe impl FrameAllocator<Size4KiB> for GlobalFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        pzalloc(0, PAL_NOWAIT).map(|p| p.frame())
    }
}

impl FrameDeallocator<Size4KiB> for GlobalFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        pfree(PageRef::from_phys(frame.start_address()), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn buddy_pn_flips_order_bit() {
        assert_eq!(buddy_pn(0, 0), 1);
        assert_eq!(buddy_pn(1, 0), 0);
        assert_eq!(buddy_pn(4, 2), 0);
        assert_eq!(buddy_pn(0b1010_0000, 4), 0b1011_0000);
    }

    #[test_case]
    fn alloc_free_round_trip() {
        let page = palloc(0, PAL_NOWAIT).expect("out of memory");
        let first = page.pn();
        pfree(page, 0);

        // After the free, an equal-order allocation may coalesce elsewhere,
        // but the frame must be reusable and never double-handed-out.
        let a = palloc(0, PAL_NOWAIT).expect("out of memory");
        let b = palloc(0, PAL_NOWAIT).expect("out of memory");
        assert_ne!(a.pn(), b.pn());
        let _ = first;
        pfree(a, 0);
        pfree(b, 0);
    }

    #[test_case]
    fn higher_order_runs_are_aligned() {
        for order in 1..4 {
            let page = palloc(order, PAL_NOWAIT).expect("out of memory");
            assert_eq!(page.pn() & ((1 << order) - 1), 0, "misaligned order-{} run", order);
            pfree(page, order);
        }
    }
}
