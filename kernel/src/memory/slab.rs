//! Slab allocator and `kmalloc`.
//!
//! Each cache hands out fixed-size objects from page-allocator frames. A
//! frame starts with a small header; the free objects inside it thread a
//! singly-linked free list through their own (unused) storage, so a frame
//! costs nothing beyond the header until objects are live.
//!
//! `kmalloc` picks the smallest cache from a power-of-two ladder. Requests
//! bigger than the largest rung allocate whole page runs and are remembered
//! on a side list so `kfree`/`ksize` can find them again.

use alloc::vec::Vec;
use core::ptr::NonNull;
use spin::Mutex;

use super::buddy::{self, PageRef, PAL_KERNEL};
use super::PG_SIZE;

/// Frame header, placed at the start of every page run owned by a cache.
struct SlabFrame {
    next_frame: *mut SlabFrame,
    free_list: *mut FreeObject,
    object_count: u32,
    free_count: u32,
}

/// Free objects reuse their own storage as list links.
struct FreeObject {
    next: *mut FreeObject,
}

struct SlabInner {
    frames: *mut SlabFrame,
}

// SAFETY: the raw frame pointers are only dereferenced while the cache mutex
// is held.
unsafe impl Send for SlabInner {}

pub struct SlabCache {
    name: &'static str,
    object_size: usize,
    page_order: usize,
    inner: Mutex<SlabInner>,
}

pub struct SlabStats {
    pub name: &'static str,
    pub object_size: usize,
    pub frame_count: usize,
    pub in_use: usize,
}

impl SlabCache {
    pub const fn new(name: &'static str, object_size: usize) -> Self {
        SlabCache {
            name,
            object_size,
            // Largest rung still fits objects beside the header in an
            // order-1 run; everything smaller uses single pages.
            page_order: if object_size >= PG_SIZE / 2 { 1 } else { 0 },
            inner: Mutex::new(SlabInner {
                frames: core::ptr::null_mut(),
            }),
        }
    }

    fn frame_bytes(&self) -> usize {
        PG_SIZE << self.page_order
    }

    fn objects_per_frame(&self) -> usize {
        let header = align_up(core::mem::size_of::<SlabFrame>(), core::mem::align_of::<u64>());
        (self.frame_bytes() - header) / self.object_size
    }

    /// Carve a fresh frame and thread its free list.
    unsafe fn new_frame(&self) -> Option<*mut SlabFrame> {
        let page = buddy::palloc(self.page_order, PAL_KERNEL)?;
        let base = page.virt().as_mut_ptr::<u8>();

        let frame = base as *mut SlabFrame;
        let header = align_up(core::mem::size_of::<SlabFrame>(), core::mem::align_of::<u64>());
        let count = self.objects_per_frame();

        let mut free_list: *mut FreeObject = core::ptr::null_mut();
        for i in (0..count).rev() {
            let obj = base.add(header + i * self.object_size) as *mut FreeObject;
            (*obj).next = free_list;
            free_list = obj;
        }

        (*frame) = SlabFrame {
            next_frame: core::ptr::null_mut(),
            free_list,
            object_count: count as u32,
            free_count: count as u32,
        };
        Some(frame)
    }

    /// Allocate one object. Sleeps on memory pressure like `palloc`.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();

        // First frame with a free object wins.
        let mut frame = inner.frames;
        unsafe {
            while !frame.is_null() {
                if !(*frame).free_list.is_null() {
                    break;
                }
                frame = (*frame).next_frame;
            }

            if frame.is_null() {
                frame = self.new_frame()?;
                (*frame).next_frame = inner.frames;
                inner.frames = frame;
            }

            let obj = (*frame).free_list;
            (*frame).free_list = (*obj).next;
            (*frame).free_count -= 1;
            Some(NonNull::new_unchecked(obj as *mut u8))
        }
    }

    /// Return an object to the frame covering its address.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `self.alloc()` and not freed since.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let inner = self.inner.lock();
        let mut frame = inner.frames;
        while !frame.is_null() {
            let start = frame as usize;
            let end = start + self.frame_bytes();
            if (ptr as usize) > start && (ptr as usize) < end {
                let obj = ptr as *mut FreeObject;
                (*obj).next = (*frame).free_list;
                (*frame).free_list = obj;
                (*frame).free_count += 1;
                return;
            }
            frame = (*frame).next_frame;
        }
        panic!("slab '{}': free of foreign pointer {:p}", self.name, ptr);
    }

    /// Whether `ptr` falls inside one of this cache's frames.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let inner = self.inner.lock();
        let mut frame = inner.frames;
        unsafe {
            while !frame.is_null() {
                let start = frame as usize;
                if (ptr as usize) > start && (ptr as usize) < start + self.frame_bytes() {
                    return true;
                }
                frame = (*frame).next_frame;
            }
        }
        false
    }

    /// Release every fully-free frame back to the page allocator.
    pub fn oom(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut released = 0;
        unsafe {
            let mut link: *mut *mut SlabFrame = &mut inner.frames;
            while !(*link).is_null() {
                let frame = *link;
                if (*frame).free_count == (*frame).object_count {
                    *link = (*frame).next_frame;
                    buddy::pfree_va(x86_64::VirtAddr::from_ptr(frame), self.page_order);
                    released += 1;
                } else {
                    link = &mut (*frame).next_frame;
                }
            }
        }
        released
    }

    pub fn stats(&self) -> SlabStats {
        let inner = self.inner.lock();
        let mut frame_count = 0;
        let mut in_use = 0;
        unsafe {
            let mut frame = inner.frames;
            while !frame.is_null() {
                frame_count += 1;
                in_use += ((*frame).object_count - (*frame).free_count) as usize;
                frame = (*frame).next_frame;
            }
        }
        SlabStats {
            name: self.name,
            object_size: self.object_size,
            frame_count,
            in_use,
        }
    }
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// ---------------------------------------------------------------------------
// kmalloc ladder
// ---------------------------------------------------------------------------

static KMALLOC_32: SlabCache = SlabCache::new("kmalloc-32", 32);
static KMALLOC_64: SlabCache = SlabCache::new("kmalloc-64", 64);
static KMALLOC_128: SlabCache = SlabCache::new("kmalloc-128", 128);
static KMALLOC_256: SlabCache = SlabCache::new("kmalloc-256", 256);
static KMALLOC_512: SlabCache = SlabCache::new("kmalloc-512", 512);
static KMALLOC_1024: SlabCache = SlabCache::new("kmalloc-1024", 1024);
static KMALLOC_2048: SlabCache = SlabCache::new("kmalloc-2048", 2048);
static KMALLOC_4096: SlabCache = SlabCache::new("kmalloc-4096", 4096);

static KMALLOC_CACHES: [&SlabCache; 8] = [
    &KMALLOC_32,
    &KMALLOC_64,
    &KMALLOC_128,
    &KMALLOC_256,
    &KMALLOC_512,
    &KMALLOC_1024,
    &KMALLOC_2048,
    &KMALLOC_4096,
];

/// Allocations larger than the ladder get whole page runs; remembered here
/// so `kfree`/`ksize` can recover the order from the raw pointer.
static LARGE_ALLOCS: Mutex<Vec<(usize, usize, usize)>> = Mutex::new(Vec::new()); // (addr, order, size)

pub fn init() {
    // Caches build frames lazily; nothing to do beyond logging the ladder.
    log::info!(
        "kmalloc ladder ready: {} caches, {}..{} bytes",
        KMALLOC_CACHES.len(),
        KMALLOC_CACHES[0].object_size,
        KMALLOC_CACHES[KMALLOC_CACHES.len() - 1].object_size
    );
}

fn cache_for(size: usize) -> Option<&'static SlabCache> {
    KMALLOC_CACHES
        .iter()
        .copied()
        .find(|cache| cache.object_size >= size)
}

/// Allocate `size` bytes of kernel memory.
pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }

    if let Some(cache) = cache_for(size) {
        return cache.alloc();
    }

    // Oversized: round up to a page-run order.
    let pages = (size + PG_SIZE - 1) / PG_SIZE;
    let order = order_for_pages(pages)?;
    let run = buddy::palloc(order, PAL_KERNEL)?;
    let addr = run.virt().as_u64() as usize;
    LARGE_ALLOCS.lock().push((addr, order, size));
    NonNull::new(addr as *mut u8)
}

/// Free memory returned by `kmalloc`.
///
/// # Safety
///
/// `ptr` must have come from `kmalloc` and not been freed since.
pub unsafe fn kfree(ptr: *mut u8) {
    for cache in KMALLOC_CACHES {
        if cache.contains(ptr) {
            cache.free(ptr);
            return;
        }
    }

    let mut large = LARGE_ALLOCS.lock();
    if let Some(idx) = large.iter().position(|&(addr, _, _)| addr == ptr as usize) {
        let (addr, order, _) = large.swap_remove(idx);
        drop(large);
        let phys =
            x86_64::PhysAddr::new(addr as u64 - super::physical_memory_offset().as_u64());
        buddy::pfree(PageRef::from_phys(phys), order);
        return;
    }

    panic!("kfree of pointer {:p} not owned by kmalloc", ptr);
}

/// Usable size of a `kmalloc` allocation.
pub fn ksize(ptr: *const u8) -> Option<usize> {
    for cache in KMALLOC_CACHES {
        if cache.contains(ptr) {
            return Some(cache.object_size);
        }
    }
    LARGE_ALLOCS
        .lock()
        .iter()
        .find(|&&(addr, _, _)| addr == ptr as usize)
        .map(|&(_, _, size)| size)
}

/// Memory-pressure hook: drop fully-free frames from every cache.
pub fn kmalloc_oom() -> usize {
    KMALLOC_CACHES.iter().map(|cache| cache.oom()).sum()
}

fn order_for_pages(pages: usize) -> Option<usize> {
    (0..buddy::ORDER_MAX).find(|&order| (1usize << order) >= pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn ladder_selects_smallest_fit() {
        assert_eq!(cache_for(1).unwrap().object_size, 32);
        assert_eq!(cache_for(32).unwrap().object_size, 32);
        assert_eq!(cache_for(33).unwrap().object_size, 64);
        assert_eq!(cache_for(4096).unwrap().object_size, 4096);
        assert!(cache_for(4097).is_none());
    }

    #[test_case]
    fn alloc_free_reuses_object() {
        let cache = &KMALLOC_64;
        let a = cache.alloc().expect("out of memory");
        unsafe {
            cache.free(a.as_ptr());
        }
        let b = cache.alloc().expect("out of memory");
        // A freed object goes to the head of its frame's free list.
        assert_eq!(a, b);
        unsafe {
            cache.free(b.as_ptr());
        }
    }

    #[test_case]
    fn ksize_reports_rung() {
        let p = kmalloc(100).expect("out of memory");
        assert_eq!(ksize(p.as_ptr()), Some(128));
        unsafe {
            kfree(p.as_ptr());
        }
    }
}
