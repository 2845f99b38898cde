//! Memory management: physical page allocator, kernel heap, object caches,
//! and per-process address spaces.
//!
//! Initialization order matters and is driven from `init()`:
//! buddy allocator (over the bootloader memory map) -> kernel heap ->
//! slab caches. Address spaces are created later, per task.

pub mod address_space;
pub mod buddy;
pub mod heap;
pub mod page_fault;
pub mod slab;
pub mod user;
pub mod vma;

use bootloader_api::info::MemoryRegions;
use conquer_once::spin::OnceCell;
use x86_64::{PhysAddr, VirtAddr};

/// Size of a physical page.
pub const PG_SIZE: usize = 4096;
/// log2(PG_SIZE)
pub const PG_SHIFT: usize = 12;

/// Align `len` up to the next page boundary.
pub const fn pg_align(len: u64) -> u64 {
    (len + PG_SIZE as u64 - 1) & !(PG_SIZE as u64 - 1)
}

/// Align `addr` down to a page boundary.
pub const fn pg_align_down(addr: u64) -> u64 {
    addr & !(PG_SIZE as u64 - 1)
}

/// Top of the user half of the address space. User regions, including the
/// exec-created stack, live strictly below this.
pub const USER_SPACE_END: u64 = 0x0000_7FFF_FFFF_F000;

/// Where exec places the top of the initial user stack.
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FF00_0000;
/// Fixed size of the initial user stack region.
pub const USER_STACK_SIZE: u64 = 8 * 1024 * 1024;

/// Global physical memory offset: all of physical memory is mapped at this
/// virtual offset by the bootloader and shared by every address space.
static PHYSICAL_MEMORY_OFFSET: OnceCell<VirtAddr> = OnceCell::uninit();

/// Boot page-table root; tasks fall back to it while tearing down their
/// own address space.
static BOOT_CR3: OnceCell<x86_64::structures::paging::PhysFrame> = OnceCell::uninit();

/// Initialize the memory subsystem.
pub fn init(physical_memory_offset: VirtAddr, memory_regions: &'static MemoryRegions) {
    log::info!("Initializing memory management...");
    PHYSICAL_MEMORY_OFFSET.init_once(|| physical_memory_offset);
    BOOT_CR3.init_once(|| x86_64::registers::control::Cr3::read().0);

    let (heap_start, heap_len) = buddy::init(memory_regions, heap::HEAP_SIZE);
    heap::init(heap_start, heap_len);
    slab::init();

    log::info!(
        "Memory management initialized ({} pages free)",
        buddy::free_page_count()
    );
}

/// Get the physical memory offset.
pub fn physical_memory_offset() -> VirtAddr {
    *PHYSICAL_MEMORY_OFFSET
        .get()
        .expect("physical memory offset not initialized")
}

/// Convert a physical address to its offset-mapped virtual address.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(phys.as_u64() + physical_memory_offset().as_u64())
}

/// Switch the CPU back to the boot page tables (kernel mappings only).
pub fn activate_boot_root() {
    let root = *BOOT_CR3.get().expect("memory not initialized");
    unsafe {
        let (current, flags) = x86_64::registers::control::Cr3::read();
        if current != root {
            x86_64::registers::control::Cr3::write(root, flags);
        }
    }
}
