use linked_list_allocator::LockedHeap;
use x86_64::VirtAddr;

/// Heap size: 32 MiB, carved as one contiguous offset-mapped range by the
/// buddy allocator's init so no page-table work is needed this early.
pub const HEAP_SIZE: usize = 32 * 1024 * 1024;

/// Global allocator instance using a proper free-list allocator.
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initialize the heap allocator over the carved range.
pub fn init(start: VirtAddr, len: usize) {
    unsafe {
        ALLOCATOR.lock().init(start.as_mut_ptr::<u8>(), len);
    }
    log::info!(
        "Heap initialized at {:#x}, {} KiB",
        start.as_u64(),
        len / 1024
    );
}

/// Handle allocation errors
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout)
}
