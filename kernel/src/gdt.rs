//! GDT and TSS.
//!
//! One TSS for the single CPU: `rsp0` is repointed at every dispatch so
//! traps from user mode land on the incoming task's kernel stack. A
//! dedicated IST stack backs the double-fault handler.

use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicPtr, Ordering};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const IST_STACK_SIZE: usize = 4096 * 5;

static mut DOUBLE_FAULT_STACK: [u8; IST_STACK_SIZE] = [0; IST_STACK_SIZE];

static TSS: OnceCell<TaskStateSegment> = OnceCell::uninit();
static GDT: OnceCell<(GlobalDescriptorTable, Selectors)> = OnceCell::uninit();

/// Raw pointer into the OnceCell so `set_kernel_stack` can update rsp0
/// after init. Single CPU, updated only with interrupts disabled around
/// dispatch.
static TSS_PTR: AtomicPtr<TaskStateSegment> = AtomicPtr::new(core::ptr::null_mut());

struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
}

pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
    use x86_64::instructions::tables::load_tss;

    let tss = TSS.get_or_init(|| {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let start = VirtAddr::from_ptr(&raw const DOUBLE_FAULT_STACK);
            start + IST_STACK_SIZE as u64
        };
        tss
    });
    TSS_PTR.store(
        tss as *const TaskStateSegment as *mut TaskStateSegment,
        Ordering::Release,
    );

    let (gdt, selectors) = GDT.get_or_init(|| {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(tss));
        // sysret ordering: user data before user code.
        let user_data_selector = gdt.append(Descriptor::user_data_segment());
        let user_code_selector = gdt.append(Descriptor::user_code_segment());
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                tss_selector,
                user_code_selector,
                user_data_selector,
            },
        )
    });

    gdt.load();
    unsafe {
        CS::set_reg(selectors.code_selector);
        SS::set_reg(selectors.data_selector);
        DS::set_reg(selectors.data_selector);
        ES::set_reg(selectors.data_selector);
        load_tss(selectors.tss_selector);
    }

    log::info!("GDT loaded (user cs={:?})", selectors.user_code_selector);
}

/// Repoint `rsp0`; traps from user mode will use this kernel stack.
pub fn set_kernel_stack(stack_top: VirtAddr) {
    let tss = TSS_PTR.load(Ordering::Acquire);
    if !tss.is_null() {
        // SAFETY: single CPU; only the dispatch path writes, with
        // interrupts disabled, and the CPU reads it only on a trap.
        unsafe {
            (*tss).privilege_stack_table[0] = stack_top;
        }
    }
}

/// Selectors the trap-return path needs to build user-mode iretq frames
/// (RPL 3 on both).
pub fn user_selectors() -> (u16, u16) {
    let (_, selectors) = GDT.get().expect("GDT not initialized");
    (
        selectors.user_code_selector.0 | 3,
        selectors.user_data_selector.0 | 3,
    )
}

pub fn kernel_selectors() -> (u16, u16) {
    let (_, selectors) = GDT.get().expect("GDT not initialized");
    (selectors.code_selector.0, selectors.data_selector.0)
}
