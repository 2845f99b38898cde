//! Page fault routing.
//!
//! Order matters: a fault on an address some region covers is a demand
//! fault and gets filled, whether it came from user code or from a kernel
//! copy helper walking user memory. Only unresolvable faults consult the
//! task's fixup address; with no fixup the fault is fatal (SIGSEGV for user
//! mode, panic for the kernel).

use core::sync::atomic::Ordering;
use x86_64::VirtAddr;

use super::USER_SPACE_END;

pub enum FaultResolution {
    /// Mapping installed; retry the faulting access.
    Handled,
    /// Kernel-mode fault with an armed recovery address: redirect rip here.
    KernelFixup(u64),
    /// Unresolvable.
    Fault,
}

pub fn handle_fault(fault_addr: u64, from_user: bool, write: bool) -> FaultResolution {
    // Demand fault against the current task's regions.
    if fault_addr < USER_SPACE_END {
        if let Some(task) = crate::task::scheduler::try_current() {
            let mut guard = task.addr_space.lock();
            if let Some(space) = guard.as_mut() {
                if space.handle_fault(VirtAddr::new(fault_addr), write).is_ok() {
                    return FaultResolution::Handled;
                }
            }
        }
    }

    // A kernel-mode fault during a user copy recovers through the fixup.
    // User-mode faults never redirect into kernel code, stale fixup or not.
    if !from_user {
        if let Some(task) = crate::task::scheduler::try_current() {
            let fixup = task.fault_recovery.load(Ordering::Acquire);
            if fixup != 0 {
                return FaultResolution::KernelFixup(fixup);
            }
        }
    }

    FaultResolution::Fault
}
