//! Memory syscall handlers: brk and sbrk.

use x86_64::VirtAddr;

use crate::errno::{KResult, EINVAL};
use crate::interrupts::TrapFrame;
use crate::task::scheduler;

/// brk(new_end): absolute program break. Returns the new break.
pub fn sys_brk(frame: &mut TrapFrame) -> KResult<i64> {
    let task = scheduler::current();
    let mut guard = task.addr_space.lock();
    let space = guard.as_mut().ok_or(EINVAL)?;

    let new_brk = frame.rdi;
    if new_brk != 0 {
        space.set_brk(VirtAddr::new(new_brk))?;
    }
    Ok(space.brk.as_u64() as i64)
}

/// sbrk(increment): returns the previous break.
pub fn sys_sbrk(frame: &mut TrapFrame) -> KResult<i64> {
    let task = scheduler::current();
    let mut guard = task.addr_space.lock();
    let space = guard.as_mut().ok_or(EINVAL)?;

    let increment = frame.rdi as i64;
    let old = space.sbrk(increment)?;
    Ok(old.as_u64() as i64)
}
