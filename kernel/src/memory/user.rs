//! Safe access to user memory.
//!
//! Two layers of defense. `user_check_region`/`user_check_strn` are the
//! advisory scans over the region list used before bulk operations. The
//! copy helpers themselves are the real contract: before touching user
//! memory they install a fault-recovery address into the current task, so a
//! page fault that the region fill cannot satisfy rewinds into the fixup
//! stub and surfaces as `EFAULT` instead of a kernel oops.

use core::arch::global_asm;
use core::sync::atomic::Ordering;

use x86_64::VirtAddr;

use super::address_space::user_check_region;
use super::vma::VmFlags;
use super::USER_SPACE_END;
use crate::errno::{KResult, EFAULT, ENOMEM};

global_asm!(
    r#"
.global raw_user_copy
// raw_user_copy(dst [rdi], src [rsi], len [rdx]) -> 0 or -EFAULT
//
// Faults inside the rep land in the page-fault handler; if the address
// cannot be demand-filled the handler redirects rip to raw_user_copy_fixup.
raw_user_copy:
    mov rcx, rdx
    rep movsb
    xor eax, eax
    ret

.global raw_user_copy_fixup
raw_user_copy_fixup:
    mov rax, -14
    ret

.global raw_user_memset
// raw_user_memset(dst [rdi], byte [sil], len [rdx]) -> 0 or -EFAULT
raw_user_memset:
    mov rcx, rdx
    mov al, sil
    rep stosb
    xor eax, eax
    ret
"#
);

extern "C" {
    fn raw_user_copy(dst: *mut u8, src: *const u8, len: usize) -> i64;
    fn raw_user_copy_fixup();
    fn raw_user_memset(dst: *mut u8, byte: u8, len: usize) -> i64;
}

fn user_range_ok(addr: u64, len: usize) -> bool {
    addr != 0
        && addr
            .checked_add(len as u64)
            .map_or(false, |end| end <= USER_SPACE_END)
}

/// Run `f` with the fault-recovery address armed.
fn with_fixup<F: FnOnce() -> i64>(f: F) -> KResult<()> {
    let task = crate::task::scheduler::current();
    task.fault_recovery
        .store(raw_user_copy_fixup as usize as u64, Ordering::Release);
    let ret = f();
    task.fault_recovery.store(0, Ordering::Release);

    if ret < 0 {
        Err(EFAULT)
    } else {
        Ok(())
    }
}

/// Copy `len` bytes from kernel memory into user memory.
pub fn copy_to_user_raw(dst: *mut u8, src: *const u8, len: usize) -> KResult<()> {
    if len == 0 {
        return Ok(());
    }
    if !user_range_ok(dst as u64, len) {
        return Err(EFAULT);
    }
    with_fixup(|| unsafe { raw_user_copy(dst, src, len) })
}

/// Copy `len` bytes from user memory into kernel memory.
pub fn copy_from_user_raw(dst: *mut u8, src: *const u8, len: usize) -> KResult<()> {
    if len == 0 {
        return Ok(());
    }
    if !user_range_ok(src as u64, len) {
        return Err(EFAULT);
    }
    with_fixup(|| unsafe { raw_user_copy(dst, src, len) })
}

/// Fill `len` bytes of user memory with `byte`.
pub fn memset_user_raw(dst: *mut u8, byte: u8, len: usize) -> KResult<()> {
    if len == 0 {
        return Ok(());
    }
    if !user_range_ok(dst as u64, len) {
        return Err(EFAULT);
    }
    with_fixup(|| unsafe { raw_user_memset(dst, byte, len) })
}

/// Copy a `Copy` value out of user memory.
pub fn copy_from_user<T: Copy>(ptr: u64) -> KResult<T> {
    let mut value = core::mem::MaybeUninit::<T>::uninit();
    copy_from_user_raw(
        value.as_mut_ptr() as *mut u8,
        ptr as *const u8,
        core::mem::size_of::<T>(),
    )?;
    // SAFETY: the copy fully initialized `value` or we returned EFAULT.
    Ok(unsafe { value.assume_init() })
}

/// Copy a `Copy` value into user memory.
pub fn copy_to_user<T: Copy>(ptr: u64, value: &T) -> KResult<()> {
    copy_to_user_raw(
        ptr as *mut u8,
        value as *const T as *const u8,
        core::mem::size_of::<T>(),
    )
}

/// Copy a user buffer into a kernel `Vec`.
pub fn copy_vec_from_user(ptr: u64, len: usize) -> KResult<alloc::vec::Vec<u8>> {
    let mut buf = alloc::vec::Vec::new();
    buf.try_reserve_exact(len).map_err(|_| ENOMEM)?;
    buf.resize(len, 0);
    copy_from_user_raw(buf.as_mut_ptr(), ptr as *const u8, len)?;
    Ok(buf)
}

/// Advisory pre-check of a user range against the current task's regions.
pub fn check_region(ptr: u64, len: u64, access: VmFlags) -> KResult<()> {
    let task = crate::task::scheduler::current();
    let guard = task.addr_space.lock();
    let space = guard.as_ref().ok_or(EFAULT)?;
    user_check_region(space, VirtAddr::new(ptr), len, access)
}

/// Scan for a NUL within the containing region, up to `max` bytes, and
/// return the string copied into kernel memory.
pub fn copy_string_from_user(ptr: u64, max: usize) -> KResult<alloc::string::String> {
    if ptr == 0 || ptr >= USER_SPACE_END {
        return Err(EFAULT);
    }

    let mut bytes = alloc::vec::Vec::new();
    let mut off = 0usize;
    let mut byte = [0u8; 1];
    while off < max {
        copy_from_user_raw(byte.as_mut_ptr(), (ptr + off as u64) as *const u8, 1)?;
        if byte[0] == 0 {
            return alloc::string::String::from_utf8(bytes).map_err(|_| EFAULT);
        }
        bytes.push(byte[0]);
        off += 1;
    }
    Err(crate::errno::ENAMETOOLONG)
}
