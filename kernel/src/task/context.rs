//! Context switching.
//!
//! A context is nothing more than a saved kernel stack pointer: the switch
//! pushes the callee-saved registers onto the outgoing stack, swaps `rsp`,
//! and pops them from the incoming one. New tasks get a hand-built stack
//! frame that "returns" into the entry trampoline.

use core::arch::global_asm;
use core::cell::UnsafeCell;

use x86_64::VirtAddr;

global_asm!(
    r#"
.global arch_context_switch
// arch_context_switch(old_rsp_slot: *mut u64 [rdi], new_rsp: u64 [rsi])
//
// Caller-saved registers are dead across the call per the SysV ABI; only
// callee-saved state needs to travel with the stack.
arch_context_switch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov rsp, rsi
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

.global task_entry_trampoline
// First instruction a new task ever runs. The bootstrap frame put the entry
// function in rbx and its argument in r12; interrupts were off across the
// switch and get re-enabled here.
task_entry_trampoline:
    sti
    mov rdi, r12
    call rbx
    call task_entry_returned
"#
);

extern "C" {
    pub fn arch_context_switch(old_rsp_slot: *mut u64, new_rsp: u64);
    fn task_entry_trampoline();
}

/// A kernel task function never returns; landing here is a bug.
#[no_mangle]
extern "C" fn task_entry_returned() -> ! {
    panic!("task entry function returned");
}

/// Saved kernel `rsp` while the task is switched out.
pub struct TaskContext {
    rsp: UnsafeCell<u64>,
}

impl TaskContext {
    pub const fn new() -> TaskContext {
        TaskContext {
            rsp: UnsafeCell::new(0),
        }
    }

    pub fn rsp_slot(&self) -> *mut u64 {
        self.rsp.get()
    }

    /// # Safety
    ///
    /// Only meaningful while the owning task is switched out.
    pub unsafe fn rsp(&self) -> u64 {
        *self.rsp.get()
    }

    /// Build the bootstrap frame for a fresh task on `stack_top`.
    ///
    /// Layout matches `arch_context_switch`'s pop sequence: six callee-saved
    /// slots then the return address. `rbx` carries the entry function and
    /// `r12` its argument, which the trampoline moves into `rdi`.
    pub fn init(&self, stack_top: VirtAddr, entry: extern "C" fn(usize) -> !, arg: usize) {
        const FRAME_WORDS: usize = 7;
        let top = stack_top.as_u64() & !0xF;
        let frame = (top - (FRAME_WORDS * 8) as u64) as *mut u64;

        unsafe {
            frame.add(0).write(0); // r15
            frame.add(1).write(0); // r14
            frame.add(2).write(0); // r13
            frame.add(3).write(arg as u64); // r12 -> rdi
            frame.add(4).write(entry as usize as u64); // rbx, called by trampoline
            frame.add(5).write(0); // rbp
            frame.add(6).write(task_entry_trampoline as usize as u64); // ret target

            *self.rsp.get() = frame as u64;
        }
    }

    /// Point the context at an arbitrary prepared frame (fork's copied trap
    /// frame return path).
    ///
    /// # Safety
    ///
    /// `rsp` must reference a frame laid out for `arch_context_switch`.
    pub unsafe fn set_rsp(&self, rsp: u64) {
        *self.rsp.get() = rsp;
    }
}
