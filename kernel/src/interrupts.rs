//! IDT, PIC, the trap frame, and the user-mode entry/exit paths.
//!
//! Syscalls arrive through `int 0x80` with the number in `rax`; the naked
//! entry stub spills every general-purpose register into a `TrapFrame` on
//! the kernel stack, calls the dispatcher, and unwinds through
//! `trap_return`, which is also where freshly forked children and the first
//! exec of PID 1 enter user mode. Pending signals are dispatched on every
//! return to user mode.

use core::arch::global_asm;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use conquer_once::spin::OnceCell;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub const TIMER_VECTOR: u8 = PIC_1_OFFSET;
pub const SYSCALL_VECTOR: u8 = 0x80;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Register state captured at every trap boundary. Layout must match the
/// push/pop order in the assembly stubs below.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // Pushed by the CPU on the way in, consumed by iretq on the way out.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// A zeroed frame targeting user mode at `rip`/`rsp`, interrupts on.
    pub fn new_user(rip: u64, rsp: u64) -> TrapFrame {
        let (user_cs, user_ss) = crate::gdt::user_selectors();
        TrapFrame {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip,
            cs: user_cs as u64,
            rflags: 0x202, // IF set
            rsp,
            ss: user_ss as u64,
        }
    }

    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

global_asm!(
    r#"
.global syscall_entry_int80
syscall_entry_int80:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    mov rdi, rsp
    call syscall_trap_handler
    // fall through

.global trap_return
// rsp -> TrapFrame; forked children and first-exec enter here too.
trap_return:
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    iretq

.global user_enter
// user_enter(frame_rsp: u64 [rdi]) -> !
// Jump into user mode from a kernel thread: rdi points at a TrapFrame
// already placed on this task's kernel stack.
user_enter:
    mov rsp, rdi
    jmp trap_return
"#
);

extern "C" {
    fn syscall_entry_int80();
    pub fn trap_return() -> !;
    pub fn user_enter(frame_rsp: u64) -> !;
}

/// Address of `trap_return` for fork's hand-built context frames.
pub fn trap_return_addr() -> u64 {
    trap_return as usize as u64
}

#[no_mangle]
extern "C" fn syscall_trap_handler(frame: &mut TrapFrame) {
    crate::syscall::dispatch(frame);
    // Signals fire on the way back to user mode.
    crate::task::signal::deliver_pending(frame);
}

static IDT: OnceCell<InterruptDescriptorTable> = OnceCell::uninit();

pub fn init() {
    let idt = IDT.get_or_init(|| {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[TIMER_VECTOR].set_handler_fn(timer_interrupt_handler);
        unsafe {
            idt[SYSCALL_VECTOR]
                .set_handler_addr(x86_64::VirtAddr::new(syscall_entry_int80 as usize as u64))
                .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
        }
        idt
    });
    idt.load();

    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        // Only the timer line; device IRQs belong to external drivers.
        pics.write_masks(!0b0000_0001, 0xFF);
    }

    log::info!("IDT loaded, PIC initialized (timer unmasked)");
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!("breakpoint: {:?}", stack_frame);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    if stack_frame.code_segment.rpl() == x86_64::PrivilegeLevel::Ring3 {
        log::warn!(
            "invalid opcode in pid {} at {:#x}",
            crate::task::scheduler::current().pid,
            stack_frame.instruction_pointer.as_u64()
        );
        crate::task::sys::task_exit_signal(crate::task::signal::SIGILL);
    }
    panic!("kernel invalid opcode: {:?}", stack_frame);
}

extern "x86-interrupt" fn general_protection_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    if stack_frame.code_segment.rpl() == x86_64::PrivilegeLevel::Ring3 {
        log::warn!(
            "general protection fault in pid {} (err {:#x})",
            crate::task::scheduler::current().pid,
            error_code
        );
        crate::task::sys::task_exit_signal(crate::task::signal::SIGSEGV);
    }
    panic!(
        "kernel general protection fault (err {:#x}): {:?}",
        error_code, stack_frame
    );
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("double fault: {:?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    mut stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let fault_addr = Cr2::read().expect("CR2 read failed").as_u64();
    let from_user = error_code.contains(PageFaultErrorCode::USER_MODE);
    let write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);

    match crate::memory::page_fault::handle_fault(fault_addr, from_user, write) {
        crate::memory::page_fault::FaultResolution::Handled => {}
        crate::memory::page_fault::FaultResolution::KernelFixup(fixup_rip) => {
            // A user-copy helper faulted: redirect to its recovery address,
            // which reports EFAULT to the caller.
            unsafe {
                stack_frame
                    .as_mut()
                    .update(|frame| frame.instruction_pointer = x86_64::VirtAddr::new(fixup_rip));
            }
        }
        crate::memory::page_fault::FaultResolution::Fault => {
            if from_user {
                log::warn!(
                    "segfault: pid {} addr {:#x} (write={})",
                    crate::task::scheduler::current().pid,
                    fault_addr,
                    write
                );
                crate::task::sys::task_exit_signal(crate::task::signal::SIGSEGV);
            }
            panic!(
                "kernel page fault at {:#x} ({:?}): {:?}",
                fault_addr, error_code, stack_frame
            );
        }
    }
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    crate::time::on_tick();

    unsafe {
        PICS.lock().notify_end_of_interrupt(TIMER_VECTOR);
    }

    // Preempt whoever we interrupted; runs on their kernel stack, resumes
    // here when they are next scheduled, and returns through iretq.
    crate::task::scheduler::yield_preempt();
}
