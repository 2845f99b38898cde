//! The execution loader.
//!
//! Builds a process image: parse the executable, construct the new address
//! space region by region, and stage argv/envp in two phases. The strings
//! are copied into kernel buffers while the old address space is still
//! live; only after the new space is installed and activated are they laid
//! out at the top of the new user stack:
//!
//! ```text
//! ... argv strings ... envp strings ...
//! argv[0..argc] NULL
//! envp[0..envc] NULL
//! &envp, &argv, argc      <- final user SP points at argc
//! ```

pub mod elf;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use x86_64::VirtAddr;

use crate::errno::{KResult, E2BIG, ENOMEM};
use crate::fs::file::File;
use crate::interrupts::TrapFrame;
use crate::memory::address_space::{AddressSpace, RegionKind};
use crate::memory::buddy::{self, PAL_KERNEL};
use crate::memory::user::copy_to_user_raw;
use crate::memory::vma::{VmFlags, VmMap};
use crate::memory::{pg_align, pg_align_down, PG_SIZE, USER_STACK_SIZE, USER_STACK_TOP};
use elf::{ElfBinary, LoadSegment};

/// Upper bound on total argv+envp bytes.
const PARAM_MAX: usize = 64 * 1024;

/// Kernel-side staging of argv/envp (phase one).
pub struct ParamStrings {
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

impl ParamStrings {
    pub fn new(argv: Vec<String>, envp: Vec<String>) -> KResult<ParamStrings> {
        let total: usize = argv.iter().chain(envp.iter()).map(|s| s.len() + 1).sum();
        if total > PARAM_MAX {
            return Err(E2BIG);
        }
        Ok(ParamStrings { argv, envp })
    }
}

/// Build the address space for `binary`, backed by `file`.
///
/// Each LOAD section becomes a file-backed region spanning
/// `PG_ALIGN_DOWN(vaddr) .. PG_ALIGN(vaddr + filesz)`; a memsz overhang
/// becomes a separate anonymous bss region. When filesz ends mid-page the
/// boundary page is read eagerly and zero-padded past the file tail, since
/// that page holds both file bytes and bss zeros.
pub fn build_address_space(binary: &ElfBinary, file: &Arc<File>) -> KResult<AddressSpace> {
    let mut space = AddressSpace::new()?;

    for segment in &binary.segments {
        map_segment(&mut space, segment, file)?;
    }

    // Fixed stack near the top of the user half.
    let stack_start = VirtAddr::new(USER_STACK_TOP - USER_STACK_SIZE);
    let stack_end = VirtAddr::new(USER_STACK_TOP);
    space.add_map(
        VmMap::new(stack_start, stack_end, VmFlags::READ | VmFlags::WRITE),
        Some(RegionKind::Stack),
    )?;

    Ok(space)
}

fn map_segment(space: &mut AddressSpace, segment: &LoadSegment, file: &Arc<File>) -> KResult<()> {
    let file_start = pg_align_down(segment.vaddr);
    let file_end = pg_align(segment.vaddr + segment.filesz);
    let mem_end = pg_align(segment.vaddr + segment.memsz);

    let kind = if segment.flags.executable() {
        Some(RegionKind::Code)
    } else if segment.filesz > 0 {
        Some(RegionKind::Data)
    } else {
        Some(RegionKind::Bss)
    };

    if segment.filesz > 0 {
        let map = VmMap::new_backed(
            VirtAddr::new(file_start),
            VirtAddr::new(file_end),
            segment.flags,
            file.clone(),
            pg_align_down(segment.file_offset),
        );
        space.add_map(map, kind)?;

        // The last file-backed page may carry a bss head: pre-fill it with
        // file bytes up to filesz and zeros beyond, and map it eagerly so
        // the demand path never re-reads stale file bytes over the zeros.
        let tail = segment.vaddr + segment.filesz;
        if tail % PG_SIZE as u64 != 0 && segment.memsz > segment.filesz {
            fill_boundary_page(space, segment, file, tail)?;
        }
    }

    if mem_end > file_end {
        let bss = VmMap::new(
            VirtAddr::new(file_end.max(file_start)),
            VirtAddr::new(mem_end),
            VmFlags::READ | VmFlags::WRITE,
        );
        space.add_map(bss, Some(RegionKind::Bss))?;
    } else if segment.filesz == 0 && mem_end > file_start {
        let bss = VmMap::new(
            VirtAddr::new(file_start),
            VirtAddr::new(mem_end),
            VmFlags::READ | VmFlags::WRITE,
        );
        space.add_map(bss, Some(RegionKind::Bss))?;
    }

    Ok(())
}

fn fill_boundary_page(
    space: &mut AddressSpace,
    segment: &LoadSegment,
    file: &Arc<File>,
    tail: u64,
) -> KResult<()> {
    let page_base = pg_align_down(tail);
    let valid = (tail - page_base) as usize;

    let page = buddy::pzalloc(0, PAL_KERNEL).ok_or(ENOMEM)?;
    let buf = unsafe { core::slice::from_raw_parts_mut(page.virt().as_mut_ptr::<u8>(), valid) };

    let file_off = segment.file_offset + (page_base - segment.vaddr);
    let mut read = 0;
    while read < valid {
        let n = file.pread(&mut buf[read..], file_off + read as u64)?;
        if n == 0 {
            break;
        }
        read += n;
    }

    space.map_filled_page(VirtAddr::new(page_base), page, segment.flags)
}

/// Phase two: lay the staged strings out at the top of the new stack.
/// Returns the final user stack pointer (points at `argc`).
pub fn stage_params(params: &ParamStrings) -> KResult<u64> {
    let argc = params.argv.len();
    let envc = params.envp.len();

    let strings_len: usize = params
        .argv
        .iter()
        .chain(params.envp.iter())
        .map(|s| s.len() + 1)
        .sum();
    // argv[] + NULL, envp[] + NULL, then &envp, &argv, argc.
    let table_len = (argc + 1 + envc + 1 + 3) * 8;

    let top = USER_STACK_TOP;
    let strings_base = (top - strings_len as u64) & !0x7;
    let sp = (strings_base - table_len as u64) & !0xF;

    // Strings first.
    let mut cursor = strings_base;
    let mut argv_ptrs: Vec<u64> = Vec::with_capacity(argc + 1);
    let mut envp_ptrs: Vec<u64> = Vec::with_capacity(envc + 1);

    for (list, ptrs) in [
        (&params.argv, &mut argv_ptrs),
        (&params.envp, &mut envp_ptrs),
    ] {
        for s in list.iter() {
            copy_to_user_raw(cursor as *mut u8, s.as_ptr(), s.len())?;
            copy_to_user_raw((cursor + s.len() as u64) as *mut u8, b"\0".as_ptr(), 1)?;
            ptrs.push(cursor);
            cursor += s.len() as u64 + 1;
        }
        ptrs.push(0);
    }

    // Pointer tables and the argc/argv/envp triple, bottom-up from sp.
    let mut table: Vec<u64> = Vec::with_capacity(table_len / 8);
    let argv_table_addr = sp + 3 * 8;
    let envp_table_addr = argv_table_addr + (argc as u64 + 1) * 8;

    table.push(argc as u64);
    table.push(argv_table_addr);
    table.push(envp_table_addr);
    table.extend_from_slice(&argv_ptrs);
    table.extend_from_slice(&envp_ptrs);

    copy_to_user_raw(sp as *mut u8, table.as_ptr() as *const u8, table.len() * 8)?;

    Ok(sp)
}

/// Replace the current task's image with `file`. On success the trap frame
/// is rewritten to enter the new program; the caller returns to user mode
/// through it.
pub fn exec_image(
    file: Arc<File>,
    name: String,
    params: ParamStrings,
    frame: &mut TrapFrame,
) -> KResult<()> {
    let binary = elf::elf_parse(&file)?;
    let new_space = build_address_space(&binary, &file)?;

    let task = crate::task::scheduler::current();

    // Point of no return: install and activate the new space, then drop
    // the old one.
    let old_space = {
        let mut guard = task.addr_space.lock();
        let old = guard.take();
        new_space.activate();
        *guard = Some(new_space);
        old
    };
    drop(old_space);

    let sp = stage_params(&params)?;

    // Exec resets caught handlers, closes close-on-exec descriptors, and
    // renames the task; pid, ppid, pgid, session, cwd, and credentials all
    // survive.
    task.sig.exec_reset();
    task.files.close_cloexec();
    *task.name.lock() = name;

    *frame = TrapFrame::new_user(binary.entry, sp);
    Ok(())
}

/// First entry into user mode for a task that has never been there: build
/// the image, place the trap frame at the top of this task's kernel stack,
/// and fall through `trap_return`. Used by the init bootstrap; only
/// returns (with the error) when the exec failed.
pub fn exec_into_user(
    file: Arc<File>,
    name: String,
    params: ParamStrings,
) -> crate::errno::Errno {
    let mut frame = TrapFrame::new_user(0, 0);
    if let Err(err) = exec_image(file, name, params, &mut frame) {
        return err;
    }

    let task = crate::task::scheduler::current();
    task.mark_user();

    unsafe {
        let top = task.kstack.top().as_u64() & !0xF;
        let slot = (top - core::mem::size_of::<TrapFrame>() as u64) as *mut TrapFrame;
        slot.write(frame);
        crate::interrupts::user_enter(slot as u64);
    }
}
