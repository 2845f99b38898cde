//! ELF executable parsing.
//!
//! Reads the header and program headers through the VFS and reduces them to
//! the load segments the address-space builder consumes. Only 64-bit
//! little-endian executables for this machine are accepted.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errno::{KResult, ENOEXEC};
use crate::fs::file::File;
use crate::memory::vma::VmFlags;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 0x3E;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1 << 0;
const PF_W: u32 = 1 << 1;
const PF_R: u32 = 1 << 2;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct ElfHeader {
    ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct ProgramHeader {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// One `PT_LOAD` section reduced to what the loader needs.
#[derive(Debug, Clone, Copy)]
pub struct LoadSegment {
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub file_offset: u64,
    pub flags: VmFlags,
}

#[derive(Debug)]
pub struct ElfBinary {
    pub entry: u64,
    pub segments: Vec<LoadSegment>,
}

fn read_struct<T: Copy>(file: &Arc<File>, offset: u64) -> KResult<T> {
    let mut value = core::mem::MaybeUninit::<T>::uninit();
    let buf = unsafe {
        core::slice::from_raw_parts_mut(
            value.as_mut_ptr() as *mut u8,
            core::mem::size_of::<T>(),
        )
    };
    let mut read = 0;
    while read < buf.len() {
        let n = file.pread(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Err(ENOEXEC);
        }
        read += n;
    }
    // SAFETY: fully overwritten above.
    Ok(unsafe { value.assume_init() })
}

fn segment_flags(p_flags: u32) -> VmFlags {
    let mut flags = VmFlags::empty();
    if p_flags & PF_R != 0 {
        flags = flags | VmFlags::READ;
    }
    if p_flags & PF_W != 0 {
        flags = flags | VmFlags::WRITE;
    }
    if p_flags & PF_X != 0 {
        flags = flags | VmFlags::EXEC;
    }
    flags
}

/// Parse the executable, verifying magic and machine, and collect the
/// `PT_LOAD` program sections.
pub fn elf_parse(file: &Arc<File>) -> KResult<ElfBinary> {
    let header: ElfHeader = read_struct(file, 0)?;

    if header.ident[..4] != ELF_MAGIC {
        return Err(ENOEXEC);
    }
    if header.ident[4] != ELF_CLASS_64 || header.ident[5] != ELF_DATA_LSB {
        return Err(ENOEXEC);
    }
    if header.e_type != ET_EXEC || header.e_machine != EM_X86_64 {
        return Err(ENOEXEC);
    }
    if header.e_phentsize as usize != core::mem::size_of::<ProgramHeader>() {
        return Err(ENOEXEC);
    }

    let mut segments = Vec::new();
    for i in 0..header.e_phnum {
        let offset = header.e_phoff + i as u64 * header.e_phentsize as u64;
        let ph: ProgramHeader = read_struct(file, offset)?;

        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.p_memsz < ph.p_filesz {
            return Err(ENOEXEC);
        }
        segments.push(LoadSegment {
            vaddr: ph.p_vaddr,
            filesz: ph.p_filesz,
            memsz: ph.p_memsz,
            file_offset: ph.p_offset,
            flags: segment_flags(ph.p_flags),
        });
    }

    if segments.is_empty() {
        return Err(ENOEXEC);
    }

    Ok(ElfBinary {
        entry: header.e_entry,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn flag_translation() {
        let rx = segment_flags(PF_R | PF_X);
        assert!(rx.readable() && rx.executable() && !rx.writable());
        let rw = segment_flags(PF_R | PF_W);
        assert!(rw.readable() && rw.writable() && !rw.executable());
    }

    #[test_case]
    fn header_sizes_are_elf64() {
        assert_eq!(core::mem::size_of::<ElfHeader>(), 64);
        assert_eq!(core::mem::size_of::<ProgramHeader>(), 56);
    }
}
