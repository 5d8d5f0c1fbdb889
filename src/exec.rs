//! exec: replace the current process image with an ELF32 executable loaded
//! from the file system.

use zerocopy::{AsBytes, FromBytes};

use crate::arch::{self, IntrStack};
use crate::file::{self, O_RDONLY, SEEK_SET};
use crate::memlayout::USER_STACK_TOP;
use crate::param::PGSIZE;
use crate::proc;
use crate::vm::{self, PteFlags};
use crate::println;

/// "\x7fELF", version 1, 32-bit, little-endian.
const ELF_IDENT: &[u8; 7] = b"\x7fELF\x01\x01\x01";
/// ET_EXEC.
const ELF_TYPE_EXEC: u16 = 2;
/// EM_386.
const ELF_MACHINE_386: u16 = 3;
/// Loadable program-header type.
const PT_LOAD: u32 = 1;

#[derive(Default, Clone, Copy, FromBytes, AsBytes)]
#[repr(C)]
struct Elf32Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[derive(Default, Clone, Copy, FromBytes, AsBytes)]
#[repr(C)]
struct Elf32Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<Elf32Ehdr>(), 52);
static_assertions::const_assert_eq!(core::mem::size_of::<Elf32Phdr>(), 32);

impl Elf32Ehdr {
    fn is_valid(&self) -> bool {
        &self.e_ident[..7] == ELF_IDENT
            && self.e_type == ELF_TYPE_EXEC
            && self.e_machine == ELF_MACHINE_386
            && self.e_version == 1
            && self.e_phnum <= 1024
            && self.e_phentsize == core::mem::size_of::<Elf32Phdr>() as u16
    }
}

/// Copies `filesz` bytes at file offset `offset` to virtual `vaddr`,
/// demand-allocating any page of the range not yet mapped in the current
/// process.
fn segment_load(fd: i32, offset: u32, filesz: u32, vaddr: u32) -> Result<(), ()> {
    let vaddr_first_page = vaddr as usize & !(PGSIZE - 1);
    let size_in_first_page = PGSIZE - (vaddr as usize & (PGSIZE - 1));
    let occupy_pages = if filesz as usize > size_in_first_page {
        crate::utils::div_round_up(filesz as usize - size_in_first_page, PGSIZE) + 1
    } else {
        1
    };

    let mut vaddr_page = vaddr_first_page;
    for _ in 0..occupy_pages {
        // An exec over a forked image may find pages already mapped; they
        // are simply overwritten.
        // SAFETY: self-mapped table lookups on the active directory.
        let mapped = unsafe {
            let pde = vm::pde_ptr(vaddr_page);
            *pde & PteFlags::P.bits() != 0 && *vm::pte_ptr(vaddr_page) & PteFlags::P.bits() != 0
        };
        if !mapped && vm::get_a_page(crate::kalloc::PoolFlag::User, vaddr_page).is_none() {
            return Err(());
        }
        vaddr_page += PGSIZE;
    }

    if file::sys_lseek(fd, offset as i32, SEEK_SET) == -1 {
        return Err(());
    }
    // SAFETY: the range was mapped above; user space is reachable through
    // the shared address space.
    let dst = unsafe { core::slice::from_raw_parts_mut(vaddr as *mut u8, filesz as usize) };
    if file::sys_read(fd, dst) != filesz as isize {
        return Err(());
    }
    Ok(())
}

/// Loads `pathname` and returns its entry point.
fn load(pathname: &str) -> Result<u32, ()> {
    let fd = file::sys_open(pathname, O_RDONLY);
    if fd == -1 {
        println!("exec: {} does not exist", pathname);
        return Err(());
    }
    // Whatever happens below, the fd goes back.
    let fd_guard = scopeguard::guard(fd, |fd| {
        let _ = file::sys_close(fd);
    });
    let fd = *fd_guard;

    let mut elf_header = Elf32Ehdr::default();
    if file::sys_read(fd, elf_header.as_bytes_mut())
        != core::mem::size_of::<Elf32Ehdr>() as isize
    {
        return Err(());
    }
    if !elf_header.is_valid() {
        return Err(());
    }

    for prog_idx in 0..elf_header.e_phnum as u32 {
        let prog_header_offset =
            elf_header.e_phoff + prog_idx * elf_header.e_phentsize as u32;
        if file::sys_lseek(fd, prog_header_offset as i32, SEEK_SET) == -1 {
            return Err(());
        }
        let mut prog_header = Elf32Phdr::default();
        if file::sys_read(fd, prog_header.as_bytes_mut())
            != core::mem::size_of::<Elf32Phdr>() as isize
        {
            return Err(());
        }
        if prog_header.p_type == PT_LOAD {
            segment_load(
                fd,
                prog_header.p_offset,
                prog_header.p_filesz,
                prog_header.p_vaddr,
            )?;
        }
    }
    Ok(elf_header.e_entry)
}

/// Replaces the current process with `path`. `argv` is the caller's
/// null-terminated pointer array, handed to the new image verbatim
/// (`ebx` = argv, `ecx` = argc). Returns -1 only on load failure; success
/// does not return.
pub fn sys_execv(path: &str, argv: *const *const u8) -> i32 {
    let mut argc: u32 = 0;
    // SAFETY: the caller's argv is a null-terminated array in the shared
    // address space.
    unsafe {
        while !(*argv.add(argc as usize)).is_null() {
            argc += 1;
        }
    }

    let Ok(entry_point) = load(path) else {
        return -1;
    };

    let cur = proc::current_task();
    // SAFETY: rewriting our own name and our own trap frame; the jump
    // below never returns.
    unsafe {
        (*cur).name.clear();
        let tail = &path[path.len().saturating_sub(crate::param::TASK_NAME_LEN - 1)..];
        let _ = (*cur).name.try_push_str(if path.len() < crate::param::TASK_NAME_LEN {
            path
        } else {
            tail
        });

        let frame =
            (cur as usize + PGSIZE - core::mem::size_of::<IntrStack>()) as *mut IntrStack;
        (*frame).ebx = argv as usize as u32;
        (*frame).ecx = argc;
        (*frame).eip = entry_point;
        (*frame).esp = USER_STACK_TOP as u32;

        // No scheduler hop: straight out through the trampoline.
        arch::jump_to_intr_exit(frame);
    }
}
