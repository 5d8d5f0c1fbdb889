//! Physical and virtual memory map.
//!
//! The boot loader enters the kernel with the high-half mapping active: the
//! upper gigabyte of every address space aliases physical memory from 0, and
//! the last directory entry self-maps the page directory.

/// Base of the kernel half of every address space.
pub const KERNBASE: usize = 0xc000_0000;

/// First virtual address handed out by the kernel virtual pool. Low memory
/// below 1 MiB stays reserved for the loader, the main task's PCB and the
/// pool bitmaps.
pub const K_HEAP_START: usize = 0xc010_0000;

/// The physical-pool and kernel virtual-pool bitmaps live in this reserved
/// low-memory window, established before any allocator exists.
pub const MEM_BITMAP_BASE: usize = 0xc009_a000;

/// PCB page of the boot (main) task; the loader parks the initial stack at
/// the top of this page.
pub const MAIN_TASK_PCB: usize = 0xc009_e000;

/// Physical address of the kernel page directory set up by the loader.
pub const KERNEL_PGDIR_PA: usize = 0x10_0000;

/// User images link at this base (the conventional ELF32 text base).
pub const USER_VADDR_START: usize = 0x0804_8000;

/// Top of user space; the page right below it is the ring-3 stack.
pub const USER_STACK_TOP: usize = KERNBASE;
pub const USER_STACK3_VADDR: usize = KERNBASE - crate::param::PGSIZE;

/// The loader reports the usable memory byte count at this low-memory word;
/// the BIOS records the disk count at 0x475.
pub const BOOT_TOTAL_MEM: usize = KERNBASE + 0xb00;
pub const BOOT_DISK_CNT: usize = KERNBASE + 0x475;

/// Directory entries covering user space; entries 768..1022 are the shared
/// kernel half and 1023 is the self-map.
pub const USER_PDE_CNT: usize = 768;
