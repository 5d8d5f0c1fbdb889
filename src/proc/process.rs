//! User-process bootstrap: address-space creation and the first drop to
//! ring 3.

use core::ptr;

use crate::arch::{self, IntrStack, EFLAGS_USER, SELECTOR_U_CODE, SELECTOR_U_DATA};
use crate::bitmap::Bitmap;
use crate::heap;
use crate::intr::HeldInterrupts;
use crate::kalloc::PoolFlag;
use crate::memlayout::{KERNBASE, KERNEL_PGDIR_PA, USER_STACK3_VADDR, USER_VADDR_START};
use crate::param::{DEFAULT_PRIO, PGSIZE};
use crate::proc::{self, Task, ThreadFunc, ThreadStack};
use crate::utils::div_round_up;
use crate::vm;

/// Thread body of a nascent user process: builds a ring-3 trap frame whose
/// `eip` is the process entry, gives it a fresh user stack page, and leaves
/// through the interrupt-exit trampoline.
pub fn start_process(entry: usize) {
    let cur = proc::current_task();
    // SAFETY: runs as the first code of `cur`; the PCB page top holds room
    // reserved by thread_create for exactly this frame.
    unsafe {
        let kstack = (*cur).kstack as usize + core::mem::size_of::<ThreadStack>();
        (*cur).kstack = kstack as *mut usize;
        let frame = kstack as *mut IntrStack;

        ptr::write(
            frame,
            IntrStack {
                vec_no: 0,
                edi: 0,
                esi: 0,
                ebp: 0,
                esp_dummy: 0,
                ebx: 0,
                edx: 0,
                ecx: 0,
                eax: 0,
                gs: 0,
                fs: SELECTOR_U_DATA,
                es: SELECTOR_U_DATA,
                ds: SELECTOR_U_DATA,
                err_code: 0,
                eip: entry as u32,
                cs: SELECTOR_U_CODE,
                eflags: EFLAGS_USER,
                esp: (vm::get_a_page(PoolFlag::User, USER_STACK3_VADDR).expect("user stack page")
                    + PGSIZE) as u32,
                ss: SELECTOR_U_DATA,
            },
        );
        arch::jump_to_intr_exit(frame);
    }
}

/// Loads the page directory of `task` (the kernel's own for kernel
/// threads). A kernel thread scheduled after a user process must switch
/// back, or it would keep running on the process's tables.
pub fn page_dir_activate(task: *mut Task) {
    // SAFETY: PCB live; a non-zero pgdir was mapped by create_page_dir.
    unsafe {
        let pagedir_phy = if (*task).pgdir == 0 {
            KERNEL_PGDIR_PA
        } else {
            vm::addr_v2p((*task).pgdir)
        };
        arch::load_pgdir(pagedir_phy);
    }
}

/// Page directory plus, for user tasks, the TSS `esp0` update so the next
/// trap lands on this task's kernel stack.
pub fn process_activate(task: *mut Task) {
    assert!(!task.is_null());
    page_dir_activate(task);
    // SAFETY: PCB live.
    unsafe {
        if (*task).pgdir != 0 {
            arch::update_tss_esp0(task as usize + PGSIZE);
        }
    }
}

/// Allocates a page directory whose kernel half mirrors the kernel's and
/// whose last entry self-maps. Returns its kernel virtual address.
pub fn create_page_dir() -> Option<usize> {
    // Kept out of user reach: the directory lives in kernel space.
    let page_dir_vaddr = vm::get_kernel_pages(1)?;
    // SAFETY: fresh page; the kernel directory is reachable through the
    // active self-map.
    unsafe {
        // Entries 768.. cover the shared kernel gigabyte.
        ptr::copy_nonoverlapping(
            (0xffff_f000usize + 0x300 * 4) as *const u8,
            (page_dir_vaddr + 0x300 * 4) as *mut u8,
            1024,
        );
        let new_pgdir_pa = vm::addr_v2p(page_dir_vaddr);
        let flags = (vm::PteFlags::P | vm::PteFlags::RW | vm::PteFlags::US).bits();
        *((page_dir_vaddr as *mut usize).add(1023)) = new_pgdir_pa | flags;
    }
    Some(page_dir_vaddr)
}

/// Gives `task` its user virtual pool: one bit per page between the ELF
/// base and the top of user space, backed by kernel pages.
pub fn create_user_vaddr_bitmap(task: *mut Task) {
    let bytes = (KERNBASE - USER_VADDR_START) / PGSIZE / 8;
    let bitmap_pg_cnt = div_round_up(bytes, PGSIZE);
    let bits = vm::get_kernel_pages(bitmap_pg_cnt).expect("user vaddr bitmap");
    // SAFETY: PCB handed over by the caller; pages just allocated.
    unsafe {
        (*task).user_vaddr.vaddr_start = USER_VADDR_START;
        (*task).user_vaddr.bitmap = Bitmap::from_raw(bits as *mut u8, bytes);
        (*task).user_vaddr.bitmap.init();
    }
}

/// Creates a user process that starts executing `body` in ring 3.
pub fn process_execute(body: ThreadFunc, name: &str) -> *mut Task {
    // PCBs are kernel bookkeeping, so they come from the kernel pool.
    let task = vm::get_kernel_pages(1).expect("PCB page") as *mut Task;
    // SAFETY: fresh page.
    unsafe {
        proc::init_thread(task, name, DEFAULT_PRIO);
        create_user_vaddr_bitmap(task);
        proc::thread_create(task, start_process, body as usize);
        (*task).pgdir = create_page_dir().expect("page directory");
        heap::block_desc_init(&mut (*task).u_block_descs);

        let _held = HeldInterrupts::new();
        debug_assert!(!proc::ready_list().contains(&mut (*task).general_tag));
        proc::ready_list().push_back(&mut (*task).general_tag);
        debug_assert!(!proc::all_list().contains(&mut (*task).all_tag));
        proc::all_list().push_back(&mut (*task).all_tag);
    }
    task
}
