//! fork: clone the calling user process.

use core::ptr;

use crate::arch::{self, IntrStack};
use crate::file;
use crate::heap;
use crate::intr::HeldInterrupts;
use crate::kalloc::PoolFlag;
use crate::memlayout::{KERNBASE, USER_VADDR_START};
use crate::param::{NOFILE, PGSIZE};
use crate::proc::{self, Pid, Task, TaskStatus};
use crate::utils::div_round_up;
use crate::vm;

const WORD: usize = core::mem::size_of::<usize>();

/// Clones the parent's PCB page wholesale, then patches the fields that must
/// differ: identity, queue links, a private copy of the virtual-address
/// bitmap, and empty block descriptors so the child cannot dangle on the
/// parent's arenas.
unsafe fn copy_pcb_vaddrbitmap_stack0(child: *mut Task, parent: *mut Task) -> Result<(), ()> {
    // SAFETY (whole function): both PCB pages are exclusively ours while
    // fork runs with interrupts off.
    unsafe {
        // The page copy brings the PCB fields and the zero-ring stack,
        // including the parent's trap frame at the top.
        ptr::copy_nonoverlapping(parent as *const u8, child as *mut u8, PGSIZE);

        (*child).pid = proc::fork_pid();
        (*child).elapsed_ticks = 0;
        (*child).status = TaskStatus::Ready;
        (*child).ticks = (*child).priority;
        (*child).parent_pid = (*parent).pid;
        // The copied links alias the parent's queues; reset them.
        (*child).general_tag.init();
        (*child).all_tag.init();
        heap::block_desc_init(&mut (*child).u_block_descs);

        // Deep-copy the virtual-address bitmap; the copied one still points
        // into the parent's buffer.
        let bytes = (KERNBASE - USER_VADDR_START) / PGSIZE / 8;
        let bitmap_pg_cnt = div_round_up(bytes, PGSIZE);
        let vaddr_btmp = vm::get_kernel_pages(bitmap_pg_cnt).ok_or(())?;
        ptr::copy_nonoverlapping(
            (*child).user_vaddr.bitmap.as_mut_ptr() as *const u8,
            vaddr_btmp as *mut u8,
            bytes,
        );
        (*child).user_vaddr.bitmap = crate::bitmap::Bitmap::from_raw(vaddr_btmp as *mut u8, bytes);

        let _ = (*child).name.try_push_str("_fork");
    }
    Ok(())
}

/// Copies every mapped user page of the parent into the child through a
/// kernel bounce page, flipping page directories around each transfer.
unsafe fn copy_body_stack3(child: *mut Task, parent: *mut Task, buf_page: usize) {
    // SAFETY (whole function): interrupts are off; the bounce page is a
    // private kernel page; the child's directory shares the kernel half, so
    // kernel data stays reachable after the CR3 switch.
    unsafe {
        let btmp_bytes_len = (*parent).user_vaddr.bitmap.bytes_len();
        let vaddr_start = (*parent).user_vaddr.vaddr_start;

        for idx_byte in 0..btmp_bytes_len {
            if *(*parent).user_vaddr.bitmap.as_mut_ptr().add(idx_byte) == 0 {
                continue;
            }
            for idx_bit in 0..8 {
                if !(*parent).user_vaddr.bitmap.test(idx_byte * 8 + idx_bit) {
                    continue;
                }
                let prog_vaddr = (idx_byte * 8 + idx_bit) * PGSIZE + vaddr_start;

                ptr::copy_nonoverlapping(prog_vaddr as *const u8, buf_page as *mut u8, PGSIZE);

                // Map the same virtual page in the child and fill it. The
                // bitmap bit is already set from the deep copy.
                proc::process::page_dir_activate(child);
                let _ = vm::get_a_page_without_vbitmap(PoolFlag::User, prog_vaddr)
                    .expect("fork: child page");
                ptr::copy_nonoverlapping(buf_page as *const u8, prog_vaddr as *mut u8, PGSIZE);

                proc::process::page_dir_activate(parent);
            }
        }
    }
}

/// Builds the child's switch frame right below its copied trap frame, so
/// its first dispatch returns through `intr_exit` — straight back to user
/// mode with `eax` forced to 0.
unsafe fn build_child_stack(child: *mut Task) {
    // SAFETY: the child page top holds the copied trap frame.
    unsafe {
        let intr_stack =
            (child as usize + PGSIZE - core::mem::size_of::<IntrStack>()) as *mut IntrStack;
        (*intr_stack).eax = 0;

        let eip_slot = (intr_stack as usize - WORD) as *mut usize;
        *eip_slot = arch::intr_exit as usize;
        // Callee-saved slots below eip; their values do not matter on this
        // path, zero keeps the frame tidy.
        for i in 2..=5 {
            *((intr_stack as usize - i * WORD) as *mut usize) = 0;
        }
        (*child).kstack = (intr_stack as usize - 5 * WORD) as *mut usize;
    }
}

/// Every file the child inherits gains one reference: inode open counts for
/// regular files, the slot's dup count for pipes.
unsafe fn update_file_refs(child: *mut Task) {
    for local_fd in 3..NOFILE {
        // SAFETY: the fd table was just copied from the parent, whose
        // entries are live.
        unsafe {
            let global_fd = (*child).fd_table[local_fd];
            if global_fd != -1 {
                file::dup_global_slot(global_fd as usize);
            }
        }
    }
}

unsafe fn copy_process(child: *mut Task, parent: *mut Task) -> Result<(), ()> {
    // Bounce page for the user-space copy.
    let buf_page = vm::get_kernel_pages(1).ok_or(())?;
    // SAFETY: delegated to the helpers.
    unsafe {
        copy_pcb_vaddrbitmap_stack0(child, parent)?;
        (*child).pgdir = proc::process::create_page_dir().ok_or(())?;
        copy_body_stack3(child, parent, buf_page);
        build_child_stack(child);
        update_file_refs(child);
    }
    vm::mfree_page(PoolFlag::Kernel, buf_page, 1);
    Ok(())
}

/// Clones the calling user process. The parent gets the child's pid, the
/// child gets 0. Kernel threads must not call this.
pub fn sys_fork() -> Pid {
    let _held = HeldInterrupts::new();
    let parent = proc::current_task();
    let Some(child_page) = vm::get_kernel_pages(1) else {
        return -1;
    };
    let child = child_page as *mut Task;
    // SAFETY: fork runs with interrupts off on the parent.
    unsafe {
        assert!((*parent).pgdir != 0, "fork from a kernel thread");
        if copy_process(child, parent).is_err() {
            return -1;
        }

        debug_assert!(!proc::ready_list().contains(&mut (*child).general_tag));
        proc::ready_list().push_back(&mut (*child).general_tag);
        debug_assert!(!proc::all_list().contains(&mut (*child).all_tag));
        proc::all_list().push_back(&mut (*child).all_tag);

        (*child).pid
    }
}
