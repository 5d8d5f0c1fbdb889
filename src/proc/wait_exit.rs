//! wait and exit: zombie reaping and resource teardown.

use crate::elem2entry;
use crate::file;
use crate::intr::HeldInterrupts;
use crate::kalloc::{self, PoolFlag};
use crate::memlayout::USER_PDE_CNT;
use crate::param::{NOFILE, PGSIZE};
use crate::proc::{self, Pid, Task, TaskStatus};
use crate::utils::div_round_up;
use crate::vm;

/// Releases everything a dying user process holds short of its PCB page:
/// every user frame reachable from its page tables, the pages backing its
/// virtual-address bitmap, and its open files.
fn release_prog_resource(task: *mut Task) {
    // SAFETY: `task` is current and its directory is the active one, so the
    // self-map walks its own tables.
    unsafe {
        let pgdir_vaddr = (*task).pgdir as *mut usize;
        let present = vm::PteFlags::P.bits();

        // (1) User frames and their page tables.
        for pde_idx in 0..USER_PDE_CNT {
            let pde = *pgdir_vaddr.add(pde_idx);
            if pde & present == 0 {
                continue;
            }
            // One directory entry spans 4 MiB.
            let first_pte = vm::pte_ptr(pde_idx * 0x40_0000);
            for pte_idx in 0..1024 {
                let pte = *first_pte.add(pte_idx);
                if pte & present != 0 {
                    kalloc::free_a_phy_page(pte & 0xffff_f000);
                }
            }
            kalloc::free_a_phy_page(pde & 0xffff_f000);
        }

        // (2) The kernel pages backing the virtual-address bitmap.
        let bitmap_pg_cnt = div_round_up((*task).user_vaddr.bitmap.bytes_len(), PGSIZE);
        let bits = (*task).user_vaddr.bitmap.as_mut_ptr() as usize;
        vm::mfree_page(PoolFlag::Kernel, bits, bitmap_pg_cnt);

        // (3) Open files, pipe-aware through the fd layer.
        for local_fd in 3..NOFILE as i32 {
            if (*task).fd_table[local_fd as usize] != -1 {
                let _ = file::sys_close(local_fd);
            }
        }
    }
}

/// Reaps one Hanging child: copies its exit status out, frees its PCB and
/// pid, and returns its pid. With no children at all returns -1; otherwise
/// blocks Waiting until some child exits.
pub fn sys_wait(status: *mut i32) -> Pid {
    let parent = proc::current_task();
    loop {
        // SAFETY: list walks run with interrupts off.
        let hanging = {
            let _held = HeldInterrupts::new();
            unsafe {
                proc::all_list().traverse(|elem| {
                    let t = elem2entry!(Task, all_tag, elem);
                    (*t).parent_pid == (*parent).pid && (*t).status == TaskStatus::Hanging
                })
            }
        };
        if let Some(elem) = hanging {
            let child = elem2entry!(Task, all_tag, elem);
            // SAFETY: a Hanging child is inert; only its reaper touches it.
            unsafe {
                if !status.is_null() {
                    *status = (*child).exit_status;
                }
                let child_pid = (*child).pid;
                proc::thread_exit(child, false);
                return child_pid;
            }
        }

        let any_child = {
            let _held = HeldInterrupts::new();
            unsafe {
                proc::all_list().traverse(|elem| {
                    (*elem2entry!(Task, all_tag, elem)).parent_pid == (*parent).pid
                })
            }
        };
        if any_child.is_none() {
            return -1;
        }
        // Children still running; sleep until one of them exits.
        proc::thread_block(TaskStatus::Waiting);
    }
}

/// Terminates the calling process: children are reparented to init (pid 1),
/// resources released, the parent woken if it is waiting, and the task
/// hangs until reaped.
pub fn sys_exit(status: i32) -> ! {
    let cur = proc::current_task();
    // SAFETY: fields of the current task; list walks under held interrupts.
    unsafe {
        (*cur).exit_status = status;
        assert!((*cur).parent_pid != -1, "exit of a parentless task");

        {
            let _held = HeldInterrupts::new();
            let _ = proc::all_list().traverse(|elem| {
                let t = elem2entry!(Task, all_tag, elem);
                if (*t).parent_pid == (*cur).pid {
                    (*t).parent_pid = 1;
                }
                false
            });
        }

        release_prog_resource(cur);

        let parent = proc::pid_to_task((*cur).parent_pid);
        if !parent.is_null() && (*parent).status == TaskStatus::Waiting {
            proc::thread_unblock(parent);
        }

        proc::thread_block(TaskStatus::Hanging);
    }
    panic!("sys_exit: resumed after hanging");
}
