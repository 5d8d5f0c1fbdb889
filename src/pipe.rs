//! Pipes: a ring buffer behind a shared file-table slot.

use alloc::boxed::Box;

use crate::file::{self, PIPE_FLAG};
use crate::ioqueue::IoQueue;
use crate::proc;

/// Whether the task-local `fd` currently refers to a pipe slot.
pub fn is_pipe(local_fd: i32) -> bool {
    let cur = proc::current_task();
    // SAFETY: task-private table.
    let global_fd = unsafe { (*cur).fd_table[local_fd as usize] };
    if global_fd < 0 {
        return false;
    }
    file::file_table()[global_fd as usize].flags == PIPE_FLAG
}

fn ring_of(global_fd: usize) -> &'static IoQueue {
    let file = &file::file_table()[global_fd];
    debug_assert_eq!(file.flags, PIPE_FLAG);
    // SAFETY: a pipe slot's inode pointer is the ring buffer, alive while
    // the slot's dup count is non-zero.
    unsafe { &*(file.inode as *const IoQueue) }
}

pub(crate) fn free_ring(ring: *mut crate::fs::Inode) {
    // SAFETY: allocated in sys_pipe via Box::new.
    unsafe { drop(Box::from_raw(ring as *mut IoQueue)) };
}

/// Creates a pipe: one global slot, one kernel page of ring buffer, the
/// same slot installed behind both returned fds (read end first).
pub fn sys_pipe(pipefd: &mut [i32; 2]) -> i32 {
    let table = file::file_table();
    let Some(global_fd) = table.iter().position(|f| f.inode.is_null()) else {
        return -1;
    };

    // The ring buffer rides the slot's inode pointer; the dup count rides
    // its position field.
    let ring = Box::into_raw(Box::new(IoQueue::new()));
    table[global_fd].inode = ring as *mut crate::fs::Inode;
    table[global_fd].flags = PIPE_FLAG;
    table[global_fd].pos = 2;

    let Some(fd0) = file::pcb_fd_install(global_fd) else {
        table[global_fd].inode = core::ptr::null_mut();
        free_ring(ring as *mut crate::fs::Inode);
        return -1;
    };
    let Some(fd1) = file::pcb_fd_install(global_fd) else {
        let cur = proc::current_task();
        // SAFETY: undoing the install just made in our own table.
        unsafe { (*cur).fd_table[fd0 as usize] = -1 };
        table[global_fd].inode = core::ptr::null_mut();
        free_ring(ring as *mut crate::fs::Inode);
        return -1;
    };
    pipefd[0] = fd0;
    pipefd[1] = fd1;
    0
}

/// Reads at most the bytes currently buffered, so a reader of a sluggish
/// writer sees a partial transfer instead of a deadlock.
pub fn pipe_read(fd: i32, buf: &mut [u8]) -> usize {
    let global_fd = file::fd_local2global(fd);
    let ring = ring_of(global_fd);

    let size = ring.len().min(buf.len());
    for slot in buf[..size].iter_mut() {
        *slot = ring.getc();
    }
    size
}

/// Writes at most the space currently free, mirroring `pipe_read`.
pub fn pipe_write(fd: i32, buf: &[u8]) -> usize {
    let global_fd = file::fd_local2global(fd);
    let ring = ring_of(global_fd);

    let size = ring.space().min(buf.len());
    for &byte in &buf[..size] {
        ring.putc(byte);
    }
    size
}

/// Redirects task-local `old_fd`: to plain stdio when `new_fd` < 3, else
/// to whatever global slot `new_fd` references.
pub fn sys_fd_redirect(old_fd: u32, new_fd: u32) {
    let cur = proc::current_task();
    // SAFETY: task-private table.
    unsafe {
        if new_fd < 3 {
            (*cur).fd_table[old_fd as usize] = new_fd as i32;
        } else {
            let new_global_fd = (*cur).fd_table[new_fd as usize];
            (*cur).fd_table[old_fd as usize] = new_global_fd;
        }
    }
}
