//! The global open-file table and the per-task fd layer.
//!
//! A table slot is `{inode, position, flags}`. Pipes reuse the slot: the
//! flags field holds `PIPE_FLAG`, the inode pointer actually points at a
//! ring buffer, and the position field counts duped descriptors.

use array_macro::array;

use crate::fs::{self, cur_fs, FileType, Inode, SearchRecord};
use crate::intr::HeldInterrupts;
use crate::param::{MAX_PATH_LEN, NFILE, NOFILE};
use crate::pipe;
use crate::proc;
use crate::utils::Global;
use crate::println;

pub const O_RDONLY: u32 = 0;
pub const O_WRONLY: u32 = 1;
pub const O_RDWR: u32 = 2;
pub const O_CREAT: u32 = 4;

/// Flag value marking a file-table slot as a pipe endpoint.
pub const PIPE_FLAG: u32 = 0xffff;

pub const SEEK_SET: u8 = 1;
pub const SEEK_CUR: u8 = 2;
pub const SEEK_END: u8 = 3;

pub struct File {
    /// Read/write offset; dup count for pipes.
    pub pos: u32,
    pub flags: u32,
    /// Null when the slot is free; a ring-buffer pointer for pipes.
    pub inode: *mut Inode,
}

impl File {
    const fn none() -> Self {
        Self {
            pos: 0,
            flags: 0,
            inode: core::ptr::null_mut(),
        }
    }
}

static FILE_TABLE: Global<[File; NFILE]> = Global::new(array![_ => File::none(); NFILE]);

pub fn file_table_init() {
    // SAFETY: single-threaded init.
    let table = unsafe { FILE_TABLE.as_mut() };
    for file in table.iter_mut() {
        file.inode = core::ptr::null_mut();
    }
}

/// # Safety
///
/// File-table access rides the same serialisation as the file system: one
/// sys_* call at a time mutates a slot.
#[allow(clippy::mut_from_ref)]
pub(crate) fn file_table() -> &'static mut [File; NFILE] {
    // SAFETY: see above.
    unsafe { FILE_TABLE.as_mut() }
}

/// First free global slot.
fn get_free_slot() -> Option<usize> {
    file_table().iter().position(|f| f.inode.is_null())
}

/// Maps a task-local fd through the task's table to a global slot index.
pub fn fd_local2global(local_fd: i32) -> usize {
    let cur = proc::current_task();
    // SAFETY: task-private table.
    let global_fd = unsafe { (*cur).fd_table[local_fd as usize] };
    assert!(global_fd >= 0 && (global_fd as usize) < NFILE);
    global_fd as usize
}

/// Installs `global_idx` into the first free task-local slot (>= 3).
pub(crate) fn pcb_fd_install(global_idx: usize) -> Option<i32> {
    let cur = proc::current_task();
    // SAFETY: task-private table.
    unsafe {
        for local_fd in 3..NOFILE {
            if (*cur).fd_table[local_fd] == -1 {
                (*cur).fd_table[local_fd] = global_idx as i32;
                return Some(local_fd as i32);
            }
        }
    }
    println!("exceed max open files per proc");
    None
}

/// fork: the child inherited `global_fd`, so the slot gains a reference.
pub(crate) fn dup_global_slot(global_fd: usize) {
    let table = file_table();
    if table[global_fd].flags == PIPE_FLAG {
        table[global_fd].pos += 1;
    } else {
        // SAFETY: an in-use slot holds an open inode.
        unsafe { (*table[global_fd].inode).open_cnts += 1 };
    }
}

/// Creates `name` inside `parent_dir` and returns the new task-local fd.
fn file_create(parent_dir: *mut fs::Dir, name: &str, flags: u32) -> Result<i32, ()> {
    let slot = get_free_slot().ok_or_else(|| {
        println!("exceed max open files");
    })?;

    let inode = cur_fs().create_file_inode(parent_dir, name)?;

    let table = file_table();
    table[slot].inode = inode;
    table[slot].pos = 0;
    table[slot].flags = flags;

    match pcb_fd_install(slot) {
        Some(fd) => Ok(fd),
        None => {
            table[slot].inode = core::ptr::null_mut();
            cur_fs().inode_close(inode);
            Err(())
        }
    }
}

/// Opens inode `ino` into a fresh slot. Write-capable opens take the
/// inode's single-writer flag or fail.
fn file_open(ino: u32, flags: u32) -> Result<i32, ()> {
    let slot = get_free_slot().ok_or_else(|| {
        println!("exceed max open files");
    })?;

    let inode = cur_fs().inode_open(ino);
    let table = file_table();
    table[slot].inode = inode;
    table[slot].pos = 0;
    table[slot].flags = flags;

    if flags & (O_WRONLY | O_RDWR) != 0 {
        let _held = HeldInterrupts::new();
        // SAFETY: inode open, interrupts off.
        unsafe {
            if (*inode).write_deny {
                table[slot].inode = core::ptr::null_mut();
                cur_fs().inode_close(inode);
                println!("file can't be written now, try again later");
                return Err(());
            }
            (*inode).write_deny = true;
        }
    }

    match pcb_fd_install(slot) {
        Some(fd) => Ok(fd),
        None => {
            table[slot].inode = core::ptr::null_mut();
            cur_fs().inode_close(inode);
            Err(())
        }
    }
}

fn file_close(file: &mut File) {
    if file.inode.is_null() {
        return;
    }
    // SAFETY: in-use slot holds an open inode.
    unsafe { (*file.inode).write_deny = false };
    cur_fs().inode_close(file.inode);
    file.inode = core::ptr::null_mut();
}

/// Opens (or with `O_CREAT` creates) the regular file at `pathname`.
/// Returns a task-local fd.
pub fn sys_open(pathname: &str, flags: u32) -> i32 {
    // Directories go through opendir.
    if pathname.ends_with('/') {
        println!("can't open a directory {}", pathname);
        return -1;
    }
    assert!(flags <= 7);

    let mut rec = SearchRecord::new();
    let fs = cur_fs();
    let pathname_depth = fs::path::path_depth(pathname);
    let found = fs.search_file(pathname, &mut rec);

    if rec.file_type == FileType::Directory {
        println!("can't open a directory with open(), use opendir() instead");
        fs.dir_close(rec.parent_dir);
        return -1;
    }
    // A miss in a middle component is not a creatable situation.
    let searched_depth = fs::path::path_depth(&rec.searched_path);
    if pathname_depth != searched_depth {
        println!(
            "cannot access {}: subpath {} does not exist",
            pathname, rec.searched_path
        );
        fs.dir_close(rec.parent_dir);
        return -1;
    }

    let fd = match (found, flags & O_CREAT != 0) {
        (None, false) => {
            println!(
                "in path {}, file {} does not exist",
                rec.searched_path,
                fs::path::basename(pathname)
            );
            Err(())
        }
        (Some(_), true) => {
            println!("{} already exists!", pathname);
            Err(())
        }
        (None, true) => {
            println!("creating file");
            file_create(rec.parent_dir, fs::path::basename(pathname), flags)
        }
        (Some(ino), false) => file_open(ino, flags),
    };
    fs.dir_close(rec.parent_dir);
    fd.unwrap_or(-1)
}

/// Closes a task-local fd; pipe-aware.
pub fn sys_close(fd: i32) -> i32 {
    if fd <= 2 {
        return -1;
    }
    let global_fd = fd_local2global(fd);
    let table = file_table();
    if table[global_fd].flags == PIPE_FLAG {
        // Last endpoint gone: the ring buffer goes too.
        table[global_fd].pos -= 1;
        if table[global_fd].pos == 0 {
            pipe::free_ring(table[global_fd].inode);
            table[global_fd].inode = core::ptr::null_mut();
        }
    } else {
        file_close(&mut table[global_fd]);
    }
    let cur = proc::current_task();
    // SAFETY: task-private table.
    unsafe { (*cur).fd_table[fd as usize] = -1 };
    0
}

/// Reads up to `buf.len()` bytes from `fd`. stdin drains the keyboard
/// queue (or the pipe it was redirected to).
pub fn sys_read(fd: i32, buf: &mut [u8]) -> isize {
    if fd < 0 || fd == 1 || fd == 2 {
        println!("sys_read: fd error");
        return -1;
    }
    if fd == 0 {
        if pipe::is_pipe(fd) {
            return pipe::pipe_read(fd, buf) as isize;
        }
        for slot in buf.iter_mut() {
            *slot = crate::kbd::kbd_buf().getc();
        }
        return if buf.is_empty() { -1 } else { buf.len() as isize };
    }
    if pipe::is_pipe(fd) {
        return pipe::pipe_read(fd, buf) as isize;
    }
    let global_fd = fd_local2global(fd);
    let file = &mut file_table()[global_fd];
    match cur_fs().read_at(file.inode, file.pos, buf) {
        Ok(n) => {
            file.pos += n as u32;
            n as isize
        }
        Err(()) => -1,
    }
}

/// Writes `buf` to `fd`. stdout goes to the console (or the pipe it was
/// redirected to).
pub fn sys_write(fd: i32, buf: &[u8]) -> isize {
    if fd < 0 {
        println!("sys_write: fd error");
        return -1;
    }
    if fd == 1 || fd == 2 {
        if pipe::is_pipe(fd) {
            return pipe::pipe_write(fd, buf) as isize;
        }
        crate::console::put_str(core::str::from_utf8(buf).unwrap_or(""));
        return buf.len() as isize;
    }
    if pipe::is_pipe(fd) {
        return pipe::pipe_write(fd, buf) as isize;
    }
    let global_fd = fd_local2global(fd);
    let file = &mut file_table()[global_fd];
    if file.flags & (O_WRONLY | O_RDWR) == 0 {
        crate::console::put_str("sys_write: fd lacks O_RDWR or O_WRONLY\n");
        return -1;
    }
    match cur_fs().write_at(file.inode, file.pos, buf) {
        Ok(n) => {
            file.pos += n as u32;
            n as isize
        }
        Err(()) => -1,
    }
}

/// The seek arithmetic: `SEEK_END` with offset 0 addresses the last byte,
/// and a position one past the end (at `size`) is legal so seek-then-write
/// can append.
fn seek_pos(cur_pos: u32, file_size: u32, offset: i32, whence: u8) -> Option<u32> {
    let new_pos = match whence {
        SEEK_SET => offset,
        SEEK_CUR => cur_pos as i32 + offset,
        _ => file_size as i32 - 1 + offset,
    };
    if new_pos < 0 || new_pos > file_size as i32 {
        return None;
    }
    Some(new_pos as u32)
}

/// Repositions `fd`.
pub fn sys_lseek(fd: i32, offset: i32, whence: u8) -> i32 {
    if fd < 0 {
        println!("sys_lseek: fd error");
        return -1;
    }
    assert!((SEEK_SET..=SEEK_END).contains(&whence));
    let global_fd = fd_local2global(fd);
    let file = &mut file_table()[global_fd];
    // SAFETY: in-use slot holds an open inode.
    let file_size = unsafe { (*file.inode).size };

    match seek_pos(file.pos, file_size, offset, whence) {
        Some(new_pos) => {
            file.pos = new_pos;
            file.pos as i32
        }
        None => {
            println!("sys_lseek: position out of range");
            -1
        }
    }
}

/// Deletes the regular file at `pathname`. Open files cannot go.
pub fn sys_unlink(pathname: &str) -> i32 {
    assert!(pathname.len() < MAX_PATH_LEN);
    let fs = cur_fs();
    let mut rec = SearchRecord::new();
    let Some(ino) = fs.search_file(pathname, &mut rec) else {
        println!("file {} not found!", pathname);
        fs.dir_close(rec.parent_dir);
        return -1;
    };
    assert!(ino != 0);
    if rec.file_type == FileType::Directory {
        println!("can't delete a directory with unlink(), use rmdir() instead");
        fs.dir_close(rec.parent_dir);
        return -1;
    }

    // Refuse while any table slot still references the inode.
    let in_use = file_table()
        .iter()
        .any(|f| !f.inode.is_null() && f.flags != PIPE_FLAG && unsafe { (*f.inode).ino } == ino);
    if in_use {
        fs.dir_close(rec.parent_dir);
        println!("file {} is in use, not allowed to delete!", pathname);
        return -1;
    }

    let mut io_buf = alloc::vec![0u8; 2 * crate::param::SECTOR_SIZE];
    fs.delete_dir_entry(rec.parent_dir, ino, &mut io_buf);
    fs.inode_release(ino);
    fs.dir_close(rec.parent_dir);
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_set_and_cur_move_absolutely_and_relatively() {
        assert_eq!(seek_pos(0, 100, 40, SEEK_SET), Some(40));
        assert_eq!(seek_pos(40, 100, 10, SEEK_CUR), Some(50));
        assert_eq!(seek_pos(40, 100, -41, SEEK_CUR), None);
        assert_eq!(seek_pos(0, 100, -1, SEEK_SET), None);
    }

    #[test]
    fn seek_end_addresses_the_last_byte() {
        assert_eq!(seek_pos(0, 100, 0, SEEK_END), Some(99));
        assert_eq!(seek_pos(0, 100, -9, SEEK_END), Some(90));
    }

    #[test]
    fn seeking_to_the_size_is_allowed_for_append() {
        assert_eq!(seek_pos(0, 100, 100, SEEK_SET), Some(100));
        assert_eq!(seek_pos(0, 100, 101, SEEK_SET), None);
        assert_eq!(seek_pos(0, 100, 1, SEEK_END), Some(100));
    }
}
