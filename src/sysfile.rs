//! Directory-level and miscellaneous file-system syscalls. The plain file
//! calls (`open`/`close`/`read`/`write`/`lseek`/`unlink`) live in `file`.

use crate::fs::{cur_fs, Dir, DirEntry, FileType, SearchRecord, Stat};
use crate::param::MAX_PATH_LEN;
use crate::proc;
use crate::println;

/// Creates the directory at (absolute) `pathname`.
pub fn sys_mkdir(pathname: &str) -> i32 {
    match cur_fs().mkdir(pathname) {
        Ok(()) => 0,
        Err(()) => -1,
    }
}

/// Opens a directory; null on failure.
pub fn sys_opendir(name: &str) -> *mut Dir {
    assert!(name.len() < MAX_PATH_LEN);
    let fs = cur_fs();
    // The root needs no lookup.
    if name == "/" || name == "/." || name == "/.." {
        return fs.root_dir();
    }

    let mut rec = SearchRecord::new();
    let ret = match fs.search_file(name, &mut rec) {
        None => {
            println!("in {}, subpath {} does not exist", name, rec.searched_path);
            core::ptr::null_mut()
        }
        Some(ino) => match rec.file_type {
            FileType::Regular => {
                println!("{} is a regular file!", name);
                core::ptr::null_mut()
            }
            _ => fs.dir_open(ino),
        },
    };
    fs.dir_close(rec.parent_dir);
    ret
}

pub fn sys_closedir(dir: *mut Dir) -> i32 {
    if dir.is_null() {
        return -1;
    }
    cur_fs().dir_close(dir);
    0
}

/// Next entry of `dir`, or `None` at the end.
pub fn sys_readdir(dir: *mut Dir) -> Option<DirEntry> {
    assert!(!dir.is_null());
    cur_fs().dir_read(dir)
}

pub fn sys_rewinddir(dir: *mut Dir) {
    cur_fs().dir_rewind(dir);
}

/// Removes the empty directory at `pathname`.
pub fn sys_rmdir(pathname: &str) -> i32 {
    match cur_fs().rmdir(pathname) {
        Ok(()) => 0,
        Err(()) => -1,
    }
}

/// Changes the calling task's working directory.
pub fn sys_chdir(path: &str) -> i32 {
    let fs = cur_fs();
    let mut rec = SearchRecord::new();
    let ret = match fs.search_file(path, &mut rec) {
        Some(ino) if rec.file_type == FileType::Directory => {
            let cur = proc::current_task();
            // SAFETY: task-private field.
            unsafe { (*cur).cwd_ino = ino };
            0
        }
        Some(_) => {
            println!("sys_chdir: {} is a regular file or other!", path);
            -1
        }
        None => -1,
    };
    fs.dir_close(rec.parent_dir);
    ret
}

/// Writes the current working directory into `buf`; the written length on
/// success, -1 when the walk fails or the buffer is too small.
pub fn sys_getcwd(buf: &mut [u8]) -> i32 {
    let cur = proc::current_task();
    // SAFETY: task-private field.
    let cwd_ino = unsafe { (*cur).cwd_ino };
    match cur_fs().rebuild_cwd_path(cwd_ino) {
        Some(path) if path.len() <= buf.len() => {
            buf[..path.len()].copy_from_slice(path.as_bytes());
            path.len() as i32
        }
        _ => -1,
    }
}

pub fn sys_stat(path: &str, st: &mut Stat) -> i32 {
    match cur_fs().stat(path, st) {
        Ok(()) => 0,
        Err(()) => -1,
    }
}

pub fn sys_putchar(ch: u8) {
    crate::console::put_char(ch);
}

/// The built-in command summary, written through the fd layer so pipelines
/// capture it like any other output.
pub fn sys_help() {
    let text = "\
builtin commands:
 ls: show directory or file information
 cd: change current work directory
 mkdir: create a directory
 rmdir: remove an empty directory
 rm: remove a regular file
 pwd: show current work directory
 ps: show process information
 clear: clear screen
shortcut keys:
 ctrl+l: clear screen
 ctrl+u: clear input
";
    let _ = crate::file::sys_write(1, text.as_bytes());
}

/// Boot-time helper: copies a loader-staged program image from raw sectors
/// of the system disk into the file system, so `exec` has something to
/// load. Skipped when the staging area holds no ELF image.
pub fn stage_user_prog(src_lba: u32, file_size: usize, path: &str) {
    use crate::ata::BlockIo;

    let sec_cnt = crate::utils::div_round_up(file_size, crate::param::SECTOR_SIZE);
    let mut prog_buf = alloc::vec![0u8; sec_cnt * crate::param::SECTOR_SIZE];
    let sda = crate::ata::disk(0, 0);
    sda.read(src_lba, &mut prog_buf);

    if &prog_buf[..4] != b"\x7fELF" {
        println!("no staged program at sector {}", src_lba);
        return;
    }

    let fd = crate::file::sys_open(path, crate::file::O_CREAT | crate::file::O_RDWR);
    if fd != -1 {
        if crate::file::sys_write(fd, &prog_buf[..file_size]) == -1 {
            println!("file write error!");
        }
        let _ = crate::file::sys_close(fd);
    }
}
