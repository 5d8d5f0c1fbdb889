//! The command shell: line editor, pipeline composition, builtins.
//!
//! Runs as the init process's child in ring 3 and talks to the kernel
//! exclusively through the syscall stubs.

use alloc::string::String;
use alloc::vec::Vec;
use alloc::format;

use crate::fs::{FileType, Stat};
use crate::param::{CMD_LEN, MAX_ARG_NR};
use crate::syscall::usys;

const CTRL_L: u8 = 0x0c;
const CTRL_U: u8 = 0x15;

fn sprint(s: &str) {
    let _ = usys::write(1, s.as_bytes());
}

fn print_prompt(cwd: &str) {
    sprint(&format!("[rabbit@localhost {}]$ ", cwd));
}

/// Reads one line from stdin with minimal editing: backspace, Ctrl-L
/// (clear screen), Ctrl-U (kill line), Enter submits.
fn readline(buf: &mut String, cwd: &str) {
    buf.clear();
    let mut byte = [0u8; 1];
    while usys::read(0, &mut byte) != -1 && buf.len() < CMD_LEN {
        match byte[0] {
            b'\n' | b'\r' => {
                usys::putchar(b'\n');
                return;
            }
            0x08 => {
                // Never erase past this line's own input.
                if !buf.is_empty() {
                    buf.pop();
                    usys::putchar(0x08);
                }
            }
            CTRL_L => {
                usys::clear();
                print_prompt(cwd);
                sprint(buf);
            }
            CTRL_U => {
                while !buf.is_empty() {
                    usys::putchar(0x08);
                    buf.pop();
                }
            }
            ch => {
                usys::putchar(ch);
                buf.push(ch as char);
            }
        }
    }
    sprint("readline: no enter key found in the command line, max 128 chars\n");
}

/// Splits `cmd` on `token`, at most `MAX_ARG_NR` words.
fn cmd_parse(cmd: &str, token: char) -> Option<Vec<&str>> {
    let argv: Vec<&str> = cmd.split(token).filter(|w| !w.is_empty()).collect();
    if argv.len() > MAX_ARG_NR {
        return None;
    }
    Some(argv)
}

/// Turns `path` into a clean absolute path: prefixed with `cwd` when
/// relative, `.` and `..` components resolved away.
fn make_clear_abs_path(path: &str, cwd: &str) -> String {
    let mut joined = String::new();
    if !path.starts_with('/') {
        joined.push_str(cwd);
        if !joined.ends_with('/') {
            joined.push('/');
        }
    }
    joined.push_str(path);

    let mut parts: Vec<&str> = Vec::new();
    for comp in joined.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                let _ = parts.pop();
            }
            name => parts.push(name),
        }
    }
    let mut clean = String::from("/");
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            clean.push('/');
        }
        clean.push_str(part);
    }
    clean
}

fn builtin_ls(args: &[&str], cwd: &str) {
    let mut long = false;
    let mut target: Option<&str> = None;
    for arg in &args[1..] {
        match *arg {
            "-l" => long = true,
            path => target = Some(path),
        }
    }
    let path = make_clear_abs_path(target.unwrap_or("."), cwd);

    let mut st = Stat::zero();
    if usys::stat(&path, &mut st) == -1 {
        sprint(&format!("ls: cannot access {}: No such file or directory\n", path));
        return;
    }
    if st.file_type == FileType::Regular {
        if long {
            sprint(&format!("- {:<6} {:<10} {}\n", st.ino, st.size, path));
        } else {
            sprint(&format!("{}\n", path));
        }
        return;
    }

    let dir = usys::opendir(&path);
    if dir.is_null() {
        return;
    }
    while let Some(de) = usys::readdir(dir) {
        if long {
            let child = if path == "/" {
                format!("/{}", de.name())
            } else {
                format!("{}/{}", path, de.name())
            };
            let mut cst = Stat::zero();
            let _ = usys::stat(&child, &mut cst);
            let kind = if de.file_type() == FileType::Directory { 'd' } else { '-' };
            sprint(&format!("{} {:<6} {:<10} {}\n", kind, de.ino, cst.size, de.name()));
        } else {
            sprint(&format!("{} ", de.name()));
        }
    }
    if !long {
        sprint("\n");
    }
    let _ = usys::closedir(dir);
}

/// `cd`: returns the new working directory on success.
fn builtin_cd(args: &[&str], cwd: &str) -> Option<String> {
    let target = if args.len() == 1 {
        String::from("/")
    } else {
        make_clear_abs_path(args[1], cwd)
    };
    if usys::chdir(&target) == -1 {
        sprint(&format!("cd: no such directory {}\n", target));
        return None;
    }
    Some(target)
}

fn builtin_pwd() {
    let mut buf = [0u8; crate::param::MAX_PATH_LEN];
    let len = usys::getcwd(&mut buf);
    if len < 0 {
        sprint("pwd: get current work directory failed\n");
        return;
    }
    sprint(core::str::from_utf8(&buf[..len as usize]).unwrap_or("?"));
    sprint("\n");
}

fn builtin_mkdir(args: &[&str], cwd: &str) {
    if args.len() != 2 {
        sprint("mkdir: only support 1 argument!\n");
        return;
    }
    let path = make_clear_abs_path(args[1], cwd);
    if path != "/" && usys::mkdir(&path) == 0 {
        return;
    }
    sprint(&format!("mkdir: create directory {} failed\n", path));
}

fn builtin_rmdir(args: &[&str], cwd: &str) {
    if args.len() != 2 {
        sprint("rmdir: only support 1 argument!\n");
        return;
    }
    let path = make_clear_abs_path(args[1], cwd);
    if path != "/" && usys::rmdir(&path) == 0 {
        return;
    }
    sprint(&format!("rmdir: remove {} failed\n", path));
}

fn builtin_rm(args: &[&str], cwd: &str) {
    if args.len() != 2 {
        sprint("rm: only support 1 argument!\n");
        return;
    }
    let path = make_clear_abs_path(args[1], cwd);
    if path != "/" && usys::unlink(&path) == 0 {
        return;
    }
    sprint(&format!("rm: delete {} failed\n", path));
}

/// Forks and execs an external program; the parent waits for it.
fn run_external(args: &[&str], cwd: &str) {
    let pid = usys::fork();
    if pid != 0 {
        let mut status = 0;
        let child_pid = usys::wait(&mut status);
        if child_pid == -1 {
            panic!("shell: no child to wait for");
        }
        sprint(&format!("child_pid {}, its status: {}\n", child_pid, status));
    } else {
        let abs_path = make_clear_abs_path(args[0], cwd);

        let mut st = Stat::zero();
        if usys::stat(&abs_path, &mut st) == -1 {
            sprint(&format!(
                "shell: cannot access {}: No such file or directory\n",
                abs_path
            ));
            usys::exit(-1);
        }

        // argv as NUL-terminated strings plus the terminating null slot.
        let storage: Vec<Vec<u8>> = core::iter::once(abs_path.as_str())
            .chain(args[1..].iter().copied())
            .map(|arg| {
                let mut bytes = Vec::from(arg.as_bytes());
                bytes.push(0);
                bytes
            })
            .collect();
        let mut argv: Vec<*const u8> = storage.iter().map(|s| s.as_ptr()).collect();
        argv.push(core::ptr::null());

        let _ = usys::execv(&abs_path, argv.as_ptr());
        usys::exit(-1);
    }
}

fn cmd_execute(args: &[&str], cwd: &mut String) {
    match args[0] {
        "ls" => builtin_ls(args, cwd),
        "cd" => {
            if let Some(new_cwd) = builtin_cd(args, cwd) {
                *cwd = new_cwd;
            }
        }
        "pwd" => builtin_pwd(),
        "ps" => usys::ps(),
        "clear" => usys::clear(),
        "mkdir" => builtin_mkdir(args, cwd),
        "rmdir" => builtin_rmdir(args, cwd),
        "rm" => builtin_rm(args, cwd),
        "help" => usys::help(),
        _ => run_external(args, cwd),
    }
}

/// The interactive loop. Never returns.
pub fn my_shell() -> ! {
    let mut cwd = String::from("/");
    let mut cmd_line = String::new();
    loop {
        print_prompt(&cwd);
        readline(&mut cmd_line, &cwd);
        if cmd_line.is_empty() {
            continue;
        }

        if cmd_line.contains('|') {
            // cmd1 | cmd2 | ... | cmdn: everything before the last command
            // writes into the pipe, everything after the first reads from
            // it.
            let mut fds = [-1i32; 2];
            let _ = usys::pipe(&mut fds);
            usys::fd_redirect(1, fds[1] as u32);

            let line = cmd_line.clone();
            let mut cmds = line.split('|').peekable();

            let first = cmds.next().unwrap_or("");
            if let Some(args) = cmd_parse(first, ' ') {
                if !args.is_empty() {
                    cmd_execute(&args, &mut cwd);
                }
            }
            usys::fd_redirect(0, fds[0] as u32);

            while let Some(each_cmd) = cmds.next() {
                if cmds.peek().is_none() {
                    // Last command: restore stdout to the screen first.
                    usys::fd_redirect(1, 1);
                }
                if let Some(args) = cmd_parse(each_cmd, ' ') {
                    if !args.is_empty() {
                        cmd_execute(&args, &mut cwd);
                    }
                }
            }
            // Stdin back to the keyboard, pipe gone.
            usys::fd_redirect(0, 0);
            let _ = usys::close(fds[0]);
            let _ = usys::close(fds[1]);
        } else {
            let line = cmd_line.clone();
            match cmd_parse(&line, ' ') {
                None => {
                    sprint(&format!("number of arguments exceeds {}\n", MAX_ARG_NR));
                }
                Some(args) if args.is_empty() => {}
                Some(args) => cmd_execute(&args, &mut cwd),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs_path_resolution() {
        assert_eq!(make_clear_abs_path("b", "/a"), "/a/b");
        assert_eq!(make_clear_abs_path("/x/y", "/a"), "/x/y");
        assert_eq!(make_clear_abs_path("../c", "/a/b"), "/a/c");
        assert_eq!(make_clear_abs_path("./d", "/a"), "/a/d");
        assert_eq!(make_clear_abs_path("..", "/"), "/");
        assert_eq!(make_clear_abs_path("a//b///c", "/"), "/a/b/c");
    }

    #[test]
    fn parse_splits_and_bounds_args() {
        assert_eq!(cmd_parse("ls  -l   /tmp", ' ').unwrap(), ["ls", "-l", "/tmp"]);
        assert!(cmd_parse("", ' ').unwrap().is_empty());
        let long = "a ".repeat(MAX_ARG_NR + 1);
        assert!(cmd_parse(&long, ' ').is_none());
    }
}
