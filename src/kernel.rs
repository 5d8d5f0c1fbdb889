//! Boot orchestration: subsystem bring-up, the init process, and the main
//! thread's retirement.

use alloc::format;

use crate::syscall::usys;
use crate::{arch, ata, fs, heap, kalloc, memlayout, proc, shell, sysfile, timer, trap, vm};
use crate::println;

/// Reads the loader's memory report and carves out the pools and the
/// kernel heap descriptors.
fn mem_init() {
    println!("mem_init start");
    // SAFETY: the loader stores the usable byte count at this word.
    let mem_bytes_total = unsafe { *(memlayout::BOOT_TOTAL_MEM as *const u32) } as usize;
    // SAFETY: single-threaded boot.
    kalloc::mem_pool_init(mem_bytes_total, unsafe { &mut *vm::kernel_vaddr() });
    heap::kernel_descs_init();
    println!("mem_init done");
}

/// The init process (pid 1): forks the shell and reaps orphans forever.
fn init(_arg: usize) {
    let ret_pid = usys::fork();
    if ret_pid != 0 {
        loop {
            let mut status = 0;
            let child_pid = usys::wait(&mut status);
            let _ = usys::write(
                1,
                format!(
                    "I am init, my pid is 1, I received a child with pid {} and status {}\n",
                    child_pid, status
                )
                .as_bytes(),
            );
        }
    } else {
        shell::my_shell();
    }
}

/// Brings every subsystem up, in dependency order. The interrupt
/// controller and timer come before `sti`; the disk stack needs interrupts
/// on for its completion semaphore.
pub fn init_all() {
    println!("init_all");
    trap::pic_init();
    mem_init();
    proc::thread_init(init);
    timer::timer_init();
    // SAFETY: handlers and their data are ready.
    unsafe { arch::intr_on() };
    ata::ide_init();
    fs::filesys_init();
}

/// Where the loader's entry glue lands after establishing the high-half
/// mapping and the boot stack.
#[no_mangle]
pub extern "C" fn kernel_main() -> ! {
    println!("I am kernel");
    init_all();

    // Pull the loader-staged user program (if one was placed on the raw
    // system disk) into the file system, so the shell has something to
    // exec.
    sysfile::stage_user_prog(300, 4777, "/prog_no_arg");

    crate::console::cls_screen();
    // The boot thread is done; init and the shell carry on from here.
    proc::thread_exit(proc::current_task(), true);
    unreachable!("main thread rescheduled after exit");
}
