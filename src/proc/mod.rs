//! Tasks and the scheduler.
//!
//! A task's whole identity lives in one kernel page: the PCB at the bottom,
//! the zero-ring stack growing down from the top. Scheduling is preemptive
//! round-robin over the ready list with cooperative yields in between; the
//! running task's quantum is its priority in timer ticks.

use core::ptr;

use arrayvec::ArrayString;

use crate::arch;
use crate::elem2entry;
use crate::heap::MemBlockDesc;
use crate::intr::HeldInterrupts;
use crate::list::{List, ListEntry};
use crate::memlayout::MAIN_TASK_PCB;
use crate::param::{DEFAULT_PRIO, DESC_CNT, NOFILE, NPID, PGSIZE, TASK_NAME_LEN};
use crate::sync::Mutex;
use crate::utils::Global;
use crate::vm::{self, VirtPool};
use crate::println;

mod fork;
mod process;
mod wait_exit;

pub use fork::sys_fork;
pub use process::{process_execute, start_process};
pub use wait_exit::{sys_exit, sys_wait};

pub type Pid = i16;

/// Stack-overflow canary at the end of the PCB fields; the trap path checks
/// it every tick.
pub const STACK_MAGIC: u32 = 0x1998_0924;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TaskStatus {
    Running,
    Ready,
    Blocked,
    Waiting,
    Hanging,
    Died,
}

/// Saved kernel context for `switch_to`, plus the bootstrap tail used the
/// first time a task is dispatched: `ret` lands in `kernel_thread_entry`,
/// which finds `function`/`arg` where the C ABI expects call arguments.
#[repr(C)]
pub struct ThreadStack {
    pub ebp: usize,
    pub ebx: usize,
    pub edi: usize,
    pub esi: usize,
    pub eip: usize,
    pub unused_retaddr: usize,
    pub function: usize,
    pub arg: usize,
}

pub type ThreadFunc = fn(usize);

/// PCB. Must stay at the bottom of its page; `switch_to` stores the outgoing
/// stack pointer through offset 0.
#[repr(C)]
pub struct Task {
    pub kstack: *mut usize,
    pub pid: Pid,
    pub parent_pid: Pid,
    pub status: TaskStatus,
    pub priority: u8,
    /// Ticks left in the current quantum.
    pub ticks: u8,
    pub elapsed_ticks: u32,
    pub name: ArrayString<TASK_NAME_LEN>,
    /// Link for the ready list and for blocking waiter lists.
    pub general_tag: ListEntry,
    /// Link for the all-tasks list.
    pub all_tag: ListEntry,
    /// Virtual address of the task's page directory; 0 for kernel threads.
    pub pgdir: usize,
    pub user_vaddr: VirtPool,
    pub u_block_descs: [MemBlockDesc; DESC_CNT],
    pub fd_table: [i32; NOFILE],
    pub cwd_ino: u32,
    pub exit_status: i32,
    pub stack_magic: u32,
}

const _: () = assert!(core::mem::offset_of!(Task, kstack) == 0);
static_assertions::const_assert!(core::mem::size_of::<Task>() <= PGSIZE / 4);

static READY_LIST: Global<List> = Global::new(List::new());
static ALL_LIST: Global<List> = Global::new(List::new());
static CURRENT: Global<*mut Task> = Global::new(ptr::null_mut());
static MAIN_TASK: Global<*mut Task> = Global::new(ptr::null_mut());
static IDLE_TASK: Global<*mut Task> = Global::new(ptr::null_mut());

/// The running task's PCB. Null only before `make_main_thread`.
pub fn current_task() -> *mut Task {
    // SAFETY: single word, written only inside schedule() with interrupts
    // off.
    unsafe { *CURRENT.get() }
}

/// # Safety
///
/// Interrupts must be off.
pub(crate) unsafe fn ready_list() -> &'static mut List {
    unsafe { READY_LIST.as_mut() }
}

/// # Safety
///
/// Interrupts must be off.
pub(crate) unsafe fn all_list() -> &'static mut List {
    unsafe { ALL_LIST.as_mut() }
}

pub(crate) fn main_task() -> *mut Task {
    unsafe { *MAIN_TASK.get() }
}

struct PidPool {
    bitmap: bitmaps::Bitmap<NPID>,
    start: Pid,
}

static PID_POOL: spin::Lazy<Mutex<PidPool>> = spin::Lazy::new(|| {
    Mutex::new(PidPool {
        bitmap: bitmaps::Bitmap::new(),
        start: 1,
    })
});

fn allocate_pid() -> Pid {
    let mut pool = PID_POOL.lock();
    let bit_idx = pool.bitmap.first_false_index().expect("pid pool exhausted");
    let _ = pool.bitmap.set(bit_idx, true);
    bit_idx as Pid + pool.start
}

/// Fork is the only other allocation path.
pub(crate) fn fork_pid() -> Pid {
    allocate_pid()
}

pub(crate) fn release_pid(pid: Pid) {
    let mut pool = PID_POOL.lock();
    let bit_idx = (pid - pool.start) as usize;
    let _ = pool.bitmap.set(bit_idx, false);
}

/// Finds a PCB by pid on the all-tasks list.
pub fn pid_to_task(pid: Pid) -> *mut Task {
    let _held = HeldInterrupts::new();
    // SAFETY: interrupts off.
    let hit = unsafe {
        all_list().traverse(|elem| (*elem2entry!(Task, all_tag, elem)).pid == pid)
    };
    match hit {
        Some(elem) => elem2entry!(Task, all_tag, elem),
        None => ptr::null_mut(),
    }
}

/// First code of every kernel thread: open interrupts (we arrive here from
/// `switch_to` with them off) and run the body. A body that returns parks
/// its task for good.
extern "C" fn kernel_thread_entry(function: usize, arg: usize) {
    // SAFETY: re-enabling after the scheduler's critical section ended at
    // the context switch.
    unsafe { arch::intr_on() };
    // SAFETY: `function` was stored from a `ThreadFunc` in thread_create.
    let function: ThreadFunc = unsafe { core::mem::transmute(function) };
    function(arg);
    loop {
        thread_block(TaskStatus::Blocked);
    }
}

/// Builds the bootstrap switch frame so the first dispatch of `task` enters
/// `kernel_thread_entry(function, arg)`.
pub fn thread_create(task: *mut Task, function: ThreadFunc, arg: usize) {
    // SAFETY: `task` owns its page; the stack top has room for both frames.
    unsafe {
        let kstack = (*task).kstack as usize
            - core::mem::size_of::<arch::IntrStack>()
            - core::mem::size_of::<ThreadStack>();
        (*task).kstack = kstack as *mut usize;
        let frame = kstack as *mut ThreadStack;
        ptr::write(
            frame,
            ThreadStack {
                ebp: 0,
                ebx: 0,
                edi: 0,
                esi: 0,
                eip: kernel_thread_entry as usize,
                unused_retaddr: 0,
                function: function as usize,
                arg,
            },
        );
    }
}

/// Fills in a fresh PCB at `task` (the bottom of its own page).
///
/// # Safety
///
/// `task` must point at a page-aligned, otherwise unused kernel page.
pub unsafe fn init_thread(task: *mut Task, name: &str, prio: u8) {
    let mut task_name = ArrayString::new();
    let _ = task_name.try_push_str(name);

    let mut fd_table = [-1i32; NOFILE];
    fd_table[0] = 0;
    fd_table[1] = 1;
    fd_table[2] = 2;

    // SAFETY: caller hands over the page.
    unsafe {
        ptr::write(
            task,
            Task {
                kstack: (task as usize + PGSIZE) as *mut usize,
                pid: allocate_pid(),
                parent_pid: -1,
                status: TaskStatus::Ready,
                priority: prio,
                ticks: prio,
                elapsed_ticks: 0,
                name: task_name,
                general_tag: ListEntry::new(),
                all_tag: ListEntry::new(),
                pgdir: 0,
                user_vaddr: VirtPool::empty(),
                u_block_descs: array_macro::array![_ => MemBlockDesc::empty(); DESC_CNT],
                fd_table,
                cwd_ino: 0,
                exit_status: 0,
                stack_magic: STACK_MAGIC,
            },
        );
        (*task).general_tag.init();
        (*task).all_tag.init();
    }
}

/// Creates and readies a kernel thread.
pub fn thread_start(name: &str, prio: u8, function: ThreadFunc, arg: usize) -> *mut Task {
    // PCBs live in kernel space, user processes' included.
    let task = vm::get_kernel_pages(1).expect("PCB page") as *mut Task;
    // SAFETY: fresh zeroed page.
    unsafe {
        init_thread(task, name, prio);
        thread_create(task, function, arg);

        let _held = HeldInterrupts::new();
        debug_assert!(!ready_list().contains(&mut (*task).general_tag));
        ready_list().push_back(&mut (*task).general_tag);
        debug_assert!(!all_list().contains(&mut (*task).all_tag));
        all_list().push_back(&mut (*task).all_tag);
    }
    task
}

/// Wraps the already-running boot flow into the main task. Its PCB page was
/// reserved by the loader, which also parked the boot stack at its top.
fn make_main_thread() {
    let main = MAIN_TASK_PCB as *mut Task;
    // SAFETY: the loader reserved this page; nothing else owns it.
    unsafe {
        init_thread(main, "main", DEFAULT_PRIO);
        (*main).status = TaskStatus::Running;
        *MAIN_TASK.get() = main;
        *CURRENT.get() = main;

        let _held = HeldInterrupts::new();
        debug_assert!(!all_list().contains(&mut (*main).all_tag));
        all_list().push_back(&mut (*main).all_tag);
    }
}

/// The idle task: parked until the scheduler finds the ready list empty,
/// then halts until the next interrupt.
fn idle(_arg: usize) {
    loop {
        thread_block(TaskStatus::Blocked);
        arch::idle_relax();
    }
}

/// Picks the next task and switches to it. Interrupts must be off.
pub fn schedule() {
    assert!(!arch::intr_get(), "schedule with interrupts on");
    let cur = current_task();
    // SAFETY: interrupts are off throughout.
    unsafe {
        if (*cur).status == TaskStatus::Running {
            // Quantum expired: back to the tail with a fresh slice.
            debug_assert!(!ready_list().contains(&mut (*cur).general_tag));
            ready_list().push_back(&mut (*cur).general_tag);
            (*cur).ticks = (*cur).priority;
            (*cur).status = TaskStatus::Ready;
        }
        // A blocked/waiting/hanging task stays off the ready list.

        if ready_list().is_empty() {
            thread_unblock(*IDLE_TASK.get());
        }
        let elem = ready_list().pop_front().expect("ready list empty");
        let next = elem2entry!(Task, general_tag, elem);
        (*next).status = TaskStatus::Running;

        process::process_activate(next);
        *CURRENT.get() = next;
        arch::switch_to(cur as *mut u8, next as *mut u8);
    }
}

/// Parks the current task in `status` and schedules away; returns after a
/// wakeup with the entry interrupt state restored.
pub fn thread_block(status: TaskStatus) {
    assert!(matches!(
        status,
        TaskStatus::Blocked | TaskStatus::Waiting | TaskStatus::Hanging
    ));
    let held = HeldInterrupts::new();
    let cur = current_task();
    // SAFETY: interrupts off.
    unsafe { (*cur).status = status };
    schedule();
    drop(held);
}

/// Readies a parked task at the head of the queue so it runs soon.
///
/// # Safety
///
/// `task` must point at a live PCB.
pub unsafe fn thread_unblock(task: *mut Task) {
    let _held = HeldInterrupts::new();
    // SAFETY: interrupts off; PCB live per contract.
    unsafe {
        assert!(
            matches!(
                (*task).status,
                TaskStatus::Blocked | TaskStatus::Waiting | TaskStatus::Hanging
            ),
            "thread_unblock: task not blocked"
        );
        if (*task).status != TaskStatus::Ready {
            assert!(
                !ready_list().contains(&mut (*task).general_tag),
                "thread_unblock: blocked task on ready list"
            );
            ready_list().push_front(&mut (*task).general_tag);
            (*task).status = TaskStatus::Ready;
        }
    }
}

/// Voluntary end of quantum: like a tick timeout, but asked for.
pub fn thread_yield() {
    let cur = current_task();
    let held = HeldInterrupts::new();
    // SAFETY: interrupts off.
    unsafe {
        debug_assert!(!ready_list().contains(&mut (*cur).general_tag));
        ready_list().push_back(&mut (*cur).general_tag);
        (*cur).status = TaskStatus::Ready;
    }
    schedule();
    drop(held);
}

/// Timer-tick accounting, entered from the trap path with interrupts off.
pub fn tick() {
    let cur = current_task();
    if cur.is_null() {
        return;
    }
    // SAFETY: interrupts off in the handler.
    unsafe {
        assert!((*cur).stack_magic == STACK_MAGIC, "kernel stack overflow");
        (*cur).elapsed_ticks += 1;
        if (*cur).ticks == 0 {
            schedule();
        } else {
            (*cur).ticks -= 1;
        }
    }
}

/// Tears down a finished task: off the queues, page directory and PCB page
/// returned, pid released. `need_schedule` hands the CPU on immediately and
/// does not return.
pub fn thread_exit(task: *mut Task, need_schedule: bool) {
    let held = HeldInterrupts::new();
    // SAFETY: interrupts off; `task` is either current or a Hanging child
    // nobody else touches.
    unsafe {
        (*task).status = TaskStatus::Died;

        if ready_list().contains(&mut (*task).general_tag) {
            (*task).general_tag.remove();
        }
        if (*task).pgdir != 0 {
            vm::mfree_page(crate::kalloc::PoolFlag::Kernel, (*task).pgdir, 1);
        }
        (*task).all_tag.remove();

        // The main task's PCB is loader memory, not heap.
        if task != main_task() {
            vm::mfree_page(crate::kalloc::PoolFlag::Kernel, task as usize, 1);
        }
        release_pid((*task).pid);
    }
    if need_schedule {
        schedule();
        panic!("thread_exit: schedule returned");
    }
    drop(held);
}

/// `ps`: one padded line per task, written through the fd layer so a
/// pipeline can capture it.
pub fn sys_ps() {
    let header = "PID            PPID           STAT           TICKS          COMMAND\n";
    let _ = crate::file::sys_write(1, header.as_bytes());

    let _held = HeldInterrupts::new();
    // SAFETY: interrupts off while walking the list; the writes below may
    // block, so collect first.
    let mut lines = alloc::vec::Vec::new();
    unsafe {
        let _ = all_list().traverse(|elem| {
            let t = elem2entry!(Task, all_tag, elem);
            let stat = match (*t).status {
                TaskStatus::Running => "RUNNING",
                TaskStatus::Ready => "READY",
                TaskStatus::Blocked => "BLOCKED",
                TaskStatus::Waiting => "WAITING",
                TaskStatus::Hanging => "HANGING",
                TaskStatus::Died => "DIED",
            };
            let ppid = if (*t).parent_pid == -1 {
                alloc::string::String::from("NULL")
            } else {
                alloc::format!("{}", (*t).parent_pid)
            };
            lines.push(alloc::format!(
                "{:<15}{:<15}{:<15}{:<15x}{}\n",
                (*t).pid,
                ppid,
                stat,
                (*t).elapsed_ticks,
                (*t).name
            ));
            false
        });
    }
    drop(_held);
    for line in lines {
        let _ = crate::file::sys_write(1, line.as_bytes());
    }
}

/// Brings up the task machinery: queues, the init process (which must be
/// pid 1), the main thread wrapper and the idle task.
pub fn thread_init(init_body: ThreadFunc) {
    println!("thread_init start");
    // SAFETY: boot is single threaded.
    unsafe {
        READY_LIST.as_mut().init();
        ALL_LIST.as_mut().init();
    }

    // First user process: init. Created first so it gets pid 1.
    process::process_execute(init_body, "init");

    make_main_thread();

    // SAFETY: single word store at boot.
    unsafe { *IDLE_TASK.get() = thread_start("idle", 10, idle, 0) };
    println!("thread_init done");
}
