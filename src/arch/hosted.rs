//! Hosted stand-in used by `cargo test` on the build machine.
//!
//! Only the interrupt flag is modelled (the sync primitives consult it);
//! everything that needs privilege panics so a test reaching for real
//! hardware fails loudly instead of silently. Under the test harness the
//! flag is per thread, since the harness runs tests in parallel.

use crate::arch::IntrStack;

cfg_if::cfg_if! {
    if #[cfg(test)] {
        use core::cell::Cell;

        std::thread_local! {
            static IF: Cell<bool> = const { Cell::new(true) };
        }

        pub fn intr_get() -> bool {
            IF.with(|flag| flag.get())
        }

        pub unsafe fn intr_off() {
            IF.with(|flag| flag.set(false));
        }

        pub unsafe fn intr_on() {
            IF.with(|flag| flag.set(true));
        }
    } else {
        use core::sync::atomic::{AtomicBool, Ordering};

        static IF: AtomicBool = AtomicBool::new(true);

        pub fn intr_get() -> bool {
            IF.load(Ordering::Relaxed)
        }

        pub unsafe fn intr_off() {
            IF.store(false, Ordering::Relaxed);
        }

        pub unsafe fn intr_on() {
            IF.store(true, Ordering::Relaxed);
        }
    }
}

pub fn idle_relax() {
    unreachable!("idle_relax on hosted target");
}

pub unsafe fn inb(_port: u16) -> u8 {
    panic!("port I/O on hosted target");
}

pub unsafe fn outb(_port: u16, _value: u8) {
    panic!("port I/O on hosted target");
}

pub unsafe fn insw(_port: u16, _buf: *mut u8, _word_cnt: usize) {
    panic!("port I/O on hosted target");
}

pub unsafe fn outsw(_port: u16, _buf: *const u8, _word_cnt: usize) {
    panic!("port I/O on hosted target");
}

pub unsafe fn load_pgdir(_pgdir_pa: usize) {
    panic!("paging on hosted target");
}

pub unsafe fn invlpg(_vaddr: usize) {}

pub unsafe extern "C" fn switch_to(_cur: *mut u8, _next: *mut u8) {
    panic!("context switch on hosted target");
}

pub unsafe extern "C" fn intr_exit() -> ! {
    panic!("intr_exit on hosted target");
}

pub unsafe fn jump_to_intr_exit(_frame: *mut IntrStack) -> ! {
    panic!("intr_exit on hosted target");
}

pub fn update_tss_esp0(_kstack_top: usize) {}
