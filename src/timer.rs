//! Programmable interval timer: tick counter and tick-granular sleep.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::param::TICK_HZ;
use crate::proc;
use crate::utils::div_round_up;
use crate::println;

const PIT_INPUT_HZ: u32 = 1_193_180;
const PIT_CTRL_PORT: u16 = 0x43;
const PIT_COUNTER0_PORT: u16 = 0x40;
/// Counter 0, lo/hi access, mode 2 (rate generator).
const PIT_MODE: u8 = 0x36;

static TICKS: AtomicU32 = AtomicU32::new(0);

pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Timer IRQ body, entered with interrupts off.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    proc::tick();
}

/// Yields until `sleep_ticks` timer ticks have elapsed.
fn ticks_to_sleep(sleep_ticks: u32) {
    let start = ticks();
    while ticks().wrapping_sub(start) < sleep_ticks {
        proc::thread_yield();
    }
}

/// Sleeps at millisecond granularity, rounded up to whole ticks.
pub fn msleep(ms: u32) {
    let per_tick_ms = 1000 / TICK_HZ;
    let sleep_ticks = div_round_up(ms as usize, per_tick_ms as usize) as u32;
    assert!(sleep_ticks > 0);
    ticks_to_sleep(sleep_ticks);
}

/// Programs the PIT for `TICK_HZ` and leaves the counting to the IRQ path.
pub fn timer_init() {
    println!("timer_init start");
    let divisor = (PIT_INPUT_HZ / TICK_HZ) as u16;
    // SAFETY: standard 8253 programming sequence.
    unsafe {
        crate::arch::outb(PIT_CTRL_PORT, PIT_MODE);
        crate::arch::outb(PIT_COUNTER0_PORT, divisor as u8);
        crate::arch::outb(PIT_COUNTER0_PORT, (divisor >> 8) as u8);
    }
    println!("timer_init done");
}
