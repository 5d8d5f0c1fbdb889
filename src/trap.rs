//! Trap routing.
//!
//! The low-level entry glue saves an `IntrStack` frame on the zero-ring
//! stack and calls `intr_dispatch` with the vector number inside it; on
//! return it restores the frame through `intr_exit`. This module routes by
//! vector: timer, keyboard, the two ATA channels, and the syscall gate.

use pic8259::ChainedPics;

use crate::arch::IntrStack;
use crate::{ata, kbd, syscall, timer};
use crate::println;

pub const PIC_1_OFFSET: u8 = 0x20;
pub const PIC_2_OFFSET: u8 = 0x28;

pub const TIMER_VEC: u8 = PIC_1_OFFSET;
pub const KBD_VEC: u8 = PIC_1_OFFSET + 1;
pub const ATA0_VEC: u8 = PIC_1_OFFSET + 14;
pub const ATA1_VEC: u8 = PIC_1_OFFSET + 15;
pub const SYSCALL_VEC: u8 = 0x80;

static PICS: spin::Mutex<ChainedPics> =
    // SAFETY: the offsets 0x20/0x28 do not collide with CPU exceptions.
    spin::Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remaps the 8259A pair and unmasks the timer, the keyboard, the cascade
/// and both ATA lines.
pub fn pic_init() {
    println!("pic_init start");
    // SAFETY: standard initialisation sequence; interrupts are still off.
    unsafe {
        PICS.lock().initialize();
        // Primary: IRQ 0 (timer), 1 (keyboard), 2 (cascade).
        crate::arch::outb(0x21, 0b1111_1000);
        // Secondary: IRQ 14/15 (the ATA channels).
        crate::arch::outb(0xa1, 0b0011_1111);
    }
    println!("pic_init done");
}

fn end_of_interrupt(vec_no: u8) {
    // SAFETY: `vec_no` was raised by one of the two PICs.
    unsafe { PICS.lock().notify_end_of_interrupt(vec_no) };
}

/// Entry point the interrupt glue calls for every vector. Runs with
/// interrupts off on the interrupted task's zero-ring stack.
///
/// # Safety
///
/// `frame` must point at the live trap frame of the current interrupt.
#[no_mangle]
pub unsafe extern "C" fn intr_dispatch(frame: *mut IntrStack) {
    // SAFETY: frame live per the contract.
    let vec_no = unsafe { (*frame).vec_no } as u8;
    match vec_no {
        TIMER_VEC => {
            // EOI first: the tick handler may schedule away and not return
            // here for a long time.
            end_of_interrupt(vec_no);
            timer::on_tick();
        }
        KBD_VEC => {
            end_of_interrupt(vec_no);
            kbd::handle_irq();
        }
        ATA0_VEC | ATA1_VEC => {
            end_of_interrupt(vec_no);
            ata::intr_hd_handler(vec_no);
        }
        SYSCALL_VEC => {
            // SAFETY: frame live; eax carries the number, ebx/ecx/edx the
            // arguments, eax the return value.
            unsafe {
                let ret = syscall::dispatch(
                    (*frame).eax as usize,
                    (*frame).ebx as usize,
                    (*frame).ecx as usize,
                    (*frame).edx as usize,
                );
                (*frame).eax = ret as u32;
            }
        }
        // Exceptions and spurious vectors: report and halt on the former
        // class would go here; unexpected device vectors are dropped.
        _ => {
            // SAFETY: read of the live frame.
            let eip = unsafe { (*frame).eip };
            println!("unexpected interrupt {:#x} at eip {:#x}", vec_no, eip);
        }
    }
}
