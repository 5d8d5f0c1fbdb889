//! Keyboard front-end: scancodes in, cooked bytes out.
//!
//! The IRQ handler decodes set-1 scancodes and feeds printable characters
//! (plus `\n`, backspace and the Ctrl-letter control codes the shell's line
//! editor understands) into the TTY ring buffer that `sys_read(stdin)`
//! drains.

use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};

use crate::ioqueue::IoQueue;

const KBD_DATA_PORT: u16 = 0x60;

static KBD_BUF: IoQueue = IoQueue::new();

pub fn kbd_buf() -> &'static IoQueue {
    &KBD_BUF
}

static DECODER: spin::Lazy<spin::Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>>> =
    spin::Lazy::new(|| {
        spin::Mutex::new(Keyboard::new(
            ScancodeSet1::new(),
            layouts::Us104Key,
            // Ctrl-L / Ctrl-U arrive as 0x0c / 0x15 for the line editor.
            HandleControl::MapLettersToUnicode,
        ))
    });

/// Keyboard IRQ body, entered with interrupts off.
pub fn handle_irq() {
    // SAFETY: reading the controller's output buffer acks the byte.
    let scancode = unsafe { crate::arch::inb(KBD_DATA_PORT) };

    let mut decoder = DECODER.lock();
    if let Ok(Some(event)) = decoder.add_byte(scancode) {
        if let Some(DecodedKey::Unicode(ch)) = decoder.process_keyevent(event) {
            let byte = match ch {
                '\r' | '\n' => b'\n',
                c if (c as u32) < 0x80 => c as u8,
                _ => return,
            };
            // Never block inside the handler: drop keystrokes once the
            // queue is full.
            if !KBD_BUF.is_full() {
                KBD_BUF.putc(byte);
            }
        }
    }
}
