//! Interrupt-flag critical sections.

use crate::arch;

/// Guard for an interrupts-disabled critical section. The flag state on
/// entry is restored on drop, so sections nest.
///
/// # Safety
///
/// While a `HeldInterrupts` is alive on a uniprocessor nothing else runs,
/// which is the mutual-exclusion basis for every kernel data structure not
/// behind a blocking lock.
pub struct HeldInterrupts {
    was_enabled: bool,
}

impl HeldInterrupts {
    pub fn new() -> Self {
        let was_enabled = arch::intr_get();
        // SAFETY: re-enabled on drop.
        unsafe { arch::intr_off() };
        Self { was_enabled }
    }
}

impl Default for HeldInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HeldInterrupts {
    fn drop(&mut self) {
        debug_assert!(!arch::intr_get(), "HeldInterrupts dropped interruptible");
        if self.was_enabled {
            // SAFETY: restoring the state observed on entry.
            unsafe { arch::intr_on() };
        }
    }
}
