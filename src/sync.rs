//! Blocking coordination: counting semaphore and recursive mutex.
//!
//! Both are entered under disabled interrupts; a task that cannot proceed
//! parks itself on the primitive's waiter list via its PCB link and blocks.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr;

use crate::elem2entry;
use crate::intr::HeldInterrupts;
use crate::list::List;
use crate::proc::{self, Task, TaskStatus};

struct SemInner {
    value: u8,
    waiters: List,
}

pub struct Semaphore {
    inner: UnsafeCell<SemInner>,
}

// SAFETY: every access happens inside a HeldInterrupts section.
unsafe impl Sync for Semaphore {}
unsafe impl Send for Semaphore {}

impl Semaphore {
    pub const fn new(value: u8) -> Self {
        Self {
            inner: UnsafeCell::new(SemInner {
                value,
                waiters: List::new(),
            }),
        }
    }

    /// P operation. Blocks the current task while the count is zero.
    pub fn down(&self) {
        let _held = HeldInterrupts::new();
        // SAFETY: interrupts are off, so the inner state is ours until we
        // block; after each wakeup the section is re-entered atomically.
        let inner = unsafe { &mut *self.inner.get() };
        while inner.value == 0 {
            let cur = proc::current_task();
            unsafe {
                assert!(
                    !inner.waiters.contains(&mut (*cur).general_tag),
                    "sema down: running task already waiting"
                );
                inner.waiters.push_back(&mut (*cur).general_tag);
            }
            proc::thread_block(TaskStatus::Blocked);
        }
        inner.value -= 1;
    }

    /// V operation. Readies the longest waiter, if any.
    pub fn up(&self) {
        let _held = HeldInterrupts::new();
        // SAFETY: interrupts are off.
        let inner = unsafe { &mut *self.inner.get() };
        if let Some(elem) = inner.waiters.pop_front() {
            let waiter = elem2entry!(Task, general_tag, elem);
            // SAFETY: a parked task stays alive until it is unblocked.
            unsafe { proc::thread_unblock(waiter) };
        }
        inner.value += 1;
    }
}

/// Recursive mutex built on a binary semaphore.
///
/// Re-acquisition by the holder only bumps a nesting count; the semaphore is
/// released when the count returns to zero. This matters because helpers
/// like the allocator may be re-entered from a region that already holds the
/// owning pool's lock.
pub struct Mutex<T> {
    holder: UnsafeCell<*mut Task>,
    holder_repeat: UnsafeCell<u32>,
    sem: Semaphore,
    data: UnsafeCell<T>,
}

// SAFETY: the semaphore serialises non-recursive access; recursive guards
// alias by design, mirroring the holder's own call stack.
unsafe impl<T: Send> Sync for Mutex<T> {}
unsafe impl<T: Send> Send for Mutex<T> {}

pub struct MutexGuard<'a, T> {
    lock: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            holder: UnsafeCell::new(ptr::null_mut()),
            holder_repeat: UnsafeCell::new(0),
            sem: Semaphore::new(1),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        let cur = proc::current_task();
        // SAFETY: the holder fields are written only by the holder itself or
        // by a task that just won the semaphore.
        unsafe {
            if !(*self.holder.get()).is_null() && *self.holder.get() == cur {
                *self.holder_repeat.get() += 1;
            } else {
                self.sem.down();
                *self.holder.get() = cur;
                debug_assert_eq!(*self.holder_repeat.get(), 0);
                *self.holder_repeat.get() = 1;
            }
        }
        MutexGuard { lock: self }
    }

    /// Raw access to the protected data, for contexts that own exclusivity
    /// by other means (panic path, interrupt handlers of a held channel).
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: only the holder can own a guard.
        unsafe {
            let holder = self.lock.holder.get();
            let repeat = self.lock.holder_repeat.get();
            assert!(*holder == proc::current_task(), "mutex released by non-holder");
            if *repeat > 1 {
                *repeat -= 1;
                return;
            }
            debug_assert_eq!(*repeat, 1);
            // Clear the holder before the up, or a woken waiter could see a
            // stale holder.
            *holder = ptr::null_mut();
            *repeat = 0;
            self.lock.sem.up();
        }
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: guard implies the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: guard implies the lock is held.
        unsafe { &mut *self.lock.data.get() }
    }
}
