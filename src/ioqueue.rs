//! SPSC ring buffer with blocking endpoints.
//!
//! A 2048-byte circular queue with one parked-producer slot and one
//! parked-consumer slot. The keyboard queue and every pipe are instances.
//! Entered with interrupts disabled; the lock only arbitrates the waiter
//! slots when several tasks share an endpoint.

use core::cell::UnsafeCell;
use core::ptr;

use crate::arch;
use crate::param::IOQ_BUF_SIZE;
use crate::proc::{self, Task, TaskStatus};
use crate::sync::Mutex;

struct IoqInner {
    producer: *mut Task,
    consumer: *mut Task,
    head: usize,
    tail: usize,
    buf: [u8; IOQ_BUF_SIZE],
}

pub struct IoQueue {
    lock: Mutex<()>,
    inner: UnsafeCell<IoqInner>,
}

// SAFETY: inner state is only touched with interrupts disabled.
unsafe impl Sync for IoQueue {}
unsafe impl Send for IoQueue {}

fn next_pos(pos: usize) -> usize {
    (pos + 1) % IOQ_BUF_SIZE
}

impl IoQueue {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            inner: UnsafeCell::new(IoqInner {
                producer: ptr::null_mut(),
                consumer: ptr::null_mut(),
                head: 0,
                tail: 0,
                buf: [0; IOQ_BUF_SIZE],
            }),
        }
    }

    fn inner(&self) -> &mut IoqInner {
        debug_assert!(!arch::intr_get(), "ioqueue touched with interrupts on");
        // SAFETY: interrupts are off, see the type invariant.
        unsafe { &mut *self.inner.get() }
    }

    pub fn is_full(&self) -> bool {
        let q = self.inner();
        next_pos(q.head) == q.tail
    }

    pub fn is_empty(&self) -> bool {
        let q = self.inner();
        q.head == q.tail
    }

    /// Bytes currently queued.
    pub fn len(&self) -> usize {
        let q = self.inner();
        if q.head >= q.tail {
            q.head - q.tail
        } else {
            IOQ_BUF_SIZE - (q.tail - q.head)
        }
    }

    /// Free space before `putc` would block.
    pub fn space(&self) -> usize {
        IOQ_BUF_SIZE - 1 - self.len()
    }

    /// Parks the current task in `waiter` and blocks.
    fn wait(waiter: &mut *mut Task) {
        assert!(waiter.is_null(), "ioqueue: waiter slot occupied");
        *waiter = proc::current_task();
        proc::thread_block(TaskStatus::Blocked);
    }

    fn wakeup(waiter: &mut *mut Task) {
        assert!(!waiter.is_null());
        // SAFETY: a parked task stays alive until unblocked.
        unsafe { proc::thread_unblock(*waiter) };
        *waiter = ptr::null_mut();
    }

    /// Consumer side: takes one byte, blocking while the queue is empty.
    pub fn getc(&self) -> u8 {
        while self.is_empty() {
            // The lock keeps a second consumer from claiming the slot
            // while this one parks itself.
            let guard = self.lock.lock();
            Self::wait(&mut self.inner().consumer);
            drop(guard);
        }

        let q = self.inner();
        let byte = q.buf[q.tail];
        q.tail = next_pos(q.tail);

        if !q.producer.is_null() {
            Self::wakeup(&mut q.producer);
        }
        byte
    }

    /// Producer side: stores one byte, blocking while the queue is full.
    pub fn putc(&self, byte: u8) {
        while self.is_full() {
            let guard = self.lock.lock();
            Self::wait(&mut self.inner().producer);
            drop(guard);
        }

        let q = self.inner();
        q.buf[q.head] = byte;
        q.head = next_pos(q.head);

        if !q.consumer.is_null() {
            Self::wakeup(&mut q.consumer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> IoQueue {
        // The queue asserts the interrupt discipline even on the host.
        unsafe { arch::intr_off() };
        IoQueue::new()
    }

    #[test]
    fn put_then_get_round_trips() {
        let q = fresh();
        for b in b"finch" {
            q.putc(*b);
        }
        assert_eq!(q.len(), 5);
        let got: alloc::vec::Vec<u8> = (0..5).map(|_| q.getc()).collect();
        assert_eq!(&got, b"finch");
        assert!(q.is_empty());
    }

    #[test]
    fn capacity_is_size_minus_one() {
        let q = fresh();
        for i in 0..IOQ_BUF_SIZE - 1 {
            assert!(!q.is_full());
            q.putc(i as u8);
        }
        assert!(q.is_full());
        assert_eq!(q.len(), IOQ_BUF_SIZE - 1);
        assert_eq!(q.space(), 0);
    }

    #[test]
    fn len_wraps_around() {
        let q = fresh();
        // Push the indices around the wrap point.
        for _ in 0..IOQ_BUF_SIZE - 10 {
            q.putc(0);
            let _ = q.getc();
        }
        for b in 0..20u8 {
            q.putc(b);
        }
        assert_eq!(q.len(), 20);
        for b in 0..20u8 {
            assert_eq!(q.getc(), b);
        }
    }
}
