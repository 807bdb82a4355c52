// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Lock-free bounded rings: the transport for all cross-thread and
//! cross-process-boundary handoff in the data plane.
//!
//! [`Ring`] is a fixed-capacity multi-producer/multi-consumer FIFO driven by
//! compare-and-swap on split head/tail indices (the classic DPDK ring
//! discipline: reserve a slot by CAS on the head, fill it, then publish by
//! advancing the tail in reservation order). There is no blocking anywhere;
//! a full ring rejects the element and hands it back to the caller.
//!
//! [`registry::RingRegistry`] resolves rings by name so components reference
//! each other through [`names`] templates instead of holding cyclic pointers.

pub mod names;
pub mod registry;

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Error carrying back an element rejected by a full ring.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("ring full")]
pub struct RingFull<T>(pub T);

/// A bounded MPMC FIFO.
///
/// Capacity is rounded up to a power of two. Elements are `Send` values
/// moved through the ring; no allocation happens after construction.
pub struct Ring<T> {
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    prod_head: CachePadded<AtomicUsize>,
    prod_tail: CachePadded<AtomicUsize>,
    cons_head: CachePadded<AtomicUsize>,
    cons_tail: CachePadded<AtomicUsize>,
}

// SAFETY: slots are only touched by the reserving producer/consumer between
// its head CAS and tail publication; the atomics order those accesses.
#[allow(unsafe_code)]
unsafe impl<T: Send> Send for Ring<T> {}
#[allow(unsafe_code)]
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Create a ring holding up to `capacity` elements (rounded up to a
    /// power of two, minimum 2).
    #[must_use]
    pub fn new(capacity: usize) -> Ring<T> {
        let cap = capacity.max(2).next_power_of_two();
        let slots = (0..cap)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Ring {
            mask: cap - 1,
            slots,
            prod_head: CachePadded::new(AtomicUsize::new(0)),
            prod_tail: CachePadded::new(AtomicUsize::new(0)),
            cons_head: CachePadded::new(AtomicUsize::new(0)),
            cons_tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Usable capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of elements currently queued. Advisory under concurrency.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prod_tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.cons_tail.load(Ordering::Acquire))
    }

    /// True when no element is queued. Advisory under concurrency.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue one element.
    ///
    /// # Errors
    ///
    /// [`RingFull`] returns the element when no slot is free.
    #[allow(unsafe_code)]
    pub fn enqueue(&self, item: T) -> Result<(), RingFull<T>> {
        let cap = self.capacity();
        let mut head = self.prod_head.load(Ordering::Relaxed);
        loop {
            let cons_tail = self.cons_tail.load(Ordering::Acquire);
            if head.wrapping_sub(cons_tail) >= cap {
                return Err(RingFull(item));
            }
            match self.prod_head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
        // SAFETY: slot `head` is reserved exclusively for this producer until
        // prod_tail passes it.
        unsafe {
            (*self.slots[head & self.mask].get()).write(item);
        }
        // publish in reservation order
        while self.prod_tail.load(Ordering::Acquire) != head {
            core::hint::spin_loop();
        }
        self.prod_tail.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Dequeue one element, or `None` when the ring is empty.
    #[allow(unsafe_code)]
    pub fn dequeue(&self) -> Option<T> {
        let mut head = self.cons_head.load(Ordering::Relaxed);
        loop {
            let prod_tail = self.prod_tail.load(Ordering::Acquire);
            if head == prod_tail {
                return None;
            }
            match self.cons_head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
        // SAFETY: slot `head` was published by a producer (head < prod_tail)
        // and is reserved exclusively for this consumer.
        let item = unsafe { (*self.slots[head & self.mask].get()).assume_init_read() };
        while self.cons_tail.load(Ordering::Acquire) != head {
            core::hint::spin_loop();
        }
        self.cons_tail.store(head.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Dequeue up to `max` elements into `out`, returning how many moved.
    pub fn dequeue_burst(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut moved = 0;
        while moved < max {
            match self.dequeue() {
                Some(item) => {
                    out.push(item);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

impl<T> core::fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_order_single_thread() {
        let ring = Ring::new(8);
        for i in 0..8 {
            ring.enqueue(i).unwrap();
        }
        assert_eq!(ring.enqueue(99).unwrap_err(), RingFull(99));
        for i in 0..8 {
            assert_eq!(ring.dequeue(), Some(i));
        }
        assert_eq!(ring.dequeue(), None);
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let ring: Ring<u8> = Ring::new(2048);
        assert_eq!(ring.capacity(), 2048);
        let ring: Ring<u8> = Ring::new(1000);
        assert_eq!(ring.capacity(), 1024);
    }

    #[test]
    fn burst_dequeue_stops_at_empty() {
        let ring = Ring::new(8);
        ring.enqueue(1).unwrap();
        ring.enqueue(2).unwrap();
        let mut out = Vec::new();
        assert_eq!(ring.dequeue_burst(&mut out, 32), 2);
        assert_eq!(out, vec![1, 2]);
    }

    #[test]
    fn full_ring_returns_element_without_loss() {
        let ring = Ring::new(2);
        ring.enqueue(String::from("a")).unwrap();
        ring.enqueue(String::from("b")).unwrap();
        let RingFull(back) = ring.enqueue(String::from("c")).unwrap_err();
        assert_eq!(back, "c");
    }

    #[test]
    fn drop_releases_queued_elements() {
        let payload = Arc::new(());
        let ring = Ring::new(4);
        ring.enqueue(Arc::clone(&payload)).unwrap();
        ring.enqueue(Arc::clone(&payload)).unwrap();
        drop(ring);
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn mpmc_under_contention() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;

        let ring = Arc::new(Ring::new(256));
        let consumed = Arc::new(AtomicUsize::new(0));
        let sum = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|s| {
            for p in 0..PRODUCERS {
                let ring = Arc::clone(&ring);
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut item = p * PER_PRODUCER + i;
                        loop {
                            match ring.enqueue(item) {
                                Ok(()) => break,
                                Err(RingFull(back)) => item = back,
                            }
                            std::thread::yield_now();
                        }
                    }
                });
            }
            for _ in 0..CONSUMERS {
                let ring = Arc::clone(&ring);
                let consumed = Arc::clone(&consumed);
                let sum = Arc::clone(&sum);
                s.spawn(move || {
                    while consumed.load(Ordering::Relaxed) < PRODUCERS * PER_PRODUCER {
                        if let Some(v) = ring.dequeue() {
                            sum.fetch_add(v, Ordering::Relaxed);
                            consumed.fetch_add(1, Ordering::Relaxed);
                        } else {
                            std::thread::yield_now();
                        }
                    }
                });
            }
        });

        let n = PRODUCERS * PER_PRODUCER;
        assert_eq!(consumed.load(Ordering::Relaxed), n);
        assert_eq!(sum.load(Ordering::Relaxed), n * (n - 1) / 2);
    }
}
