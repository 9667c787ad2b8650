// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-core task queue.
//!
//! This crate provides the [`TaskQueue`], the multi-producer, multi-consumer
//! queue that backs each emulated PandoHammer core. Producers are local
//! enqueuers, the scheduler column and work-stealers; the primary consumer is
//! the set of worker harts of the owning core (at most one of which is
//! active at a time under cooperative scheduling, but stealers may dequeue
//! concurrently from other cores).
//!
//! Ordering is FIFO-ish per producer; across producers no order is
//! guaranteed. The queue is unbounded underneath but reports back-pressure
//! through [`Full`] above a fixed capacity so that enqueuers can surface a
//! `queue_full` condition instead of growing without bound.

use core::fmt;

use crossbeam_queue::SegQueue;

/// Default capacity bound, in elements.
///
/// Enqueues are refused (with [`Full`]) once the approximate length reaches
/// this bound.
pub const DEFAULT_CAPACITY: usize = 1 << 20;

/// Error returned by [`TaskQueue::try_enqueue`] when the queue is at
/// capacity. Carries the rejected element back to the caller.
pub struct Full<T>(pub T);

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue is full")
    }
}

/// A multi-producer, multi-consumer queue of runnable work.
pub struct TaskQueue<T> {
    queue: SegQueue<T>,
    capacity: usize,
}

impl<T> TaskQueue<T> {
    /// Creates an empty queue with [`DEFAULT_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an empty queue that refuses enqueues above `capacity`
    /// elements.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            capacity,
        }
    }

    /// Attempts to enqueue `t`, returning it back inside [`Full`] if the
    /// queue is at capacity.
    pub fn try_enqueue(&self, t: T) -> Result<(), Full<T>> {
        if self.queue.len() >= self.capacity {
            return Err(Full(t));
        }
        self.queue.push(t);
        Ok(())
    }

    /// Dequeues the oldest available element, if any.
    pub fn try_dequeue(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Returns the approximate number of queued elements.
    ///
    /// The value is exact only if no producer or consumer is concurrently
    /// active; callers must treat it as advisory (the work-stealing
    /// threshold does exactly that).
    pub fn approx_len(&self) -> usize {
        self.queue.len()
    }

    /// Returns whether the queue appears empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drops all queued elements.
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("approx_len", &self.approx_len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn enqueue_dequeue() {
        let queue = TaskQueue::new();
        assert!(queue.is_empty());
        queue.try_enqueue(1).unwrap();
        queue.try_enqueue(2).unwrap();
        assert_eq!(queue.approx_len(), 2);
        assert_eq!(queue.try_dequeue(), Some(1));
        assert_eq!(queue.try_dequeue(), Some(2));
        assert_eq!(queue.try_dequeue(), None);
    }

    #[test]
    fn full_returns_element() {
        let queue = TaskQueue::with_capacity(2);
        queue.try_enqueue("a").unwrap();
        queue.try_enqueue("b").unwrap();
        let Full(rejected) = queue.try_enqueue("c").unwrap_err();
        assert_eq!(rejected, "c");
        // draining frees capacity again
        assert_eq!(queue.try_dequeue(), Some("a"));
        queue.try_enqueue("c").unwrap();
    }

    #[test]
    fn clear_discards_everything() {
        let queue = TaskQueue::new();
        for i in 0..100 {
            queue.try_enqueue(i).unwrap();
        }
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.try_dequeue(), None);
    }

    #[test]
    fn per_producer_order_is_preserved() {
        let queue = Arc::new(TaskQueue::new());

        let handles: Vec<_> = (0..4u64)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for seq in 0..1000u64 {
                        queue.try_enqueue((producer, seq)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // within each producer the sequence numbers must come out ascending
        let mut last = [None::<u64>; 4];
        let mut total = 0;
        while let Some((producer, seq)) = queue.try_dequeue() {
            #[expect(clippy::cast_possible_truncation, reason = "producer < 4")]
            let producer = producer as usize;
            if let Some(prev) = last[producer] {
                assert!(seq > prev, "producer {producer} reordered");
            }
            last[producer] = Some(seq);
            total += 1;
        }
        assert_eq!(total, 4000);
    }

    #[test]
    fn concurrent_consumers_see_every_element() {
        let queue = Arc::new(TaskQueue::new());
        for i in 0..10_000u64 {
            queue.try_enqueue(i).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut sum = 0u64;
                    while let Some(v) = queue.try_dequeue() {
                        sum += v;
                    }
                    sum
                })
            })
            .collect();

        let sum: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(sum, (0..10_000u64).sum());
        assert!(queue.is_empty());
    }
}
