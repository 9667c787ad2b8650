// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives built on global memory.
//!
//! Both primitives are backed by a single cell allocated at a caller-chosen
//! place and tier, so harts anywhere in the fabric can signal through them.
//! Waiting is cooperative: the waiter yields until the cell says go, then
//! pairs the producers' release writes with an acquire fence.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::addr::MemoryKind;
use crate::atomics::{atomic_fetch_add, atomic_fetch_sub, atomic_load, atomic_store, atomic_thread_fence};
use crate::error::Result;
use crate::global_ptr::{GlobalPtr, allocate_memory, deallocate_memory};
use crate::hart::wait_until;
use crate::locality::current_place;
use crate::place::Place;

/// Counts outstanding work across the fabric.
///
/// The counter is a `u64` in global memory. Producers `add` before making
/// work visible and the work `done`s itself; `wait` returns once the
/// counter hits zero.
pub struct WaitGroup {
    count: GlobalPtr<u64>,
}

/// A copyable reference to a [`WaitGroup`]'s counter, for capture in
/// tasks.
#[derive(Debug, Clone, Copy)]
pub struct WaitGroupHandle {
    count: GlobalPtr<u64>,
}

impl WaitGroup {
    /// Creates an uninitialized wait group; call
    /// [`initialize`](Self::initialize) before use.
    pub const fn new() -> Self {
        Self {
            count: GlobalPtr::null(),
        }
    }

    /// Allocates the counter at `place` in `kind` with `initial_count`.
    pub fn initialize(
        &mut self,
        initial_count: u32,
        place: Place,
        kind: MemoryKind,
    ) -> Result<()> {
        let count = allocate_memory::<u64>(place, 1, kind)?;
        count.store(u64::from(initial_count));
        atomic_thread_fence(Ordering::Release);
        self.count = count;
        Ok(())
    }

    /// Allocates the counter locally in main memory.
    pub fn initialize_local(&mut self, initial_count: u32) -> Result<()> {
        self.initialize(initial_count, current_place(), MemoryKind::Main)
    }

    /// Frees the counter. Not thread-safe, but idempotent.
    pub fn deinitialize(&mut self) {
        if !self.count.is_null() {
            deallocate_memory(self.count, 1);
            self.count = GlobalPtr::null();
        }
    }

    pub fn handle(&self) -> WaitGroupHandle {
        WaitGroupHandle { count: self.count }
    }

    /// Blocks (cooperatively) until the counter reaches zero.
    pub fn wait(&self) {
        let count = self.count;
        wait_until(|| atomic_load(count, Ordering::Relaxed) == 0);
        atomic_thread_fence(Ordering::Acquire);
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroupHandle {
    /// Adds `delta` items to wait for.
    pub fn add(self, delta: u32) {
        atomic_fetch_add(self.count, u64::from(delta), Ordering::Release);
    }

    /// Adds one item to wait for.
    pub fn add_one(self) {
        self.add(1);
    }

    /// Signals that one item completed.
    pub fn done(self) {
        atomic_fetch_sub(self.count, 1, Ordering::Release);
    }
}

/// One-shot signal.
///
/// Wakers set the flag with release semantics; waiters yield until it is
/// set, then fence with acquire. The timed wait returns `false` on expiry
/// without cancelling the producer.
pub struct Notification {
    flag: GlobalPtr<u64>,
}

/// A copyable reference to a [`Notification`]'s flag, for capture in
/// tasks.
#[derive(Debug, Clone, Copy)]
pub struct NotificationHandle {
    flag: GlobalPtr<u64>,
}

impl Notification {
    /// Creates an uninitialized notification; call
    /// [`initialize`](Self::initialize) before use.
    pub const fn new() -> Self {
        Self {
            flag: GlobalPtr::null(),
        }
    }

    /// Allocates the flag at `place` in `kind`, initially unset.
    pub fn initialize(&mut self, place: Place, kind: MemoryKind) -> Result<()> {
        let flag = allocate_memory::<u64>(place, 1, kind)?;
        flag.store(0);
        atomic_thread_fence(Ordering::Release);
        self.flag = flag;
        Ok(())
    }

    /// Allocates the flag locally in main memory.
    pub fn initialize_local(&mut self) -> Result<()> {
        self.initialize(current_place(), MemoryKind::Main)
    }

    /// Frees the flag. Not thread-safe, but idempotent.
    pub fn deinitialize(&mut self) {
        if !self.flag.is_null() {
            deallocate_memory(self.flag, 1);
            self.flag = GlobalPtr::null();
        }
    }

    pub fn handle(&self) -> NotificationHandle {
        NotificationHandle { flag: self.flag }
    }

    /// Sets the flag.
    pub fn notify(&self) {
        self.handle().notify();
    }

    /// Waits until the flag is set.
    pub fn wait(&self) {
        let flag = self.flag;
        wait_until(|| atomic_load(flag, Ordering::Relaxed) != 0);
        atomic_thread_fence(Ordering::Acquire);
    }

    /// Waits until the flag is set or `timeout` elapsed; returns whether
    /// the flag was set.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let flag = self.flag;
        let deadline = Instant::now() + timeout;
        let mut notified = false;
        wait_until(|| {
            if atomic_load(flag, Ordering::Relaxed) != 0 {
                notified = true;
                return true;
            }
            Instant::now() >= deadline
        });
        if notified {
            atomic_thread_fence(Ordering::Acquire);
        }
        notified
    }
}

impl Default for Notification {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHandle {
    /// Sets the flag.
    pub fn notify(self) {
        atomic_store(self.flag, 1, Ordering::Release);
    }
}
