// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Emulated PandoHammer cores.
//!
//! Each core hosts `harts_per_core` cooperative harts that share one task
//! queue. Worker cores (x < core dims) dequeue and run tasks, alternating
//! between yielding and a single work-stealing pass on a miss. The extra
//! core at `x == core dims` is the scheduler column: `anyCore` placements
//! land in its queue and it forwards each task to a uniformly random worker
//! core on the same pod.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::thread::JoinHandle;

use task_queue::TaskQueue;

use crate::error::{Error, Result};
use crate::hart::{self, Current, HartBaton, HartContext, hart_yield, wait_until};
use crate::node::Pxn;
use crate::place::{CoreIndex, ThreadIndex};
use crate::task::Task;
use crate::termination;

/// A peer queue longer than this is a steal victim. Advisory; see the
/// dispatch loop.
pub(crate) const STEAL_THRESHOLD: usize = 4096;

/// Host-stack slack on top of the emulated L1SP, for the runtime's own
/// frames.
const HART_STACK_SLACK: usize = 256 * 1024;

const STOPPED: u8 = 0;
const IDLE: u8 = 1;
const READY: u8 = 2;

pub(crate) struct Core {
    pub index: CoreIndex,
    /// `Stopped -> Idle -> Ready` during bring-up and back during
    /// finalization, driven by the CAS-elected hart.
    state: AtomicU8,
    queue: spin::Once<TaskQueue<Task>>,
    pub baton: HartBaton,
    bringup: spin::Barrier,
    harts_done: AtomicI64,
    pub contexts: Vec<HartContext>,
}

impl Core {
    #[expect(clippy::cast_possible_truncation, reason = "bounded by hart validation")]
    pub(crate) fn new(index: CoreIndex, harts: usize, l1sp_per_hart: usize) -> Self {
        let contexts = (0..harts)
            .map(|id| HartContext::new(ThreadIndex(id as i8), l1sp_per_hart))
            .collect();
        Self {
            index,
            state: AtomicU8::new(STOPPED),
            queue: spin::Once::new(),
            baton: HartBaton::new(harts),
            bringup: spin::Barrier::new(harts),
            harts_done: AtomicI64::new(0),
            contexts,
        }
    }

    /// This core's task queue; `None` until the elected hart built it.
    pub(crate) fn queue(&self) -> Option<&TaskQueue<Task>> {
        self.queue.get()
    }

    /// Resolves a core-wide L1SP offset to a native pointer within the
    /// owning hart's stack window.
    pub(crate) fn l1sp_native(&self, offset: usize) -> Result<*mut u8> {
        let stack_bytes = self
            .contexts
            .first()
            .map(HartContext::stack_bytes)
            .ok_or(Error::OutOfBounds)?;
        // offsets are (top - ptr) + hart * stack_bytes, so the owning hart
        // window is one past the exact multiple
        let hart = (offset.max(1) - 1) / stack_bytes;
        let context = self.contexts.get(hart).ok_or(Error::OutOfBounds)?;
        context.native_addr(offset - hart * stack_bytes)
    }
}

/// Spawns every hart of every core of `pxn`. Returns the join handles for
/// the CP to collect at power-off.
pub(crate) fn start_harts(pxn: &Arc<Pxn>) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(pxn.cores.len() * pxn.config.harts_per_core);
    for (core_idx, core) in pxn.cores.iter().enumerate() {
        for hart_idx in 0..core.contexts.len() {
            let pxn = Arc::clone(pxn);
            let handle = std::thread::Builder::new()
                .name(format!("{}-c{}-h{}", pxn.node, core_idx, hart_idx))
                .stack_size(pxn.config.l1sp_per_hart + HART_STACK_SLACK)
                .spawn(move || hart_main(&pxn, core_idx, hart_idx))
                .map_err(|err| {
                    tracing::error!("failed to launch hart thread: {err}");
                    Error::LaunchError
                })?;
            handles.push(handle);
        }
    }
    Ok(handles)
}

/// Shared entry point of every hart.
fn hart_main(pxn: &Arc<Pxn>, core_idx: usize, hart_idx: usize) {
    let core = Arc::clone(&pxn.cores[core_idx]);

    // The stack grows down from here; everything a hart ever exposes
    // through an L1SP address lives below this frame.
    let stack_anchor: u8 = 0;
    core.contexts[hart_idx].set_stack_top((&raw const stack_anchor) as usize);

    hart::set_current(Current {
        pxn: Arc::clone(pxn),
        core: Some(core_idx),
        hart: Some(hart_idx),
    });

    // all harts of the core have their stack ranges before any of them runs
    core.bringup.wait();
    core.baton.wait_turn(hart_idx);

    tracing::info!("{} core {} hart {} started", pxn.node, core_idx, hart_idx);

    init_memory_resources(pxn, core_idx, hart_idx);
    init_queue(&core, pxn);

    let worker_dims = pxn.core_dims();
    if core.index.x < worker_dims.x {
        worker_loop(pxn, &core);
    } else {
        scheduler_loop(pxn, &core);
    }

    finalize_queue(&core, pxn, hart_idx);

    tracing::info!("{} core {} hart {} stopped", pxn.node, core_idx, hart_idx);

    hart::clear_current();
    core.baton.retire(hart_idx);
}

/// The L2SP resource for the PXN is constructed by the first hart of core
/// (0,0); the CP constructs the main-memory resource.
fn init_memory_resources(pxn: &Arc<Pxn>, core_idx: usize, hart_idx: usize) {
    if core_idx == 0 && hart_idx == 0 {
        if let Err(err) = pxn.init_l2sp_resource() {
            crate::fatal!("could not initialize the L2SP resource: {err}");
        }
    }
}

/// Exactly one hart per core builds the queue; election is a CAS on the
/// core state. The others spin until `Ready`.
fn init_queue(core: &Core, pxn: &Pxn) {
    if core
        .state
        .compare_exchange(STOPPED, IDLE, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        core.queue.call_once(TaskQueue::new);
        core.state.store(READY, Ordering::Release);
        // the CP waits for this to reach the core count
        pxn.cores_initialized.fetch_add(1, Ordering::Release);
    }
    wait_until(|| core.state.load(Ordering::Acquire) == READY);
}

enum SchedulerFailState {
    Yield,
    Steal,
}

/// Executes tasks from the core's queue; on a miss alternates between
/// yielding and one work-stealing pass.
fn worker_loop(pxn: &Arc<Pxn>, core: &Core) {
    let queue = core.queue().expect("queue built during bring-up");
    let worker_dims = pxn.core_dims();
    let mut fail_state = SchedulerFailState::Yield;

    loop {
        let mut task = queue.try_dequeue();
        if task.is_none() {
            match fail_state {
                SchedulerFailState::Yield => {
                    hart_yield();
                    fail_state = SchedulerFailState::Steal;
                }
                SchedulerFailState::Steal => {
                    // one pass over the peer cores (the scheduler column
                    // included), at most one task per miss
                    for x in 0..=worker_dims.x {
                        let peer = &pxn.cores[usize::try_from(x).unwrap()];
                        if core.index == peer.index {
                            continue;
                        }
                        let Some(peer_queue) = peer.queue() else {
                            continue;
                        };
                        if peer_queue.approx_len() > STEAL_THRESHOLD {
                            task = peer_queue.try_dequeue();
                            if task.is_some() {
                                break;
                            }
                        }
                    }
                    fail_state = SchedulerFailState::Yield;
                }
            }
        }
        if let Some(task) = task.take() {
            task.invoke();
            termination::increase_tasks_finished(pxn, 0, 1);
        }
        if !core_active(pxn) {
            break;
        }
    }
}

/// Distributes tasks from the scheduler column's queue to a uniformly
/// random worker core on the same pod. Never runs user tasks itself.
fn scheduler_loop(pxn: &Arc<Pxn>, core: &Core) {
    let queue = core.queue().expect("queue built during bring-up");
    let worker_dims = pxn.core_dims();
    // static seed for run-to-run repeatability
    let mut rng = fastrand::Rng::with_seed(u64::try_from(core.index.x).unwrap_or_default());

    loop {
        if let Some(task) = queue.try_dequeue() {
            let target = rng.usize(..usize::try_from(worker_dims.x).unwrap());
            let worker = &pxn.cores[target];
            let Some(worker_queue) = worker.queue() else {
                crate::fatal!("worker queue vanished during distribution");
            };
            if worker_queue.try_enqueue(task).is_err() {
                crate::fatal!("could not enqueue from scheduler to worker core");
            }
        }
        if !core_active(pxn) {
            break;
        }
    }
}

/// Yields, then reports whether the core should keep dispatching.
fn core_active(pxn: &Pxn) -> bool {
    hart_yield();
    pxn.active.load(Ordering::Relaxed)
}

/// Symmetric to bring-up: every hart signals done; the elected hart waits
/// for its peers, marks the core finalized, waits for the peer cores,
/// tears the queue down and signals the CP.
fn finalize_queue(core: &Core, pxn: &Pxn, _hart_idx: usize) {
    core.harts_done.fetch_add(1, Ordering::Release);

    if core
        .state
        .compare_exchange(READY, IDLE, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        let harts = i64::try_from(core.contexts.len()).unwrap();
        wait_until(|| core.harts_done.load(Ordering::Acquire) == harts);

        pxn.cores_finalized.fetch_add(1, Ordering::Release);
        let cores = i64::try_from(pxn.cores.len()).unwrap();
        wait_until(|| pxn.cores_finalized.load(Ordering::Acquire) == cores);

        core.state.store(STOPPED, Ordering::Release);
        if let Some(queue) = core.queue() {
            queue.clear();
        }
        pxn.cores_done.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l1sp_offsets_map_to_the_owning_hart() {
        let core = Core::new(CoreIndex::new(0, 0), 4, 0x1000);
        for (hart, ctx) in core.contexts.iter().enumerate() {
            ctx.set_stack_top(0x1000_0000 + hart * 0x10_0000);
        }
        // offset 0x100 into hart 2's window
        let offset = 2 * 0x1000 + 0x100;
        let p = core.l1sp_native(offset).unwrap() as usize;
        assert_eq!(p, 0x1000_0000 + 2 * 0x10_0000 - 0x100);
    }

    #[test]
    fn l1sp_window_boundary_belongs_to_the_lower_hart() {
        let core = Core::new(CoreIndex::new(0, 0), 2, 0x1000);
        core.contexts[0].set_stack_top(0x2000_0000);
        core.contexts[1].set_stack_top(0x3000_0000);
        // an offset of exactly one window is the deepest byte of hart 0,
        // not byte zero of hart 1
        let p = core.l1sp_native(0x1000).unwrap() as usize;
        assert_eq!(p, 0x2000_0000 - 0x1000);
    }

    #[test]
    fn l1sp_out_of_range_is_rejected() {
        let core = Core::new(CoreIndex::new(0, 0), 2, 0x1000);
        core.contexts[0].set_stack_top(0x2000_0000);
        core.contexts[1].set_stack_top(0x3000_0000);
        assert!(core.l1sp_native(0x2001).is_err());
        assert!(core.l1sp_native(0).is_err());
    }
}
