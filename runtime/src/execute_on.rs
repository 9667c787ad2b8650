// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task placement.
//!
//! `execute_on` validates the target place, resolves the `anyCore` wildcard
//! to the scheduler column and enqueues the task: directly into the target
//! core's queue when the node is local, or as a `request` active message
//! whose responder enqueues it when it is remote.

use crate::error::{Error, Result};
use crate::hart::{self, hart_yield};
use crate::node::Pxn;
use crate::place::{Place, PodIndex};
use crate::task::Task;
use crate::termination;

/// Enqueues `f` for execution at `place`.
///
/// Wildcards: an `ANY_POD` placement resolves to pod (0,0); an `ANY_CORE`
/// placement lands on the scheduler column of the target pod, which
/// forwards it to some worker core. After a successful enqueue the caller
/// yields once so a local worker (or the transport) can make progress.
pub fn execute_on(place: Place, f: impl FnOnce() + Send + 'static) -> Result<()> {
    submit(place, Task::new(f))
}

pub(crate) fn submit(place: Place, task: Task) -> Result<()> {
    let current = hart::current();
    let pxn = &current.pxn;

    let node_dims = pxn.endpoint.node_dims();
    if place.node.0 < 0 || place.node >= node_dims {
        tracing::error!("invalid node index: {}", place.node);
        return Err(Error::OutOfBounds);
    }
    validate(pxn, place)?;

    // count the task before it can possibly run
    termination::increase_tasks_created(pxn, 0, 1);

    let result = if place.node == pxn.node {
        enqueue_local(pxn, place, task)
    } else {
        pxn.endpoint.request(place.node, place, task)
    };
    if result.is_err() {
        // the task never became runnable, rebalance the counter
        termination::increase_tasks_created(pxn, 0, -1);
        return result;
    }

    hart_yield();
    Ok(())
}

/// Checks pod and core indices against the target dimensions (wildcards
/// excepted). Node dimensions are identical across the fabric, so the
/// sender can validate remote placements too.
fn validate(pxn: &Pxn, place: Place) -> Result<()> {
    let pod_dims = pxn.pod_dims();
    if !place.pod.is_any() && (place.pod.x >= pod_dims.x || place.pod.y >= pod_dims.y) {
        tracing::error!("invalid pod index: {}", place.pod);
        return Err(Error::OutOfBounds);
    }
    let core_dims = pxn.core_dims();
    if !place.core.is_any() && (place.core.x >= core_dims.x || place.core.y >= core_dims.y) {
        tracing::error!("invalid core index: {}", place.core);
        return Err(Error::OutOfBounds);
    }
    Ok(())
}

/// Enqueues into a local core queue; also the responder side of a remote
/// `request` message.
pub(crate) fn enqueue_local(pxn: &Pxn, mut place: Place, task: Task) -> Result<()> {
    validate(pxn, place)?;
    if place.pod.is_any() {
        place.pod = PodIndex::new(0, 0);
    }
    let core_dims = pxn.core_dims();
    let core_x = if place.core.is_any() {
        // anyCore: the scheduler column's queue
        core_dims.x
    } else {
        place.core.x
    };

    let core = &pxn.cores[usize::try_from(core_x).map_err(|_| Error::OutOfBounds)?];
    let queue = core.queue().ok_or(Error::NotInit)?;
    queue.try_enqueue(task).map_err(|_| {
        tracing::error!("queue of core {} is full", core.index);
        Error::QueueFull
    })
}
