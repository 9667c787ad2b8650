// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Termination detection.
//!
//! Every PXN keeps per-pod counts of tasks created and tasks finished in
//! reserved main memory. Quiescence holds when the fabric-wide sum of
//! `created - finished` is zero and no task was created during the last
//! reduction round.

use std::sync::atomic::Ordering;

use crate::hart;
use crate::node::Pxn;

/// Counts a newly created task against `pod` on the creating PXN.
///
/// Relaxed: the all-reduce of `wait_all` is the global synchronization
/// point.
pub(crate) fn increase_tasks_created(pxn: &Pxn, pod: usize, n: i64) {
    pxn.created_counter(pod).fetch_add(n, Ordering::Relaxed);
}

/// Counts a finished task against the executing pod.
pub(crate) fn increase_tasks_finished(pxn: &Pxn, pod: usize, n: i64) {
    pxn.finished_counter(pod).fetch_add(n, Ordering::Relaxed);
}

/// Monotonically sampled created count, summed over the pods of this PXN.
fn created(pxn: &Pxn, order: Ordering) -> i64 {
    (0..pxn.pod_count())
        .map(|pod| pxn.created_counter(pod).load(order))
        .sum()
}

/// Samples (created, finished) for this PXN. Finished is read first so the
/// difference never under-counts pending work.
fn task_counts(pxn: &Pxn) -> (i64, i64) {
    let finished = (0..pxn.pod_count())
        .map(|pod| pxn.finished_counter(pod).load(Ordering::SeqCst))
        .sum();
    let created = created(pxn, Ordering::SeqCst);
    (created, finished)
}

/// Blocks the CP until every task created anywhere in the fabric has
/// executed.
///
/// Termination detection: this algorithm exits iff all the created tasks in
/// the system have been executed. The first all-reduce round is designed to
/// fail (the pending contribution is seeded with `created` without
/// subtracting `finished`) so that it acts as a barrier and establishes a
/// baseline; in the best case the algorithm performs two rounds. Each PXN
/// contributes its `created - finished` difference plus the number of tasks
/// created since its previous contribution, so a task spawned onto a node
/// that already contributed makes the round fail and forces another one.
pub fn wait_all() {
    let current = hart::current();
    if current.core.is_some() {
        crate::fatal!("wait_all can only be called from the CP");
    }
    let pxn = &current.pxn;

    let prev = created(pxn, Ordering::Relaxed);
    let mut prev_created_tasks = prev;
    // don't count finished, to fail the first round
    let mut partial_pending_tasks = prev;
    let mut new_tasks_created = prev;
    loop {
        let global_new = pxn.endpoint.allreduce(new_tasks_created);
        let global_pending = pxn.endpoint.allreduce(partial_pending_tasks);
        if global_pending == 0 && global_new == 0 {
            break;
        }

        let (created_tasks, finished_tasks) = task_counts(pxn);
        new_tasks_created = created_tasks - prev_created_tasks;
        partial_pending_tasks = created_tasks - finished_tasks;
        prev_created_tasks = created_tasks;
    }
}
