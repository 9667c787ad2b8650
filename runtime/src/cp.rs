// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The Command Processor.
//!
//! One CP thread per PXN drives the bring-up phases in order: memory
//! resources and zero-filled static storage, transport, cores; then a
//! cross-PXN barrier, the user entry point, termination detection, and the
//! teardown in reverse.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::addr::GlobalAddress;
use crate::atomics::{atomic_fetch_add, atomic_load, atomic_store};
use crate::cores;
use crate::global_ptr::GlobalPtr;
use crate::hart::{self, Current, wait_until};
use crate::node::Pxn;
use crate::place::NodeIndex;
use crate::termination;

/// Runs one PXN's Command Processor to completion; returns the user entry
/// point's result.
pub(crate) fn cp_main(pxn: Arc<Pxn>, entry: Arc<dyn Fn() -> i32 + Send + Sync>) -> i32 {
    hart::set_current(Current {
        pxn: Arc::clone(&pxn),
        core: None,
        hart: None,
    });
    tracing::info!("{} CP started", pxn.node);

    // 1. memory: the backing chunks were allocated zeroed (which covers the
    //    static storage zero fill); the CP owns the main-memory resource
    if let Err(err) = pxn.init_main_resource() {
        crate::fatal!("could not initialize the main memory resource: {err}");
    }

    // 2. transport: start polling, then rendezvous so no PXN races ahead
    //    of a fabric that is not fully attached
    let poller = pxn.endpoint.start(Arc::clone(&pxn));
    pxn.endpoint.barrier();

    // 3. cores: spawn the harts and wait until every core queue is Ready
    let harts = match cores::start_harts(&pxn) {
        Ok(harts) => harts,
        Err(err) => crate::fatal!("could not start cores: {err}"),
    };
    let core_count = i64::try_from(pxn.cores.len()).unwrap();
    wait_until(|| pxn.cores_initialized.load(Ordering::Acquire) == core_count);

    // 4. cross-PXN barrier
    cp_barrier(&pxn);

    // 5. the user program
    let result = entry();

    // 6. termination detection
    termination::wait_all();

    // 7. teardown: stop the cores, then the transport
    cp_barrier(&pxn);
    pxn.active.store(false, Ordering::Release);
    wait_until(|| pxn.cores_done.load(Ordering::Acquire) == core_count);
    for hart in harts {
        if hart.join().is_err() {
            crate::fatal!("a hart thread panicked");
        }
    }

    pxn.endpoint.barrier();
    pxn.endpoint.stop();
    poller
        .join()
        .unwrap_or_else(|_| crate::fatal!("the polling thread panicked"));

    tracing::info!("{} CP stopped", pxn.node);
    hart::clear_current();
    result
}

/// Cross-PXN barrier between the Command Processors.
///
/// Every CP increments the "CPs reached" cell on PXN 0; the last to arrive
/// resets the counter and bumps every PXN's barrier-generation flag; the
/// others spin-yield on their local flag.
pub(crate) fn cp_barrier(pxn: &Pxn) {
    let nodes = pxn.endpoint.node_dims().0;
    let local_gen = GlobalPtr::<u64>::from_address(GlobalAddress::encode_main(
        pxn.node,
        pxn.cells.barrier_gen,
    ));
    let reached = GlobalPtr::<u64>::from_address(GlobalAddress::encode_main(
        NodeIndex(0),
        pxn.cells.cps_reached,
    ));

    let barrier_gen = atomic_load(local_gen, Ordering::Relaxed) + 1;
    let arrived = atomic_fetch_add(reached, 1, Ordering::SeqCst);
    if arrived == u64::try_from(nodes).unwrap() - 1 {
        // last one in: reset the counter, then release everyone
        atomic_store(reached, 0, Ordering::SeqCst);
        for node in 0..nodes {
            let exit_flag = GlobalPtr::<u64>::from_address(GlobalAddress::encode_main(
                NodeIndex(node),
                pxn.cells.barrier_gen,
            ));
            atomic_store(exit_flag, barrier_gen, Ordering::Release);
        }
    }
    wait_until(|| atomic_load(local_gen, Ordering::Acquire) >= barrier_gen);
}
