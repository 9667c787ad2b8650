// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Where am I?
//!
//! Locality queries answer for the calling thread: the CP has no pod, core
//! or hart, so its queries come back with wildcards; harts answer with
//! their full coordinates. Core dimensions exclude the scheduler column (a
//! whole column of cores is reserved for scheduling).

use crate::hart;
use crate::place::{
    ANY_CORE, ANY_POD, ANY_THREAD, CoreIndex, NodeIndex, Place, PodIndex, ThreadIndex,
};

/// The node the caller executes on.
pub fn current_node() -> NodeIndex {
    hart::current().pxn.node
}

/// The node grid dimensions.
pub fn node_dims() -> NodeIndex {
    hart::current().pxn.endpoint.node_dims()
}

/// The pod the caller executes on; the CP has no pod.
pub fn current_pod() -> PodIndex {
    let current = hart::current();
    if current.core.is_some() {
        PodIndex::new(0, 0)
    } else {
        ANY_POD
    }
}

/// The pod grid dimensions.
pub fn pod_dims() -> PodIndex {
    hart::current().pxn.pod_dims()
}

/// The core the caller executes on; the CP has no core.
pub fn current_core() -> CoreIndex {
    let current = hart::current();
    match current.core {
        Some(idx) => current.pxn.cores[idx].index,
        None => ANY_CORE,
    }
}

/// The worker-core grid dimensions (the scheduler column excluded).
pub fn core_dims() -> CoreIndex {
    hart::current().pxn.core_dims()
}

/// The hart the caller executes on; the CP has no hart.
pub fn current_thread() -> ThreadIndex {
    let current = hart::current();
    match current.hart {
        Some(idx) => current.pxn.cores[current.core.unwrap()].contexts[idx].id,
        None => ANY_THREAD,
    }
}

/// Harts per core.
#[expect(clippy::cast_possible_truncation, reason = "bounded by config validation")]
pub fn thread_dims() -> ThreadIndex {
    ThreadIndex(hart::current().pxn.config.harts_per_core as i8)
}

/// The caller's place.
pub fn current_place() -> Place {
    Place::new(current_node(), current_pod(), current_core())
}

/// The machine's place dimensions.
pub fn place_dims() -> Place {
    Place::new(node_dims(), pod_dims(), core_dims())
}

/// Whether the caller is a Command Processor thread.
pub fn is_on_cp() -> bool {
    hart::current().core.is_none()
}
