// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Emulation runtime for the PandoHammer PGAS many-core accelerator.
//!
//! A machine is a mesh of PXNs (nodes); each PXN contains pods, each pod
//! contains cores, and each core hosts a fixed number of cooperative harts
//! plus one coordinating Command Processor thread per PXN. Applications
//! see a global address space over three memory tiers (per-hart L1
//! scratchpad, per-pod L2 scratchpad, per-PXN main memory), remote memory
//! operations and atomics, remote task dispatch, collective termination
//! detection, and fine-grained cooperative scheduling.
//!
//! The entry points are [`launch`] (explicit [`Config`], used by tests)
//! and [`run_from_env`] (environment-driven, used by binaries). The user
//! program runs on every PXN's CP; work is spread with [`execute_on`],
//! memory comes from [`allocate_memory`], and [`wait_all`] blocks the CP
//! until the whole fabric is quiescent.
//!
//! ```no_run
//! use phrt::{ANY_CORE, ANY_POD, Config, NodeIndex, Place};
//!
//! let code = phrt::launch(Config::default(), || {
//!     let mut wg = phrt::WaitGroup::new();
//!     wg.initialize_local(1).unwrap();
//!     let handle = wg.handle();
//!     let place = Place::new(NodeIndex(0), ANY_POD, ANY_CORE);
//!     phrt::execute_on(place, move || handle.done()).unwrap();
//!     wg.wait();
//!     wg.deinitialize();
//!     phrt::wait_all();
//!     0
//! })
//! .unwrap();
//! assert_eq!(code, 0);
//! ```

mod addr;
mod atomics;
mod config;
mod cores;
mod cp;
mod error;
mod execute_on;
mod global_ptr;
mod hart;
mod locality;
mod logging;
mod mem;
mod node;
mod place;
mod start;
mod sync;
mod task;
mod termination;
mod transport;
mod util;

pub use addr::{GlobalAddress, MemoryKind, locality_of};
pub use atomics::{
    AtomicArith, AtomicInt, DataType, atomic_compare_exchange, atomic_decrement, atomic_fetch_add,
    atomic_fetch_sub, atomic_increment, atomic_load, atomic_store, atomic_thread_fence,
};
pub use config::Config;
pub use error::{Error, Result, exit};
pub use execute_on::execute_on;
pub use global_ptr::{
    GlobalPtr, allocate_memory, deallocate_memory, global_address_of, global_memcpy,
};
pub use hart::{hart_yield, wait_until};
pub use locality::{
    core_dims, current_core, current_node, current_place, current_pod, current_thread, is_on_cp,
    node_dims, place_dims, pod_dims, thread_dims,
};
pub use place::{
    ANY_CORE, ANY_NODE, ANY_PLACE, ANY_POD, ANY_THREAD, CoreIndex, NodeIndex, Place, PodIndex,
    ThreadIndex,
};
pub use start::{launch, run_from_env};
pub use sync::{Notification, NotificationHandle, WaitGroup, WaitGroupHandle};
pub use task::Task;
pub use termination::wait_all;
