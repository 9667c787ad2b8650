// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fans a counter-increment task out to every node and waits for global
//! quiescence. Machine shape comes from the environment (`NUM_NODES`,
//! `NUM_CORES`, `NUM_HARTS`, ...).

use std::process::ExitCode;
use std::sync::atomic::Ordering;

use phrt::{ANY_CORE, ANY_POD, MemoryKind, NodeIndex, Place};

const TASKS_PER_NODE: u32 = 64;

fn main() -> ExitCode {
    let code = phrt::run_from_env(|| {
        let me = phrt::current_node();
        let nodes = phrt::node_dims();

        let counter = match phrt::allocate_memory::<u64>(
            phrt::current_place(),
            1,
            MemoryKind::Main,
        ) {
            Ok(counter) => counter,
            Err(err) => return err.exit_code(),
        };
        counter.store(0);
        phrt::atomic_thread_fence(Ordering::Release);

        let mut wg = phrt::WaitGroup::new();
        phrt::check!(wg.initialize_local(TASKS_PER_NODE * u32::try_from(nodes.0).unwrap()));
        let handle = wg.handle();

        // every node sprays tasks over every other node's cores
        for node in 0..nodes.0 {
            let place = Place::new(NodeIndex(node), ANY_POD, ANY_CORE);
            for _ in 0..TASKS_PER_NODE {
                phrt::check!(phrt::execute_on(place, move || {
                    phrt::atomic_increment(counter, 1u64, Ordering::Relaxed);
                    handle.done();
                }));
            }
        }

        wg.wait();
        let total = phrt::atomic_load(counter, Ordering::Acquire);
        println!(
            "{me}: {total} increments from {} nodes",
            nodes.0
        );

        wg.deinitialize();
        phrt::deallocate_memory(counter, 1);
        phrt::wait_all();
        0
    });
    ExitCode::from(u8::try_from(code.clamp(0, 255)).unwrap())
}
