// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Global memory semantics: typed pointers, atomics laws, bulk copies and
//! allocation behavior, exercised through the public API on live machines.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use phrt::{
    ANY_CORE, ANY_POD, Config, GlobalPtr, MemoryKind, NodeIndex, Notification, Place, WaitGroup,
};

fn config(nodes: usize) -> Config {
    Config {
        nodes,
        cores_per_pod: 2,
        harts_per_core: 2,
        l1sp_per_hart: 0x4000,
        l2sp_per_pod: 1 << 20,
        main_per_node: 1 << 24,
    }
}

#[test]
fn atomic_store_then_load_round_trips_per_width() {
    let failures = Arc::new(AtomicUsize::new(0));
    let failures2 = Arc::clone(&failures);

    let code = phrt::launch(config(1), move || {
        let here = phrt::current_place();

        macro_rules! round_trip {
            ($ty:ty, $value:expr) => {
                let cell = phrt::allocate_memory::<$ty>(here, 1, MemoryKind::Main).unwrap();
                for order in [Ordering::Relaxed, Ordering::Release, Ordering::SeqCst] {
                    phrt::atomic_store(cell, $value, order);
                    for load_order in [Ordering::Relaxed, Ordering::Acquire, Ordering::SeqCst] {
                        if phrt::atomic_load(cell, load_order) != $value {
                            failures2.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                phrt::deallocate_memory(cell, 1);
            };
        }

        round_trip!(i8, -7i8);
        round_trip!(u8, 0xA5u8);
        round_trip!(i16, -12_345i16);
        round_trip!(u16, 0xBEEFu16);
        round_trip!(i32, -7_654_321i32);
        round_trip!(u32, 0xDEAD_BEEFu32);
        round_trip!(i64, i64::MIN + 3);
        round_trip!(u64, u64::MAX - 3);

        phrt::wait_all();
        0
    })
    .unwrap();

    assert_eq!(code, 0);
    assert_eq!(failures.load(Ordering::Relaxed), 0);
}

#[test]
fn compare_exchange_succeeds_iff_expected_matches() {
    let failures = Arc::new(AtomicUsize::new(0));
    let failures2 = Arc::clone(&failures);

    let code = phrt::launch(config(1), move || {
        let here = phrt::current_place();
        let cell = phrt::allocate_memory::<u64>(here, 1, MemoryKind::Main).unwrap();
        phrt::atomic_store(cell, 5u64, Ordering::SeqCst);

        // matching expected: swaps and reports the old value
        match phrt::atomic_compare_exchange(cell, 5u64, 9, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(5) => {}
            _ => {
                failures2.fetch_add(1, Ordering::Relaxed);
            }
        }
        // mismatch: the cell is unchanged and the observed value comes back
        match phrt::atomic_compare_exchange(cell, 5u64, 1, Ordering::SeqCst, Ordering::SeqCst) {
            Err(9) => {}
            _ => {
                failures2.fetch_add(1, Ordering::Relaxed);
            }
        }
        if phrt::atomic_load(cell, Ordering::SeqCst) != 9 {
            failures2.fetch_add(1, Ordering::Relaxed);
        }

        phrt::deallocate_memory(cell, 1);
        phrt::wait_all();
        0
    })
    .unwrap();

    assert_eq!(code, 0);
    assert_eq!(failures.load(Ordering::Relaxed), 0);
}

#[test]
fn fetch_add_and_sub_report_previous_values() {
    let code = phrt::launch(config(1), || {
        let here = phrt::current_place();
        let cell = phrt::allocate_memory::<i64>(here, 1, MemoryKind::Main).unwrap();
        phrt::atomic_store(cell, 10i64, Ordering::SeqCst);

        let mut ok = phrt::atomic_fetch_add(cell, 5, Ordering::SeqCst) == 10;
        ok &= phrt::atomic_fetch_sub(cell, 3, Ordering::SeqCst) == 15;
        phrt::atomic_increment(cell, 1, Ordering::SeqCst);
        phrt::atomic_decrement(cell, 2, Ordering::SeqCst);
        ok &= phrt::atomic_load(cell, Ordering::SeqCst) == 11;

        phrt::deallocate_memory(cell, 1);
        phrt::wait_all();
        i32::from(!ok)
    })
    .unwrap();
    assert_eq!(code, 0);
}

/// Fills `count` bytes behind `ptr` with a deterministic pattern.
fn fill(ptr: GlobalPtr<u8>, count: usize, salt: u8) {
    for i in 0..count {
        #[expect(clippy::cast_possible_truncation, reason = "pattern byte")]
        ptr.add(i).store((i as u8) ^ salt);
    }
}

/// Checks the pattern written by [`fill`].
fn check(ptr: GlobalPtr<u8>, count: usize, salt: u8) -> bool {
    (0..count).all(|i| {
        #[expect(clippy::cast_possible_truncation, reason = "pattern byte")]
        let want = (i as u8) ^ salt;
        ptr.add(i).load() == want
    })
}

#[test]
fn memcpy_covers_all_locality_pairings() {
    const N: usize = 1024;
    let code = phrt::launch(config(3), move || {
        if phrt::current_node() != NodeIndex(0) {
            phrt::wait_all();
            return 0;
        }

        let local = Place::new(NodeIndex(0), ANY_POD, ANY_CORE);
        let remote1 = Place::new(NodeIndex(1), ANY_POD, ANY_CORE);
        let remote2 = Place::new(NodeIndex(2), ANY_POD, ANY_CORE);

        let a = phrt::allocate_memory::<u8>(local, N, MemoryKind::Main).unwrap();
        let b = phrt::allocate_memory::<u8>(local, N, MemoryKind::Main).unwrap();
        let c = phrt::allocate_memory::<u8>(remote1, N, MemoryKind::Main).unwrap();
        let d = phrt::allocate_memory::<u8>(remote2, N, MemoryKind::L2Sp).unwrap();

        // both local
        fill(a, N, 0x11);
        phrt::global_memcpy(b, a, N);
        let mut ok = check(b, N, 0x11);

        // source local, destination remote
        phrt::global_memcpy(c, b, N);
        ok &= check(c, N, 0x11);

        // both remote (distinct nodes): staged through a temporary
        phrt::global_memcpy(d, c, N);
        ok &= check(d, N, 0x11);

        // destination local, source remote
        fill(d, N, 0x5C);
        phrt::global_memcpy(a, d, N);
        ok &= check(a, N, 0x5C);

        phrt::wait_all();
        i32::from(!ok)
    })
    .unwrap();
    assert_eq!(code, 0);
}

#[test]
fn small_allocations_are_aligned_and_distinct() {
    let code = phrt::launch(config(1), || {
        let here = phrt::current_place();
        let mut seen = std::collections::HashSet::new();
        let mut ok = true;
        let mut ptrs = Vec::new();
        for _ in 0..1024 {
            let p = phrt::allocate_memory::<u64>(here, 1, MemoryKind::Main).unwrap();
            ok &= p.address().offset().unwrap() % align_of::<u64>() == 0;
            ok &= seen.insert(p.address().bits());
            ptrs.push(p);
        }
        // a large allocation still succeeds alongside the small ones
        let big = phrt::allocate_memory::<u8>(here, 1 << 20, MemoryKind::Main).unwrap();
        ok &= !big.is_null();
        phrt::deallocate_memory(big, 1 << 20);
        let again = phrt::allocate_memory::<u8>(here, 1 << 20, MemoryKind::Main).unwrap();
        ok &= !again.is_null();
        for p in ptrs {
            phrt::deallocate_memory(p, 1);
        }
        phrt::wait_all();
        i32::from(!ok)
    })
    .unwrap();
    assert_eq!(code, 0);
}

#[test]
fn allocation_failure_is_reported_not_fatal() {
    let code = phrt::launch(config(1), || {
        let here = phrt::current_place();
        // far larger than the whole tier
        let result = phrt::allocate_memory::<u8>(here, 1 << 30, MemoryKind::L2Sp);
        phrt::wait_all();
        i32::from(result.is_ok())
    })
    .unwrap();
    assert_eq!(code, 0);
}

#[test]
fn wait_group_releases_after_exactly_k_dones() {
    let released_at = Arc::new(AtomicI64::new(-1));
    let released_at2 = Arc::clone(&released_at);

    let code = phrt::launch(config(1), move || {
        const K: u32 = 3;
        let mut wg = WaitGroup::new();
        wg.initialize_local(K).unwrap();
        let handle = wg.handle();

        let any = Place::new(NodeIndex(0), ANY_POD, ANY_CORE);
        for _ in 0..K {
            phrt::execute_on(any, move || handle.done()).unwrap();
        }
        wg.wait();
        released_at2.store(i64::from(K), Ordering::SeqCst);
        wg.deinitialize();
        // deinitialize is idempotent
        wg.deinitialize();
        phrt::wait_all();
        0
    })
    .unwrap();

    assert_eq!(code, 0);
    assert_eq!(released_at.load(Ordering::SeqCst), 3);
}

#[test]
fn notification_wait_for_times_out_and_delivers() {
    let code = phrt::launch(config(1), || {
        let mut note = Notification::new();
        note.initialize_local().unwrap();

        // nobody notifies: the timed wait expires
        let expired = !note.wait_for(Duration::from_millis(50));

        let handle = note.handle();
        let any = Place::new(NodeIndex(0), ANY_POD, ANY_CORE);
        phrt::execute_on(any, move || handle.notify()).unwrap();
        let delivered = note.wait_for(Duration::from_secs(10));
        note.wait(); // already set, returns immediately

        note.deinitialize();
        phrt::wait_all();
        i32::from(!(expired && delivered))
    })
    .unwrap();
    assert_eq!(code, 0);
}

#[test]
fn global_address_of_round_trips_through_the_l1sp_window() {
    let observed = Arc::new(AtomicI64::new(0));
    let observed2 = Arc::clone(&observed);

    let code = phrt::launch(config(1), move || {
        let mut wg = WaitGroup::new();
        wg.initialize_local(1).unwrap();
        let handle = wg.handle();
        let observed = Arc::clone(&observed2);

        let any = Place::new(NodeIndex(0), ANY_POD, ANY_CORE);
        phrt::execute_on(any, move || {
            // a stack cell of this hart, addressed through its global
            // (L1SP) address
            let cell: i64 = 4096;
            let ptr = phrt::global_address_of(&cell).unwrap();
            if ptr.address().kind() == Ok(MemoryKind::L1Sp) {
                observed.store(ptr.load(), Ordering::SeqCst);
            }
            handle.done();
        })
        .unwrap();

        wg.wait();
        wg.deinitialize();
        phrt::wait_all();
        0
    })
    .unwrap();

    assert_eq!(code, 0);
    assert_eq!(observed.load(Ordering::SeqCst), 4096);
}
