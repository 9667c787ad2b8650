// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-PXN state object.
//!
//! Everything that the original design keeps in per-node singletons lives
//! here: the backing memories, the tier resources, the reserved runtime
//! cells, the core table and the lifecycle counters. The object is built at
//! power-on, threaded through the CP and the harts, and torn down in
//! reverse order at power-off.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64};

use crate::addr::{GlobalAddress, MemoryKind};
use crate::config::Config;
use crate::cores::Core;
use crate::error::{Error, Result};
use crate::mem::specific::RuntimeCells;
use crate::mem::{L2SP_BUCKETS, MAIN_BUCKETS, MemoryChunk, SpecificStorage, TierResource};
use crate::place::{CoreIndex, NodeIndex, PodIndex};
use crate::transport::fabric::Endpoint;

pub(crate) struct Pxn {
    pub node: NodeIndex,
    pub config: Config,
    pub endpoint: Arc<Endpoint>,
    /// L2 scratchpad backing store (one pod in this deployment shape).
    pub l2sp: MemoryChunk,
    /// Main memory backing store.
    pub main: MemoryChunk,
    /// Offsets of the runtime's reserved cells in main memory.
    pub cells: RuntimeCells,
    storage: SpecificStorage,
    l2sp_resource: spin::Once<TierResource>,
    main_resource: spin::Once<TierResource>,
    pub cores: Vec<Arc<Core>>,
    /// Core-active flag; cleared by the CP once termination detection has
    /// declared quiescence.
    pub active: AtomicBool,
    /// Monotonic count of cores whose queue reached `Ready`.
    pub cores_initialized: AtomicI64,
    /// Monotonic count of cores that finished finalization.
    pub cores_finalized: AtomicI64,
    /// Count of cores that signalled the CP after teardown.
    pub cores_done: AtomicI64,
}

impl Pxn {
    pub(crate) fn new(
        node: NodeIndex,
        config: Config,
        endpoint: Arc<Endpoint>,
    ) -> Result<Arc<Self>> {
        let mut storage = SpecificStorage::new();
        let cells = RuntimeCells::reserve(&mut storage, pod_count(&config))?;

        if storage.main_reserved() > config.main_per_node
            || storage.l2sp_reserved() > config.l2sp_per_pod
        {
            tracing::error!("{node} memories too small for the reserved storage");
            return Err(Error::InsufficientSpace);
        }

        let l2sp = MemoryChunk::new(config.l2sp_per_pod)?;
        let main = MemoryChunk::new(config.main_per_node)?;

        let cores = (0..config.cores_per_pod)
            .map(|x| {
                #[expect(clippy::cast_possible_truncation, reason = "bounded by the core bit range")]
                let index = CoreIndex::new(x as i8, 0);
                Arc::new(Core::new(
                    index,
                    config.harts_per_core,
                    config.l1sp_per_hart,
                ))
            })
            .collect();

        Ok(Arc::new(Self {
            node,
            config,
            endpoint,
            l2sp,
            main,
            cells,
            storage,
            l2sp_resource: spin::Once::new(),
            main_resource: spin::Once::new(),
            cores,
            active: AtomicBool::new(true),
            cores_initialized: AtomicI64::new(0),
            cores_finalized: AtomicI64::new(0),
            cores_done: AtomicI64::new(0),
        }))
    }

    /// Pods on this PXN. The deployment shape is a 1x1 pod grid.
    pub(crate) fn pod_count(&self) -> usize {
        pod_count(&self.config)
    }

    pub(crate) fn pod_dims(&self) -> PodIndex {
        PodIndex::new(1, 1)
    }

    /// Worker-core grid dimensions; the scheduler column is the extra core
    /// at `x == core_dims().x`.
    #[expect(clippy::cast_possible_truncation, reason = "bounded by the core bit range")]
    pub(crate) fn core_dims(&self) -> CoreIndex {
        CoreIndex::new((self.cores.len() - 1) as i8, 1)
    }

    /// Resolves a global address owned by this PXN to a native pointer.
    pub(crate) fn native_addr(&self, addr: GlobalAddress) -> Result<*mut u8> {
        debug_assert_eq!(addr.node(), self.node, "address is not local to this PXN");
        match addr.kind()? {
            MemoryKind::L2Sp => self.l2sp.native_addr(addr.offset()?),
            MemoryKind::Main => self.main.native_addr(addr.offset()?),
            MemoryKind::L1Sp => {
                let pod = addr.pod();
                if pod != PodIndex::new(0, 0) {
                    tracing::error!("invalid pod index: {pod}");
                    return Err(Error::OutOfBounds);
                }
                let core = addr.core();
                let x = usize::try_from(core.x).map_err(|_| Error::OutOfBounds)?;
                if core.y != 0 || x >= self.cores.len() {
                    tracing::error!("invalid core index: {core}");
                    return Err(Error::OutOfBounds);
                }
                self.cores[x].l1sp_native(addr.offset()?)
            }
            MemoryKind::Unknown => Err(Error::InvalidAddress),
        }
    }

    /// The per-pod `created` counter, living in reserved main memory.
    pub(crate) fn created_counter(&self, pod: usize) -> &AtomicI64 {
        self.counter(self.cells.created[pod])
    }

    /// The per-pod `finished` counter, living in reserved main memory.
    pub(crate) fn finished_counter(&self, pod: usize) -> &AtomicI64 {
        self.counter(self.cells.finished[pod])
    }

    fn counter(&self, offset: usize) -> &AtomicI64 {
        let p = self
            .main
            .native_addr(offset)
            .unwrap_or_else(|err| crate::fatal!("reserved cell out of bounds: {err}"));
        // Safety: the cell was reserved 8-aligned in main memory and lives
        // as long as `self`.
        unsafe { AtomicI64::from_ptr(p.cast()) }
    }

    /// Constructs the L2SP resource; done once by hart 0 of core (0,0).
    pub(crate) fn init_l2sp_resource(&self) -> Result<()> {
        let start = self.storage.l2sp_reserved();
        let resource = TierResource::new(
            MemoryKind::L2Sp,
            self.node,
            PodIndex::new(0, 0),
            start,
            self.l2sp.len() - start,
            L2SP_BUCKETS,
        )?;
        self.l2sp_resource.call_once(|| resource);
        Ok(())
    }

    /// Constructs the main-memory resource; done once by the CP.
    pub(crate) fn init_main_resource(&self) -> Result<()> {
        let start = self.storage.main_reserved();
        let resource = TierResource::new(
            MemoryKind::Main,
            self.node,
            PodIndex::new(0, 0),
            start,
            self.main.len() - start,
            MAIN_BUCKETS,
        )?;
        self.main_resource.call_once(|| resource);
        Ok(())
    }

    /// The dynamic-allocation resource for a tier.
    pub(crate) fn resource(&self, kind: MemoryKind) -> Result<&TierResource> {
        let resource = match kind {
            MemoryKind::L2Sp => self.l2sp_resource.get(),
            MemoryKind::Main => self.main_resource.get(),
            _ => return Err(Error::InvalidValue),
        };
        resource.ok_or(Error::NotInit)
    }
}

fn pod_count(_config: &Config) -> usize {
    1
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::transport::fabric::build_fabric;

    fn small_pxn() -> Arc<Pxn> {
        let config = Config {
            nodes: 1,
            cores_per_pod: 2,
            harts_per_core: 2,
            l1sp_per_hart: 0x2000,
            l2sp_per_pod: 1 << 20,
            main_per_node: 1 << 22,
        };
        let endpoint = build_fabric(1).remove(0);
        Pxn::new(NodeIndex(0), config, endpoint).unwrap()
    }

    #[test]
    fn reserved_counters_are_zero_and_writable() {
        let pxn = small_pxn();
        assert_eq!(pxn.created_counter(0).load(Ordering::Relaxed), 0);
        pxn.created_counter(0).fetch_add(5, Ordering::Relaxed);
        assert_eq!(pxn.created_counter(0).load(Ordering::Relaxed), 5);
        assert_eq!(pxn.finished_counter(0).load(Ordering::Relaxed), 0);
    }

    #[test]
    fn native_addr_resolves_l2sp_and_main() {
        let pxn = small_pxn();
        let l2 = GlobalAddress::encode_l2sp(pxn.node, PodIndex::new(0, 0), 64);
        let main = GlobalAddress::encode_main(pxn.node, 128);
        assert!(pxn.native_addr(l2).is_ok());
        assert!(pxn.native_addr(main).is_ok());

        let bad = GlobalAddress::encode_main(pxn.node, 1 << 23);
        assert_eq!(pxn.native_addr(bad), Err(Error::OutOfBounds));
    }

    #[test]
    fn resources_require_initialization() {
        let pxn = small_pxn();
        assert!(matches!(
            pxn.resource(MemoryKind::Main),
            Err(Error::NotInit)
        ));
        pxn.init_main_resource().unwrap();
        let addr = pxn
            .resource(MemoryKind::Main)
            .unwrap()
            .allocate(64, 8)
            .unwrap();
        assert_eq!(addr.kind().unwrap(), MemoryKind::Main);
        assert!(pxn.native_addr(addr).is_ok());
    }
}
