// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The in-process loopback fabric.
//!
//! One endpoint per PXN, connected all-to-all through channels. A per-PXN
//! polling thread drains the endpoint's inbound channel, executes responder
//! semantics against the local memories and routes replies back to the
//! initiator, until the owning CP signals shutdown. Collectives (barrier,
//! sum all-reduce) rendezvous through a shared generation counter.

use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::atomics::{DataType, NativeAtomic};
use crate::error::{Error, Result};
use crate::node::Pxn;
use crate::place::{NodeIndex, Place};
use crate::task::Task;
use crate::transport::handles::{AckHandle, HandleTable, LoadHandle, Pending, ValueHandle};
use crate::transport::{Envelope, Frame, pack_atomic, pack_load, pack_store, wire};

/// Sum all-reduce (and barrier) rendezvous shared by every CP.
pub(crate) struct Collective {
    participants: usize,
    state: Mutex<CollectiveState>,
    cv: Condvar,
}

struct CollectiveState {
    arrived: usize,
    generation: u64,
    accumulator: i64,
    result: i64,
}

impl Collective {
    fn new(participants: usize) -> Self {
        Self {
            participants,
            state: Mutex::new(CollectiveState {
                arrived: 0,
                generation: 0,
                accumulator: 0,
                result: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Contributes `value` and blocks until every participant arrived;
    /// returns the sum of all contributions.
    pub(crate) fn allreduce(&self, value: i64) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.accumulator += value;
        state.arrived += 1;
        if state.arrived == self.participants {
            state.result = state.accumulator;
            state.accumulator = 0;
            state.arrived = 0;
            state.generation += 1;
            self.cv.notify_all();
            state.result
        } else {
            let generation = state.generation;
            while state.generation == generation {
                state = self.cv.wait(state).unwrap();
            }
            state.result
        }
    }

    /// All-reduce of nothing, acting as a barrier.
    pub(crate) fn barrier(&self) {
        self.allreduce(0);
    }
}

/// One PXN's attachment to the fabric.
pub(crate) struct Endpoint {
    node: NodeIndex,
    peers: Vec<Sender<Envelope>>,
    inbound: spin::Mutex<Option<Receiver<Envelope>>>,
    pub(crate) handles: HandleTable,
    collective: Arc<Collective>,
}

/// Builds the all-to-all fabric for `nodes` PXNs.
#[expect(clippy::cast_possible_truncation, reason = "bounded by the node bit range")]
pub(crate) fn build_fabric(nodes: usize) -> Vec<Arc<Endpoint>> {
    let collective = Arc::new(Collective::new(nodes));
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..nodes).map(|_| channel()).unzip();

    receivers
        .into_iter()
        .enumerate()
        .map(|(i, rx)| {
            Arc::new(Endpoint {
                node: NodeIndex(i as i16),
                peers: senders.clone(),
                inbound: spin::Mutex::new(Some(rx)),
                handles: HandleTable::new(),
                collective: Arc::clone(&collective),
            })
        })
        .collect()
}

impl Endpoint {
    pub(crate) fn node(&self) -> NodeIndex {
        self.node
    }

    #[expect(clippy::cast_possible_truncation, reason = "bounded by the node bit range")]
    pub(crate) fn node_dims(&self) -> NodeIndex {
        NodeIndex(self.peers.len() as i16)
    }

    /// Starts the polling thread draining this endpoint.
    pub(crate) fn start(&self, pxn: Arc<Pxn>) -> JoinHandle<()> {
        let Some(inbound) = self.inbound.lock().take() else {
            crate::fatal!("transport polling already started on {}", self.node);
        };
        std::thread::Builder::new()
            .name(format!("poll-{}", self.node))
            .spawn(move || poll_loop(&pxn, &inbound))
            .unwrap_or_else(|err| crate::fatal!("cannot start polling thread: {err}"))
    }

    /// Signals the polling thread to stop once the queue has drained.
    pub(crate) fn stop(&self) {
        let _ = self.send(self.node, Frame::Shutdown);
    }

    pub(crate) fn barrier(&self) {
        self.collective.barrier();
    }

    pub(crate) fn allreduce(&self, value: i64) -> i64 {
        self.collective.allreduce(value)
    }

    fn send(&self, dst: NodeIndex, frame: Frame) -> Result<()> {
        let idx = usize::try_from(dst.0).map_err(|_| Error::OutOfBounds)?;
        let Some(tx) = self.peers.get(idx) else {
            tracing::error!("node index out of bounds: {dst}");
            return Err(Error::OutOfBounds);
        };
        if tx
            .send(Envelope {
                src: self.node,
                frame,
            })
            .is_err()
        {
            crate::fatal!("transport send to {dst} failed");
        }
        Ok(())
    }

    /// Ships a task for remote enqueue.
    pub(crate) fn request(&self, dst: NodeIndex, place: Place, task: Task) -> Result<()> {
        self.send(dst, Frame::Request { place, task })
    }

    /// Remote load of `n` bytes from `addr` into `dst_ptr` on this node.
    pub(crate) fn load(
        &self,
        dst: NodeIndex,
        addr: u64,
        n: usize,
        dst_ptr: *mut u8,
    ) -> Result<Arc<LoadHandle>> {
        let handle = Arc::new(LoadHandle::new(dst_ptr, n));
        let words = self.handles.register(Pending::Load(Arc::clone(&handle)));
        self.send(
            dst,
            Frame::Load {
                payload: pack_load(addr, n as u64),
                handle: words,
            },
        )?;
        Ok(handle)
    }

    /// Remote store of `data` to `addr`.
    pub(crate) fn store(&self, dst: NodeIndex, addr: u64, data: &[u8]) -> Result<Arc<AckHandle>> {
        let handle = Arc::new(AckHandle::default());
        let words = self.handles.register(Pending::Ack(Arc::clone(&handle)));
        self.send(
            dst,
            Frame::Store {
                payload: pack_store(addr, data),
                handle: words,
            },
        )?;
        Ok(handle)
    }

    pub(crate) fn atomic_load(
        &self,
        dst: NodeIndex,
        addr: crate::addr::GlobalAddress,
        datatype: DataType,
    ) -> Result<Arc<ValueHandle>> {
        let handle = Arc::new(ValueHandle::default());
        let words = self.handles.register(Pending::Value(Arc::clone(&handle)));
        self.send(
            dst,
            Frame::AtomicLoad {
                payload: pack_atomic(addr.bits(), datatype, &[]),
                handle: words,
            },
        )?;
        Ok(handle)
    }

    pub(crate) fn atomic_store(
        &self,
        dst: NodeIndex,
        addr: crate::addr::GlobalAddress,
        datatype: DataType,
        value: &[u8],
    ) -> Result<Arc<AckHandle>> {
        let handle = Arc::new(AckHandle::default());
        let words = self.handles.register(Pending::Ack(Arc::clone(&handle)));
        self.send(
            dst,
            Frame::AtomicStore {
                payload: pack_atomic(addr.bits(), datatype, &[value]),
                handle: words,
            },
        )?;
        Ok(handle)
    }

    pub(crate) fn atomic_compare_exchange(
        &self,
        dst: NodeIndex,
        addr: crate::addr::GlobalAddress,
        datatype: DataType,
        expected: &[u8],
        desired: &[u8],
    ) -> Result<Arc<ValueHandle>> {
        let handle = Arc::new(ValueHandle::default());
        let words = self.handles.register(Pending::Value(Arc::clone(&handle)));
        self.send(
            dst,
            Frame::AtomicCompareExchange {
                payload: pack_atomic(addr.bits(), datatype, &[expected, desired]),
                handle: words,
            },
        )?;
        Ok(handle)
    }

    pub(crate) fn atomic_increment(
        &self,
        dst: NodeIndex,
        addr: crate::addr::GlobalAddress,
        datatype: DataType,
        value: &[u8],
    ) -> Result<Arc<AckHandle>> {
        let handle = Arc::new(AckHandle::default());
        let words = self.handles.register(Pending::Ack(Arc::clone(&handle)));
        self.send(
            dst,
            Frame::AtomicIncrement {
                payload: pack_atomic(addr.bits(), datatype, &[value]),
                handle: words,
            },
        )?;
        Ok(handle)
    }

    pub(crate) fn atomic_decrement(
        &self,
        dst: NodeIndex,
        addr: crate::addr::GlobalAddress,
        datatype: DataType,
        value: &[u8],
    ) -> Result<Arc<AckHandle>> {
        let handle = Arc::new(AckHandle::default());
        let words = self.handles.register(Pending::Ack(Arc::clone(&handle)));
        self.send(
            dst,
            Frame::AtomicDecrement {
                payload: pack_atomic(addr.bits(), datatype, &[value]),
                handle: words,
            },
        )?;
        Ok(handle)
    }

    pub(crate) fn atomic_fetch_add(
        &self,
        dst: NodeIndex,
        addr: crate::addr::GlobalAddress,
        datatype: DataType,
        value: &[u8],
    ) -> Result<Arc<ValueHandle>> {
        let handle = Arc::new(ValueHandle::default());
        let words = self.handles.register(Pending::Value(Arc::clone(&handle)));
        self.send(
            dst,
            Frame::AtomicFetchAdd {
                payload: pack_atomic(addr.bits(), datatype, &[value]),
                handle: words,
            },
        )?;
        Ok(handle)
    }

    pub(crate) fn atomic_fetch_sub(
        &self,
        dst: NodeIndex,
        addr: crate::addr::GlobalAddress,
        datatype: DataType,
        value: &[u8],
    ) -> Result<Arc<ValueHandle>> {
        let handle = Arc::new(ValueHandle::default());
        let words = self.handles.register(Pending::Value(Arc::clone(&handle)));
        self.send(
            dst,
            Frame::AtomicFetchSub {
                payload: pack_atomic(addr.bits(), datatype, &[value]),
                handle: words,
            },
        )?;
        Ok(handle)
    }
}

/// Per-type responder bodies, dispatched over the wire datatype tag.
macro_rules! dispatch_data_type {
    ($dt:expr, $f:ident($($arg:expr),*)) => {
        match $dt {
            DataType::I8 => $f::<i8>($($arg),*),
            DataType::U8 => $f::<u8>($($arg),*),
            DataType::I16 => $f::<i16>($($arg),*),
            DataType::U16 => $f::<u16>($($arg),*),
            DataType::I32 => $f::<i32>($($arg),*),
            DataType::U32 => $f::<u32>($($arg),*),
            DataType::I64 => $f::<i64>($($arg),*),
            DataType::U64 => $f::<u64>($($arg),*),
        }
    };
}

fn poll_loop(pxn: &Arc<Pxn>, inbound: &Receiver<Envelope>) {
    tracing::debug!("{} transport polling started", pxn.node);
    while let Ok(envelope) = inbound.recv() {
        let src = envelope.src;
        match envelope.frame {
            Frame::Request { place, task } => {
                if let Err(err) = crate::execute_on::enqueue_local(pxn, place, task) {
                    crate::fatal!("failed to execute remote operation: {err}");
                }
            }
            Frame::Load { payload, handle } => {
                let mut r = wire::Reader::new(&payload);
                let (addr, n) = match (r.u64(), r.u64()) {
                    (Ok(addr), Ok(n)) => (addr, n),
                    _ => crate::fatal!("malformed load request"),
                };
                let src_ptr = resolve(pxn, addr);
                #[expect(clippy::cast_possible_truncation, reason = "sizes fit usize")]
                let n = n as usize;
                // Safety: resolve() bounds-checked the address; the runtime
                // owns the backing memory for the fabric's lifetime.
                let data = unsafe { core::slice::from_raw_parts(src_ptr, n) }.to_vec();
                reply(pxn, src, Frame::LoadAck {
                    payload: data,
                    handle,
                });
            }
            Frame::Store { payload, handle } => {
                let mut r = wire::Reader::new(&payload);
                let Ok(addr) = r.u64() else {
                    crate::fatal!("malformed store request");
                };
                let data = r.rest();
                let dst_ptr = resolve(pxn, addr);
                // Safety: resolve() bounds-checked the address.
                unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst_ptr, data.len()) };
                core::sync::atomic::fence(Ordering::Release);
                reply(pxn, src, Frame::Ack { handle });
            }
            Frame::AtomicLoad { payload, handle } => {
                let (p, dt, _) = unpack_atomic(pxn, &payload);
                let value = dispatch_data_type!(dt, respond_atomic_load(p));
                reply(pxn, src, Frame::ValueAck {
                    payload: value,
                    handle,
                });
            }
            Frame::AtomicStore { payload, handle } => {
                let (p, dt, data) = unpack_atomic(pxn, &payload);
                dispatch_data_type!(dt, respond_atomic_store(p, data));
                reply(pxn, src, Frame::Ack { handle });
            }
            Frame::AtomicCompareExchange { payload, handle } => {
                let (p, dt, data) = unpack_atomic(pxn, &payload);
                let observed = dispatch_data_type!(dt, respond_atomic_cas(p, data));
                reply(pxn, src, Frame::ValueAck {
                    payload: observed,
                    handle,
                });
            }
            Frame::AtomicIncrement { payload, handle } => {
                let (p, dt, data) = unpack_atomic(pxn, &payload);
                dispatch_data_type!(dt, respond_atomic_add(p, data));
                reply(pxn, src, Frame::Ack { handle });
            }
            Frame::AtomicDecrement { payload, handle } => {
                let (p, dt, data) = unpack_atomic(pxn, &payload);
                dispatch_data_type!(dt, respond_atomic_sub(p, data));
                reply(pxn, src, Frame::Ack { handle });
            }
            Frame::AtomicFetchAdd { payload, handle } => {
                let (p, dt, data) = unpack_atomic(pxn, &payload);
                let previous = dispatch_data_type!(dt, respond_atomic_fetch_add(p, data));
                reply(pxn, src, Frame::ValueAck {
                    payload: previous,
                    handle,
                });
            }
            Frame::AtomicFetchSub { payload, handle } => {
                let (p, dt, data) = unpack_atomic(pxn, &payload);
                let previous = dispatch_data_type!(dt, respond_atomic_fetch_sub(p, data));
                reply(pxn, src, Frame::ValueAck {
                    payload: previous,
                    handle,
                });
            }
            Frame::LoadAck { payload, handle } => match pxn.endpoint.handles.take(handle) {
                Some(Pending::Load(h)) => h.set_ready(&payload),
                _ => crate::fatal!("load reply for unknown handle"),
            },
            Frame::Ack { handle } => match pxn.endpoint.handles.take(handle) {
                Some(Pending::Ack(h)) => h.set_ready(),
                _ => crate::fatal!("ack for unknown handle"),
            },
            Frame::ValueAck { payload, handle } => match pxn.endpoint.handles.take(handle) {
                Some(Pending::Value(h)) => h.set_ready(&payload),
                _ => crate::fatal!("value reply for unknown handle"),
            },
            Frame::Shutdown => break,
        }
    }
    tracing::debug!("{} transport polling stopped", pxn.node);
}

fn reply(pxn: &Pxn, dst: NodeIndex, frame: Frame) {
    if pxn.endpoint.send(dst, frame).is_err() {
        crate::fatal!("could not send reply to {dst}");
    }
}

fn resolve(pxn: &Pxn, addr: u64) -> *mut u8 {
    match pxn.native_addr(crate::addr::GlobalAddress::from_bits(addr)) {
        Ok(p) => p,
        Err(err) => crate::fatal!("unresolvable global address {addr:#x}: {err}"),
    }
}

/// Unpacks `{addr, datatype}` and resolves the address; returns the value
/// bytes that follow.
fn unpack_atomic<'a>(pxn: &Pxn, payload: &'a [u8]) -> (*mut u8, DataType, &'a [u8]) {
    let mut r = wire::Reader::new(payload);
    let (addr, tag) = match (r.u64(), r.i64()) {
        (Ok(addr), Ok(tag)) => (addr, tag),
        _ => crate::fatal!("malformed atomic request"),
    };
    let Ok(dt) = DataType::from_wire(tag) else {
        crate::fatal!("unknown data type: {tag}");
    };
    (resolve(pxn, addr), dt, r.rest())
}

fn respond_atomic_load<T: NativeAtomic>(p: *mut u8) -> Vec<u8> {
    // Safety: address resolved and bounds-checked by the caller.
    let value = unsafe { T::native_load(p, Ordering::Relaxed) };
    value.to_wire()[..T::WIDTH].to_vec()
}

fn respond_atomic_store<T: NativeAtomic>(p: *mut u8, data: &[u8]) {
    // Safety: address resolved and bounds-checked by the caller.
    unsafe { T::native_store(p, T::from_wire(data), Ordering::Relaxed) };
}

fn respond_atomic_cas<T: NativeAtomic>(p: *mut u8, data: &[u8]) -> Vec<u8> {
    let expected = T::from_wire(data);
    let desired = T::from_wire(&data[T::WIDTH..]);
    // Safety: address resolved and bounds-checked by the caller.
    let observed = match unsafe {
        T::native_cas(p, expected, desired, Ordering::Relaxed, Ordering::Relaxed)
    } {
        Ok(v) | Err(v) => v,
    };
    observed.to_wire()[..T::WIDTH].to_vec()
}

fn respond_atomic_add<T: NativeAtomic>(p: *mut u8, data: &[u8]) {
    // Safety: address resolved and bounds-checked by the caller.
    unsafe { T::native_fetch_add(p, T::from_wire(data), Ordering::Relaxed) };
}

fn respond_atomic_sub<T: NativeAtomic>(p: *mut u8, data: &[u8]) {
    // Safety: address resolved and bounds-checked by the caller.
    unsafe { T::native_fetch_sub(p, T::from_wire(data), Ordering::Relaxed) };
}

fn respond_atomic_fetch_add<T: NativeAtomic>(p: *mut u8, data: &[u8]) -> Vec<u8> {
    // Safety: address resolved and bounds-checked by the caller.
    let previous = unsafe { T::native_fetch_add(p, T::from_wire(data), Ordering::Relaxed) };
    previous.to_wire()[..T::WIDTH].to_vec()
}

fn respond_atomic_fetch_sub<T: NativeAtomic>(p: *mut u8, data: &[u8]) -> Vec<u8> {
    // Safety: address resolved and bounds-checked by the caller.
    let previous = unsafe { T::native_fetch_sub(p, T::from_wire(data), Ordering::Relaxed) };
    previous.to_wire()[..T::WIDTH].to_vec()
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn allreduce_sums_across_participants() {
        let collective = Arc::new(Collective::new(4));
        let handles: Vec<_> = (0..4i64)
            .map(|i| {
                let collective = Arc::clone(&collective);
                thread::spawn(move || collective.allreduce(i + 1))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 10);
        }
    }

    #[test]
    fn allreduce_generations_do_not_bleed() {
        let collective = Arc::new(Collective::new(2));
        let c2 = Arc::clone(&collective);
        let t = thread::spawn(move || (c2.allreduce(1), c2.allreduce(10)));
        let first = collective.allreduce(2);
        let second = collective.allreduce(20);
        assert_eq!(first, 3);
        assert_eq!(second, 30);
        assert_eq!(t.join().unwrap(), (3, 30));
    }

    #[test]
    fn single_participant_collective_is_immediate() {
        let collective = Collective::new(1);
        assert_eq!(collective.allreduce(7), 7);
        collective.barrier();
    }
}
