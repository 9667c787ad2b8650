// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cross-node transport.
//!
//! Remote loads, stores, atomics and task spawns travel as active messages:
//! one message kind per operation, with the inline argument words packed as
//! concatenated little-endian fields in declared order. Each request
//! carries an opaque two-word handle token that the reply echoes back so
//! the initiator can fulfill the correct handle. Replies are single-shot.
//!
//! The concrete fabric is an in-process loopback: every PXN owns an
//! endpoint with an inbound channel drained by a per-PXN polling thread.
//! The generic `request` message carries the task as an owned value, which
//! is this transport's representation of the opaque serialized closure.

pub(crate) mod fabric;
pub(crate) mod handles;
pub(crate) mod wire;

use crate::atomics::DataType;
use crate::place::{NodeIndex, Place};
use crate::task::Task;
use handles::HandleWords;

/// One active message.
///
/// The `payload` buffers hold the per-operation argument words in declared
/// order (see each variant); variable-size operations append their data
/// bytes after the fixed fields.
pub(crate) enum Frame {
    /// Generic RPC: the responder enqueues (or runs) the carried task.
    Request { place: Place, task: Task },
    /// `{src_addr: u64, byte_count: u64}`; the reply carries the bytes.
    Load { payload: Vec<u8>, handle: HandleWords },
    /// `{dst_addr: u64}` followed by the raw bytes to write.
    Store { payload: Vec<u8>, handle: HandleWords },
    /// `{src_addr: u64, datatype: i64}`.
    AtomicLoad { payload: Vec<u8>, handle: HandleWords },
    /// `{dst_addr: u64, datatype: i64, value}`.
    AtomicStore { payload: Vec<u8>, handle: HandleWords },
    /// `{dst_addr: u64, datatype: i64, expected, desired}`.
    AtomicCompareExchange { payload: Vec<u8>, handle: HandleWords },
    /// `{dst_addr: u64, datatype: i64, value}`.
    AtomicIncrement { payload: Vec<u8>, handle: HandleWords },
    /// `{dst_addr: u64, datatype: i64, value}`.
    AtomicDecrement { payload: Vec<u8>, handle: HandleWords },
    /// `{dst_addr: u64, datatype: i64, value}`.
    AtomicFetchAdd { payload: Vec<u8>, handle: HandleWords },
    /// `{dst_addr: u64, datatype: i64, value}`.
    AtomicFetchSub { payload: Vec<u8>, handle: HandleWords },
    /// Reply to `Load`: the requested bytes.
    LoadAck { payload: Vec<u8>, handle: HandleWords },
    /// Reply to ack-only operations.
    Ack { handle: HandleWords },
    /// Reply carrying a single value (atomic load, CAS, fetch-add/sub).
    ValueAck { payload: Vec<u8>, handle: HandleWords },
    /// Stops the polling thread; sent by the owning CP at teardown.
    Shutdown,
}

/// A frame plus its source node, as delivered to a poller.
pub(crate) struct Envelope {
    pub src: NodeIndex,
    pub frame: Frame,
}

/// Packs `{addr, byte_count}` for a load request.
pub(crate) fn pack_load(addr: u64, byte_count: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16);
    wire::put_u64(&mut payload, addr);
    wire::put_u64(&mut payload, byte_count);
    payload
}

/// Packs `{addr}` followed by the store data.
pub(crate) fn pack_store(addr: u64, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + data.len());
    wire::put_u64(&mut payload, addr);
    payload.extend_from_slice(data);
    payload
}

/// Packs `{addr, datatype}` followed by zero or more value words.
pub(crate) fn pack_atomic(addr: u64, datatype: DataType, values: &[&[u8]]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + values.iter().map(|v| v.len()).sum::<usize>());
    wire::put_u64(&mut payload, addr);
    wire::put_i64(&mut payload, datatype as i64);
    for value in values {
        payload.extend_from_slice(value);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_are_concatenated_in_declared_order() {
        let payload = pack_load(0xAABB_CCDD_0011_2233, 64);
        assert_eq!(payload.len(), 16);
        let mut r = wire::Reader::new(&payload);
        assert_eq!(r.u64().unwrap(), 0xAABB_CCDD_0011_2233);
        assert_eq!(r.u64().unwrap(), 64);

        let payload = pack_store(7, &[1, 2, 3]);
        let mut r = wire::Reader::new(&payload);
        assert_eq!(r.u64().unwrap(), 7);
        assert_eq!(r.rest(), &[1, 2, 3]);

        let payload = pack_atomic(9, DataType::U32, &[&42u32.to_le_bytes()]);
        let mut r = wire::Reader::new(&payload);
        assert_eq!(r.u64().unwrap(), 9);
        assert_eq!(r.i64().unwrap(), DataType::U32 as i64);
        assert_eq!(r.rest(), &42u32.to_le_bytes());
    }
}
