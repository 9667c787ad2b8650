// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Typed global pointers.
//!
//! A [`GlobalPtr<T>`] wraps a [`GlobalAddress`]; dereference-style reads
//! and writes pick the local path (plain memcpy through the resolved
//! native address) or the remote path (a transport load/store suspended on
//! its completion handle) based on the owning node. Pointer arithmetic is
//! in units of `size_of::<T>()` and operates on the offset field of the
//! encoded address.

use core::fmt;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use std::sync::atomic::Ordering;

use crate::addr::{GlobalAddress, MemoryKind, locality_of};
use crate::atomics::{atomic_load, atomic_store};
use crate::error::{Error, Result};
use crate::execute_on::execute_on;
use crate::hart::{self, wait_until};
use crate::place::Place;

/// A typed handle into the global address space.
pub struct GlobalPtr<T> {
    addr: GlobalAddress,
    _marker: PhantomData<*mut T>,
}

// Safety: a global pointer is an address value; every dereference goes
// through the runtime's load/store paths.
unsafe impl<T> Send for GlobalPtr<T> {}
// Safety: see above.
unsafe impl<T> Sync for GlobalPtr<T> {}

impl<T> Clone for GlobalPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GlobalPtr<T> {}

impl<T> PartialEq for GlobalPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}
impl<T> Eq for GlobalPtr<T> {}

impl<T> fmt::Debug for GlobalPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalPtr({})", self.addr)
    }
}

impl<T> GlobalPtr<T> {
    /// The null pointer.
    pub const fn null() -> Self {
        Self::from_address(GlobalAddress::NULL)
    }

    pub const fn from_address(addr: GlobalAddress) -> Self {
        Self {
            addr,
            _marker: PhantomData,
        }
    }

    pub const fn address(self) -> GlobalAddress {
        self.addr
    }

    pub const fn is_null(self) -> bool {
        self.addr.is_null()
    }

    /// Reinterprets the pointee type. The address is unchanged.
    pub const fn cast<U>(self) -> GlobalPtr<U> {
        GlobalPtr::from_address(self.addr)
    }

    /// Offsets the pointer by `count` elements of `T`.
    pub fn add(self, count: usize) -> Self {
        let offset = match self.addr.offset() {
            Ok(offset) => offset,
            Err(err) => crate::fatal!("pointer arithmetic on invalid address: {err}"),
        };
        let moved = self
            .addr
            .with_offset(offset + count * size_of::<T>())
            .unwrap_or_else(|err| crate::fatal!("pointer arithmetic overflow: {err}"));
        Self::from_address(moved)
    }

    /// The locality this pointer belongs to.
    pub fn locality(self) -> Result<Place> {
        locality_of(self.addr)
    }
}

impl<T: Copy> GlobalPtr<T> {
    /// Reads the pointee.
    pub fn load(self) -> T {
        let mut out = MaybeUninit::<T>::uninit();
        load_bytes(self.addr, size_of::<T>(), out.as_mut_ptr().cast());
        // Safety: load_bytes filled all size_of::<T>() bytes.
        unsafe { out.assume_init() }
    }

    /// Writes the pointee.
    pub fn store(self, value: T) {
        store_bytes(self.addr, size_of::<T>(), (&raw const value).cast());
    }
}

/// Reads `n` bytes from a global address into a native buffer.
pub(crate) fn load_bytes(src: GlobalAddress, n: usize, dst: *mut u8) {
    if n == 0 {
        return;
    }
    let current = hart::current();
    let node = src.node();
    if node == current.pxn.node {
        let src_ptr = match current.pxn.native_addr(src) {
            Ok(p) => p,
            Err(err) => crate::fatal!("load error: {err}"),
        };
        // Safety: resolved local address, n bytes bounds-checked by the
        // memory map; dst is caller-provided with room for n bytes.
        unsafe { core::ptr::copy_nonoverlapping(src_ptr, dst, n) };
    } else {
        let handle = match current.pxn.endpoint.load(node, src.bits(), n, dst) {
            Ok(handle) => handle,
            Err(err) => crate::fatal!("load error: {err}"),
        };
        wait_until(|| handle.ready());
    }
}

/// Writes `n` bytes from a native buffer to a global address.
pub(crate) fn store_bytes(dst: GlobalAddress, n: usize, src: *const u8) {
    if n == 0 {
        return;
    }
    let current = hart::current();
    let node = dst.node();
    if node == current.pxn.node {
        let dst_ptr = match current.pxn.native_addr(dst) {
            Ok(p) => p,
            Err(err) => crate::fatal!("store error: {err}"),
        };
        // Safety: resolved local address; src is caller-provided with n
        // readable bytes.
        unsafe { core::ptr::copy_nonoverlapping(src, dst_ptr, n) };
    } else {
        // Safety: src is caller-provided with n readable bytes.
        let data = unsafe { core::slice::from_raw_parts(src, n) };
        let handle = match current.pxn.endpoint.store(node, dst.bits(), data) {
            Ok(handle) => handle,
            Err(err) => crate::fatal!("store error: {err}"),
        };
        wait_until(|| handle.ready());
    }
}

/// Copies `count` elements between two global pointers.
///
/// Picks one of four strategies based on locality: both local is a plain
/// memcpy; a local source becomes a remote store; a local destination
/// becomes a remote load straight into it; two remote ends stage through a
/// temporary buffer (remote-load into it, then remote-store from it).
pub fn global_memcpy<T>(dst: GlobalPtr<T>, src: GlobalPtr<T>, count: usize) {
    let n = count * size_of::<T>();
    if n == 0 {
        return;
    }
    let current = hart::current();
    let here = current.pxn.node;
    let src_node = src.address().node();
    let dst_node = dst.address().node();

    if src_node == here && dst_node == here {
        let (src_ptr, dst_ptr) = match (
            current.pxn.native_addr(src.address()),
            current.pxn.native_addr(dst.address()),
        ) {
            (Ok(s), Ok(d)) => (s, d),
            _ => crate::fatal!("memcpy on unresolvable addresses"),
        };
        // Safety: both resolved local, bounds-checked addresses; global
        // allocations do not overlap.
        unsafe { core::ptr::copy_nonoverlapping(src_ptr, dst_ptr, n) };
    } else if src_node == here {
        let src_ptr = match current.pxn.native_addr(src.address()) {
            Ok(p) => p,
            Err(err) => crate::fatal!("memcpy source error: {err}"),
        };
        store_bytes(dst.address(), n, src_ptr);
    } else if dst_node == here {
        let dst_ptr = match current.pxn.native_addr(dst.address()) {
            Ok(p) => p,
            Err(err) => crate::fatal!("memcpy destination error: {err}"),
        };
        load_bytes(src.address(), n, dst_ptr);
    } else {
        let mut staging = vec![0u8; n];
        load_bytes(src.address(), n, staging.as_mut_ptr());
        store_bytes(dst.address(), n, staging.as_ptr());
    }
}

/// Translates a native reference into a global pointer.
///
/// The reference must live in this PXN's L2SP or main memory, or on the
/// calling hart's stack (L1SP); anything else cannot be addressed
/// globally.
pub fn global_address_of<T>(value: &T) -> Result<GlobalPtr<T>> {
    let current = hart::current();
    let p = core::ptr::from_ref(value).cast::<u8>();
    let node = current.pxn.node;

    if let Some(offset) = current.pxn.l2sp.offset_of(p) {
        let addr = GlobalAddress::encode_l2sp(node, crate::place::PodIndex::new(0, 0), offset);
        return Ok(GlobalPtr::from_address(addr));
    }
    if let Some(offset) = current.pxn.main.offset_of(p) {
        return Ok(GlobalPtr::from_address(GlobalAddress::encode_main(node, offset)));
    }

    // potentially a stack variable of the calling hart
    let (Some(core_idx), Some(hart_idx)) = (current.core, current.hart) else {
        return Err(Error::OutOfBounds);
    };
    let core = &current.pxn.cores[core_idx];
    let offset = core.contexts[hart_idx].stack_offset(p as usize)?;
    let addr = GlobalAddress::encode_l1sp(
        node,
        crate::place::PodIndex::new(0, 0),
        core.index,
        offset,
    );
    Ok(GlobalPtr::from_address(addr))
}

/// Allocates `count` elements of `T` in the given tier at `place`.
///
/// A local allocation draws from the tier's resource directly. A remote
/// one ships an allocation task to the target, which publishes the
/// resulting address into a scratch cell on the initiator; a null result
/// means the target's resource was exhausted.
pub fn allocate_memory<T>(place: Place, count: usize, kind: MemoryKind) -> Result<GlobalPtr<T>> {
    let bytes = count * size_of::<T>();
    let align = align_of::<T>();
    if bytes == 0 {
        return Err(Error::InvalidValue);
    }

    let current = hart::current();
    if place.node.is_any() || place.node == current.pxn.node {
        let addr = current
            .pxn
            .resource(kind)?
            .allocate(bytes, align)
            .ok_or(Error::BadAlloc)?;
        return Ok(GlobalPtr::from_address(addr));
    }

    // result cell in local main memory, remotely addressable by the target
    const PENDING: u64 = u64::MAX;
    let cell_addr = current
        .pxn
        .resource(MemoryKind::Main)?
        .allocate(size_of::<u64>(), align_of::<u64>())
        .ok_or(Error::BadAlloc)?;
    let cell = GlobalPtr::<u64>::from_address(cell_addr);
    atomic_store(cell, PENDING, Ordering::Relaxed);

    let spawned = execute_on(place, move || {
        let bits = hart::current()
            .pxn
            .resource(kind)
            .ok()
            .and_then(|resource| resource.allocate(bytes, align))
            .map_or(0, GlobalAddress::bits);
        atomic_store(cell, bits, Ordering::Release);
    });
    if let Err(err) = spawned {
        deallocate_memory(cell, 1);
        return Err(err);
    }

    wait_until(|| atomic_load(cell, Ordering::Relaxed) != PENDING);
    let bits = atomic_load(cell, Ordering::Acquire);
    deallocate_memory(cell, 1);

    if bits == 0 {
        Err(Error::BadAlloc)
    } else {
        Ok(GlobalPtr::from_address(GlobalAddress::from_bits(bits)))
    }
}

/// Returns `count` elements of `T` to the owning tier resource.
///
/// Remote pointers are returned by shipping a deallocation task to the
/// owning node. Null pointers are ignored.
pub fn deallocate_memory<T>(ptr: GlobalPtr<T>, count: usize) {
    if ptr.is_null() {
        return;
    }
    let bytes = count * size_of::<T>();
    let align = align_of::<T>();
    let addr = ptr.address();
    let kind = match addr.kind() {
        Ok(kind @ (MemoryKind::L2Sp | MemoryKind::Main)) => kind,
        _ => crate::fatal!("cannot deallocate memory at {addr}"),
    };

    let current = hart::current();
    if addr.node() == current.pxn.node {
        match current.pxn.resource(kind) {
            Ok(resource) => resource.deallocate(addr, bytes, align),
            Err(err) => crate::fatal!("cannot deallocate memory: {err}"),
        }
        return;
    }

    let place = Place::new(addr.node(), crate::place::ANY_POD, crate::place::ANY_CORE);
    let result = execute_on(place, move || {
        match hart::current().pxn.resource(kind) {
            Ok(resource) => resource.deallocate(addr, bytes, align),
            Err(err) => crate::fatal!("cannot deallocate memory: {err}"),
        }
    });
    if let Err(err) = result {
        tracing::error!("remote deallocation failed: {err}");
    }
}
