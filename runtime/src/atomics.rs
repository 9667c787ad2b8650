// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Typed atomics over global pointers.
//!
//! For a local address the façade performs the native atomic with the
//! requested order and then yields (cooperative handoff). For a remote
//! address the initiator emits a release-side pre-fence, sends the matching
//! active message, suspends until the handle is ready and emits an
//! acquire-side post-fence; the responder executes the effect with relaxed
//! ordering. This reproduces the C++ memory-order semantics at the
//! initiator's node while keeping the wire traffic minimal.

use core::sync::atomic::{
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicU8, AtomicU16, AtomicU32, AtomicU64,
    Ordering, fence,
};

use crate::error::{Error, Result};
use crate::global_ptr::GlobalPtr;
use crate::hart::{self, hart_yield, wait_until};
use crate::node::Pxn;

/// Tag identifying the operand width and signedness of a wire-level atomic.
///
/// Responder-side dispatch is a match over this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum DataType {
    I8 = 0,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
}

impl DataType {
    pub(crate) fn from_wire(tag: i64) -> Result<Self> {
        Ok(match tag {
            0 => DataType::I8,
            1 => DataType::U8,
            2 => DataType::I16,
            3 => DataType::U16,
            4 => DataType::I32,
            5 => DataType::U32,
            6 => DataType::I64,
            7 => DataType::U64,
            _ => return Err(Error::InvalidValue),
        })
    }

    pub(crate) fn width(self) -> usize {
        match self {
            DataType::I8 | DataType::U8 => 1,
            DataType::I16 | DataType::U16 => 2,
            DataType::I32 | DataType::U32 => 4,
            DataType::I64 | DataType::U64 => 8,
        }
    }
}

#[doc(hidden)]
pub mod sealed {
    use super::{DataType, Ordering};

    /// Native atomic operations for one integer width, used by the façade
    /// on the local path and by the transport responder.
    pub trait NativeAtomic: Copy {
        const DATA_TYPE: DataType;
        const WIDTH: usize;

        fn to_wire(self) -> [u8; 8];
        fn from_wire(bytes: &[u8]) -> Self;

        /// # Safety
        /// `p` must be valid, aligned for `Self` and observe the runtime's
        /// data-race discipline (all accesses through these atomics).
        unsafe fn native_load(p: *mut u8, order: Ordering) -> Self;
        /// # Safety
        /// See [`Self::native_load`].
        unsafe fn native_store(p: *mut u8, v: Self, order: Ordering);
        /// # Safety
        /// See [`Self::native_load`].
        unsafe fn native_cas(
            p: *mut u8,
            current: Self,
            new: Self,
            success: Ordering,
            failure: Ordering,
        ) -> Result<Self, Self>;
        /// # Safety
        /// See [`Self::native_load`].
        unsafe fn native_fetch_add(p: *mut u8, v: Self, order: Ordering) -> Self;
        /// # Safety
        /// See [`Self::native_load`].
        unsafe fn native_fetch_sub(p: *mut u8, v: Self, order: Ordering) -> Self;
    }
}

pub(crate) use sealed::NativeAtomic;

/// Integer types supported by atomic load/store over global pointers.
pub trait AtomicInt: sealed::NativeAtomic + Send + 'static {}

/// Integer types that additionally support CAS and the arithmetic atomics
/// (the 32- and 64-bit widths).
pub trait AtomicArith: AtomicInt {}

macro_rules! impl_native_atomic {
    ($($ty:ty => $atomic:ty, $tag:ident;)*) => {$(
        impl sealed::NativeAtomic for $ty {
            const DATA_TYPE: DataType = DataType::$tag;
            const WIDTH: usize = size_of::<$ty>();

            fn to_wire(self) -> [u8; 8] {
                let mut out = [0u8; 8];
                out[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
                out
            }

            fn from_wire(bytes: &[u8]) -> Self {
                <$ty>::from_le_bytes(bytes[..Self::WIDTH].try_into().unwrap())
            }

            unsafe fn native_load(p: *mut u8, order: Ordering) -> Self {
                // Safety: forwarded from the caller.
                unsafe { <$atomic>::from_ptr(p.cast()) }.load(load_order(order))
            }

            unsafe fn native_store(p: *mut u8, v: Self, order: Ordering) {
                // Safety: forwarded from the caller.
                unsafe { <$atomic>::from_ptr(p.cast()) }.store(v, store_order(order));
            }

            unsafe fn native_cas(
                p: *mut u8,
                current: Self,
                new: Self,
                success: Ordering,
                failure: Ordering,
            ) -> Result<Self, Self> {
                // Safety: forwarded from the caller.
                unsafe { <$atomic>::from_ptr(p.cast()) }
                    .compare_exchange(current, new, success, load_order(failure))
            }

            unsafe fn native_fetch_add(p: *mut u8, v: Self, order: Ordering) -> Self {
                // Safety: forwarded from the caller.
                unsafe { <$atomic>::from_ptr(p.cast()) }.fetch_add(v, order)
            }

            unsafe fn native_fetch_sub(p: *mut u8, v: Self, order: Ordering) -> Self {
                // Safety: forwarded from the caller.
                unsafe { <$atomic>::from_ptr(p.cast()) }.fetch_sub(v, order)
            }
        }

        impl AtomicInt for $ty {}
    )*};
}

impl_native_atomic! {
    i8 => AtomicI8, I8;
    u8 => AtomicU8, U8;
    i16 => AtomicI16, I16;
    u16 => AtomicU16, U16;
    i32 => AtomicI32, I32;
    u32 => AtomicU32, U32;
    i64 => AtomicI64, I64;
    u64 => AtomicU64, U64;
}

impl AtomicArith for i32 {}
impl AtomicArith for u32 {}
impl AtomicArith for i64 {}
impl AtomicArith for u64 {}

/// Clamps an order to the set that is legal for a plain load.
fn load_order(order: Ordering) -> Ordering {
    match order {
        Ordering::Release => Ordering::Relaxed,
        Ordering::AcqRel => Ordering::Acquire,
        other => other,
    }
}

/// Clamps an order to the set that is legal for a plain store.
fn store_order(order: Ordering) -> Ordering {
    match order {
        Ordering::Acquire => Ordering::Relaxed,
        Ordering::AcqRel => Ordering::Release,
        other => other,
    }
}

/// Release-side fence emitted before a remote operation, consistent with
/// the request's order.
pub(crate) fn pre_op_fence(order: Ordering) {
    match order {
        Ordering::Release | Ordering::AcqRel => fence(Ordering::Release),
        Ordering::SeqCst => fence(Ordering::SeqCst),
        _ => {}
    }
}

/// Acquire-side fence emitted after the reply handle becomes ready,
/// consistent with the request's order.
pub(crate) fn post_op_fence(order: Ordering) {
    match order {
        Ordering::Acquire | Ordering::AcqRel => fence(Ordering::Acquire),
        Ordering::SeqCst => fence(Ordering::SeqCst),
        _ => {}
    }
}

fn local_native_addr<T: AtomicInt>(pxn: &Pxn, ptr: GlobalPtr<T>) -> *mut u8 {
    match pxn.native_addr(ptr.address()) {
        Ok(p) => p,
        Err(err) => crate::fatal!("cannot resolve global address {}: {err}", ptr.address()),
    }
}

/// Atomically loads the value behind `ptr` with `order`.
pub fn atomic_load<T: AtomicInt>(ptr: GlobalPtr<T>, order: Ordering) -> T {
    let current = hart::current();
    let node = ptr.address().node();
    if node == current.pxn.node {
        let p = local_native_addr(&current.pxn, ptr);
        // Safety: resolved local address of a T-typed global cell.
        let value = unsafe { T::native_load(p, order) };
        hart_yield();
        value
    } else {
        if order == Ordering::SeqCst {
            fence(Ordering::SeqCst);
        }
        let handle = match current.pxn.endpoint.atomic_load(node, ptr.address(), T::DATA_TYPE) {
            Ok(handle) => handle,
            Err(err) => crate::fatal!("remote operation error: {err}"),
        };
        wait_until(|| handle.ready());
        post_op_fence(order);
        handle.value::<T>()
    }
}

/// Atomically stores `value` behind `ptr` with `order`.
pub fn atomic_store<T: AtomicInt>(ptr: GlobalPtr<T>, value: T, order: Ordering) {
    let current = hart::current();
    let node = ptr.address().node();
    if node == current.pxn.node {
        let p = local_native_addr(&current.pxn, ptr);
        // Safety: resolved local address of a T-typed global cell.
        unsafe { T::native_store(p, value, order) };
        hart_yield();
    } else {
        pre_op_fence(order);
        let handle = match current.pxn.endpoint.atomic_store(
            node,
            ptr.address(),
            T::DATA_TYPE,
            &value.to_wire()[..T::WIDTH],
        ) {
            Ok(handle) => handle,
            Err(err) => crate::fatal!("remote operation error: {err}"),
        };
        wait_until(|| handle.ready());
        if order == Ordering::SeqCst {
            fence(Ordering::SeqCst);
        }
    }
}

/// Atomic compare-exchange: succeeds iff the cell holds `expected`, in
/// which case it is replaced by `desired`. Returns the observed value,
/// `Ok` on success and `Err` on failure (the cell is then unchanged).
///
/// Non-weak: the responder uses a strong compare-exchange and the
/// initiator compares the observed value.
pub fn atomic_compare_exchange<T: AtomicArith>(
    ptr: GlobalPtr<T>,
    expected: T,
    desired: T,
    success: Ordering,
    failure: Ordering,
) -> Result<T, T>
where
    T: PartialEq,
{
    let current = hart::current();
    let node = ptr.address().node();
    if node == current.pxn.node {
        let p = local_native_addr(&current.pxn, ptr);
        // Safety: resolved local address of a T-typed global cell.
        let result = unsafe { T::native_cas(p, expected, desired, success, failure) };
        hart_yield();
        result
    } else {
        pre_op_fence(success);
        let handle = match current.pxn.endpoint.atomic_compare_exchange(
            node,
            ptr.address(),
            T::DATA_TYPE,
            &expected.to_wire()[..T::WIDTH],
            &desired.to_wire()[..T::WIDTH],
        ) {
            Ok(handle) => handle,
            Err(err) => crate::fatal!("remote operation error: {err}"),
        };
        wait_until(|| handle.ready());
        let observed = handle.value::<T>();
        if observed == expected {
            post_op_fence(success);
            Ok(observed)
        } else {
            post_op_fence(failure);
            Err(observed)
        }
    }
}

/// Atomically adds `value` to the cell, discarding the previous value.
pub fn atomic_increment<T: AtomicArith>(ptr: GlobalPtr<T>, value: T, order: Ordering) {
    let current = hart::current();
    let node = ptr.address().node();
    if node == current.pxn.node {
        let p = local_native_addr(&current.pxn, ptr);
        // Safety: resolved local address of a T-typed global cell.
        unsafe { T::native_fetch_add(p, value, order) };
        hart_yield();
    } else {
        pre_op_fence(order);
        let handle = match current.pxn.endpoint.atomic_increment(
            node,
            ptr.address(),
            T::DATA_TYPE,
            &value.to_wire()[..T::WIDTH],
        ) {
            Ok(handle) => handle,
            Err(err) => crate::fatal!("remote operation error: {err}"),
        };
        wait_until(|| handle.ready());
        post_op_fence(order);
    }
}

/// Atomically subtracts `value` from the cell, discarding the previous
/// value.
pub fn atomic_decrement<T: AtomicArith>(ptr: GlobalPtr<T>, value: T, order: Ordering) {
    let current = hart::current();
    let node = ptr.address().node();
    if node == current.pxn.node {
        let p = local_native_addr(&current.pxn, ptr);
        // Safety: resolved local address of a T-typed global cell.
        unsafe { T::native_fetch_sub(p, value, order) };
        hart_yield();
    } else {
        pre_op_fence(order);
        let handle = match current.pxn.endpoint.atomic_decrement(
            node,
            ptr.address(),
            T::DATA_TYPE,
            &value.to_wire()[..T::WIDTH],
        ) {
            Ok(handle) => handle,
            Err(err) => crate::fatal!("remote operation error: {err}"),
        };
        wait_until(|| handle.ready());
        post_op_fence(order);
    }
}

/// Atomically adds `value` to the cell and returns the previous value.
pub fn atomic_fetch_add<T: AtomicArith>(ptr: GlobalPtr<T>, value: T, order: Ordering) -> T {
    let current = hart::current();
    let node = ptr.address().node();
    if node == current.pxn.node {
        let p = local_native_addr(&current.pxn, ptr);
        // Safety: resolved local address of a T-typed global cell.
        let previous = unsafe { T::native_fetch_add(p, value, order) };
        hart_yield();
        previous
    } else {
        pre_op_fence(order);
        let handle = match current.pxn.endpoint.atomic_fetch_add(
            node,
            ptr.address(),
            T::DATA_TYPE,
            &value.to_wire()[..T::WIDTH],
        ) {
            Ok(handle) => handle,
            Err(err) => crate::fatal!("remote operation error: {err}"),
        };
        wait_until(|| handle.ready());
        post_op_fence(order);
        handle.value::<T>()
    }
}

/// Atomically subtracts `value` from the cell and returns the previous
/// value.
pub fn atomic_fetch_sub<T: AtomicArith>(ptr: GlobalPtr<T>, value: T, order: Ordering) -> T {
    let current = hart::current();
    let node = ptr.address().node();
    if node == current.pxn.node {
        let p = local_native_addr(&current.pxn, ptr);
        // Safety: resolved local address of a T-typed global cell.
        let previous = unsafe { T::native_fetch_sub(p, value, order) };
        hart_yield();
        previous
    } else {
        pre_op_fence(order);
        let handle = match current.pxn.endpoint.atomic_fetch_sub(
            node,
            ptr.address(),
            T::DATA_TYPE,
            &value.to_wire()[..T::WIDTH],
        ) {
            Ok(handle) => handle,
            Err(err) => crate::fatal!("remote operation error: {err}"),
        };
        wait_until(|| handle.ready());
        post_op_fence(order);
        handle.value::<T>()
    }
}

/// Emits a thread fence with `order` (relaxed is a no-op).
pub fn atomic_thread_fence(order: Ordering) {
    if order != Ordering::Relaxed {
        fence(order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_round_trips_on_the_wire() {
        for dt in [
            DataType::I8,
            DataType::U8,
            DataType::I16,
            DataType::U16,
            DataType::I32,
            DataType::U32,
            DataType::I64,
            DataType::U64,
        ] {
            assert_eq!(DataType::from_wire(dt as i64).unwrap(), dt);
        }
        assert_eq!(DataType::from_wire(99), Err(Error::InvalidValue));
    }

    #[test]
    fn wire_encoding_round_trips_values() {
        assert_eq!(i8::from_wire(&(-7i8).to_wire()), -7);
        assert_eq!(u16::from_wire(&0xBEEFu16.to_wire()), 0xBEEF);
        assert_eq!(i64::from_wire(&i64::MIN.to_wire()), i64::MIN);
        assert_eq!(u64::from_wire(&u64::MAX.to_wire()), u64::MAX);
    }

    #[test]
    fn native_ops_honor_cas_semantics() {
        let mut cell = 5i64;
        let p = (&raw mut cell).cast::<u8>();
        // Safety: p is a valid aligned i64.
        unsafe {
            assert_eq!(
                i64::native_cas(p, 5, 9, Ordering::SeqCst, Ordering::SeqCst),
                Ok(5)
            );
            assert_eq!(
                i64::native_cas(p, 5, 1, Ordering::SeqCst, Ordering::SeqCst),
                Err(9)
            );
            assert_eq!(i64::native_load(p, Ordering::SeqCst), 9);
            assert_eq!(i64::native_fetch_add(p, 1, Ordering::SeqCst), 9);
            assert_eq!(i64::native_fetch_sub(p, 3, Ordering::SeqCst), 10);
            assert_eq!(i64::native_load(p, Ordering::SeqCst), 7);
        }
    }

    #[test]
    fn store_and_load_orders_are_clamped() {
        let mut cell = 0u32;
        let p = (&raw mut cell).cast::<u8>();
        // Safety: p is a valid aligned u32; Release load / Acquire store
        // must not panic thanks to the clamps.
        unsafe {
            u32::native_store(p, 3, Ordering::Acquire);
            assert_eq!(u32::native_load(p, Ordering::Release), 3);
        }
    }
}
