// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Global address encoding.
//!
//! A global address is a single 64-bit word encoding a memory tier, the
//! owning locality and an offset within that locality's memory:
//!
//! ```text
//! bits [58..64)  memory tier tag (all tiers)
//! bits [44..58)  node index      (all tiers)
//!
//! L1SP: [25..31) pod (x,y)  [19..25) core (x,y)  [18..19) global  [0..18) offset
//! L2SP: [25..31) pod (x,y)                                        [0..25) offset
//! Main:                                                           [0..44) offset
//! ```
//!
//! The node bit range is identical across tiers and the pod bit range is
//! identical for L1SP and L2SP, so those extractors do not need to know the
//! tier first. Everything else decodes tier-first.

use core::fmt;

use crate::error::{Error, Result};
use crate::place::{ANY_CORE, ANY_POD, CoreIndex, NodeIndex, Place, PodIndex};

/// Width of the node index field, shared by all tiers.
pub const NODE_BITS: u32 = 14;
/// Width of one pod grid coordinate.
pub const POD_COORD_BITS: u32 = 3;
/// Width of one core grid coordinate.
pub const CORE_COORD_BITS: u32 = 3;
/// Width of the L1SP offset field.
pub const L1SP_OFFSET_BITS: u32 = 18;
/// Width of the L2SP offset field.
pub const L2SP_OFFSET_BITS: u32 = 25;
/// Width of the main-memory offset field.
pub const MAIN_OFFSET_BITS: u32 = 44;
/// Width of the memory tier tag.
pub const KIND_BITS: u32 = 6;

// The three layouts must place the node field at the same bits, and L1SP and
// L2SP must place the pod field at the same bits.
static_assertions::const_assert_eq!(
    L1SP_OFFSET_BITS + 1 + 2 * CORE_COORD_BITS + 2 * POD_COORD_BITS + 13,
    44
);
static_assertions::const_assert_eq!(L2SP_OFFSET_BITS + 2 * POD_COORD_BITS + 13, 44);
static_assertions::const_assert_eq!(MAIN_OFFSET_BITS, 44);
static_assertions::const_assert_eq!(44 + NODE_BITS + KIND_BITS, 64);

mycelium_bitfield::bitfield! {
    /// L1SP address layout.
    struct L1spLayout<u64> {
        const OFFSET = 18;
        const GLOBAL: bool;
        const CORE_X = 3;
        const CORE_Y = 3;
        const POD_X = 3;
        const POD_Y = 3;
        const _RESERVED = 13;
        const NODE = 14;
        const KIND = 6;
    }
}

mycelium_bitfield::bitfield! {
    /// L2SP address layout.
    struct L2spLayout<u64> {
        const OFFSET = 25;
        const POD_X = 3;
        const POD_Y = 3;
        const _RESERVED = 13;
        const NODE = 14;
        const KIND = 6;
    }
}

mycelium_bitfield::bitfield! {
    /// Main-memory address layout.
    struct MainLayout<u64> {
        const OFFSET = 44;
        const NODE = 14;
        const KIND = 6;
    }
}

/// The memory tier a global address references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryKind {
    /// Not a known memory (the null address decodes to this).
    Unknown = 0,
    /// Per-hart L1 scratchpad.
    L1Sp = 1,
    /// Per-pod L2 scratchpad.
    L2Sp = 2,
    /// Per-PXN main memory.
    Main = 3,
}

impl MemoryKind {
    fn from_tag(tag: u64) -> Result<Self> {
        match tag {
            0 => Ok(MemoryKind::Unknown),
            1 => Ok(MemoryKind::L1Sp),
            2 => Ok(MemoryKind::L2Sp),
            3 => Ok(MemoryKind::Main),
            _ => Err(Error::InvalidAddress),
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemoryKind::Unknown => "unknown",
            MemoryKind::L1Sp => "l1sp",
            MemoryKind::L2Sp => "l2sp",
            MemoryKind::Main => "main",
        };
        f.write_str(s)
    }
}

/// A 64-bit handle into the global address space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GlobalAddress(u64);

impl GlobalAddress {
    /// The null address. Decodes to [`MemoryKind::Unknown`].
    pub const NULL: GlobalAddress = GlobalAddress(0);

    /// Reconstitutes an address from its raw bits.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bits of the address.
    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Encodes an L1SP address from its locality tuple and offset.
    pub fn encode_l1sp(
        node: NodeIndex,
        pod: PodIndex,
        core: CoreIndex,
        offset: usize,
    ) -> GlobalAddress {
        debug_assert!(node.0 >= 0 && !pod.is_any() && !core.is_any());
        let bits = L1spLayout::new()
            .with(L1spLayout::KIND, MemoryKind::L1Sp as u64)
            .with(L1spLayout::NODE, unsigned(i64::from(node.0)))
            .with(L1spLayout::POD_X, unsigned(i64::from(pod.x)))
            .with(L1spLayout::POD_Y, unsigned(i64::from(pod.y)))
            .with(L1spLayout::CORE_X, unsigned(i64::from(core.x)))
            .with(L1spLayout::CORE_Y, unsigned(i64::from(core.y)))
            .with(L1spLayout::GLOBAL, true)
            .with(L1spLayout::OFFSET, offset as u64)
            .0;
        GlobalAddress(bits)
    }

    /// Encodes an L2SP address from its locality tuple and offset.
    pub fn encode_l2sp(node: NodeIndex, pod: PodIndex, offset: usize) -> GlobalAddress {
        debug_assert!(node.0 >= 0 && !pod.is_any());
        let bits = L2spLayout::new()
            .with(L2spLayout::KIND, MemoryKind::L2Sp as u64)
            .with(L2spLayout::NODE, unsigned(i64::from(node.0)))
            .with(L2spLayout::POD_X, unsigned(i64::from(pod.x)))
            .with(L2spLayout::POD_Y, unsigned(i64::from(pod.y)))
            .with(L2spLayout::OFFSET, offset as u64)
            .0;
        GlobalAddress(bits)
    }

    /// Encodes a main-memory address from its node and offset.
    pub fn encode_main(node: NodeIndex, offset: usize) -> GlobalAddress {
        debug_assert!(node.0 >= 0);
        let bits = MainLayout::new()
            .with(MainLayout::KIND, MemoryKind::Main as u64)
            .with(MainLayout::NODE, unsigned(i64::from(node.0)))
            .with(MainLayout::OFFSET, offset as u64)
            .0;
        GlobalAddress(bits)
    }

    /// Extracts the memory tier of this address.
    ///
    /// The null address yields [`MemoryKind::Unknown`]; a tag matching no
    /// tier yields [`Error::InvalidAddress`].
    pub fn kind(self) -> Result<MemoryKind> {
        MemoryKind::from_tag(MainLayout::from_bits(self.0).get(MainLayout::KIND))
    }

    /// Extracts the node index. Valid for every tier.
    #[expect(clippy::cast_possible_truncation, reason = "node field is 14 bits")]
    pub fn node(self) -> NodeIndex {
        NodeIndex(MainLayout::from_bits(self.0).get(MainLayout::NODE) as i16)
    }

    /// Extracts the pod index. Only meaningful for L1SP and L2SP addresses.
    #[expect(clippy::cast_possible_truncation, reason = "pod coords are 3 bits")]
    pub fn pod(self) -> PodIndex {
        let v = L2spLayout::from_bits(self.0);
        PodIndex {
            x: v.get(L2spLayout::POD_X) as i8,
            y: v.get(L2spLayout::POD_Y) as i8,
        }
    }

    /// Extracts the core index. Only meaningful for L1SP addresses.
    #[expect(clippy::cast_possible_truncation, reason = "core coords are 3 bits")]
    pub fn core(self) -> CoreIndex {
        let v = L1spLayout::from_bits(self.0);
        CoreIndex {
            x: v.get(L1spLayout::CORE_X) as i8,
            y: v.get(L1spLayout::CORE_Y) as i8,
        }
    }

    /// Returns the L1SP "globally visible" flag. Only meaningful for L1SP
    /// addresses.
    pub fn l1sp_global(self) -> bool {
        L1spLayout::from_bits(self.0).get(L1spLayout::GLOBAL)
    }

    /// Extracts the tier-relative byte offset.
    #[expect(clippy::cast_possible_truncation, reason = "offsets are at most 44 bits")]
    pub fn offset(self) -> Result<usize> {
        let bits = match self.kind()? {
            MemoryKind::L1Sp => L1spLayout::from_bits(self.0).get(L1spLayout::OFFSET),
            MemoryKind::L2Sp => L2spLayout::from_bits(self.0).get(L2spLayout::OFFSET),
            MemoryKind::Main => MainLayout::from_bits(self.0).get(MainLayout::OFFSET),
            MemoryKind::Unknown => return Err(Error::InvalidAddress),
        };
        Ok(bits as usize)
    }

    /// Returns this address with its offset field replaced by `offset`.
    pub fn with_offset(self, offset: usize) -> Result<GlobalAddress> {
        let bits = match self.kind()? {
            MemoryKind::L1Sp => {
                L1spLayout::from_bits(self.0)
                    .with(L1spLayout::OFFSET, offset as u64)
                    .0
            }
            MemoryKind::L2Sp => {
                L2spLayout::from_bits(self.0)
                    .with(L2spLayout::OFFSET, offset as u64)
                    .0
            }
            MemoryKind::Main => {
                MainLayout::from_bits(self.0)
                    .with(MainLayout::OFFSET, offset as u64)
                    .0
            }
            MemoryKind::Unknown => return Err(Error::InvalidAddress),
        };
        Ok(GlobalAddress(bits))
    }
}

impl fmt::Debug for GlobalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalAddress({:#018x})", self.0)
    }
}

impl fmt::Display for GlobalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[expect(clippy::cast_sign_loss, reason = "asserted non-negative")]
fn unsigned(v: i64) -> u64 {
    debug_assert!(v >= 0);
    v as u64
}

/// Derives the locality of a global address as a [`Place`].
///
/// Fields that the address tier does not encode come back as wildcards: the
/// pod for main memory, the core for everything but L1SP.
pub fn locality_of(addr: GlobalAddress) -> Result<Place> {
    if addr.is_null() {
        return Ok(crate::place::ANY_PLACE);
    }
    let kind = addr.kind()?;
    let node = addr.node();
    let pod = if kind == MemoryKind::Main { ANY_POD } else { addr.pod() };
    let core = if kind == MemoryKind::L1Sp { addr.core() } else { ANY_CORE };
    Ok(Place::new(node, pod, core))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn null_is_unknown() {
        assert_eq!(GlobalAddress::NULL.kind().unwrap(), MemoryKind::Unknown);
        assert!(GlobalAddress::NULL.is_null());
    }

    #[test]
    fn bad_tag_is_invalid() {
        // tag 0b111111 matches no tier
        let addr = GlobalAddress::from_bits(0x3f << 58);
        assert_eq!(addr.kind(), Err(Error::InvalidAddress));
        assert_eq!(addr.offset(), Err(Error::InvalidAddress));
    }

    #[test]
    fn l1sp_encodes_global_bit() {
        let addr = GlobalAddress::encode_l1sp(
            NodeIndex(3),
            PodIndex::new(1, 2),
            CoreIndex::new(4, 5),
            0x1234,
        );
        assert!(addr.l1sp_global());
    }

    #[test]
    fn node_field_is_tier_independent() {
        let node = NodeIndex(1234);
        let l1 = GlobalAddress::encode_l1sp(node, PodIndex::new(0, 0), CoreIndex::new(0, 0), 0);
        let l2 = GlobalAddress::encode_l2sp(node, PodIndex::new(0, 0), 0);
        let main = GlobalAddress::encode_main(node, 0);
        assert_eq!(l1.node(), node);
        assert_eq!(l2.node(), node);
        assert_eq!(main.node(), node);
    }

    proptest! {
        #[test]
        fn l1sp_round_trip(
            node in 0i16..(1 << 13),
            pod_x in 0i8..8, pod_y in 0i8..8,
            core_x in 0i8..8, core_y in 0i8..8,
            offset in 0usize..(1 << 18),
        ) {
            let addr = GlobalAddress::encode_l1sp(
                NodeIndex(node),
                PodIndex::new(pod_x, pod_y),
                CoreIndex::new(core_x, core_y),
                offset,
            );
            prop_assert_eq!(addr.kind().unwrap(), MemoryKind::L1Sp);
            prop_assert_eq!(addr.node(), NodeIndex(node));
            prop_assert_eq!(addr.pod(), PodIndex::new(pod_x, pod_y));
            prop_assert_eq!(addr.core(), CoreIndex::new(core_x, core_y));
            prop_assert_eq!(addr.offset().unwrap(), offset);
        }

        #[test]
        fn l2sp_round_trip(
            node in 0i16..(1 << 13),
            pod_x in 0i8..8, pod_y in 0i8..8,
            offset in 0usize..(1 << 25),
        ) {
            let addr = GlobalAddress::encode_l2sp(
                NodeIndex(node),
                PodIndex::new(pod_x, pod_y),
                offset,
            );
            prop_assert_eq!(addr.kind().unwrap(), MemoryKind::L2Sp);
            prop_assert_eq!(addr.node(), NodeIndex(node));
            prop_assert_eq!(addr.pod(), PodIndex::new(pod_x, pod_y));
            prop_assert_eq!(addr.offset().unwrap(), offset);
        }

        #[test]
        fn main_round_trip(node in 0i16..(1 << 13), offset in 0usize..(1usize << 44)) {
            let addr = GlobalAddress::encode_main(NodeIndex(node), offset);
            prop_assert_eq!(addr.kind().unwrap(), MemoryKind::Main);
            prop_assert_eq!(addr.node(), NodeIndex(node));
            prop_assert_eq!(addr.offset().unwrap(), offset);
        }

        #[test]
        fn decoded_addresses_have_exactly_one_tier(bits in any::<u64>()) {
            // whatever the bits, kind() either fails or yields one tier
            let addr = GlobalAddress::from_bits(bits);
            if let Ok(kind) = addr.kind() {
                let all = [
                    MemoryKind::Unknown,
                    MemoryKind::L1Sp,
                    MemoryKind::L2Sp,
                    MemoryKind::Main,
                ];
                prop_assert_eq!(all.iter().filter(|k| **k == kind).count(), 1);
            }
        }

        #[test]
        fn offset_arithmetic_stays_within_tier(
            node in 0i16..(1 << 13),
            offset in 0usize..(1 << 20),
            delta in 0usize..(1 << 20),
        ) {
            let addr = GlobalAddress::encode_l2sp(NodeIndex(node), PodIndex::new(0, 0), offset);
            let moved = addr.with_offset(offset + delta).unwrap();
            prop_assert_eq!(moved.kind().unwrap(), MemoryKind::L2Sp);
            prop_assert_eq!(moved.node(), NodeIndex(node));
            prop_assert_eq!(moved.offset().unwrap(), offset + delta);
        }
    }

    #[test]
    fn locality_wildcards_follow_the_tier() {
        let node = NodeIndex(2);
        let main = GlobalAddress::encode_main(node, 64);
        let place = locality_of(main).unwrap();
        assert_eq!(place.node, node);
        assert!(place.pod.is_any());
        assert!(place.core.is_any());

        let l2 = GlobalAddress::encode_l2sp(node, PodIndex::new(0, 0), 64);
        let place = locality_of(l2).unwrap();
        assert_eq!(place.pod, PodIndex::new(0, 0));
        assert!(place.core.is_any());
    }
}
