// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Composition of the per-tier dynamic allocator.
//!
//! Each tier resource is slab buckets for fixed sizes, a free list tracking
//! ranges reclaimed from the bump region, and a bump allocator for the
//! remainder. Bucket extents are computed by walking the tier's dynamic
//! region from its start in declared order, honoring natural alignment at
//! each step; the free list's metadata bucket and the bump region consume
//! the tail.

use arrayvec::ArrayVec;
use spin::Mutex;

use crate::addr::{GlobalAddress, MemoryKind};
use crate::error::{Error, Result};
use crate::mem::bump::BumpResource;
use crate::mem::free_list::{DEFAULT_CAPACITY, FreeListResource};
use crate::mem::slab::SlabResource;
use crate::mem::specific::MAX_ALIGN;
use crate::place::{NodeIndex, PodIndex};
use crate::util::align_up;

/// Allocations routed to the bump region are rounded up to this granule.
pub(crate) const MIN_BUMP_ALLOCATION: usize = 32;

/// A slab bucket declaration: block size and share of the dynamic region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BucketSpec {
    pub slab: usize,
    pub ratio: f64,
}

/// L2SP slab buckets.
pub(crate) const L2SP_BUCKETS: &[BucketSpec] = &[
    BucketSpec { slab: 8, ratio: 0.2 },
    BucketSpec { slab: 16, ratio: 0.3 },
    BucketSpec { slab: 32, ratio: 0.4 },
];

/// Main-memory slab buckets.
pub(crate) const MAIN_BUCKETS: &[BucketSpec] = &[
    BucketSpec { slab: 8, ratio: 0.006 },
    BucketSpec { slab: 16, ratio: 0.006 },
    BucketSpec { slab: 32, ratio: 0.006 },
    BucketSpec { slab: 64, ratio: 0.063 },
    BucketSpec { slab: 128, ratio: 0.031 },
];

/// A contiguous byte region assigned to one sub-allocator of a tier.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MemoryBucket {
    pub ratio: f64,
    pub bytes: usize,
    pub start: usize,
}

/// The per-tier allocator: slab buckets + free list + bump.
#[derive(Debug)]
pub(crate) struct TierResource {
    kind: MemoryKind,
    node: NodeIndex,
    pod: PodIndex,
    region_len: usize,
    slabs: ArrayVec<SlabResource, 5>,
    free_list: FreeListResource,
    free_list_bucket: MemoryBucket,
    bump: BumpResource,
    /// Serializes the allocate fall-through chain so a concurrent burst
    /// cannot interleave bump and free-list decisions.
    chain: Mutex<()>,
}

impl TierResource {
    /// Lays the buckets out over `[region_start, region_start + region_len)`
    /// of the tier and builds the allocator stack.
    pub(crate) fn new(
        kind: MemoryKind,
        node: NodeIndex,
        pod: PodIndex,
        region_start: usize,
        region_len: usize,
        specs: &[BucketSpec],
    ) -> Result<Self> {
        let region_end = region_start + region_len;
        let mut slabs = ArrayVec::new();
        let mut cursor = region_start;

        for spec in specs {
            #[expect(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                clippy::cast_precision_loss,
                reason = "ratios are small positive fractions of an in-range length"
            )]
            let share = (spec.ratio * region_len as f64) as usize;
            let bytes = (share / spec.slab) * spec.slab;
            let start = align_up(cursor, spec.slab);
            if start + bytes > region_end {
                tracing::error!(
                    kind = %kind,
                    slab = spec.slab,
                    "memory resource buckets breakdown is misconfigured"
                );
                return Err(Error::MemoryError);
            }
            slabs.push(SlabResource::new(start, bytes, spec.slab));
            cursor = start + bytes;
        }

        let metadata_bytes = FreeListResource::metadata_size(DEFAULT_CAPACITY);
        let free_list_start = align_up(cursor, MAX_ALIGN);
        cursor = free_list_start + metadata_bytes;

        let bump_start = align_up(cursor, MAX_ALIGN);
        if bump_start + MIN_BUMP_ALLOCATION > region_end {
            tracing::error!(kind = %kind, "no space left for the bump region");
            return Err(Error::MemoryError);
        }
        let bump_bytes = region_end - bump_start;

        #[expect(clippy::cast_precision_loss, reason = "reporting ratio only")]
        let free_list_bucket = MemoryBucket {
            ratio: metadata_bytes as f64 / region_len as f64,
            bytes: metadata_bytes,
            start: free_list_start,
        };

        Ok(Self {
            kind,
            node,
            pod,
            region_len,
            slabs,
            free_list: FreeListResource::new(DEFAULT_CAPACITY),
            free_list_bucket,
            bump: BumpResource::new(bump_start, bump_bytes),
            chain: Mutex::new(()),
        })
    }

    pub(crate) fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Allocates `bytes` at `align`, returning a global address or `None`.
    ///
    /// Requests that fit a slab start at the smallest fitting bucket and
    /// fall through to the larger ones; anything that still failed (or was
    /// too large for every slab) goes to the bump allocator and then to the
    /// free list.
    pub(crate) fn allocate(&self, bytes: usize, align: usize) -> Option<GlobalAddress> {
        if bytes == 0 {
            return None;
        }
        let _chain = self.chain.lock();

        let first = self.slabs.iter().position(|s| bytes <= s.slab_size());
        if let Some(first) = first {
            for slab in &self.slabs[first..] {
                if let Some(offset) = slab.allocate(bytes, align) {
                    return Some(self.encode(offset));
                }
            }
        }

        let rounded = bytes.max(MIN_BUMP_ALLOCATION);
        if let Some(offset) = self.bump.allocate(rounded, align) {
            return Some(self.encode(offset));
        }
        self.free_list
            .allocate(rounded, align.max(MAX_ALIGN))
            .map(|offset| self.encode(offset))
    }

    /// Returns an allocation. Slab-owned offsets go back to their bucket;
    /// bump-owned ranges are registered with the free list.
    pub(crate) fn deallocate(&self, addr: GlobalAddress, bytes: usize, _align: usize) {
        let Ok(offset) = addr.offset() else {
            return;
        };
        let _chain = self.chain.lock();

        if let Some(first) = self.slabs.iter().position(|s| bytes <= s.slab_size()) {
            for slab in &self.slabs[first..] {
                if slab.owns(offset) {
                    slab.deallocate(offset);
                    return;
                }
            }
        }

        if self.bump.owns(offset) {
            self.free_list
                .register_freed_block(offset, bytes.max(MIN_BUMP_ALLOCATION));
        }
    }

    /// Whether `offset` lies within the bump region (used by tests and the
    /// reuse path).
    pub(crate) fn bump_owns(&self, offset: usize) -> bool {
        self.bump.owns(offset)
    }

    /// The bucket layout of this tier, slabs first, then the free-list
    /// metadata bucket, then the bump region.
    pub(crate) fn buckets(&self) -> Vec<MemoryBucket> {
        let mut out = Vec::with_capacity(self.slabs.len() + 2);
        for (slab, spec) in self.slabs.iter().zip(self.bucket_specs()) {
            out.push(MemoryBucket {
                ratio: spec.ratio,
                bytes: slab.bytes(),
                start: slab.start(),
            });
        }
        out.push(self.free_list_bucket);
        #[expect(clippy::cast_precision_loss, reason = "reporting ratio only")]
        out.push(MemoryBucket {
            ratio: self.bump.bytes() as f64 / self.region_len as f64,
            bytes: self.bump.bytes(),
            start: self.bump.start(),
        });
        out
    }

    fn bucket_specs(&self) -> &'static [BucketSpec] {
        match self.kind {
            MemoryKind::L2Sp => L2SP_BUCKETS,
            _ => MAIN_BUCKETS,
        }
    }

    fn encode(&self, offset: usize) -> GlobalAddress {
        match self.kind {
            MemoryKind::L2Sp => GlobalAddress::encode_l2sp(self.node, self.pod, offset),
            MemoryKind::Main => GlobalAddress::encode_main(self.node, offset),
            _ => unreachable!("resources exist only for L2SP and main memory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l2sp_resource(len: usize) -> TierResource {
        TierResource::new(
            MemoryKind::L2Sp,
            NodeIndex(0),
            PodIndex::new(0, 0),
            0,
            len,
            L2SP_BUCKETS,
        )
        .unwrap()
    }

    #[test]
    fn buckets_are_disjoint_and_cover_the_tail() {
        let resource = l2sp_resource(1 << 20);
        let buckets = resource.buckets();
        for pair in buckets.windows(2) {
            assert!(
                pair[0].start + pair[0].bytes <= pair[1].start,
                "buckets overlap: {pair:?}"
            );
        }
        let last = buckets.last().unwrap();
        assert_eq!(last.start + last.bytes, 1 << 20);
    }

    #[test]
    fn exact_slab_size_comes_from_the_matching_bucket() {
        let resource = l2sp_resource(1 << 20);
        let buckets = resource.buckets();
        for (i, spec) in L2SP_BUCKETS.iter().enumerate() {
            let addr = resource.allocate(spec.slab, 8).unwrap();
            let offset = addr.offset().unwrap();
            assert!(
                offset >= buckets[i].start && offset < buckets[i].start + buckets[i].bytes,
                "allocation of {} bytes landed outside bucket {i}",
                spec.slab
            );
        }
    }

    #[test]
    fn one_byte_above_the_largest_slab_skips_slabs() {
        let resource = l2sp_resource(1 << 20);
        let largest = L2SP_BUCKETS.last().unwrap().slab;
        let addr = resource.allocate(largest + 1, 8).unwrap();
        assert!(resource.bump_owns(addr.offset().unwrap()));
    }

    #[test]
    fn slab_exhaustion_falls_through_to_larger_buckets() {
        let resource = l2sp_resource(1 << 20);
        let bucket0 = resource.buckets()[0];
        let bucket0_end = bucket0.start + bucket0.bytes;
        // drain the 8-byte bucket entirely, then one more
        let slots = bucket0.bytes / 8;
        let mut last = 0;
        for _ in 0..=slots {
            last = resource.allocate(8, 8).unwrap().offset().unwrap();
        }
        // the final allocation spilled into the next larger bucket
        assert!(last >= bucket0_end);
    }

    #[test]
    fn freed_bump_ranges_are_reused_through_the_free_list() {
        let resource = l2sp_resource(1 << 20);
        let big = 1 << 12;
        let addr = resource.allocate(big, 16).unwrap();
        let offset = addr.offset().unwrap();
        assert!(resource.bump_owns(offset));
        resource.deallocate(addr, big, 16);
        // either the same range comes back (free-list hit) or the bump
        // region still has room; both must produce a non-null pointer
        let again = resource.allocate(big, 16).unwrap();
        assert!(resource.bump_owns(again.offset().unwrap()));
    }

    #[test]
    fn allocations_are_aligned_and_in_range() {
        let resource = l2sp_resource(1 << 20);
        for (bytes, align) in [(1usize, 1usize), (7, 4), (8, 8), (24, 8), (100, 16), (4096, 16)] {
            let addr = resource.allocate(bytes, align).unwrap();
            let offset = addr.offset().unwrap();
            assert_eq!(offset % align, 0, "{bytes}/{align} misaligned");
            assert!(offset + bytes <= 1 << 20);
        }
    }

    #[test]
    fn misconfigured_region_is_reported() {
        // far too small for the declared buckets plus the free list
        let err = TierResource::new(
            MemoryKind::L2Sp,
            NodeIndex(0),
            PodIndex::new(0, 0),
            0,
            1 << 10,
            L2SP_BUCKETS,
        )
        .unwrap_err();
        assert_eq!(err, Error::MemoryError);
    }
}
