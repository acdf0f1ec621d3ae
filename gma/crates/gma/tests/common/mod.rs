//! Test Utilities for the GMA Integration Suite
//!
//! Fixtures build a block vector over a [`SimulatedDevice`] so tests can check
//! the device-side view (live heaps, placed resources) next to the allocator's
//! own bookkeeping.
//!
//! ============================================================================
//! The assertion helpers are strict: any overlap, misalignment or lost byte
//! is a bug, never a tolerance.
//! ============================================================================

#![allow(dead_code)]

use gma::{
    Allocation, AllocationDesc, AllocationId, BlockMetadata, BlockVector, BlockVectorConfig,
    BudgetTracker, MetadataAlgorithm, SimulatedDevice, Statistics,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Block size used by most fixtures
pub const BLOCK_SIZE: u64 = 64 * 1024;

/// Seed for the randomized workloads, fixed so failures reproduce
pub const RANDOM_SEED: u64 = 0x6D61_6C6C_6F63;

/// ============================================================================
/// VECTOR FIXTURE
/// ============================================================================

/// Block vector plus handles to its device and budget
pub struct VectorFixture {
    pub vector: BlockVector,
    pub device: Arc<SimulatedDevice>,
    pub budget: Arc<BudgetTracker>,
}

impl VectorFixture {
    /// Fixed-size blocks of [`BLOCK_SIZE`] with the given algorithm
    ///
    /// **Bug this finds:** Config validation rejecting a valid layout
    pub fn new(algorithm: MetadataAlgorithm) -> Self {
        Self::with_config(BlockVectorConfig {
            preferred_block_size: BLOCK_SIZE,
            explicit_block_size: true,
            algorithm,
            ..Default::default()
        })
    }

    /// Fixture with an unlimited budget and a custom config
    pub fn with_config(config: BlockVectorConfig) -> Self {
        Self::with_budget(config, BudgetTracker::unlimited())
    }

    /// Fixture with a caller-provided budget tracker
    ///
    /// **Bug this finds:** Growth that ignores the budget
    pub fn with_budget(config: BlockVectorConfig, budget: BudgetTracker) -> Self {
        let device = Arc::new(SimulatedDevice::new());
        let budget = Arc::new(budget);
        let vector = BlockVector::new(config, device.clone(), budget.clone())
            .expect("block vector creation should succeed with a valid config");
        Self {
            vector,
            device,
            budget,
        }
    }

    /// Allocate one region and return its id
    ///
    /// **Bug this finds:** Spurious out-of-memory on a request that fits
    pub fn allocate(&self, size: u64, alignment: u64) -> AllocationId {
        self.vector
            .allocate(size, alignment, &AllocationDesc::default(), 1)
            .unwrap_or_else(|e| panic!("allocation of {} bytes failed: {}", size, e))[0]
    }

    pub fn allocate_many(&self, count: usize, size: u64) -> Vec<AllocationId> {
        (0..count).map(|_| self.allocate(size, 1)).collect()
    }

    pub fn info(&self, id: AllocationId) -> Allocation {
        self.vector
            .allocation_info(id)
            .unwrap_or_else(|| panic!("allocation {} should be live", id))
    }

    pub fn infos(&self, ids: &[AllocationId]) -> Vec<Allocation> {
        ids.iter().map(|&id| self.info(id)).collect()
    }

    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics::default();
        self.vector.add_statistics(&mut stats);
        stats
    }

    /// Free every id, failing the test on the first error
    pub fn free_all(&self, ids: impl IntoIterator<Item = AllocationId>) {
        for id in ids {
            self.vector
                .free(id)
                .unwrap_or_else(|e| panic!("free of {} failed: {}", id, e));
        }
    }
}

/// ============================================================================
/// STRICT ASSERTION HELPERS
/// ============================================================================

/// Assert that no two allocations in the same block overlap
///
/// **Bug this finds:** Free-list corruption handing out a range twice
/// **Tolerance:** ZERO - any shared byte is memory corruption
#[track_caller]
pub fn assert_no_overlap(allocations: &[Allocation], context: &str) {
    let mut by_block: BTreeMap<_, Vec<&Allocation>> = BTreeMap::new();
    for allocation in allocations {
        by_block.entry(allocation.block_id).or_default().push(allocation);
    }

    for (block, mut ranges) in by_block {
        ranges.sort_by_key(|a| a.offset);
        for pair in ranges.windows(2) {
            assert!(
                pair[0].offset + pair[0].size <= pair[1].offset,
                "{}: allocations {} [{}, {}) and {} [{}, {}) overlap in block {:?}",
                context,
                pair[0].id,
                pair[0].offset,
                pair[0].offset + pair[0].size,
                pair[1].id,
                pair[1].offset,
                pair[1].offset + pair[1].size,
                block
            );
        }
    }
}

/// Assert that every allocation honors `alignment`
///
/// **Bug this finds:** Offset rounding done before adding the margin
#[track_caller]
pub fn assert_aligned(allocations: &[Allocation], alignment: u64, context: &str) {
    for allocation in allocations {
        assert_eq!(
            allocation.offset % alignment,
            0,
            "{}: allocation {} at offset {} is not {}-byte aligned",
            context,
            allocation.id,
            allocation.offset,
            alignment
        );
    }
}

/// Assert that the regions of a block tile it exactly and the free bytes add up
///
/// **Bug this finds:** Lost or double-counted bytes after split/merge
/// **Tolerance:** ZERO - `sum(sizes) == block size` must always hold
#[track_caller]
pub fn assert_conservation(metadata: &BlockMetadata, context: &str) {
    let mut regions = Vec::new();
    metadata.for_each_suballocation(|s| regions.push(s));
    regions.sort_by_key(|s| s.offset);

    let mut cursor = 0;
    let mut free = 0;
    for region in &regions {
        assert_eq!(
            region.offset, cursor,
            "{}: region at {} leaves a gap or overlap after offset {}",
            context, region.offset, cursor
        );
        cursor = region.end();
        if region.is_free() {
            free += region.size;
        }
    }

    assert_eq!(
        cursor,
        metadata.size(),
        "{}: regions cover {} of {} bytes",
        context,
        cursor,
        metadata.size()
    );
    assert_eq!(
        free,
        metadata.sum_free_size(),
        "{}: free regions hold {} bytes but sum_free_size reports {}",
        context,
        free,
        metadata.sum_free_size()
    );
    assert!(metadata.validate(), "{}: metadata failed validation", context);
}

/// Assert that the vector and its device agree on how many heaps exist
///
/// **Bug this finds:** Heaps leaked by a block that was never dropped
#[track_caller]
pub fn assert_heaps_match_blocks(fixture: &VectorFixture, context: &str) {
    assert_eq!(
        fixture.device.live_heaps(),
        fixture.vector.block_count(),
        "{}: device holds {} heaps for {} blocks",
        context,
        fixture.device.live_heaps(),
        fixture.vector.block_count()
    );
}
