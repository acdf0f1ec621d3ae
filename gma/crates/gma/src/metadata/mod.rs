//! Block Metadata - Suballocation Bookkeeping for One Block
//!
//! Every block owns exactly one metadata instance that records which byte
//! ranges of the block are handed out. Three algorithms are available, chosen
//! per block vector at construction:
//!
//! | Algorithm | Lookup | Free | Notes |
//! |-----------|--------|------|-------|
//! | Generic   | size-sorted free index, first fit | merge with neighbours | tracks a zero-initialized range |
//! | Linear    | end of stack / ring buffer | O(1) amortized | no defragmentation support |
//! | TLSF      | two-level bitmap, O(1) | merge with neighbours | four placement strategies |
//!
//! The algorithms are a closed set, so [`BlockMetadata`] is an enum and every
//! call is a `match`; there is no vtable on the allocate/free path.
//!
//! # Invariants (checked by `validate()`)
//!
//! - Suballocations are contiguous, non-overlapping, and their sizes sum to the
//!   block size.
//! - `sum_free_size()` equals the total size of free suballocations.
//! - Generic and TLSF never leave two free suballocations next to each other.
//!
//! # Failure model
//!
//! `create_allocation_request` returning `None` is the normal "does not fit"
//! answer. Freeing an unknown handle, freeing twice, or mixing the linear
//! ring-buffer and double-stack modes panics.

pub mod generic;
pub mod linear;
pub mod tlsf;
pub mod zero_init;

pub use generic::GenericMetadata;
pub use linear::LinearMetadata;
pub use tlsf::TlsfMetadata;
pub use zero_init::ZeroInitializedRange;

use crate::stats::{DetailedStatistics, Statistics};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU64;
use std::str::FromStr;

/// Suballocation algorithm of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataAlgorithm {
    Generic,
    Linear,
    Tlsf,
}

impl FromStr for MetadataAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generic" => Ok(MetadataAlgorithm::Generic),
            "linear" => Ok(MetadataAlgorithm::Linear),
            "tlsf" => Ok(MetadataAlgorithm::Tlsf),
            other => Err(format!("unknown metadata algorithm '{}'", other)),
        }
    }
}

/// Placement strategy for one request
///
/// Only the TLSF algorithm distinguishes them; Generic and Linear accept and
/// ignore the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AllocationStrategy {
    /// Check the next larger bucket first, then the tail, then the best-fit bucket
    #[default]
    Default,
    /// Fastest lookup: larger bucket first
    MinTime,
    /// Tightest packing: best-fit bucket first
    MinMemory,
    /// Lowest offset: scan free blocks in address order
    MinOffset,
}

/// Opaque per-algorithm token for one live suballocation
///
/// Generic and Linear encode `offset + 1`; TLSF encodes `node index + 1`.
/// Handles are never compared across algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocHandle(NonZeroU64);

impl AllocHandle {
    #[inline]
    pub(crate) fn from_offset(offset: u64) -> Self {
        match NonZeroU64::new(offset.wrapping_add(1)) {
            Some(raw) => AllocHandle(raw),
            None => panic!("offset {} cannot be encoded as a handle", offset),
        }
    }

    #[inline]
    pub(crate) fn to_offset(self) -> u64 {
        self.0.get() - 1
    }

    /// Raw value, for logging
    #[inline]
    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

/// Algorithm-specific part of an allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AlgorithmData {
    /// Offset of the free suballocation being split
    Generic { free_offset: u64 },
    /// Which end of which linear vector receives the allocation
    Linear(linear::LinearRequestKind),
    /// Arena node of the free block being taken
    Tlsf { node: tlsf::NodeId },
}

/// Result of a successful placement search
///
/// Produced by [`BlockMetadata::create_allocation_request`] and consumed
/// exactly once by [`BlockMetadata::alloc`] on the same metadata, with no
/// other mutation in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Handle the allocation will have once committed
    pub handle: AllocHandle,
    /// Aligned offset the allocation will start at
    pub offset: u64,
    /// Requested size (without debug margin)
    pub size: u64,
    /// Whether the bytes at `offset..offset + size` are known to be zero
    pub zero_initialized: bool,
    pub(crate) algorithm_data: AlgorithmData,
}

/// State of one suballocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuballocationState {
    Free,
    Allocated { user_data: u64 },
}

/// One (offset, size, state) record inside a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suballocation {
    pub offset: u64,
    pub size: u64,
    pub state: SuballocationState,
}

impl Suballocation {
    #[inline]
    pub fn is_free(&self) -> bool {
        matches!(self.state, SuballocationState::Free)
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    #[inline]
    pub fn user_data(&self) -> Option<u64> {
        match self.state {
            SuballocationState::Free => None,
            SuballocationState::Allocated { user_data } => Some(user_data),
        }
    }
}

/// Placement of a live suballocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    pub offset: u64,
    pub size: u64,
    pub user_data: u64,
}

/// Suballocation bookkeeping of one block
#[derive(Debug)]
pub enum BlockMetadata {
    Generic(GenericMetadata),
    Linear(LinearMetadata),
    Tlsf(TlsfMetadata),
}

macro_rules! dispatch {
    ($self:expr, $m:ident => $body:expr) => {
        match $self {
            BlockMetadata::Generic($m) => $body,
            BlockMetadata::Linear($m) => $body,
            BlockMetadata::Tlsf($m) => $body,
        }
    };
}

impl BlockMetadata {
    /// Empty metadata covering `size` bytes
    pub fn new(algorithm: MetadataAlgorithm, size: u64, debug_margin: u64) -> Self {
        assert!(size > 0, "block size must be > 0");
        match algorithm {
            MetadataAlgorithm::Generic => {
                BlockMetadata::Generic(GenericMetadata::new(size, debug_margin))
            }
            MetadataAlgorithm::Linear => {
                BlockMetadata::Linear(LinearMetadata::new(size, debug_margin))
            }
            MetadataAlgorithm::Tlsf => BlockMetadata::Tlsf(TlsfMetadata::new(size, debug_margin)),
        }
    }

    pub fn algorithm(&self) -> MetadataAlgorithm {
        match self {
            BlockMetadata::Generic(_) => MetadataAlgorithm::Generic,
            BlockMetadata::Linear(_) => MetadataAlgorithm::Linear,
            BlockMetadata::Tlsf(_) => MetadataAlgorithm::Tlsf,
        }
    }

    pub fn size(&self) -> u64 {
        dispatch!(self, m => m.size())
    }

    pub fn debug_margin(&self) -> u64 {
        dispatch!(self, m => m.debug_margin())
    }

    pub fn sum_free_size(&self) -> u64 {
        dispatch!(self, m => m.sum_free_size())
    }

    pub fn allocation_count(&self) -> usize {
        dispatch!(self, m => m.allocation_count())
    }

    pub fn free_regions_count(&self) -> usize {
        dispatch!(self, m => m.free_regions_count())
    }

    pub fn is_empty(&self) -> bool {
        self.allocation_count() == 0
    }

    /// Full O(n) consistency check
    pub fn validate(&self) -> bool {
        dispatch!(self, m => m.validate())
    }

    /// Search for a place for `size` bytes aligned to `alignment`
    ///
    /// `upper_address` is honoured by Linear only and must be false for the
    /// other algorithms.
    pub fn create_allocation_request(
        &mut self,
        size: u64,
        alignment: u64,
        upper_address: bool,
        strategy: AllocationStrategy,
    ) -> Option<AllocationRequest> {
        assert!(size > 0, "cannot allocate an empty range");
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        match self {
            BlockMetadata::Generic(m) => {
                assert!(!upper_address, "upper address allocation requires Linear metadata");
                m.create_allocation_request(size, alignment)
            }
            BlockMetadata::Linear(m) => m.create_allocation_request(size, alignment, upper_address),
            BlockMetadata::Tlsf(m) => {
                assert!(!upper_address, "upper address allocation requires Linear metadata");
                m.create_allocation_request(size, alignment, strategy)
            }
        }
    }

    /// Commit a request produced by this metadata
    pub fn alloc(&mut self, request: &AllocationRequest, user_data: u64) {
        dispatch!(self, m => m.alloc(request, user_data));
        crate::heavy_assert!(self.validate());
    }

    /// Release the suballocation behind `handle`
    ///
    /// # Panics
    ///
    /// Panics if `handle` does not name a live suballocation.
    pub fn free(&mut self, handle: AllocHandle) {
        dispatch!(self, m => m.free(handle));
        crate::heavy_assert!(self.validate());
    }

    /// Drop every suballocation
    pub fn clear(&mut self) {
        dispatch!(self, m => m.clear())
    }

    pub fn allocation_offset(&self, handle: AllocHandle) -> u64 {
        self.allocation_info(handle).offset
    }

    pub fn allocation_info(&self, handle: AllocHandle) -> AllocationInfo {
        dispatch!(self, m => m.allocation_info(handle))
    }

    pub fn allocation_user_data(&self, handle: AllocHandle) -> u64 {
        self.allocation_info(handle).user_data
    }

    pub fn set_allocation_user_data(&mut self, handle: AllocHandle, user_data: u64) {
        dispatch!(self, m => m.set_allocation_user_data(handle, user_data))
    }

    /// First allocation in this algorithm's iteration order
    ///
    /// # Panics
    ///
    /// Linear metadata does not support iteration and panics.
    pub fn allocation_list_begin(&self) -> Option<AllocHandle> {
        match self {
            BlockMetadata::Generic(m) => m.allocation_list_begin(),
            BlockMetadata::Linear(_) => linear::unsupported("allocation_list_begin"),
            BlockMetadata::Tlsf(m) => m.allocation_list_begin(),
        }
    }

    pub fn next_allocation(&self, prev: AllocHandle) -> Option<AllocHandle> {
        match self {
            BlockMetadata::Generic(m) => m.next_allocation(prev),
            BlockMetadata::Linear(_) => linear::unsupported("next_allocation"),
            BlockMetadata::Tlsf(m) => m.next_allocation(prev),
        }
    }

    /// Size of the free region following `handle` in iteration order, or 0
    pub fn next_free_region_size(&self, handle: AllocHandle) -> u64 {
        match self {
            BlockMetadata::Generic(m) => m.next_free_region_size(handle),
            BlockMetadata::Linear(_) => linear::unsupported("next_free_region_size"),
            BlockMetadata::Tlsf(m) => m.next_free_region_size(handle),
        }
    }

    /// Visit every suballocation in address order
    ///
    /// Adjacent free space is reported as one free suballocation.
    pub fn for_each_suballocation<F: FnMut(Suballocation)>(&self, f: F) {
        dispatch!(self, m => m.for_each_suballocation(f))
    }

    pub fn add_statistics(&self, stats: &mut Statistics) {
        stats.block_count += 1;
        stats.allocation_count += self.allocation_count() as u32;
        stats.block_bytes += self.size();
        stats.allocation_bytes += self.size() - self.sum_free_size();
    }

    pub fn add_detailed_statistics(&self, stats: &mut DetailedStatistics) {
        stats.stats.block_count += 1;
        stats.stats.block_bytes += self.size();
        self.for_each_suballocation(|s| match s.state {
            SuballocationState::Free => stats.add_unused_range(s.size),
            SuballocationState::Allocated { .. } => stats.add_allocation(s.size),
        });
    }

    /// Log every live allocation; used when a block is torn down non-empty
    pub fn debug_log_all_allocations(&self) {
        self.for_each_suballocation(|s| {
            if let Some(user_data) = s.user_data() {
                log::error!(
                    "unfreed allocation: offset {}, size {}, user data {}",
                    s.offset,
                    s.size,
                    user_data
                );
            }
        });
    }
}
