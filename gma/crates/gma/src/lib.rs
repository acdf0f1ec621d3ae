//! # GMA - GPU Memory Allocator Core
//!
//! GMA places many small allocations inside a few large device heaps. It is the
//! suballocation engine of a D3D12-style allocator: heap creation and resource
//! placement are delegated to a [`HeapDevice`], and everything between those
//! calls (which heap, which offset, when to grow or shrink) happens here.
//!
//! ## Overview
//!
//! - **Block metadata**: three interchangeable layouts for one heap, behind
//!   [`BlockMetadata`]: a best-fit free list, a linear ring or double stack, and
//!   a two-level segregated fit (TLSF) index
//! - **Block vectors**: a growable pool of blocks for one heap type, with
//!   budget-aware growth and hysteresis on release
//! - **Defragmentation**: incremental passes that relocate allocations so that
//!   trailing blocks empty out
//! - **Statistics**: per-block and per-vector counters plus a JSON dump
//!
//! ## Quick Start
//!
//! ```rust
//! use gma::{AllocationDesc, BlockVector, BlockVectorConfig, BudgetTracker, SimulatedDevice};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), gma::GmaError> {
//!     let vector = BlockVector::new(
//!         BlockVectorConfig::default(),
//!         Arc::new(SimulatedDevice::new()),
//!         Arc::new(BudgetTracker::unlimited()),
//!     )?;
//!
//!     let ids = vector.allocate(4096, 256, &AllocationDesc::default(), 2)?;
//!     assert_eq!(vector.allocation_count(), 2);
//!
//!     for id in ids {
//!         vector.free(id)?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ BlockVector (one heap type, RwLock)                   │
//! │   registry: AllocationId ─► (block, handle, offset)   │
//! │   ┌────────────┐ ┌────────────┐ ┌────────────┐        │
//! │   │ NormalBlock│ │ NormalBlock│ │ NormalBlock│ ...    │
//! │   │  heap      │ │  heap      │ │  heap      │        │
//! │   │  metadata  │ │  metadata  │ │  metadata  │        │
//! │   └────────────┘ └────────────┘ └────────────┘        │
//! └───────────────┬──────────────────────┬────────────────┘
//!                 │                      │
//!        HeapDevice (heaps,      BudgetSource (counters,
//!        placed resources)       usage vs. budget)
//! ```
//!
//! A [`DefragmentationContext`] borrows one or more vectors and drives the
//! begin/end pass protocol on them.
//!
//! ## Thread Safety
//!
//! [`BlockVector`] is `Sync`; allocation and free take its write lock,
//! statistics take the read lock. Block metadata itself is not synchronized.

// Suballocation engine
pub mod block;
pub mod block_vector;
pub mod metadata;

// Defragmentation
pub mod defrag;

// Environment
pub mod budget;
pub mod device;

// Configuration and errors
pub mod config;
pub mod error;

// Monitoring
pub mod logging;
pub mod stats;

// Utilities
pub mod util;

pub use block::{BlockId, NormalBlock};
pub use block_vector::{Allocation, AllocationDesc, AllocationId, BlockVector};
pub use budget::{Budget, BudgetSource, BudgetTracker, HeapType, MemorySegmentGroup};
pub use config::{BlockVectorConfig, DefragmentationConfig};
pub use defrag::{
    DefragmentationAlgorithm, DefragmentationContext, DefragmentationMove, DefragmentationState,
    MoveOperation,
};
pub use device::{HeapDevice, HeapHandle, ResourceDesc, ResourceHandle, ResourceType, SimulatedDevice};
pub use error::{GmaError, Result};
pub use metadata::{AllocationStrategy, BlockMetadata, MetadataAlgorithm};
pub use stats::{DefragmentationStats, DetailedStatistics, Statistics};

/// GMA version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
