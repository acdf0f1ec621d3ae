//! Budget Tracking - Memory Usage Against the Heap-Type Budget
//!
//! Block vectors read the budget before deciding to grow and report every
//! block and allocation they create or release. The counters are plain
//! atomics; the budget figure itself is refreshed from a [`MemoryInfoSource`]
//! only every [`BUDGET_REFETCH_INTERVAL`] counter operations, and between two
//! refreshes the usage is extrapolated from the block bytes added since.
//!
//! The figure a block vector reads may therefore be slightly stale. That race
//! is accepted: a growth decision made on a stale budget is re-checked by the
//! device when the heap is actually created.

use crate::config::BUDGET_REFETCH_INTERVAL;
use crate::stats::Statistics;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Heap type a block vector allocates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeapType {
    /// GPU-local memory
    Default,
    /// CPU-visible memory for uploads
    Upload,
    /// CPU-visible memory for readback
    Readback,
    /// Custom heap properties; not subject to budget checks
    Custom,
}

impl HeapType {
    /// Standard heap types are budget-checked
    pub fn is_standard(self) -> bool {
        !matches!(self, HeapType::Custom)
    }

    /// Memory segment group this heap type draws from
    pub fn segment_group(self, uma: bool) -> MemorySegmentGroup {
        if uma {
            return MemorySegmentGroup::Local;
        }
        match self {
            HeapType::Default | HeapType::Custom => MemorySegmentGroup::Local,
            HeapType::Upload | HeapType::Readback => MemorySegmentGroup::NonLocal,
        }
    }
}

/// Physical memory segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemorySegmentGroup {
    Local,
    NonLocal,
}

impl MemorySegmentGroup {
    pub const COUNT: usize = 2;

    #[inline]
    fn index(self) -> usize {
        match self {
            MemorySegmentGroup::Local => 0,
            MemorySegmentGroup::NonLocal => 1,
        }
    }
}

/// Usage and budget of one heap type, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Budget {
    pub usage_bytes: u64,
    pub budget_bytes: u64,
}

impl Budget {
    /// Bytes left before the budget is reached (0 when exceeded)
    pub fn available(&self) -> u64 {
        self.budget_bytes.saturating_sub(self.usage_bytes)
    }

    pub fn is_exceeded(&self) -> bool {
        self.usage_bytes >= self.budget_bytes
    }
}

/// Counter sink and budget oracle consulted by block vectors
///
/// The counters are fire-and-forget; nothing in the allocator reads them back
/// for correctness.
pub trait BudgetSource: Send + Sync {
    fn add_allocation(&self, group: MemorySegmentGroup, bytes: u64);
    fn remove_allocation(&self, group: MemorySegmentGroup, bytes: u64);
    fn add_block(&self, group: MemorySegmentGroup, bytes: u64);
    fn remove_block(&self, group: MemorySegmentGroup, bytes: u64);

    /// Current usage and budget for `heap_type`
    fn budget_for_heap_type(&self, heap_type: HeapType) -> Budget;

    /// Segment group the counters of `heap_type` are booked under
    fn segment_group(&self, heap_type: HeapType) -> MemorySegmentGroup;
}

/// Usage and budget reported by the platform for one segment group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub current_usage: u64,
    pub budget: u64,
}

/// Platform query for video memory usage and budget
pub trait MemoryInfoSource: Send + Sync {
    /// `None` when the platform cannot report this group
    fn query(&self, group: MemorySegmentGroup) -> Option<MemoryInfo>;
}

#[derive(Default)]
struct SegmentCounters {
    block_count: AtomicU32,
    allocation_count: AtomicU32,
    block_bytes: AtomicU64,
    allocation_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
struct FetchedBudget {
    usage: u64,
    budget: u64,
    block_bytes_at_fetch: u64,
}

enum BudgetMode {
    /// Usage is our own block bytes; budget is 80% of the capacity
    Capacity([u64; MemorySegmentGroup::COUNT]),
    /// Usage and budget come from the platform, refreshed periodically
    Query(Arc<dyn MemoryInfoSource>),
}

/// Default [`BudgetSource`] implementation
pub struct BudgetTracker {
    uma: bool,
    counters: [SegmentCounters; MemorySegmentGroup::COUNT],
    mode: BudgetMode,
    fetched: RwLock<[FetchedBudget; MemorySegmentGroup::COUNT]>,
    operations_since_fetch: AtomicU32,
}

impl BudgetTracker {
    /// Tracker with fixed segment capacities and no platform query
    pub fn with_capacity(local_bytes: u64, non_local_bytes: u64) -> Self {
        Self::new(BudgetMode::Capacity([local_bytes, non_local_bytes]))
    }

    /// Tracker that never reports the budget as exceeded
    pub fn unlimited() -> Self {
        Self::with_capacity(u64::MAX, u64::MAX)
    }

    /// Tracker backed by a platform memory query
    pub fn with_memory_info(source: Arc<dyn MemoryInfoSource>) -> Self {
        let tracker = Self::new(BudgetMode::Query(source));
        tracker.update_budget();
        tracker
    }

    fn new(mode: BudgetMode) -> Self {
        Self {
            uma: false,
            counters: Default::default(),
            mode,
            fetched: RwLock::new([FetchedBudget::default(); MemorySegmentGroup::COUNT]),
            operations_since_fetch: AtomicU32::new(0),
        }
    }

    /// Treat all heap types as local memory (unified memory architecture)
    pub fn with_uma(mut self, uma: bool) -> Self {
        self.uma = uma;
        self
    }

    /// Counters booked under `group`
    pub fn statistics(&self, group: MemorySegmentGroup) -> Statistics {
        let c = &self.counters[group.index()];
        Statistics {
            block_count: c.block_count.load(Ordering::Relaxed),
            allocation_count: c.allocation_count.load(Ordering::Relaxed),
            block_bytes: c.block_bytes.load(Ordering::Relaxed),
            allocation_bytes: c.allocation_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn operations_since_fetch(&self) -> u32 {
        self.operations_since_fetch.load(Ordering::Relaxed)
    }

    pub fn should_update_budget(&self) -> bool {
        matches!(self.mode, BudgetMode::Query(_))
            && self.operations_since_fetch() >= BUDGET_REFETCH_INTERVAL
    }

    /// Query the platform and reset the extrapolation base
    pub fn update_budget(&self) {
        let BudgetMode::Query(source) = &self.mode else {
            return;
        };

        let mut fetched = self.fetched.write();
        for group in [MemorySegmentGroup::Local, MemorySegmentGroup::NonLocal] {
            let slot = &mut fetched[group.index()];
            match source.query(group) {
                Some(info) => {
                    slot.usage = info.current_usage;
                    slot.budget = info.budget;
                }
                None => log::debug!("memory info unavailable for {:?}", group),
            }
            slot.block_bytes_at_fetch =
                self.counters[group.index()].block_bytes.load(Ordering::Relaxed);
        }
        self.operations_since_fetch.store(0, Ordering::Relaxed);
    }

    fn group_budget(&self, group: MemorySegmentGroup) -> Budget {
        let block_bytes = self.counters[group.index()]
            .block_bytes
            .load(Ordering::Relaxed);
        match &self.mode {
            BudgetMode::Capacity(capacity) => Budget {
                usage_bytes: block_bytes,
                budget_bytes: capacity[group.index()] / 10 * 8,
            },
            BudgetMode::Query(_) => {
                if self.should_update_budget() {
                    self.update_budget();
                }
                let fetched = self.fetched.read()[group.index()];
                let usage = (fetched.usage + block_bytes)
                    .saturating_sub(fetched.block_bytes_at_fetch);
                Budget {
                    usage_bytes: usage,
                    budget_bytes: fetched.budget,
                }
            }
        }
    }

    fn bump(&self) {
        self.operations_since_fetch.fetch_add(1, Ordering::Relaxed);
    }
}

impl BudgetSource for BudgetTracker {
    fn add_allocation(&self, group: MemorySegmentGroup, bytes: u64) {
        let c = &self.counters[group.index()];
        c.allocation_count.fetch_add(1, Ordering::Relaxed);
        c.allocation_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.bump();
    }

    fn remove_allocation(&self, group: MemorySegmentGroup, bytes: u64) {
        let c = &self.counters[group.index()];
        let prev = c.allocation_bytes.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "allocation byte counter underflow");
        c.allocation_count.fetch_sub(1, Ordering::Relaxed);
        self.bump();
    }

    fn add_block(&self, group: MemorySegmentGroup, bytes: u64) {
        let c = &self.counters[group.index()];
        c.block_count.fetch_add(1, Ordering::Relaxed);
        c.block_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.bump();
    }

    fn remove_block(&self, group: MemorySegmentGroup, bytes: u64) {
        let c = &self.counters[group.index()];
        let prev = c.block_bytes.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "block byte counter underflow");
        c.block_count.fetch_sub(1, Ordering::Relaxed);
        self.bump();
    }

    fn budget_for_heap_type(&self, heap_type: HeapType) -> Budget {
        self.group_budget(self.segment_group(heap_type))
    }

    fn segment_group(&self, heap_type: HeapType) -> MemorySegmentGroup {
        heap_type.segment_group(self.uma)
    }
}

impl std::fmt::Debug for BudgetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetTracker")
            .field("uma", &self.uma)
            .field("local", &self.statistics(MemorySegmentGroup::Local))
            .field("non_local", &self.statistics(MemorySegmentGroup::NonLocal))
            .finish()
    }
}
