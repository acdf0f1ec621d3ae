//! Stats Module - Allocation Statistics
//!
//! Plain counters aggregated from block metadata:
//! - [`Statistics`]: block / allocation counts and bytes, cheap to gather
//! - [`DetailedStatistics`]: adds unused ranges and size extremes, needs a
//!   full walk over every suballocation
//! - [`DefragmentationStats`]: what defragmentation moved and released
//!
//! All of them serialize with serde so hosts can forward them as-is.

pub mod json;

pub use json::{block_info_json, AllocationJsonInfo};

use serde::Serialize;

/// Basic counters for a set of blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub block_count: u32,
    pub allocation_count: u32,
    /// Bytes in all blocks
    pub block_bytes: u64,
    /// Bytes handed out to allocations
    pub allocation_bytes: u64,
}

impl Statistics {
    pub fn add(&mut self, other: &Statistics) {
        self.block_count += other.block_count;
        self.allocation_count += other.allocation_count;
        self.block_bytes += other.block_bytes;
        self.allocation_bytes += other.allocation_bytes;
    }

    #[inline]
    pub fn unused_bytes(&self) -> u64 {
        self.block_bytes - self.allocation_bytes
    }
}

/// Counters plus unused-range and size extremes
///
/// Minimums start at `u64::MAX` and maximums at 0, so an empty set reads as
/// "no sample" rather than as zero-sized items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DetailedStatistics {
    pub stats: Statistics,
    pub unused_range_count: u32,
    pub allocation_size_min: u64,
    pub allocation_size_max: u64,
    pub unused_range_size_min: u64,
    pub unused_range_size_max: u64,
}

impl Default for DetailedStatistics {
    fn default() -> Self {
        DetailedStatistics {
            stats: Statistics::default(),
            unused_range_count: 0,
            allocation_size_min: u64::MAX,
            allocation_size_max: 0,
            unused_range_size_min: u64::MAX,
            unused_range_size_max: 0,
        }
    }
}

impl DetailedStatistics {
    pub fn add_allocation(&mut self, size: u64) {
        self.stats.allocation_count += 1;
        self.stats.allocation_bytes += size;
        self.allocation_size_min = self.allocation_size_min.min(size);
        self.allocation_size_max = self.allocation_size_max.max(size);
    }

    pub fn add_unused_range(&mut self, size: u64) {
        self.unused_range_count += 1;
        self.unused_range_size_min = self.unused_range_size_min.min(size);
        self.unused_range_size_max = self.unused_range_size_max.max(size);
    }

    pub fn add(&mut self, other: &DetailedStatistics) {
        self.stats.add(&other.stats);
        self.unused_range_count += other.unused_range_count;
        self.allocation_size_min = self.allocation_size_min.min(other.allocation_size_min);
        self.allocation_size_max = self.allocation_size_max.max(other.allocation_size_max);
        self.unused_range_size_min = self.unused_range_size_min.min(other.unused_range_size_min);
        self.unused_range_size_max = self.unused_range_size_max.max(other.unused_range_size_max);
    }
}

/// Cumulative result of defragmentation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DefragmentationStats {
    pub bytes_moved: u64,
    /// Bytes of blocks released because they became empty
    pub bytes_freed: u64,
    pub allocations_moved: u32,
    pub heaps_freed: u32,
}

impl DefragmentationStats {
    pub fn add(&mut self, other: &DefragmentationStats) {
        self.bytes_moved += other.bytes_moved;
        self.bytes_freed += other.bytes_freed;
        self.allocations_moved += other.allocations_moved;
        self.heaps_freed += other.heaps_freed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detailed_default_has_no_samples() {
        let detailed = DetailedStatistics::default();
        assert_eq!(detailed.allocation_size_min, u64::MAX);
        assert_eq!(detailed.allocation_size_max, 0);
        assert_eq!(detailed.stats, Statistics::default());
    }

    #[test]
    fn test_detailed_accumulates_extremes() {
        let mut a = DetailedStatistics::default();
        a.add_allocation(64);
        a.add_allocation(16);
        a.add_unused_range(512);

        let mut b = DetailedStatistics::default();
        b.add_allocation(1024);
        b.add_unused_range(8);

        a.add(&b);
        assert_eq!(a.stats.allocation_count, 3);
        assert_eq!(a.stats.allocation_bytes, 1104);
        assert_eq!(a.allocation_size_min, 16);
        assert_eq!(a.allocation_size_max, 1024);
        assert_eq!(a.unused_range_count, 2);
        assert_eq!(a.unused_range_size_min, 8);
        assert_eq!(a.unused_range_size_max, 512);
    }

    #[test]
    fn test_statistics_serialize_field_names() {
        let stats = Statistics {
            block_count: 1,
            allocation_count: 2,
            block_bytes: 4096,
            allocation_bytes: 1024,
        };
        assert_eq!(stats.unused_bytes(), 3072);
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["block_bytes"], 4096);
        assert_eq!(json["allocation_count"], 2);
    }
}
