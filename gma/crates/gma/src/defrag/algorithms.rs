//! Move selection for one pass
//!
//! Every routine here runs under the write lock of the vector it scans and
//! returns true when the pass limits were reached and the pass must end.
//! Blocks are scanned from the back (most free space) toward the front;
//! blocks before `immovable_block_count` are never used as sources.

use super::{Averages, DefragmentationAlgorithm, DefragmentationContext, DefragmentationMove, MoveOperation};
use crate::block_vector::{AllocationDesc, AllocationId, BlockVector, Inner};
use crate::config::MAX_ALLOCS_TO_IGNORE;
use crate::metadata::{AllocHandle, AllocationStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterStatus {
    Pass,
    Ignore,
    End,
}

/// Everything needed to reserve a destination for one source allocation
struct MoveData {
    src: AllocationId,
    offset: u64,
    size: u64,
    alignment: u64,
    desc: AllocationDesc,
}

impl DefragmentationContext<'_> {
    pub(super) fn compute_defragmentation(
        &mut self,
        vector: &BlockVector,
        inner: &mut Inner,
        vector_index: usize,
    ) -> bool {
        match self.config().algorithm {
            DefragmentationAlgorithm::Fast => self.compute_fast(vector, inner, vector_index),
            DefragmentationAlgorithm::Balanced => {
                self.compute_balanced(vector, inner, vector_index, true)
            }
            DefragmentationAlgorithm::Full => self.compute_full(vector, inner, vector_index),
        }
    }

    /// Move allocations of one block toward its lowest free offsets
    pub(super) fn realloc_within_block(
        &mut self,
        vector: &BlockVector,
        inner: &mut Inner,
        vector_index: usize,
        block_index: usize,
    ) -> bool {
        let mut cursor = inner.blocks[block_index].metadata.allocation_list_begin();
        while let Some(handle) = cursor {
            cursor = inner.blocks[block_index].metadata.next_allocation(handle);
            let Some(data) = move_data(inner, block_index, handle) else {
                continue;
            };
            match self.check_counters(data.size) {
                CounterStatus::Ignore => continue,
                CounterStatus::End => return true,
                CounterStatus::Pass => {}
            }
            if let Some(true) = self.realloc_lower(vector, inner, vector_index, block_index, &data) {
                return true;
            }
        }
        false
    }

    fn compute_fast(&mut self, vector: &BlockVector, inner: &mut Inner, vector_index: usize) -> bool {
        let first_source = self.vector_states[vector_index].immovable_block_count + 1;
        for i in (first_source..inner.blocks.len()).rev() {
            let mut cursor = inner.blocks[i].metadata.allocation_list_begin();
            while let Some(handle) = cursor {
                cursor = inner.blocks[i].metadata.next_allocation(handle);
                let Some(data) = move_data(inner, i, handle) else {
                    continue;
                };
                match self.check_counters(data.size) {
                    CounterStatus::Ignore => continue,
                    CounterStatus::End => return true,
                    CounterStatus::Pass => {}
                }
                if let Some(true) = self.alloc_in_other_block(vector, inner, vector_index, i, &data) {
                    return true;
                }
            }
        }
        false
    }

    fn compute_full(&mut self, vector: &BlockVector, inner: &mut Inner, vector_index: usize) -> bool {
        let first_source = self.vector_states[vector_index].immovable_block_count + 1;
        for i in (first_source..inner.blocks.len()).rev() {
            let mut cursor = inner.blocks[i].metadata.allocation_list_begin();
            while let Some(handle) = cursor {
                cursor = inner.blocks[i].metadata.next_allocation(handle);
                let Some(data) = move_data(inner, i, handle) else {
                    continue;
                };
                match self.check_counters(data.size) {
                    CounterStatus::Ignore => continue,
                    CounterStatus::End => return true,
                    CounterStatus::Pass => {}
                }
                match self.alloc_in_other_block(vector, inner, vector_index, i, &data) {
                    Some(true) => return true,
                    Some(false) => continue,
                    None => {}
                }
                if let Some(true) = self.realloc_lower(vector, inner, vector_index, i, &data) {
                    return true;
                }
            }
        }
        false
    }

    /// Full, with in-block repacking limited to gaps that matter
    ///
    /// The averages are computed on first use. When a run finds nothing with
    /// averages from an earlier pass, they are recomputed and the run repeated
    /// once.
    fn compute_balanced(
        &mut self,
        vector: &BlockVector,
        inner: &mut Inner,
        vector_index: usize,
        allow_refresh: bool,
    ) -> bool {
        let (averages, fresh) = match self.vector_states[vector_index].averages {
            Some(averages) => (averages, false),
            None => {
                let averages = vector_averages(inner);
                self.vector_states[vector_index].averages = Some(averages);
                (averages, true)
            }
        };

        let start_move_count = self.moves.len();
        let minimal_free_region = averages.free_size / 2;
        let first_source = self.vector_states[vector_index].immovable_block_count + 1;

        for i in (first_source..inner.blocks.len()).rev() {
            let mut prev_free_region_size = 0;
            let mut cursor = inner.blocks[i].metadata.allocation_list_begin();
            while let Some(handle) = cursor {
                cursor = inner.blocks[i].metadata.next_allocation(handle);
                let Some(data) = move_data(inner, i, handle) else {
                    continue;
                };
                match self.check_counters(data.size) {
                    CounterStatus::Ignore => continue,
                    CounterStatus::End => return true,
                    CounterStatus::Pass => {}
                }

                let moved = match self.alloc_in_other_block(vector, inner, vector_index, i, &data) {
                    Some(true) => return true,
                    Some(false) => true,
                    None => false,
                };

                let next_free_region_size = inner.blocks[i].metadata.next_free_region_size(handle);
                let worthwhile = prev_free_region_size >= minimal_free_region
                    || next_free_region_size >= minimal_free_region
                    || data.size <= averages.free_size
                    || data.size <= averages.alloc_size;
                if !moved && worthwhile {
                    if let Some(true) = self.realloc_lower(vector, inner, vector_index, i, &data) {
                        return true;
                    }
                }
                prev_free_region_size = next_free_region_size;
            }
        }

        if self.moves.len() == start_move_count && allow_refresh && !fresh {
            self.vector_states[vector_index].averages = None;
            return self.compute_balanced(vector, inner, vector_index, false);
        }
        false
    }

    /// Reserve room for `data` in any block before `end`
    ///
    /// `None` when no block had room, otherwise whether the pass must end.
    fn alloc_in_other_block(
        &mut self,
        vector: &BlockVector,
        inner: &mut Inner,
        vector_index: usize,
        end: usize,
        data: &MoveData,
    ) -> Option<bool> {
        for dst_block in 0..end {
            if inner.blocks[dst_block].metadata.sum_free_size() < data.size {
                continue;
            }
            if let Some(dst) =
                vector.allocate_from_block(inner, dst_block, data.size, data.alignment, &data.desc, true)
            {
                return Some(self.push_move(data, dst, vector_index));
            }
        }
        None
    }

    /// Reserve a lower offset for `data` in its own block
    ///
    /// `None` when no lower offset is free, otherwise whether the pass must end.
    fn realloc_lower(
        &mut self,
        vector: &BlockVector,
        inner: &mut Inner,
        vector_index: usize,
        block_index: usize,
        data: &MoveData,
    ) -> Option<bool> {
        let metadata = &mut inner.blocks[block_index].metadata;
        if data.offset == 0 || metadata.sum_free_size() < data.size {
            return None;
        }

        let request = metadata.create_allocation_request(
            data.size,
            data.alignment,
            false,
            AllocationStrategy::MinOffset,
        )?;
        if request.offset >= data.offset {
            return None;
        }

        let dst = vector.commit_allocation_request(
            inner,
            &request,
            block_index,
            data.alignment,
            &data.desc,
            true,
        );
        Some(self.push_move(data, dst, vector_index))
    }

    fn push_move(&mut self, data: &MoveData, dst: AllocationId, vector_index: usize) -> bool {
        self.moves.push(DefragmentationMove {
            operation: MoveOperation::Copy,
            src: data.src,
            dst_tmp: dst,
            size: data.size,
            vector: vector_index,
        });
        self.increment_counters(data.size)
    }

    fn check_counters(&mut self, bytes: u64) -> CounterStatus {
        if self.pass_stats.bytes_moved.saturating_add(bytes) > self.config().pass_byte_limit() {
            self.ignored_allocations += 1;
            if self.ignored_allocations < MAX_ALLOCS_TO_IGNORE {
                CounterStatus::Ignore
            } else {
                CounterStatus::End
            }
        } else {
            CounterStatus::Pass
        }
    }

    /// Book one move; true once a per-pass limit is reached
    fn increment_counters(&mut self, bytes: u64) -> bool {
        self.pass_stats.bytes_moved += bytes;
        self.pass_stats.allocations_moved += 1;
        self.pass_stats.allocations_moved >= self.config().pass_allocation_limit()
            || self.pass_stats.bytes_moved >= self.config().pass_byte_limit()
    }
}

/// Source details for the allocation behind `handle`; `None` for reserved
/// destinations of this context
fn move_data(inner: &Inner, block_index: usize, handle: AllocHandle) -> Option<MoveData> {
    let user_data = inner.blocks[block_index].metadata.allocation_user_data(handle);
    let src = AllocationId::from_user_data(user_data);
    let record = inner.record(src)?;
    if record.defrag_temp {
        return None;
    }
    Some(MoveData {
        src,
        offset: record.offset,
        size: record.size,
        alignment: record.alignment,
        desc: AllocationDesc {
            resource_type: record.resource_type,
            ..Default::default()
        },
    })
}

/// Average free-region and allocation sizes over every block of a vector
fn vector_averages(inner: &Inner) -> Averages {
    let mut allocation_count = 0u64;
    let mut free_region_count = 0u64;
    let mut free_bytes = 0u64;
    let mut total_bytes = 0u64;

    for block in &inner.blocks {
        allocation_count += block.metadata.allocation_count() as u64;
        free_region_count += block.metadata.free_regions_count() as u64;
        free_bytes += block.metadata.sum_free_size();
        total_bytes += block.metadata.size();
    }

    Averages {
        free_size: free_bytes.checked_div(free_region_count).unwrap_or(0),
        alloc_size: (total_bytes - free_bytes)
            .checked_div(allocation_count)
            .unwrap_or(0),
    }
}
