//! Block - One Native Heap Plus Its Suballocation Metadata
//!
//! A [`NormalBlock`] is created by a block vector when it needs capacity and
//! owns its heap for as long as it lives. Dropping the block destroys the heap
//! and returns its bytes to the budget counters, so a block removed from the
//! vector under the lock can be dropped after the lock is released.

use crate::budget::{BudgetSource, HeapType, MemorySegmentGroup};
use crate::config::BlockVectorConfig;
use crate::device::{HeapDesc, HeapDevice, HeapHandle};
use crate::error::Result;
use crate::logging::{log_event, AllocEvent};
use crate::metadata::BlockMetadata;
use gma_util::define_idx;
use std::sync::Arc;

define_idx!(
    /// Identifier of a block, unique within its block vector
    BlockId
);

/// Heap-backed block of one block vector
pub struct NormalBlock {
    id: BlockId,
    heap: HeapHandle,
    heap_type: HeapType,
    group: MemorySegmentGroup,
    pub(crate) metadata: BlockMetadata,
    device: Arc<dyn HeapDevice>,
    budget: Arc<dyn BudgetSource>,
}

impl NormalBlock {
    /// Create the heap and the metadata covering it
    pub(crate) fn create(
        id: BlockId,
        size: u64,
        config: &BlockVectorConfig,
        device: Arc<dyn HeapDevice>,
        budget: Arc<dyn BudgetSource>,
    ) -> Result<Self> {
        let heap = device.create_heap(&HeapDesc {
            size,
            heap_type: config.heap_type,
            resource_class: config.resource_class,
        })?;

        let group = budget.segment_group(config.heap_type);
        budget.add_block(group, size);
        log_event(AllocEvent::BlockCreated {
            block_id: id.0,
            size,
        });

        Ok(NormalBlock {
            id,
            heap,
            heap_type: config.heap_type,
            group,
            metadata: BlockMetadata::new(config.algorithm, size, config.debug_margin),
            device,
            budget,
        })
    }

    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[inline]
    pub fn heap(&self) -> HeapHandle {
        self.heap
    }

    #[inline]
    pub fn heap_type(&self) -> HeapType {
        self.heap_type
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.metadata.size()
    }

    #[inline]
    pub fn metadata(&self) -> &BlockMetadata {
        &self.metadata
    }

    /// Full consistency check of the block
    pub fn validate(&self) -> bool {
        self.metadata.size() > 0 && self.metadata.validate()
    }
}

impl Drop for NormalBlock {
    fn drop(&mut self) {
        if !self.metadata.is_empty() {
            self.metadata.debug_log_all_allocations();
        }

        let size = self.metadata.size();
        self.device.destroy_heap(self.heap);
        self.budget.remove_block(self.group, size);
        log_event(AllocEvent::BlockDestroyed {
            block_id: self.id.0,
            size,
        });
    }
}

impl std::fmt::Debug for NormalBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalBlock")
            .field("id", &self.id)
            .field("heap", &self.heap)
            .field("size", &self.metadata.size())
            .field("sum_free_size", &self.metadata.sum_free_size())
            .field("allocation_count", &self.metadata.allocation_count())
            .finish()
    }
}
