//! Block Vector - Growable Pool of Blocks of One Heap Type
//!
//! ============================================================================
//! OVERVIEW
//! ============================================================================
//!
//! A [`BlockVector`] serves every placed allocation of one heap type and
//! resource class. It keeps its blocks roughly sorted by free space, smallest
//! first, so a forward scan prefers the fullest block that still fits:
//!
//! ```text
//! blocks: [ B2: 16 free ][ B0: 300 free ][ B1: 4096 free (empty) ]
//!            ▲ tried first                  ▲ tried last
//! ```
//!
//! ============================================================================
//! GROWTH
//! ============================================================================
//!
//! When no block fits, a new one is created. Unless `explicit_block_size` is
//! set, the first blocks start at 1/2, 1/4 or 1/8 of the preferred size while
//! the halved size is still larger than every existing block and at least
//! twice the request. If creating the block fails, smaller sizes are retried
//! down to the request size.
//!
//! Growth is refused when the heap-type budget has no room for the block. The
//! budget is read before the lock is taken and may be slightly stale.
//!
//! ============================================================================
//! SHRINKING
//! ============================================================================
//!
//! At most one empty block is kept around to avoid create/destroy churn. A
//! block that becomes empty while another empty block exists (or while the
//! budget is exceeded) is removed. Removed blocks are dropped after the lock
//! is released.
//!
//! ============================================================================
//! ALLOCATION REGISTRY
//! ============================================================================
//!
//! Every live allocation has an [`AllocationId`] stored as the metadata user
//! data. The registry maps it to the owning block, the metadata handle and the
//! caller-visible details. Defragmentation swaps the placement of two records,
//! so an id stays valid while its memory moves.

use crate::block::{BlockId, NormalBlock};
use crate::budget::{BudgetSource, MemorySegmentGroup};
use crate::config::{BlockVectorConfig, NEW_BLOCK_SIZE_SHIFT_MAX};
use crate::device::{HeapDevice, HeapHandle, ResourceDesc, ResourceHandle, ResourceType};
use crate::error::{GmaError, Result};
use crate::logging::{log_event, AllocEvent};
use crate::metadata::{AllocHandle, AllocationRequest, AllocationStrategy, MetadataAlgorithm};
use crate::stats::{block_info_json, AllocationJsonInfo, DetailedStatistics, Statistics};
use crate::{bail, ensure};
use parking_lot::{RwLock, RwLockWriteGuard};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Identifier of a live allocation within its block vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AllocationId(u64);

impl AllocationId {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) fn from_user_data(user_data: u64) -> Self {
        AllocationId(user_data)
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-request options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationDesc {
    /// Placement strategy (TLSF only)
    pub strategy: AllocationStrategy,
    /// Place at the upper end of a linear block (double stack)
    pub upper_address: bool,
    /// Only use existing blocks
    pub never_allocate: bool,
    /// Report `BudgetExceeded` instead of `OutOfMemory` when growth would
    /// exceed the budget
    pub within_budget: bool,
    pub resource_type: ResourceType,
    pub name: Option<String>,
    /// Opaque value carried for the caller
    pub private_data: u64,
}

/// Caller-visible snapshot of one allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: AllocationId,
    pub block_id: BlockId,
    pub heap: HeapHandle,
    pub offset: u64,
    pub size: u64,
    pub alignment: u64,
    pub was_zero_initialized: bool,
    pub resource: Option<ResourceHandle>,
    pub resource_type: ResourceType,
    pub name: Option<String>,
    pub private_data: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct AllocationRecord {
    pub(crate) block: BlockId,
    pub(crate) handle: AllocHandle,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) alignment: u64,
    pub(crate) zero_initialized: bool,
    pub(crate) resource: Option<ResourceHandle>,
    pub(crate) resource_type: ResourceType,
    pub(crate) name: Option<String>,
    pub(crate) private_data: u64,
    /// Destination reserved by an in-flight defragmentation move
    pub(crate) defrag_temp: bool,
}

/// State guarded by the vector lock
pub(crate) struct Inner {
    pub(crate) blocks: Vec<NormalBlock>,
    pub(crate) allocations: FxHashMap<AllocationId, AllocationRecord>,
    next_block_id: u32,
    next_allocation_id: u64,
    has_empty_block: bool,
    incremental_sort: bool,
}

impl Inner {
    pub(crate) fn block_index(&self, id: BlockId) -> Option<usize> {
        self.blocks.iter().position(|block| block.id() == id)
    }

    pub(crate) fn record(&self, id: AllocationId) -> Option<&AllocationRecord> {
        self.allocations.get(&id)
    }

    fn next_allocation_id(&mut self) -> AllocationId {
        self.next_allocation_id += 1;
        AllocationId(self.next_allocation_id)
    }

    /// One bubble-sort step: swap the first out-of-order pair only
    fn incrementally_sort_blocks(&mut self) {
        if !self.incremental_sort {
            return;
        }
        for i in 1..self.blocks.len() {
            if self.blocks[i - 1].metadata.sum_free_size() > self.blocks[i].metadata.sum_free_size()
            {
                self.blocks.swap(i - 1, i);
                return;
            }
        }
    }

    fn sort_by_free_size(&mut self) {
        self.blocks.sort_by_key(|block| block.metadata.sum_free_size());
    }

    fn has_any_empty_block(&self) -> bool {
        self.blocks.iter().any(|block| block.metadata.is_empty())
    }

    fn max_block_size(&self, preferred: u64) -> u64 {
        let mut result = 0;
        for block in &self.blocks {
            result = result.max(block.size());
            if result >= preferred {
                break;
            }
        }
        result
    }

    fn describe(&self, user_data: u64) -> AllocationJsonInfo {
        match self.allocations.get(&AllocationId::from_user_data(user_data)) {
            Some(record) => AllocationJsonInfo {
                resource_type: record.resource_type.json_name(),
                name: record.name.clone(),
            },
            None => AllocationJsonInfo {
                resource_type: ResourceType::Unknown.json_name(),
                name: None,
            },
        }
    }
}

/// Pool of heap blocks for one heap type and resource class
pub struct BlockVector {
    config: BlockVectorConfig,
    group: MemorySegmentGroup,
    device: Arc<dyn HeapDevice>,
    budget: Arc<dyn BudgetSource>,
    inner: RwLock<Inner>,
}

impl BlockVector {
    pub fn new(
        config: BlockVectorConfig,
        device: Arc<dyn HeapDevice>,
        budget: Arc<dyn BudgetSource>,
    ) -> Result<Self> {
        config.validate()?;
        let group = budget.segment_group(config.heap_type);

        Ok(BlockVector {
            config,
            group,
            device,
            budget,
            inner: RwLock::new(Inner {
                blocks: Vec::new(),
                allocations: FxHashMap::default(),
                next_block_id: 0,
                next_allocation_id: 0,
                has_empty_block: false,
                incremental_sort: true,
            }),
        })
    }

    #[inline]
    pub fn config(&self) -> &BlockVectorConfig {
        &self.config
    }

    #[inline]
    pub fn algorithm(&self) -> MetadataAlgorithm {
        self.config.algorithm
    }

    /// Create the `min_block_count` blocks up front, at the preferred size
    pub fn create_min_blocks(&self) -> Result<()> {
        let mut inner = self.inner.write();
        while inner.blocks.len() < self.config.min_block_count {
            self.create_block(&mut inner, self.config.preferred_block_size)?;
        }
        inner.has_empty_block = inner.has_any_empty_block();
        Ok(())
    }

    // ========================================================================
    // ALLOCATE / FREE
    // ========================================================================

    /// Allocate `count` allocations of `size` bytes each
    ///
    /// All or nothing: when one of them cannot be placed, the ones already
    /// made by this call are freed before the error is returned.
    pub fn allocate(
        &self,
        size: u64,
        alignment: u64,
        desc: &AllocationDesc,
        count: usize,
    ) -> Result<Vec<AllocationId>> {
        ensure!(size > 0, GmaError::InvalidArgument("allocation size must be > 0".into()));
        ensure!(count > 0, GmaError::InvalidArgument("allocation count must be > 0".into()));
        ensure!(
            alignment.is_power_of_two(),
            GmaError::InvalidArgument(format!("alignment {} is not a power of two", alignment))
        );
        ensure!(
            !desc.upper_address || self.config.algorithm == MetadataAlgorithm::Linear,
            GmaError::InvalidArgument("upper address allocation requires a linear block vector".into())
        );

        let mut free_memory = self.free_budget_memory();
        let mut ids = Vec::with_capacity(count);
        let mut retired = Vec::new();
        let result = {
            let mut inner = self.inner.write();
            (0..count).try_for_each(|_| -> Result<()> {
                let id = self.allocate_page(
                    &mut inner,
                    size,
                    alignment,
                    desc,
                    &mut free_memory,
                    &mut retired,
                )?;
                ids.push(id);
                Ok(())
            })
        };
        drop(retired);

        if let Err(err) = result {
            for id in ids.into_iter().rev() {
                self.free(id)?;
            }
            log_event(AllocEvent::AllocationFailed {
                size,
                alignment,
                reason: err.to_string(),
            });
            return Err(err);
        }
        Ok(ids)
    }

    fn allocate_page(
        &self,
        inner: &mut Inner,
        size: u64,
        alignment: u64,
        desc: &AllocationDesc,
        free_memory: &mut u64,
        retired: &mut Vec<NormalBlock>,
    ) -> Result<AllocationId> {
        let preferred = self.config.preferred_block_size;
        if size.saturating_add(self.config.debug_margin) > preferred {
            bail!(GmaError::OutOfMemory {
                requested: size,
                available: preferred,
            });
        }

        // 1. Existing blocks, fullest first
        for index in 0..inner.blocks.len() {
            if let Some(id) = self.allocate_from_block(inner, index, size, alignment, desc, false) {
                return Ok(id);
            }
        }

        // 2. New block
        if desc.never_allocate {
            bail!(GmaError::OutOfMemory {
                requested: size,
                available: 0,
            });
        }
        if inner.blocks.len() >= self.config.max_block_count {
            bail!(GmaError::TooManyBlocks {
                max: self.config.max_block_count,
            });
        }
        if *free_memory < size {
            return Err(self.budget_rejection(size, desc.within_budget));
        }

        let mut new_block_size = preferred;
        let mut shift = 0;
        if !self.config.explicit_block_size {
            let max_existing = inner.max_block_size(preferred);
            while shift < NEW_BLOCK_SIZE_SHIFT_MAX {
                let smaller = new_block_size / 2;
                if smaller > max_existing && smaller >= size.saturating_mul(2) {
                    new_block_size = smaller;
                    shift += 1;
                } else {
                    break;
                }
            }
        }

        let mut created =
            self.try_create_block(inner, new_block_size, *free_memory, desc.within_budget);
        if !self.config.explicit_block_size {
            while created.is_err() && shift < NEW_BLOCK_SIZE_SHIFT_MAX {
                let smaller = new_block_size / 2;
                if smaller < size {
                    break;
                }
                new_block_size = smaller;
                shift += 1;
                created =
                    self.try_create_block(inner, new_block_size, *free_memory, desc.within_budget);
            }
        }

        let index = created?;
        if *free_memory != u64::MAX {
            *free_memory = free_memory.saturating_sub(new_block_size);
        }

        // The margin or the alignment can still make a fresh block too small
        if let Some(id) = self.allocate_from_block(inner, index, size, alignment, desc, false) {
            return Ok(id);
        }
        let available = inner.blocks[index].metadata.sum_free_size();
        let other_empty = inner
            .blocks
            .iter()
            .enumerate()
            .any(|(i, block)| i != index && block.metadata.is_empty());
        if other_empty && inner.blocks.len() > self.config.min_block_count {
            retired.push(inner.blocks.remove(index));
        } else {
            inner.has_empty_block = true;
        }
        Err(GmaError::OutOfMemory {
            requested: size,
            available,
        })
    }

    /// Free an allocation and apply the empty-block policy
    pub fn free(&self, id: AllocationId) -> Result<()> {
        let budget_exceeded = self.is_budget_exceeded();

        let (block_to_delete, resource) = {
            let mut inner = self.inner.write();
            let record = inner
                .allocations
                .remove(&id)
                .ok_or_else(|| GmaError::InvalidArgument(format!("unknown allocation {}", id)))?;
            let index = inner.block_index(record.block).ok_or_else(|| {
                GmaError::Internal(format!("allocation {} names a missing block", id))
            })?;

            inner.blocks[index].metadata.free(record.handle);
            crate::heavy_assert!(inner.blocks[index].validate());
            self.budget.remove_allocation(self.group, record.size);

            let block_count = inner.blocks.len();
            let can_shrink = block_count > self.config.min_block_count;
            let mut block_to_delete = None;

            if inner.blocks[index].metadata.is_empty() {
                if (inner.has_empty_block || budget_exceeded) && can_shrink {
                    block_to_delete = Some(inner.blocks.remove(index));
                } else {
                    inner.has_empty_block = true;
                }
            } else if inner.has_empty_block && budget_exceeded && can_shrink {
                if let Some(empty) = inner.blocks.iter().rposition(|b| b.metadata.is_empty()) {
                    block_to_delete = Some(inner.blocks.remove(empty));
                    inner.has_empty_block = false;
                }
            }

            inner.incrementally_sort_blocks();
            (block_to_delete, record.resource)
        };

        if let Some(resource) = resource {
            self.device.destroy_resource(resource);
        }
        drop(block_to_delete);
        Ok(())
    }

    // ========================================================================
    // RESOURCES
    // ========================================================================

    /// Allocate memory for `resource` and create it there
    ///
    /// The allocation is freed again if the device refuses the resource.
    pub fn create_resource(
        &self,
        desc: &AllocationDesc,
        resource: &ResourceDesc,
    ) -> Result<(AllocationId, ResourceHandle)> {
        let desc = AllocationDesc {
            resource_type: resource.resource_type,
            ..desc.clone()
        };
        let id = self
            .allocate(resource.size, resource.alignment.max(1), &desc, 1)?
            .pop()
            .ok_or_else(|| GmaError::Internal("allocate returned no allocation".into()))?;

        match self.create_placed_resource(id, resource) {
            Ok(handle) => Ok((id, handle)),
            Err(err) => {
                self.free(id)?;
                Err(err)
            }
        }
    }

    /// Create a placed resource over an existing allocation
    ///
    /// The device call runs without the vector lock held.
    pub fn create_placed_resource(
        &self,
        id: AllocationId,
        resource: &ResourceDesc,
    ) -> Result<ResourceHandle> {
        let (heap, offset) = {
            let inner = self.inner.read();
            let record = inner
                .record(id)
                .ok_or_else(|| GmaError::InvalidArgument(format!("unknown allocation {}", id)))?;
            ensure!(
                record.resource.is_none(),
                GmaError::InvalidArgument(format!("allocation {} already has a resource", id))
            );
            ensure!(
                resource.size <= record.size,
                GmaError::InvalidArgument(format!(
                    "resource of {} bytes does not fit allocation {} of {} bytes",
                    resource.size, id, record.size
                ))
            );
            let index = inner.block_index(record.block).ok_or_else(|| {
                GmaError::Internal(format!("allocation {} names a missing block", id))
            })?;
            (inner.blocks[index].heap(), record.offset)
        };

        let handle = self.device.create_placed_resource(heap, offset, resource)?;

        let mut inner = self.inner.write();
        match inner.allocations.get_mut(&id) {
            Some(record) => {
                record.resource = Some(handle);
                record.resource_type = resource.resource_type;
                Ok(handle)
            }
            None => {
                drop(inner);
                self.device.destroy_resource(handle);
                Err(GmaError::InvalidArgument(format!(
                    "allocation {} was freed while its resource was created",
                    id
                )))
            }
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn allocation_info(&self, id: AllocationId) -> Option<Allocation> {
        let inner = self.inner.read();
        let record = inner.record(id)?;
        let block = &inner.blocks[inner.block_index(record.block)?];
        Some(Allocation {
            id,
            block_id: record.block,
            heap: block.heap(),
            offset: record.offset,
            size: record.size,
            alignment: record.alignment,
            was_zero_initialized: record.zero_initialized,
            resource: record.resource,
            resource_type: record.resource_type,
            name: record.name.clone(),
            private_data: record.private_data,
        })
    }

    pub fn set_allocation_name(&self, id: AllocationId, name: Option<String>) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .allocations
            .get_mut(&id)
            .ok_or_else(|| GmaError::InvalidArgument(format!("unknown allocation {}", id)))?;
        record.name = name;
        Ok(())
    }

    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.len()
    }

    /// Ids of blocks in scan order
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.inner.read().blocks.iter().map(NormalBlock::id).collect()
    }

    pub fn allocation_count(&self) -> usize {
        self.inner.read().allocations.len()
    }

    /// True when no block holds an allocation
    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .blocks
            .iter()
            .all(|block| block.metadata.is_empty())
    }

    /// Size of the largest block (capped at the preferred block size)
    pub fn calc_max_block_size(&self) -> u64 {
        self.inner.read().max_block_size(self.config.preferred_block_size)
    }

    /// Fully sort blocks by free space, smallest first
    pub fn sort_by_free_size(&self) {
        self.inner.write().sort_by_free_size();
    }

    pub fn set_incremental_sort(&self, enabled: bool) {
        self.inner.write().incremental_sort = enabled;
    }

    pub fn add_statistics(&self, stats: &mut Statistics) {
        let inner = self.inner.read();
        for block in &inner.blocks {
            crate::heavy_assert!(block.validate());
            block.metadata.add_statistics(stats);
        }
    }

    pub fn add_detailed_statistics(&self, stats: &mut DetailedStatistics) {
        let inner = self.inner.read();
        for block in &inner.blocks {
            crate::heavy_assert!(block.validate());
            block.metadata.add_detailed_statistics(stats);
        }
    }

    /// One JSON object per block, keyed by block id
    pub fn write_json(&self) -> serde_json::Value {
        let inner = self.inner.read();
        let mut blocks = serde_json::Map::new();
        for block in &inner.blocks {
            crate::heavy_assert!(block.validate());
            let info = block_info_json(block.metadata(), |user_data| inner.describe(user_data));
            blocks.insert(block.id().0.to_string(), info);
        }
        serde_json::Value::Object(blocks)
    }

    /// Check every block and that the registry agrees with the metadata
    pub fn validate(&self) -> bool {
        let inner = self.inner.read();
        if !inner.blocks.iter().all(NormalBlock::validate) {
            return false;
        }

        let live: usize = inner
            .blocks
            .iter()
            .map(|block| block.metadata.allocation_count())
            .sum();
        if live != inner.allocations.len() {
            return false;
        }

        inner.allocations.iter().all(|(id, record)| {
            let Some(index) = inner.block_index(record.block) else {
                return false;
            };
            let info = inner.blocks[index].metadata.allocation_info(record.handle);
            info.offset == record.offset
                && info.size == record.size
                && info.user_data == id.raw()
                && record.offset % record.alignment == 0
        })
    }

    // ========================================================================
    // ENGINE INTERNALS (shared with defragmentation)
    // ========================================================================

    pub(crate) fn lock_write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write()
    }

    /// Try to place one allocation in `inner.blocks[index]`
    pub(crate) fn allocate_from_block(
        &self,
        inner: &mut Inner,
        index: usize,
        size: u64,
        alignment: u64,
        desc: &AllocationDesc,
        defrag_temp: bool,
    ) -> Option<AllocationId> {
        let alignment = alignment.max(self.config.min_allocation_alignment);
        let request = inner.blocks[index].metadata.create_allocation_request(
            size,
            alignment,
            desc.upper_address,
            desc.strategy,
        )?;
        Some(self.commit_allocation_request(inner, &request, index, alignment, desc, defrag_temp))
    }

    /// Commit `request` into `inner.blocks[index]` and register the allocation
    pub(crate) fn commit_allocation_request(
        &self,
        inner: &mut Inner,
        request: &AllocationRequest,
        index: usize,
        alignment: u64,
        desc: &AllocationDesc,
        defrag_temp: bool,
    ) -> AllocationId {
        let id = inner.next_allocation_id();
        let block = &mut inner.blocks[index];
        let was_empty = block.metadata.is_empty();

        block.metadata.alloc(request, id.raw());
        crate::heavy_assert!(block.validate());
        let block_id = block.id();

        // The block that just filled may not be the one the flag stood for
        if was_empty {
            inner.has_empty_block = inner.has_any_empty_block();
        }

        let record = AllocationRecord {
            block: block_id,
            handle: request.handle,
            offset: request.offset,
            size: request.size,
            alignment,
            zero_initialized: request.zero_initialized,
            resource: None,
            resource_type: desc.resource_type,
            name: desc.name.clone(),
            private_data: desc.private_data,
            defrag_temp,
        };
        inner.allocations.insert(id, record);
        self.budget.add_allocation(self.group, request.size);
        id
    }

    /// Exchange the placement of two allocations of equal size
    ///
    /// `src` takes over the memory and resource of `dst` and the other way
    /// around; metadata user data is rewritten to match.
    pub(crate) fn swap_block_allocation(&self, src: AllocationId, dst: AllocationId) -> Result<()> {
        let mut inner = self.inner.write();
        let mut src_record = inner
            .allocations
            .remove(&src)
            .ok_or_else(|| GmaError::InvalidArgument(format!("unknown allocation {}", src)))?;
        let Some(dst_record) = inner.allocations.get_mut(&dst) else {
            inner.allocations.insert(src, src_record);
            bail!(GmaError::InvalidArgument(format!("unknown allocation {}", dst)));
        };

        std::mem::swap(&mut src_record.block, &mut dst_record.block);
        std::mem::swap(&mut src_record.handle, &mut dst_record.handle);
        std::mem::swap(&mut src_record.offset, &mut dst_record.offset);
        std::mem::swap(&mut src_record.resource, &mut dst_record.resource);
        let (src_place, dst_place) = (
            (src_record.block, src_record.handle),
            (dst_record.block, dst_record.handle),
        );
        inner.allocations.insert(src, src_record);

        for ((block, handle), id) in [(src_place, src), (dst_place, dst)] {
            let index = inner.block_index(block).ok_or_else(|| {
                GmaError::Internal(format!("allocation {} names a missing block", id))
            })?;
            inner.blocks[index]
                .metadata
                .set_allocation_user_data(handle, id.raw());
        }
        Ok(())
    }

    /// Turn the temporary destination `dst` into a regular allocation
    ///
    /// `dst` inherits the caller-facing description of `src`; `src` itself is
    /// left for the caller to free.
    pub(crate) fn adopt_destination(&self, src: AllocationId, dst: AllocationId) -> Result<()> {
        let mut inner = self.inner.write();
        let (resource_type, name, private_data) = {
            let record = inner
                .record(src)
                .ok_or_else(|| GmaError::InvalidArgument(format!("unknown allocation {}", src)))?;
            (record.resource_type, record.name.clone(), record.private_data)
        };
        let record = inner
            .allocations
            .get_mut(&dst)
            .ok_or_else(|| GmaError::InvalidArgument(format!("unknown allocation {}", dst)))?;
        ensure!(
            record.defrag_temp,
            GmaError::InvalidState {
                expected: "defragmentation destination".to_string(),
                actual: format!("regular allocation {}", dst),
            }
        );
        record.defrag_temp = false;
        record.resource_type = resource_type;
        record.name = name;
        record.private_data = private_data;
        Ok(())
    }

    /// Block holding `id` and that block's size
    pub(crate) fn placement(&self, id: AllocationId) -> Option<(BlockId, u64)> {
        let inner = self.inner.read();
        let record = inner.record(id)?;
        let index = inner.block_index(record.block)?;
        Some((record.block, inner.blocks[index].size()))
    }

    // ========================================================================
    // BLOCKS & BUDGET
    // ========================================================================

    fn create_block(&self, inner: &mut Inner, size: u64) -> Result<usize> {
        let id = BlockId(inner.next_block_id);
        let block = NormalBlock::create(
            id,
            size,
            &self.config,
            self.device.clone(),
            self.budget.clone(),
        )?;
        inner.next_block_id += 1;
        inner.blocks.push(block);
        Ok(inner.blocks.len() - 1)
    }

    fn try_create_block(
        &self,
        inner: &mut Inner,
        size: u64,
        free_memory: u64,
        within_budget: bool,
    ) -> Result<usize> {
        if size > free_memory {
            return Err(self.budget_rejection(size, within_budget));
        }
        self.create_block(inner, size)
    }

    /// Bytes the budget still allows; unbounded for custom heaps
    fn free_budget_memory(&self) -> u64 {
        if !self.config.heap_type.is_standard() {
            return u64::MAX;
        }
        self.budget
            .budget_for_heap_type(self.config.heap_type)
            .available()
    }

    fn is_budget_exceeded(&self) -> bool {
        self.config.heap_type.is_standard()
            && self
                .budget
                .budget_for_heap_type(self.config.heap_type)
                .is_exceeded()
    }

    fn budget_rejection(&self, requested: u64, within_budget: bool) -> GmaError {
        let heap_type = self.config.heap_type;
        let budget = self.budget.budget_for_heap_type(heap_type);
        log_event(AllocEvent::BudgetExceeded {
            heap_type: format!("{:?}", heap_type),
            requested,
            usage: budget.usage_bytes,
            budget: budget.budget_bytes,
        });

        if within_budget {
            GmaError::BudgetExceeded {
                heap_type,
                requested,
                usage: budget.usage_bytes,
                budget: budget.budget_bytes,
            }
        } else {
            GmaError::OutOfMemory {
                requested,
                available: budget.available(),
            }
        }
    }
}

impl Drop for BlockVector {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.allocations.is_empty() {
            return;
        }

        let leaked = inner.allocations.len();
        let bytes = inner.allocations.values().map(|record| record.size).sum();
        log_event(AllocEvent::LeakDetected {
            allocations: leaked,
            bytes,
        });
        for record in inner.allocations.values() {
            if let Some(resource) = record.resource {
                self.device.destroy_resource(resource);
            }
        }

        debug_assert!(
            inner.allocations.is_empty() || std::thread::panicking(),
            "{} allocations were not freed before the block vector was destroyed",
            leaked
        );
    }
}

impl fmt::Debug for BlockVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("BlockVector")
            .field("heap_type", &self.config.heap_type)
            .field("algorithm", &self.config.algorithm)
            .field("blocks", &inner.blocks)
            .field("allocations", &inner.allocations.len())
            .finish()
    }
}
