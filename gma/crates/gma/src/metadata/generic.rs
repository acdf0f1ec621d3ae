//! Generic metadata: address-ordered suballocations plus a size-sorted free index.
//!
//! Placement is first fit among free regions that are at least as large as the
//! request, searched from the smallest candidate upward. Freeing merges with
//! both neighbours, so two free suballocations are never adjacent.

use super::{
    AlgorithmData, AllocHandle, AllocationInfo, AllocationRequest, Suballocation,
    SuballocationState, ZeroInitializedRange,
};
use crate::util::Alignment;
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct GenericMetadata {
    size: u64,
    debug_margin: u64,
    sum_free_size: u64,
    free_count: usize,
    /// Every suballocation keyed by its offset
    suballocations: BTreeMap<u64, Suballocation>,
    /// `(size, offset)` of every free suballocation, ascending
    free_by_size: Vec<(u64, u64)>,
    zero_initialized: ZeroInitializedRange,
}

impl GenericMetadata {
    pub fn new(size: u64, debug_margin: u64) -> Self {
        let mut metadata = GenericMetadata {
            size,
            debug_margin,
            sum_free_size: 0,
            free_count: 0,
            suballocations: BTreeMap::new(),
            free_by_size: Vec::new(),
            zero_initialized: ZeroInitializedRange::new(size),
        };
        metadata.clear();
        metadata
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn debug_margin(&self) -> u64 {
        self.debug_margin
    }

    #[inline]
    pub fn sum_free_size(&self) -> u64 {
        self.sum_free_size
    }

    #[inline]
    pub fn allocation_count(&self) -> usize {
        self.suballocations.len() - self.free_count
    }

    #[inline]
    pub fn free_regions_count(&self) -> usize {
        self.free_count
    }

    pub fn clear(&mut self) {
        self.suballocations.clear();
        self.free_by_size.clear();
        self.suballocations.insert(
            0,
            Suballocation {
                offset: 0,
                size: self.size,
                state: SuballocationState::Free,
            },
        );
        self.free_by_size.push((self.size, 0));
        self.free_count = 1;
        self.sum_free_size = self.size;
        self.zero_initialized.reset(self.size);
    }

    pub fn create_allocation_request(
        &self,
        size: u64,
        alignment: u64,
    ) -> Option<AllocationRequest> {
        let margin = self.debug_margin;
        if size > self.size || self.sum_free_size < size + 2 * margin {
            return None;
        }

        let first = self
            .free_by_size
            .partition_point(|&(free_size, _)| free_size < size + 2 * margin);
        self.free_by_size[first..]
            .iter()
            .find_map(|&(_, free_offset)| self.check_allocation(free_offset, size, alignment))
    }

    fn check_allocation(
        &self,
        free_offset: u64,
        size: u64,
        alignment: u64,
    ) -> Option<AllocationRequest> {
        let free = self.suballocations.get(&free_offset)?;
        debug_assert!(free.is_free());
        if free.size < size {
            return None;
        }

        let offset = Alignment::align_up(free.offset + self.debug_margin, alignment);
        let padding_begin = offset - free.offset;
        if padding_begin + size + self.debug_margin > free.size {
            return None;
        }

        Some(AllocationRequest {
            handle: AllocHandle::from_offset(offset),
            offset,
            size,
            zero_initialized: self
                .zero_initialized
                .is_range_zero_initialized(offset, offset + size),
            algorithm_data: AlgorithmData::Generic { free_offset },
        })
    }

    pub fn alloc(&mut self, request: &AllocationRequest, user_data: u64) {
        let free_offset = match request.algorithm_data {
            AlgorithmData::Generic { free_offset } => free_offset,
            other => panic!("generic metadata given a foreign request: {:?}", other),
        };
        let free = match self.suballocations.get(&free_offset) {
            Some(s) if s.is_free() => *s,
            _ => panic!("allocation request points at no free region (offset {})", free_offset),
        };

        let padding_begin = request.offset - free.offset;
        assert!(
            padding_begin + request.size <= free.size,
            "allocation request overruns its free region"
        );
        let padding_end = free.size - padding_begin - request.size;

        self.unregister_free(free.size, free.offset);
        self.suballocations.remove(&free.offset);
        self.free_count -= 1;

        self.suballocations.insert(
            request.offset,
            Suballocation {
                offset: request.offset,
                size: request.size,
                state: SuballocationState::Allocated { user_data },
            },
        );

        if padding_end > 0 {
            self.insert_free(request.offset + request.size, padding_end);
        }
        if padding_begin > 0 {
            self.insert_free(free.offset, padding_begin);
        }

        self.sum_free_size -= request.size;
        self.zero_initialized
            .mark_range_as_used(request.offset, request.offset + request.size);
    }

    pub fn free(&mut self, handle: AllocHandle) {
        self.free_at_offset(handle.to_offset());
    }

    /// Release the allocation starting at `offset` and merge it with free neighbours
    pub fn free_at_offset(&mut self, offset: u64) {
        let freed = match self.suballocations.get(&offset) {
            Some(s) if !s.is_free() => *s,
            Some(_) => panic!("double free of suballocation at offset {}", offset),
            None => panic!("no suballocation starts at offset {}", offset),
        };

        self.sum_free_size += freed.size;
        self.suballocations.remove(&offset);

        let mut merged_offset = freed.offset;
        let mut merged_size = freed.size;

        let next = self.suballocations.get(&freed.end()).copied();
        if let Some(next) = next.filter(Suballocation::is_free) {
            self.unregister_free(next.size, next.offset);
            self.suballocations.remove(&next.offset);
            self.free_count -= 1;
            merged_size += next.size;
        }

        let prev = self
            .suballocations
            .range(..offset)
            .next_back()
            .map(|(_, s)| *s);
        if let Some(prev) = prev.filter(Suballocation::is_free) {
            self.unregister_free(prev.size, prev.offset);
            self.suballocations.remove(&prev.offset);
            self.free_count -= 1;
            merged_offset = prev.offset;
            merged_size += prev.size;
        }

        self.insert_free(merged_offset, merged_size);
    }

    pub fn allocation_info(&self, handle: AllocHandle) -> AllocationInfo {
        let offset = handle.to_offset();
        match self.suballocations.get(&offset) {
            Some(Suballocation {
                offset,
                size,
                state: SuballocationState::Allocated { user_data },
            }) => AllocationInfo {
                offset: *offset,
                size: *size,
                user_data: *user_data,
            },
            _ => panic!("no live allocation at offset {}", offset),
        }
    }

    pub fn set_allocation_user_data(&mut self, handle: AllocHandle, user_data: u64) {
        let offset = handle.to_offset();
        match self.suballocations.get_mut(&offset) {
            Some(Suballocation {
                state: SuballocationState::Allocated { user_data: slot },
                ..
            }) => *slot = user_data,
            _ => panic!("no live allocation at offset {}", offset),
        }
    }

    pub fn allocation_list_begin(&self) -> Option<AllocHandle> {
        self.first_allocated_from(0)
    }

    pub fn next_allocation(&self, prev: AllocHandle) -> Option<AllocHandle> {
        self.first_allocated_from(prev.to_offset() + 1)
    }

    fn first_allocated_from(&self, offset: u64) -> Option<AllocHandle> {
        self.suballocations
            .range(offset..)
            .map(|(_, s)| s)
            .find(|s| !s.is_free())
            .map(|s| AllocHandle::from_offset(s.offset))
    }

    pub fn next_free_region_size(&self, handle: AllocHandle) -> u64 {
        let info = self.allocation_info(handle);
        match self.suballocations.get(&(info.offset + info.size)) {
            Some(next) if next.is_free() => next.size,
            _ => 0,
        }
    }

    pub fn for_each_suballocation<F: FnMut(Suballocation)>(&self, mut f: F) {
        for suballocation in self.suballocations.values() {
            f(*suballocation);
        }
    }

    pub fn validate(&self) -> bool {
        let mut expected_offset = 0;
        let mut prev_free = false;
        let mut free_count = 0;
        let mut sum_free = 0;

        for (&key, sub) in &self.suballocations {
            if key != sub.offset || sub.offset != expected_offset || sub.size == 0 {
                return false;
            }
            if sub.is_free() {
                if prev_free {
                    return false;
                }
                if self.free_by_size.binary_search(&(sub.size, sub.offset)).is_err() {
                    return false;
                }
                free_count += 1;
                sum_free += sub.size;
            }
            prev_free = sub.is_free();
            expected_offset += sub.size;
        }

        if expected_offset != self.size
            || free_count != self.free_count
            || sum_free != self.sum_free_size
            || self.free_by_size.len() != free_count
        {
            return false;
        }

        self.free_by_size.windows(2).all(|pair| pair[0] < pair[1])
    }

    fn insert_free(&mut self, offset: u64, size: u64) {
        self.suballocations.insert(
            offset,
            Suballocation {
                offset,
                size,
                state: SuballocationState::Free,
            },
        );
        self.free_count += 1;
        self.register_free(size, offset);
    }

    fn register_free(&mut self, size: u64, offset: u64) {
        let key = (size, offset);
        let pos = self.free_by_size.partition_point(|entry| *entry < key);
        self.free_by_size.insert(pos, key);
    }

    fn unregister_free(&mut self, size: u64, offset: u64) {
        match self.free_by_size.binary_search(&(size, offset)) {
            Ok(pos) => {
                self.free_by_size.remove(pos);
            }
            Err(_) => panic!(
                "free region (offset {}, size {}) missing from the size index",
                offset, size
            ),
        }
    }
}
