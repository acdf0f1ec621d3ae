//! Linear metadata: stack, double stack and ring buffer over one block.
//!
//! Two vectors of suballocations are kept, ordered by offset. Their logical
//! roles ("1st" and "2nd") are swapped by toggling `first_vector_index` rather
//! than moving data.
//!
//! ```text
//! Empty:        |1st 1st 1st ......................................|
//! RingBuffer:   |2nd 2nd ........ 1st 1st 1st .....................|
//! DoubleStack:  |1st 1st 1st .......................... 2nd 2nd 2nd|
//! ```
//!
//! Freed items stay in place as null items (state `Free`) until they reach an
//! end of their vector, or until the 1st vector is compacted. Ring-buffer and
//! double-stack use are mutually exclusive until the 2nd vector drains again.

use super::{
    AlgorithmData, AllocHandle, AllocationInfo, AllocationRequest, Suballocation,
    SuballocationState,
};
use crate::config::LINEAR_COMPACTION_MIN_ITEMS;
use crate::util::Alignment;

/// Where a linear request places its allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinearRequestKind {
    EndOf1st,
    EndOf2nd,
    UpperAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SecondVectorMode {
    Empty,
    RingBuffer,
    DoubleStack,
}

pub(super) fn unsupported(operation: &str) -> ! {
    panic!("{} is not supported by linear metadata", operation)
}

#[derive(Debug)]
pub struct LinearMetadata {
    size: u64,
    debug_margin: u64,
    sum_free_size: u64,
    suballocations: [Vec<Suballocation>; 2],
    first_vector_index: usize,
    second_vector_mode: SecondVectorMode,
    /// Null items at the front of the 1st vector
    first_null_items_begin_count: usize,
    /// Null items elsewhere in the 1st vector
    first_null_items_middle_count: usize,
    second_null_items_count: usize,
}

impl LinearMetadata {
    pub fn new(size: u64, debug_margin: u64) -> Self {
        LinearMetadata {
            size,
            debug_margin,
            sum_free_size: size,
            suballocations: [Vec::new(), Vec::new()],
            first_vector_index: 0,
            second_vector_mode: SecondVectorMode::Empty,
            first_null_items_begin_count: 0,
            first_null_items_middle_count: 0,
            second_null_items_count: 0,
        }
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
    fn first(&self) -> &Vec<Suballocation> {
        &self.suballocations[self.first_vector_index]
    }

    #[inline]
    fn second(&self) -> &Vec<Suballocation> {
        &self.suballocations[self.first_vector_index ^ 1]
    }

    #[inline]
    fn first_mut(&mut self) -> &mut Vec<Suballocation> {
        &mut self.suballocations[self.first_vector_index]
    }

    #[inline]
    fn second_mut(&mut self) -> &mut Vec<Suballocation> {
        &mut self.suballocations[self.first_vector_index ^ 1]
    }

    pub fn allocation_count(&self) -> usize {
        self.first().len() - self.first_null_items_begin_count - self.first_null_items_middle_count
            + self.second().len()
            - self.second_null_items_count
    }

    pub fn free_regions_count(&self) -> usize {
        let mut count = 0;
        self.for_each_suballocation(|s| {
            if s.is_free() {
                count += 1;
            }
        });
        count
    }

    pub fn clear(&mut self) {
        self.sum_free_size = self.size;
        self.suballocations[0].clear();
        self.suballocations[1].clear();
        self.first_vector_index = 0;
        self.second_vector_mode = SecondVectorMode::Empty;
        self.first_null_items_begin_count = 0;
        self.first_null_items_middle_count = 0;
        self.second_null_items_count = 0;
    }

    pub fn create_allocation_request(
        &self,
        size: u64,
        alignment: u64,
        upper_address: bool,
    ) -> Option<AllocationRequest> {
        let (offset, kind) = if upper_address {
            self.request_upper_address(size, alignment)?
        } else {
            self.request_lower_address(size, alignment)?
        };

        Some(AllocationRequest {
            handle: AllocHandle::from_offset(offset),
            offset,
            size,
            zero_initialized: false,
            algorithm_data: AlgorithmData::Linear(kind),
        })
    }

    fn request_upper_address(&self, size: u64, alignment: u64) -> Option<(u64, LinearRequestKind)> {
        assert!(
            self.second_vector_mode != SecondVectorMode::RingBuffer,
            "linear block is in use as a ring buffer and cannot serve upper-address allocations"
        );

        // Free space ends at the top of the upper stack.
        let space_end = self.second().last().map_or(self.size, |s| s.offset);
        if size > space_end {
            return None;
        }
        let mut offset = space_end - size;
        if self.debug_margin > 0 {
            if offset < self.debug_margin {
                return None;
            }
            offset -= self.debug_margin;
        }
        offset = Alignment::align_down(offset, alignment);

        let end_of_first = self.first().last().map_or(0, Suballocation::end);
        if end_of_first + self.debug_margin <= offset {
            Some((offset, LinearRequestKind::UpperAddress))
        } else {
            None
        }
    }

    fn request_lower_address(&self, size: u64, alignment: u64) -> Option<(u64, LinearRequestKind)> {
        // Once the oldest items are gone the block is used as a ring buffer:
        // reuse the freed front before appending past the newest item.
        if self.has_free_front() {
            if let Some(offset) = self.wrap_offset(size, alignment) {
                return Some((offset, LinearRequestKind::EndOf2nd));
            }
        }

        if matches!(
            self.second_vector_mode,
            SecondVectorMode::Empty | SecondVectorMode::DoubleStack
        ) {
            let base = self.first().last().map_or(0, |s| s.end() + self.debug_margin);
            let offset = Alignment::align_up(base, alignment);
            let space_end = match self.second_vector_mode {
                SecondVectorMode::DoubleStack => self.second().last().map_or(self.size, |s| s.offset),
                _ => self.size,
            };
            if offset + size + self.debug_margin <= space_end {
                return Some((offset, LinearRequestKind::EndOf1st));
            }
        }

        self.wrap_offset(size, alignment)
            .map(|offset| (offset, LinearRequestKind::EndOf2nd))
    }

    /// True when the front of the block below the oldest live item is free
    fn has_free_front(&self) -> bool {
        self.second_vector_mode != SecondVectorMode::DoubleStack
            && self
                .first()
                .get(self.first_null_items_begin_count)
                .map_or(false, |oldest| oldest.offset > 0)
    }

    /// Offset of a wrapped allocation ending before the oldest live item
    fn wrap_offset(&self, size: u64, alignment: u64) -> Option<u64> {
        if self.second_vector_mode == SecondVectorMode::DoubleStack || self.first().is_empty() {
            return None;
        }
        let margin = self.debug_margin;
        let base = self.second().last().map_or(0, |s| s.end() + margin);
        let offset = Alignment::align_up(base, alignment);
        let space_end = self
            .first()
            .get(self.first_null_items_begin_count)
            .map_or(self.size, |s| s.offset);
        (offset + size + margin <= space_end).then_some(offset)
    }

    pub fn alloc(&mut self, request: &AllocationRequest, user_data: u64) {
        let kind = match request.algorithm_data {
            AlgorithmData::Linear(kind) => kind,
            other => panic!("linear metadata given a foreign request: {:?}", other),
        };
        let item = Suballocation {
            offset: request.offset,
            size: request.size,
            state: SuballocationState::Allocated { user_data },
        };

        match kind {
            LinearRequestKind::UpperAddress => {
                assert!(
                    self.second_vector_mode != SecondVectorMode::RingBuffer,
                    "linear block is in use as a ring buffer and cannot serve upper-address allocations"
                );
                self.second_mut().push(item);
                self.second_vector_mode = SecondVectorMode::DoubleStack;
            }
            LinearRequestKind::EndOf1st => {
                debug_assert!(self.first().last().map_or(true, |s| item.offset >= s.end()));
                debug_assert!(item.end() <= self.size);
                self.first_mut().push(item);
            }
            LinearRequestKind::EndOf2nd => {
                debug_assert!(self
                    .first()
                    .get(self.first_null_items_begin_count)
                    .map_or(false, |s| item.end() <= s.offset));
                match self.second_vector_mode {
                    SecondVectorMode::Empty => {
                        debug_assert!(self.second().is_empty());
                        self.second_vector_mode = SecondVectorMode::RingBuffer;
                    }
                    SecondVectorMode::RingBuffer => debug_assert!(!self.second().is_empty()),
                    SecondVectorMode::DoubleStack => panic!(
                        "linear block is in use as a double stack and cannot wrap around as a ring buffer"
                    ),
                }
                self.second_mut().push(item);
            }
        }

        self.sum_free_size -= request.size;
    }

    pub fn free(&mut self, handle: AllocHandle) {
        let offset = handle.to_offset();

        // Oldest live item of the 1st vector.
        let begin = self.first_null_items_begin_count;
        if let Some(oldest) = self.first_mut().get_mut(begin) {
            if oldest.offset == offset {
                oldest.state = SuballocationState::Free;
                let size = oldest.size;
                self.sum_free_size += size;
                self.first_null_items_begin_count += 1;
                self.cleanup_after_free();
                return;
            }
        }

        // Newest item of the ring buffer or top of the upper stack.
        let last_vector = match self.second_vector_mode {
            SecondVectorMode::Empty => self.first_mut(),
            SecondVectorMode::RingBuffer | SecondVectorMode::DoubleStack => self.second_mut(),
        };
        if last_vector.last().map(|s| s.offset) == Some(offset) {
            if let Some(last) = last_vector.pop() {
                self.sum_free_size += last.size;
                self.cleanup_after_free();
                return;
            }
        }

        let (vector, index) = match self.locate(offset) {
            Some(found) => found,
            None => panic!("allocation at offset {} not found in linear metadata", offset),
        };
        let item = &mut self.suballocations[vector][index];
        assert!(!item.is_free(), "double free of suballocation at offset {}", offset);
        item.state = SuballocationState::Free;
        let size = item.size;
        self.sum_free_size += size;
        if vector == self.first_vector_index {
            self.first_null_items_middle_count += 1;
        } else {
            self.second_null_items_count += 1;
        }
        self.cleanup_after_free();
    }

    /// Physical vector and index of the item starting at `offset`
    fn locate(&self, offset: u64) -> Option<(usize, usize)> {
        let begin = self.first_null_items_begin_count;
        if let Ok(index) = self.first()[begin..].binary_search_by(|s| s.offset.cmp(&offset)) {
            return Some((self.first_vector_index, begin + index));
        }

        let second = self.second();
        let found = match self.second_vector_mode {
            SecondVectorMode::Empty => None,
            SecondVectorMode::RingBuffer => second.binary_search_by(|s| s.offset.cmp(&offset)).ok(),
            // Upper stack grows downward, so the vector is sorted descending.
            SecondVectorMode::DoubleStack => second.binary_search_by(|s| offset.cmp(&s.offset)).ok(),
        };
        found.map(|index| (self.first_vector_index ^ 1, index))
    }

    fn live_item(&self, handle: AllocHandle) -> &Suballocation {
        let offset = handle.to_offset();
        match self.locate(offset) {
            Some((vector, index)) if !self.suballocations[vector][index].is_free() => {
                &self.suballocations[vector][index]
            }
            _ => panic!("no live allocation at offset {}", offset),
        }
    }

    fn should_compact_first(&self) -> bool {
        let null_count = self.first_null_items_begin_count + self.first_null_items_middle_count;
        let count = self.first().len();
        count > LINEAR_COMPACTION_MIN_ITEMS && null_count * 2 >= (count - null_count) * 3
    }

    fn cleanup_after_free(&mut self) {
        if self.allocation_count() == 0 {
            self.clear();
            return;
        }

        // Null items reaching the front of the 1st vector.
        while self.first_null_items_begin_count < self.first().len()
            && self.first()[self.first_null_items_begin_count].is_free()
        {
            self.first_null_items_begin_count += 1;
            self.first_null_items_middle_count -= 1;
        }

        // Null items reaching the back of the 1st vector.
        while self.first_null_items_middle_count > 0
            && self.first().last().map_or(false, Suballocation::is_free)
        {
            self.first_null_items_middle_count -= 1;
            self.first_mut().pop();
        }

        // Null items reaching the back of the 2nd vector.
        while self.second_null_items_count > 0
            && self.second().last().map_or(false, Suballocation::is_free)
        {
            self.second_null_items_count -= 1;
            self.second_mut().pop();
        }

        // Null items reaching the front of the 2nd vector.
        while self.second_null_items_count > 0
            && self.second().first().map_or(false, Suballocation::is_free)
        {
            self.second_null_items_count -= 1;
            self.second_mut().remove(0);
        }

        if self.should_compact_first() {
            self.first_mut().retain(|s| !s.is_free());
            self.first_null_items_begin_count = 0;
            self.first_null_items_middle_count = 0;
        }

        if self.second().is_empty() {
            self.second_vector_mode = SecondVectorMode::Empty;
        }

        // 1st vector holds nothing but null items.
        if self.first().len() == self.first_null_items_begin_count {
            self.first_mut().clear();
            self.first_null_items_begin_count = 0;

            if !self.second().is_empty() && self.second_vector_mode == SecondVectorMode::RingBuffer {
                // The 2nd half of the ring becomes the 1st.
                self.second_vector_mode = SecondVectorMode::Empty;
                self.first_null_items_middle_count = self.second_null_items_count;
                self.second_null_items_count = 0;
                self.first_vector_index ^= 1;
                while self.first_null_items_begin_count < self.first().len()
                    && self.first()[self.first_null_items_begin_count].is_free()
                {
                    self.first_null_items_begin_count += 1;
                    self.first_null_items_middle_count -= 1;
                }
            }
        }
    }

    pub fn allocation_info(&self, handle: AllocHandle) -> AllocationInfo {
        let item = self.live_item(handle);
        AllocationInfo {
            offset: item.offset,
            size: item.size,
            user_data: item.user_data().unwrap_or_default(),
        }
    }

    pub fn set_allocation_user_data(&mut self, handle: AllocHandle, user_data: u64) {
        let offset = handle.to_offset();
        match self.locate(offset) {
            Some((vector, index)) if !self.suballocations[vector][index].is_free() => {
                self.suballocations[vector][index].state = SuballocationState::Allocated { user_data };
            }
            _ => panic!("no live allocation at offset {}", offset),
        }
    }

    /// Live items in address order, with the gaps between them reported as free
    pub fn for_each_suballocation<F: FnMut(Suballocation)>(&self, mut f: F) {
        let second: &[Suballocation] = self.second();
        let (lower, upper): (&[Suballocation], &[Suballocation]) = match self.second_vector_mode {
            SecondVectorMode::Empty => (&[], &[]),
            SecondVectorMode::RingBuffer => (second, &[]),
            SecondVectorMode::DoubleStack => (&[], second),
        };
        let first = &self.first()[self.first_null_items_begin_count..];

        let mut cursor = 0;
        let live = lower
            .iter()
            .chain(first.iter())
            .chain(upper.iter().rev())
            .filter(|s| !s.is_free());
        for item in live {
            if item.offset > cursor {
                f(Suballocation {
                    offset: cursor,
                    size: item.offset - cursor,
                    state: SuballocationState::Free,
                });
            }
            f(*item);
            cursor = item.end();
        }
        if cursor < self.size {
            f(Suballocation {
                offset: cursor,
                size: self.size - cursor,
                state: SuballocationState::Free,
            });
        }
    }

    pub fn validate(&self) -> bool {
        let first = self.first();
        let second = self.second();
        let margin = self.debug_margin;

        if second.is_empty() != (self.second_vector_mode == SecondVectorMode::Empty) {
            return false;
        }
        if first.is_empty() && !second.is_empty() && self.second_vector_mode == SecondVectorMode::RingBuffer {
            return false;
        }
        if !first.is_empty()
            && (first[self.first_null_items_begin_count..]
                .first()
                .map_or(true, Suballocation::is_free)
                || first.last().map_or(true, Suballocation::is_free))
        {
            return false;
        }
        if second.last().map_or(false, Suballocation::is_free) {
            return false;
        }
        if self.first_null_items_begin_count + self.first_null_items_middle_count > first.len()
            || self.second_null_items_count > second.len()
        {
            return false;
        }

        let mut walk = Walk {
            margin,
            offset: 0,
            used: 0,
        };
        let mut second_nulls = 0;

        if self.second_vector_mode == SecondVectorMode::RingBuffer
            && !walk.visit(second.iter(), &mut second_nulls)
        {
            return false;
        }

        if !first[..self.first_null_items_begin_count].iter().all(Suballocation::is_free) {
            return false;
        }
        let mut first_nulls = self.first_null_items_begin_count;
        if !walk.visit(first[self.first_null_items_begin_count..].iter(), &mut first_nulls) {
            return false;
        }
        if first_nulls != self.first_null_items_begin_count + self.first_null_items_middle_count {
            return false;
        }

        if self.second_vector_mode == SecondVectorMode::DoubleStack
            && !walk.visit(second.iter().rev(), &mut second_nulls)
        {
            return false;
        }
        if second_nulls != self.second_null_items_count {
            return false;
        }

        walk.offset <= self.size + margin && self.sum_free_size == self.size - walk.used
    }
}

/// Address-order cursor used by `validate`
struct Walk {
    margin: u64,
    offset: u64,
    used: u64,
}

impl Walk {
    fn visit<'a>(&mut self, items: impl Iterator<Item = &'a Suballocation>, nulls: &mut usize) -> bool {
        for item in items {
            if item.offset < self.offset {
                return false;
            }
            if item.is_free() {
                *nulls += 1;
            } else {
                self.used += item.size;
            }
            self.offset = item.end() + self.margin;
        }
        true
    }
}
