//! TLSF metadata: two-level segregated fit.
//!
//! Every region of the block, taken or free, is a node in an index arena, and
//! nodes form a doubly linked physical list in address order. Free nodes are
//! additionally threaded into one of `lists_count` size-class lists.
//!
//! Size classes:
//! - sizes up to `SMALL_BUFFER_SIZE` share memory class 0, split linearly into
//!   32 lists of 8 bytes each;
//! - larger sizes get memory class `msb(size) - 7`, split into 32 second-level
//!   lists by the next `SECOND_LEVEL_INDEX` bits below the msb.
//!
//! One bit per memory class (`is_free_bitmap`) and one bit per second-level
//! list (`inner_is_free_bitmap`) make the "smallest non-empty list at least
//! this large" lookup two bit scans.
//!
//! The last physical node is the null block: the untouched tail of the block.
//! It is free but never sits in a free list, and it may have size 0.
//!
//! A debug margin is folded into the end of the taken node, so freeing the
//! node releases its margin with it.

use super::{
    AlgorithmData, AllocHandle, AllocationInfo, AllocationRequest, AllocationStrategy,
    Suballocation, SuballocationState,
};
use crate::util::Alignment;
use gma_util::{define_idx, Idx, IndexArena};

const SMALL_BUFFER_SIZE: u64 = 256;
const SECOND_LEVEL_INDEX: u32 = 5;
const MEMORY_CLASS_SHIFT: u32 = 7;
const MAX_MEMORY_CLASSES: usize = 65 - MEMORY_CLASS_SHIFT as usize;
const SMALL_SIZE_STEP: u64 = SMALL_BUFFER_SIZE >> SECOND_LEVEL_INDEX;

define_idx!(
    /// Index of a node in a TLSF block's arena
    NodeId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    /// Member of a free list (or the null block, with both links empty)
    Free {
        prev: Option<NodeId>,
        next: Option<NodeId>,
    },
    Taken {
        user_data: u64,
    },
}

#[derive(Debug, Clone)]
struct Node {
    offset: u64,
    size: u64,
    prev_physical: Option<NodeId>,
    next_physical: Option<NodeId>,
    link: Link,
}

impl Node {
    #[inline]
    fn is_free(&self) -> bool {
        matches!(self.link, Link::Free { .. })
    }
}

#[inline]
fn size_to_memory_class(size: u64) -> u32 {
    if size > SMALL_BUFFER_SIZE {
        Alignment::bit_scan_msb(size) - MEMORY_CLASS_SHIFT
    } else {
        0
    }
}

#[inline]
fn size_to_second_index(size: u64, memory_class: u32) -> u32 {
    if memory_class == 0 {
        ((size - 1) / SMALL_SIZE_STEP) as u32
    } else {
        ((size >> (memory_class + MEMORY_CLASS_SHIFT - SECOND_LEVEL_INDEX)) as u32)
            ^ (1 << SECOND_LEVEL_INDEX)
    }
}

#[inline]
fn list_index(memory_class: u32, second_index: u32) -> usize {
    if memory_class == 0 {
        return second_index as usize;
    }
    ((memory_class - 1) as usize) * (1 << SECOND_LEVEL_INDEX)
        + second_index as usize
        + (1 << SECOND_LEVEL_INDEX)
}

#[inline]
fn list_index_for_size(size: u64) -> usize {
    let memory_class = size_to_memory_class(size);
    list_index(memory_class, size_to_second_index(size, memory_class))
}

#[inline]
fn handle_of(node: NodeId) -> AllocHandle {
    AllocHandle::from_offset(node.index() as u64)
}

#[inline]
fn node_of(handle: AllocHandle) -> NodeId {
    NodeId::from_usize(handle.to_offset() as usize)
}

#[derive(Debug)]
pub struct TlsfMetadata {
    size: u64,
    debug_margin: u64,
    alloc_count: usize,
    blocks_free_count: usize,
    /// Bytes in free-list nodes (the null block excluded)
    blocks_free_size: u64,
    is_free_bitmap: u64,
    inner_is_free_bitmap: [u32; MAX_MEMORY_CLASSES],
    lists_count: usize,
    free_list: Vec<Option<NodeId>>,
    nodes: IndexArena<NodeId, Node>,
    null_block: NodeId,
}

impl TlsfMetadata {
    pub fn new(size: u64, debug_margin: u64) -> Self {
        let mut nodes = IndexArena::new();
        let null_block = nodes.insert(Node {
            offset: 0,
            size,
            prev_physical: None,
            next_physical: None,
            link: Link::Free {
                prev: None,
                next: None,
            },
        });

        let memory_class = size_to_memory_class(size);
        let second_index = size_to_second_index(size, memory_class);
        let lists_count = if memory_class == 0 {
            0
        } else {
            (memory_class as usize - 1) * (1 << SECOND_LEVEL_INDEX) + second_index as usize
        } + 1
            + (1 << SECOND_LEVEL_INDEX);

        TlsfMetadata {
            size,
            debug_margin,
            alloc_count: 0,
            blocks_free_count: 0,
            blocks_free_size: 0,
            is_free_bitmap: 0,
            inner_is_free_bitmap: [0; MAX_MEMORY_CLASSES],
            lists_count,
            free_list: vec![None; lists_count],
            nodes,
            null_block,
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
    pub fn allocation_count(&self) -> usize {
        self.alloc_count
    }

    /// Free bytes, counting the debug margins behind live allocations
    pub fn sum_free_size(&self) -> u64 {
        self.blocks_free_size
            + self.nodes[self.null_block].size
            + self.alloc_count as u64 * self.debug_margin
    }

    pub fn free_regions_count(&self) -> usize {
        let tail = usize::from(self.nodes[self.null_block].size > 0);
        self.blocks_free_count + tail
    }

    pub fn clear(&mut self) {
        *self = TlsfMetadata::new(self.size, self.debug_margin);
    }

    pub fn create_allocation_request(
        &mut self,
        size: u64,
        alignment: u64,
        strategy: AllocationStrategy,
    ) -> Option<AllocationRequest> {
        let alloc_size = size + self.debug_margin;
        if alloc_size > self.sum_free_size() {
            return None;
        }

        let (node, offset) = self.find_placement(alloc_size, alignment, strategy)?;
        Some(AllocationRequest {
            handle: handle_of(node),
            offset,
            size,
            zero_initialized: false,
            algorithm_data: AlgorithmData::Tlsf { node },
        })
    }

    fn find_placement(
        &mut self,
        alloc_size: u64,
        alignment: u64,
        strategy: AllocationStrategy,
    ) -> Option<(NodeId, u64)> {
        let null_block = self.null_block;
        let null_list = self.lists_count;

        if self.blocks_free_count == 0 {
            return self.check_block(null_block, null_list, alloc_size, alignment);
        }

        // Smallest size whose list holds only blocks large enough for any alignment-free fit.
        let size_for_next_list = if alloc_size > SMALL_BUFFER_SIZE {
            alloc_size + (1 << (Alignment::bit_scan_msb(alloc_size) - SECOND_LEVEL_INDEX))
        } else if alloc_size > SMALL_BUFFER_SIZE - SMALL_SIZE_STEP {
            SMALL_BUFFER_SIZE + 1
        } else {
            alloc_size + SMALL_SIZE_STEP
        };

        let mut next_list_index = 0;
        match strategy {
            AllocationStrategy::MinTime => {
                let next = self.find_free_block(size_for_next_list);
                if let Some((index, head)) = next {
                    next_list_index = index;
                    if let Some(hit) = self.check_block(head, index, alloc_size, alignment) {
                        return Some(hit);
                    }
                }
                if let Some(hit) = self.check_block(null_block, null_list, alloc_size, alignment) {
                    return Some(hit);
                }
                if let Some((index, head)) = next {
                    if let Some(hit) = self.check_list(Some(head), index, alloc_size, alignment) {
                        return Some(hit);
                    }
                }
                if let Some((index, head)) = self.find_free_block(alloc_size) {
                    if let Some(hit) = self.check_list(Some(head), index, alloc_size, alignment) {
                        return Some(hit);
                    }
                }
            }
            AllocationStrategy::MinMemory => {
                if let Some((index, head)) = self.find_free_block(alloc_size) {
                    if let Some(hit) = self.check_list(Some(head), index, alloc_size, alignment) {
                        return Some(hit);
                    }
                }
                if let Some(hit) = self.check_block(null_block, null_list, alloc_size, alignment) {
                    return Some(hit);
                }
                if let Some((index, head)) = self.find_free_block(size_for_next_list) {
                    next_list_index = index;
                    if let Some(hit) = self.check_list(Some(head), index, alloc_size, alignment) {
                        return Some(hit);
                    }
                }
            }
            AllocationStrategy::MinOffset => {
                let mut candidates = Vec::with_capacity(self.blocks_free_count);
                let mut cursor = self.nodes[null_block].prev_physical;
                while let Some(id) = cursor {
                    let node = &self.nodes[id];
                    if node.is_free() && node.size >= alloc_size {
                        candidates.push(id);
                    }
                    cursor = node.prev_physical;
                }

                for &id in candidates.iter().rev() {
                    let index = list_index_for_size(self.nodes[id].size);
                    if let Some(hit) = self.check_block(id, index, alloc_size, alignment) {
                        return Some(hit);
                    }
                }
                return self.check_block(null_block, null_list, alloc_size, alignment);
            }
            AllocationStrategy::Default => {
                if let Some((index, head)) = self.find_free_block(size_for_next_list) {
                    next_list_index = index;
                    if let Some(hit) = self.check_list(Some(head), index, alloc_size, alignment) {
                        return Some(hit);
                    }
                }
                if let Some(hit) = self.check_block(null_block, null_list, alloc_size, alignment) {
                    return Some(hit);
                }
                if let Some((index, head)) = self.find_free_block(alloc_size) {
                    if let Some(hit) = self.check_list(Some(head), index, alloc_size, alignment) {
                        return Some(hit);
                    }
                }
            }
        }

        // Worst case: every list above the one already searched.
        for index in next_list_index + 1..self.lists_count {
            let head = self.free_list[index];
            if let Some(hit) = self.check_list(head, index, alloc_size, alignment) {
                return Some(hit);
            }
        }
        None
    }

    fn check_list(
        &mut self,
        head: Option<NodeId>,
        list_index: usize,
        alloc_size: u64,
        alignment: u64,
    ) -> Option<(NodeId, u64)> {
        let mut cursor = head;
        while let Some(id) = cursor {
            if let Some(hit) = self.check_block(id, list_index, alloc_size, alignment) {
                return Some(hit);
            }
            cursor = match self.nodes[id].link {
                Link::Free { next, .. } => next,
                Link::Taken { .. } => None,
            };
        }
        None
    }

    /// Aligned offset inside `id` if the request fits there
    ///
    /// A fitting free-list node moves to the front of its list.
    fn check_block(
        &mut self,
        id: NodeId,
        list_index: usize,
        alloc_size: u64,
        alignment: u64,
    ) -> Option<(NodeId, u64)> {
        let node = &self.nodes[id];
        debug_assert!(node.is_free(), "node {:?} is already taken", id);

        let aligned = Alignment::align_up(node.offset, alignment);
        if node.size < alloc_size + (aligned - node.offset) {
            return None;
        }

        if list_index != self.lists_count {
            self.move_to_front(id, list_index);
        }
        Some((id, aligned))
    }

    fn move_to_front(&mut self, id: NodeId, list_index: usize) {
        let (prev, next) = match self.nodes[id].link {
            Link::Free {
                prev: Some(prev),
                next,
            } => (prev, next),
            _ => return,
        };

        self.set_next_free(prev, next);
        if let Some(next) = next {
            self.set_prev_free(next, Some(prev));
        }
        let head = self.free_list[list_index];
        self.nodes[id].link = Link::Free { prev: None, next: head };
        if let Some(head) = head {
            self.set_prev_free(head, Some(id));
        }
        self.free_list[list_index] = Some(id);
    }

    /// Head of the smallest non-empty list whose blocks are at least `size`
    fn find_free_block(&self, size: u64) -> Option<(usize, NodeId)> {
        let mut memory_class = size_to_memory_class(size);
        let second_index = size_to_second_index(size, memory_class);
        let mut inner = self.inner_is_free_bitmap[memory_class as usize] & (u32::MAX << second_index);

        if inner == 0 {
            let outer = self.is_free_bitmap & (u64::MAX << (memory_class + 1));
            if outer == 0 {
                return None;
            }
            memory_class = Alignment::bit_scan_lsb(outer);
            inner = self.inner_is_free_bitmap[memory_class as usize];
            debug_assert!(inner != 0);
        }

        let index = list_index(memory_class, Alignment::bit_scan_lsb(u64::from(inner)));
        self.free_list[index].map(|head| (index, head))
    }

    fn set_prev_free(&mut self, id: NodeId, value: Option<NodeId>) {
        if let Link::Free { prev, .. } = &mut self.nodes[id].link {
            *prev = value;
        }
    }

    fn set_next_free(&mut self, id: NodeId, value: Option<NodeId>) {
        if let Link::Free { next, .. } = &mut self.nodes[id].link {
            *next = value;
        }
    }

    fn insert_free_block(&mut self, id: NodeId) {
        debug_assert!(id != self.null_block);
        debug_assert!(!self.nodes[id].is_free(), "node {:?} inserted twice", id);

        let size = self.nodes[id].size;
        let memory_class = size_to_memory_class(size);
        let second_index = size_to_second_index(size, memory_class);
        let index = list_index(memory_class, second_index);

        let head = self.free_list[index];
        self.nodes[id].link = Link::Free { prev: None, next: head };
        self.free_list[index] = Some(id);
        match head {
            Some(head) => self.set_prev_free(head, Some(id)),
            None => {
                self.inner_is_free_bitmap[memory_class as usize] |= 1 << second_index;
                self.is_free_bitmap |= 1 << memory_class;
            }
        }

        self.blocks_free_count += 1;
        self.blocks_free_size += size;
    }

    fn remove_free_block(&mut self, id: NodeId) {
        debug_assert!(id != self.null_block);
        let (prev, next) = match self.nodes[id].link {
            Link::Free { prev, next } => (prev, next),
            Link::Taken { .. } => panic!("node {:?} is not in a free list", id),
        };

        if let Some(next) = next {
            self.set_prev_free(next, prev);
        }
        match prev {
            Some(prev) => self.set_next_free(prev, next),
            None => {
                let size = self.nodes[id].size;
                let memory_class = size_to_memory_class(size);
                let second_index = size_to_second_index(size, memory_class);
                self.free_list[list_index(memory_class, second_index)] = next;
                if next.is_none() {
                    let inner = &mut self.inner_is_free_bitmap[memory_class as usize];
                    *inner &= !(1 << second_index);
                    if *inner == 0 {
                        self.is_free_bitmap &= !(1 << memory_class);
                    }
                }
            }
        }

        self.nodes[id].link = Link::Taken { user_data: 0 };
        self.blocks_free_count -= 1;
        self.blocks_free_size -= self.nodes[id].size;
    }

    /// Absorb `prev` (taken, physically before `id`) into `id`
    fn merge_block(&mut self, id: NodeId, prev: NodeId) {
        debug_assert_eq!(self.nodes[id].prev_physical, Some(prev));
        debug_assert!(!self.nodes[prev].is_free());

        let absorbed = self.nodes.remove(prev);
        let node = &mut self.nodes[id];
        node.offset = absorbed.offset;
        node.size += absorbed.size;
        node.prev_physical = absorbed.prev_physical;
        if let Some(before) = absorbed.prev_physical {
            self.nodes[before].next_physical = Some(id);
        }
    }

    pub fn alloc(&mut self, request: &AllocationRequest, user_data: u64) {
        let current = match request.algorithm_data {
            AlgorithmData::Tlsf { node } => node,
            other => panic!("TLSF metadata given a foreign request: {:?}", other),
        };
        assert!(
            self.nodes.contains(current) && self.nodes[current].is_free(),
            "allocation request points at a node that is no longer free"
        );
        assert!(self.nodes[current].offset <= request.offset);

        if current != self.null_block {
            self.remove_free_block(current);
        }

        // Give the alignment padding to the previous node or to a new free node.
        let missing_alignment = request.offset - self.nodes[current].offset;
        if missing_alignment > 0 {
            let prev = match self.nodes[current].prev_physical {
                Some(prev) => prev,
                None => panic!("alignment padding requested at offset 0"),
            };

            if self.nodes[prev].is_free() {
                let old_size = self.nodes[prev].size;
                let new_size = old_size + missing_alignment;
                if list_index_for_size(old_size) != list_index_for_size(new_size) {
                    self.remove_free_block(prev);
                    self.nodes[prev].size = new_size;
                    self.insert_free_block(prev);
                } else {
                    self.nodes[prev].size = new_size;
                    self.blocks_free_size += missing_alignment;
                }
            } else {
                let padding = self.nodes.insert(Node {
                    offset: self.nodes[current].offset,
                    size: missing_alignment,
                    prev_physical: Some(prev),
                    next_physical: Some(current),
                    link: Link::Taken { user_data: 0 },
                });
                self.nodes[prev].next_physical = Some(padding);
                self.nodes[current].prev_physical = Some(padding);
                self.insert_free_block(padding);
            }

            let node = &mut self.nodes[current];
            node.size -= missing_alignment;
            node.offset += missing_alignment;
        }

        let size = request.size + self.debug_margin;
        let current_size = self.nodes[current].size;
        if current_size == size {
            if current == self.null_block {
                let null_block = self.nodes.insert(Node {
                    offset: self.nodes[current].offset + size,
                    size: 0,
                    prev_physical: Some(current),
                    next_physical: None,
                    link: Link::Free {
                        prev: None,
                        next: None,
                    },
                });
                self.nodes[current].next_physical = Some(null_block);
                self.null_block = null_block;
            }
        } else {
            assert!(current_size > size, "node too small for the request it was chosen for");
            let next_physical = self.nodes[current].next_physical;
            let remainder = self.nodes.insert(Node {
                offset: self.nodes[current].offset + size,
                size: current_size - size,
                prev_physical: Some(current),
                next_physical,
                link: Link::Taken { user_data: 0 },
            });
            self.nodes[current].next_physical = Some(remainder);
            self.nodes[current].size = size;

            if current == self.null_block {
                self.nodes[remainder].link = Link::Free {
                    prev: None,
                    next: None,
                };
                self.null_block = remainder;
            } else {
                if let Some(next) = next_physical {
                    self.nodes[next].prev_physical = Some(remainder);
                }
                self.insert_free_block(remainder);
            }
        }

        self.nodes[current].link = Link::Taken { user_data };
        self.alloc_count += 1;
    }

    pub fn free(&mut self, handle: AllocHandle) {
        let mut block = node_of(handle);
        match self.nodes.get(block) {
            Some(node) if !node.is_free() => {}
            Some(_) => panic!("double free of TLSF node {:?}", block),
            None => panic!("no TLSF node {:?}", block),
        }
        let next = match self.nodes[block].next_physical {
            Some(next) => next,
            None => panic!("taken TLSF node {:?} has no physical successor", block),
        };
        self.nodes[block].link = Link::Taken { user_data: 0 };
        self.alloc_count -= 1;

        if let Some(prev) = self.nodes[block].prev_physical {
            if self.nodes[prev].is_free() {
                self.remove_free_block(prev);
                self.merge_block(block, prev);
            }
        }

        if !self.nodes[next].is_free() {
            self.insert_free_block(block);
        } else if next == self.null_block {
            self.merge_block(self.null_block, block);
        } else {
            self.remove_free_block(next);
            self.merge_block(next, block);
            block = next;
            self.insert_free_block(block);
        }
    }

    fn taken(&self, handle: AllocHandle) -> (NodeId, &Node, u64) {
        let id = node_of(handle);
        match self.nodes.get(id) {
            Some(node) => match node.link {
                Link::Taken { user_data } => (id, node, user_data),
                Link::Free { .. } => panic!("TLSF node {:?} is not allocated", id),
            },
            None => panic!("no TLSF node {:?}", id),
        }
    }

    pub fn allocation_info(&self, handle: AllocHandle) -> AllocationInfo {
        let (_, node, user_data) = self.taken(handle);
        AllocationInfo {
            offset: node.offset,
            size: node.size - self.debug_margin,
            user_data,
        }
    }

    pub fn set_allocation_user_data(&mut self, handle: AllocHandle, user_data: u64) {
        let (id, _, _) = self.taken(handle);
        self.nodes[id].link = Link::Taken { user_data };
    }

    /// Highest-addressed allocation; iteration runs toward offset 0
    pub fn allocation_list_begin(&self) -> Option<AllocHandle> {
        if self.alloc_count == 0 {
            return None;
        }
        self.first_taken_before(self.null_block)
    }

    pub fn next_allocation(&self, prev: AllocHandle) -> Option<AllocHandle> {
        let (id, _, _) = self.taken(prev);
        self.first_taken_before(id)
    }

    fn first_taken_before(&self, id: NodeId) -> Option<AllocHandle> {
        let mut cursor = self.nodes[id].prev_physical;
        while let Some(current) = cursor {
            let node = &self.nodes[current];
            if !node.is_free() {
                return Some(handle_of(current));
            }
            cursor = node.prev_physical;
        }
        None
    }

    /// Size of the free node just below the allocation, or 0
    pub fn next_free_region_size(&self, handle: AllocHandle) -> u64 {
        let (_, node, _) = self.taken(handle);
        match node.prev_physical {
            Some(prev) if self.nodes[prev].is_free() => self.nodes[prev].size,
            _ => 0,
        }
    }

    fn physical_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut cursor = Some(self.null_block);
        while let Some(id) = cursor {
            order.push(id);
            cursor = self.nodes[id].prev_physical;
        }
        order.reverse();
        order
    }

    pub fn for_each_suballocation<F: FnMut(Suballocation)>(&self, mut f: F) {
        let mut pending: Option<(u64, u64)> = None;
        let flush = |pending: &mut Option<(u64, u64)>, f: &mut F| {
            if let Some((offset, size)) = pending.take() {
                f(Suballocation {
                    offset,
                    size,
                    state: SuballocationState::Free,
                });
            }
        };

        for id in self.physical_order() {
            let node = &self.nodes[id];
            match node.link {
                Link::Free { .. } => {
                    if node.size == 0 {
                        continue;
                    }
                    pending = match pending {
                        Some((offset, size)) => Some((offset, size + node.size)),
                        None => Some((node.offset, node.size)),
                    };
                }
                Link::Taken { user_data } => {
                    flush(&mut pending, &mut f);
                    let size = node.size - self.debug_margin;
                    f(Suballocation {
                        offset: node.offset,
                        size,
                        state: SuballocationState::Allocated { user_data },
                    });
                    if self.debug_margin > 0 {
                        pending = Some((node.offset + size, self.debug_margin));
                    }
                }
            }
        }
        flush(&mut pending, &mut f);
    }

    pub fn validate(&self) -> bool {
        let null = &self.nodes[self.null_block];
        if null.next_physical.is_some() || null.link != (Link::Free { prev: None, next: None }) {
            return false;
        }
        if null.offset + null.size != self.size {
            return false;
        }

        // Physical list, walked from the tail.
        let mut expected_end = self.size;
        let mut next_id: Option<NodeId> = None;
        let mut next_free = false;
        let mut cursor = Some(self.null_block);
        let mut node_count = 0;
        let mut taken_count = 0;
        let mut free_count = 0;
        let mut free_size = 0;

        while let Some(id) = cursor {
            let node = match self.nodes.get(id) {
                Some(node) => node,
                None => return false,
            };
            if node.next_physical != next_id || node.offset + node.size != expected_end {
                return false;
            }
            if id != self.null_block {
                if node.size == 0 || (node.is_free() && next_free) {
                    return false;
                }
                if node.is_free() {
                    free_count += 1;
                    free_size += node.size;
                } else {
                    if node.size < self.debug_margin {
                        return false;
                    }
                    taken_count += 1;
                }
            }

            node_count += 1;
            next_free = node.is_free();
            next_id = Some(id);
            expected_end = node.offset;
            cursor = node.prev_physical;
        }

        if expected_end != 0
            || node_count != self.nodes.len()
            || taken_count != self.alloc_count
            || free_count != self.blocks_free_count
            || free_size != self.blocks_free_size
        {
            return false;
        }

        // Free lists and bitmaps.
        let mut listed = 0;
        for (index, &head) in self.free_list.iter().enumerate() {
            let mut prev: Option<NodeId> = None;
            let mut cursor = head;
            while let Some(id) = cursor {
                if id == self.null_block {
                    return false;
                }
                let node = &self.nodes[id];
                match node.link {
                    Link::Free { prev: link_prev, next } => {
                        if link_prev != prev || list_index_for_size(node.size) != index {
                            return false;
                        }
                        prev = Some(id);
                        cursor = next;
                    }
                    Link::Taken { .. } => return false,
                }
                listed += 1;
            }

            let memory_class = if index < (1 << SECOND_LEVEL_INDEX) {
                0
            } else {
                (index >> SECOND_LEVEL_INDEX) as u32
            };
            let second_index = (index & ((1 << SECOND_LEVEL_INDEX) - 1)) as u32;
            let inner_bit = self.inner_is_free_bitmap[memory_class as usize] & (1 << second_index) != 0;
            if inner_bit != head.is_some() {
                return false;
            }
        }

        for memory_class in 0..MAX_MEMORY_CLASSES {
            let outer_bit = self.is_free_bitmap & (1 << memory_class) != 0;
            if outer_bit != (self.inner_is_free_bitmap[memory_class] != 0) {
                return false;
            }
        }

        listed == self.blocks_free_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn allocate(
        metadata: &mut TlsfMetadata,
        size: u64,
        alignment: u64,
        strategy: AllocationStrategy,
    ) -> AllocationRequest {
        let request = metadata
            .create_allocation_request(size, alignment, strategy)
            .unwrap_or_else(|| panic!("{} bytes should fit", size));
        metadata.alloc(&request, size);
        assert!(metadata.validate());
        request
    }

    fn layout(metadata: &TlsfMetadata) -> Vec<(u64, u64, bool)> {
        let mut regions = Vec::new();
        metadata.for_each_suballocation(|s| regions.push((s.offset, s.size, s.is_free())));
        regions
    }

    #[test]
    fn test_size_classes() {
        assert_eq!(size_to_memory_class(1), 0);
        assert_eq!(size_to_memory_class(256), 0);
        assert_eq!(size_to_memory_class(257), 1);
        assert_eq!(size_to_memory_class(1024), 3);

        assert_eq!(size_to_second_index(8, 0), 0);
        assert_eq!(size_to_second_index(9, 0), 1);
        assert_eq!(size_to_second_index(256, 0), 31);
        assert_eq!(size_to_second_index(1024, 3), 0);
        assert_eq!(size_to_second_index(1535, 3), 15);

        assert_eq!(list_index_for_size(256), 31);
        assert_eq!(list_index_for_size(257), 32);
        assert_eq!(list_index_for_size(1024), 96);
        assert_eq!(TlsfMetadata::new(1024, 0).lists_count, 97);
    }

    #[test]
    fn test_three_allocations_then_free_middle() {
        let mut metadata = TlsfMetadata::new(1024, 0);
        let requests: Vec<_> = (0..3)
            .map(|_| allocate(&mut metadata, 100, 1, AllocationStrategy::Default))
            .collect();
        let offsets: Vec<_> = requests.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 100, 200]);
        assert_eq!(metadata.sum_free_size(), 724);

        metadata.free(requests[1].handle);
        assert_eq!(metadata.sum_free_size(), 824);
        assert_eq!(
            layout(&metadata),
            vec![
                (0, 100, false),
                (100, 100, true),
                (200, 100, false),
                (300, 724, true)
            ]
        );
    }

    #[test]
    fn test_strategies_pick_different_regions() {
        let mut metadata = TlsfMetadata::new(1024, 0);
        let requests: Vec<_> = (0..3)
            .map(|_| allocate(&mut metadata, 100, 1, AllocationStrategy::Default))
            .collect();
        metadata.free(requests[1].handle);

        // The exact-size hole sits in the best-fit list, not in the next larger one.
        let default = metadata
            .create_allocation_request(100, 1, AllocationStrategy::Default)
            .unwrap();
        assert_eq!(default.offset, 300);
        let min_memory = metadata
            .create_allocation_request(100, 1, AllocationStrategy::MinMemory)
            .unwrap();
        assert_eq!(min_memory.offset, 100);
        let min_offset = metadata
            .create_allocation_request(90, 1, AllocationStrategy::MinOffset)
            .unwrap();
        assert_eq!(min_offset.offset, 100);
    }

    #[test]
    fn test_alignment_padding_becomes_free_node() {
        let mut metadata = TlsfMetadata::new(1024, 0);
        allocate(&mut metadata, 10, 1, AllocationStrategy::Default);
        let aligned = allocate(&mut metadata, 64, 64, AllocationStrategy::Default);
        assert_eq!(aligned.offset, 64);
        assert_eq!(
            layout(&metadata),
            vec![(0, 10, false), (10, 54, true), (64, 64, false), (128, 896, true)]
        );
        assert_eq!(metadata.free_regions_count(), 2);
    }

    #[test]
    fn test_free_merges_back_into_null_block() {
        let mut metadata = TlsfMetadata::new(4096, 0);
        let a = allocate(&mut metadata, 512, 1, AllocationStrategy::Default);
        let b = allocate(&mut metadata, 512, 1, AllocationStrategy::Default);
        let c = allocate(&mut metadata, 512, 1, AllocationStrategy::Default);
        metadata.free(a.handle);
        metadata.free(c.handle);
        assert_eq!(metadata.free_regions_count(), 2);
        metadata.free(b.handle);

        assert!(metadata.validate());
        assert_eq!(metadata.allocation_count(), 0);
        assert_eq!(metadata.sum_free_size(), 4096);
        assert_eq!(metadata.nodes.len(), 1);
        assert_eq!(layout(&metadata), vec![(0, 4096, true)]);
    }

    #[test]
    fn test_exact_fill_leaves_empty_null_block() {
        let mut metadata = TlsfMetadata::new(256, 0);
        let a = allocate(&mut metadata, 256, 1, AllocationStrategy::Default);
        assert_eq!(metadata.sum_free_size(), 0);
        assert_eq!(metadata.free_regions_count(), 0);
        assert!(metadata
            .create_allocation_request(1, 1, AllocationStrategy::Default)
            .is_none());
        metadata.free(a.handle);
        assert_eq!(metadata.sum_free_size(), 256);
    }

    #[test]
    fn test_iteration_runs_from_highest_offset() {
        let mut metadata = TlsfMetadata::new(1024, 0);
        let a = allocate(&mut metadata, 100, 1, AllocationStrategy::Default);
        let b = allocate(&mut metadata, 100, 1, AllocationStrategy::Default);
        let c = allocate(&mut metadata, 100, 1, AllocationStrategy::Default);
        metadata.free(b.handle);

        assert_eq!(metadata.allocation_list_begin(), Some(c.handle));
        assert_eq!(metadata.next_allocation(c.handle), Some(a.handle));
        assert_eq!(metadata.next_allocation(a.handle), None);
        assert_eq!(metadata.next_free_region_size(c.handle), 100);
        assert_eq!(metadata.next_free_region_size(a.handle), 0);
    }

    #[test]
    fn test_debug_margin_travels_with_allocation() {
        let mut metadata = TlsfMetadata::new(1024, 16);
        let a = allocate(&mut metadata, 100, 1, AllocationStrategy::Default);
        let b = allocate(&mut metadata, 100, 1, AllocationStrategy::Default);
        assert_eq!(b.offset, 116);
        assert_eq!(metadata.allocation_info(a.handle).size, 100);
        assert_eq!(metadata.sum_free_size(), 824);
        assert_eq!(
            layout(&metadata),
            vec![(0, 100, false), (100, 16, true), (116, 100, false), (216, 808, true)]
        );

        metadata.free(a.handle);
        metadata.free(b.handle);
        assert_eq!(metadata.sum_free_size(), 1024);
        assert!(metadata.validate());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let mut metadata = TlsfMetadata::new(1024, 0);
        let a = allocate(&mut metadata, 100, 1, AllocationStrategy::Default);
        allocate(&mut metadata, 100, 1, AllocationStrategy::Default);
        metadata.free(a.handle);
        metadata.free(a.handle);
    }

    fn strategy_from(seed: u8) -> AllocationStrategy {
        match seed % 4 {
            0 => AllocationStrategy::Default,
            1 => AllocationStrategy::MinTime,
            2 => AllocationStrategy::MinMemory,
            _ => AllocationStrategy::MinOffset,
        }
    }

    #[quickcheck]
    fn prop_random_workload_keeps_invariants(ops: Vec<(u16, u8, bool)>) -> bool {
        let mut metadata = TlsfMetadata::new(256 * 1024, 0);
        let mut live: Vec<AllocationRequest> = Vec::new();

        for (size, seed, free) in ops.into_iter().take(200) {
            if free && !live.is_empty() {
                let victim = live.swap_remove(usize::from(size) % live.len());
                metadata.free(victim.handle);
            } else {
                let alignment = 1u64 << (seed % 9);
                let size = u64::from(size % 4096) + 1;
                if let Some(request) =
                    metadata.create_allocation_request(size, alignment, strategy_from(seed))
                {
                    if request.offset % alignment != 0 {
                        return false;
                    }
                    metadata.alloc(&request, size);
                    live.push(request);
                }
            }
            if !metadata.validate() {
                return false;
            }
        }

        let used: u64 = live.iter().map(|r| r.size).sum();
        metadata.sum_free_size() == metadata.size() - used
    }

    #[quickcheck]
    fn prop_alloc_then_free_restores_free_layout(sizes: Vec<u16>, extra: u16, seed: u8) -> bool {
        let mut metadata = TlsfMetadata::new(64 * 1024, 0);
        for size in sizes.iter().take(32).map(|&s| u64::from(s % 1024) + 1) {
            if let Some(request) =
                metadata.create_allocation_request(size, 1, AllocationStrategy::Default)
            {
                metadata.alloc(&request, 0);
            }
        }

        let free_regions = |m: &TlsfMetadata| {
            let mut regions = Vec::new();
            m.for_each_suballocation(|s| {
                if s.is_free() {
                    regions.push((s.offset, s.size));
                }
            });
            regions
        };
        let before = free_regions(&metadata);
        match metadata.create_allocation_request(u64::from(extra) + 1, 1, strategy_from(seed)) {
            Some(request) => {
                metadata.alloc(&request, 1);
                metadata.free(request.handle);
                metadata.validate() && free_regions(&metadata) == before
            }
            None => true,
        }
    }
}
