//! IndexArena - slot storage with recycled typed indices.
//!
//! Nodes of an intrusive structure (a physical block list, a free list) refer
//! to each other by index instead of by pointer. Removing a node parks its slot
//! on a vacancy stack; the next insertion reuses it, so the arena never grows
//! past the peak live count.
//!
//! ```
//! use gma_util::arena::IndexArena;
//!
//! let mut arena: IndexArena<usize, &str> = IndexArena::new();
//! let a = arena.insert("a");
//! let b = arena.insert("b");
//! assert_eq!(arena.remove(a), "a");
//! let c = arena.insert("c");
//! assert_eq!(c, a);
//! assert_eq!(arena[b], "b");
//! assert_eq!(arena.len(), 2);
//! ```

use crate::index_vec::{Idx, IndexVec};
use std::ops::{Index, IndexMut};

/// Typed-index arena with slot reuse
#[derive(Clone)]
pub struct IndexArena<I, T> {
    slots: IndexVec<I, Option<T>>,
    vacant: Vec<I>,
    live: usize,
}

impl<I: Idx, T> IndexArena<I, T> {
    pub fn new() -> Self {
        Self {
            slots: IndexVec::new(),
            vacant: Vec::new(),
            live: 0,
        }
    }

    /// Number of live elements
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of slots ever handed out (live + vacant)
    #[inline]
    pub fn capacity_used(&self) -> usize {
        self.slots.len()
    }

    /// Store `value`, reusing a vacant slot when one exists
    pub fn insert(&mut self, value: T) -> I {
        self.live += 1;
        match self.vacant.pop() {
            Some(index) => {
                debug_assert!(self.slots[index].is_none());
                self.slots[index] = Some(value);
                index
            }
            None => self.slots.push(Some(value)),
        }
    }

    /// Take the value out of `index` and mark the slot vacant
    ///
    /// # Panics
    ///
    /// Panics if the slot is already vacant.
    pub fn remove(&mut self, index: I) -> T {
        let value = self
            .slots
            .get_mut(index)
            .and_then(Option::take)
            .unwrap_or_else(|| panic!("arena slot {} is vacant", index.index()));
        self.vacant.push(index);
        self.live -= 1;
        value
    }

    #[inline]
    pub fn get(&self, index: I) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, index: I) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    #[inline]
    pub fn contains(&self, index: I) -> bool {
        self.get(index).is_some()
    }

    /// Drop every element and forget all slots
    pub fn clear(&mut self) {
        self.slots.clear();
        self.vacant.clear();
        self.live = 0;
    }

    /// Iterate over live (index, value) pairs in slot order
    pub fn iter(&self) -> impl Iterator<Item = (I, &T)> {
        self.slots
            .iter_enumerated()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i, v)))
    }
}

impl<I: Idx, T> Index<I> for IndexArena<I, T> {
    type Output = T;

    #[inline]
    fn index(&self, index: I) -> &T {
        match self.get(index) {
            Some(value) => value,
            None => panic!("arena slot {} is vacant", index.index()),
        }
    }
}

impl<I: Idx, T> IndexMut<I> for IndexArena<I, T> {
    #[inline]
    fn index_mut(&mut self, index: I) -> &mut T {
        match self.get_mut(index) {
            Some(value) => value,
            None => panic!("arena slot {} is vacant", index.index()),
        }
    }
}

impl<I: Idx, T> Default for IndexArena<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Idx, T: std::fmt::Debug> std::fmt::Debug for IndexArena<I, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexArena")
            .field("live", &self.live)
            .field("slots", &self.slots.len())
            .finish()
    }
}
