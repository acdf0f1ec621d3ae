//! Typed-index vectors.
//!
//! Allocator structures link their entries by position. [`IndexVec`] stores
//! those entries in a plain `Vec` but only accepts the index type it was
//! declared with, so a TLSF node id cannot address the block list of a vector.
//!
//! ```
//! use gma_util::define_idx;
//! use gma_util::index_vec::IndexVec;
//!
//! define_idx!(HeapSlot);
//!
//! let mut heap_sizes: IndexVec<HeapSlot, u64> = IndexVec::new();
//! let slot = heap_sizes.push(64 << 20);
//! heap_sizes[slot] /= 2;
//! assert_eq!(heap_sizes[slot], 32 << 20);
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// Position type accepted by [`IndexVec`]
///
/// `from_usize` may panic when the position does not fit the index type.
pub trait Idx: Copy + Eq {
    fn from_usize(idx: usize) -> Self;
    fn index(self) -> usize;
}

impl Idx for usize {
    #[inline]
    fn from_usize(idx: usize) -> Self {
        idx
    }

    #[inline]
    fn index(self) -> usize {
        self
    }
}

/// `Vec<T>` addressed by `I`
#[derive(Clone)]
pub struct IndexVec<I, T> {
    entries: Vec<T>,
    _index: PhantomData<fn() -> I>,
}

impl<I, T> IndexVec<I, T> {
    #[inline]
    pub const fn new() -> Self {
        IndexVec {
            entries: Vec::new(),
            _index: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry; capacity is retained
    #[inline]
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<I: Idx, T> IndexVec<I, T> {
    /// Append `value`, returning the index it now lives at
    #[inline]
    pub fn push(&mut self, value: T) -> I {
        let at = I::from_usize(self.entries.len());
        self.entries.push(value);
        at
    }

    #[inline]
    pub fn get(&self, at: I) -> Option<&T> {
        self.entries.get(at.index())
    }

    #[inline]
    pub fn get_mut(&mut self, at: I) -> Option<&mut T> {
        self.entries.get_mut(at.index())
    }

    /// Entries paired with their typed index, lowest index first
    pub fn iter_enumerated(&self) -> impl Iterator<Item = (I, &T)> + '_ {
        (0..self.entries.len())
            .map(I::from_usize)
            .zip(self.entries.iter())
    }
}

impl<I: Idx, T> Index<I> for IndexVec<I, T> {
    type Output = T;

    #[inline]
    fn index(&self, at: I) -> &T {
        &self.entries[at.index()]
    }
}

impl<I: Idx, T> IndexMut<I> for IndexVec<I, T> {
    #[inline]
    fn index_mut(&mut self, at: I) -> &mut T {
        &mut self.entries[at.index()]
    }
}

impl<I, T> Default for IndexVec<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, T: fmt::Debug> fmt::Debug for IndexVec<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.entries, f)
    }
}

/// Declare a `u32` newtype usable as an [`Idx`]
///
/// The type is ordered and hashable so it can key maps and sort block lists.
#[macro_export]
macro_rules! define_idx {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $crate::index_vec::Idx for $name {
            #[inline]
            fn from_usize(idx: usize) -> Self {
                match u32::try_from(idx) {
                    Ok(raw) => $name(raw),
                    Err(_) => panic!("position {} exceeds u32::MAX", idx),
                }
            }

            #[inline]
            fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

#[cfg(test)]
mod tests;
