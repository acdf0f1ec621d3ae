//! gma-util - Foundation Types
//!
//! ============================================================================
//! MODULE OVERVIEW
//! ============================================================================
//!
//! Typed indices shared by the allocator crates. Block metadata keeps its nodes
//! in arenas and links them by index; typing those indices keeps node ids of
//! one structure from being used to address another.
//!
//! - [`index_vec`]: `Idx`, `IndexVec`, and the `define_idx!` macro
//! - [`arena`]: `IndexArena`, an `IndexVec` with vacant-slot recycling

pub mod arena;
pub mod index_vec;

pub use arena::IndexArena;
pub use index_vec::{Idx, IndexVec};

static_assertions::assert_eq_size!(IndexVec<usize, u64>, Vec<u64>);
