//! Defragmentation - Pass-Based Relocation of Live Allocations
//!
//! ============================================================================
//! PROTOCOL
//! ============================================================================
//!
//! ```text
//!            pass_begin()             caller copies            pass_end(moves)
//! Idle ───────────────────► PassActive ─────────────► (content) ──────────────► PassCommitted
//!   │                          ▲                                                     │
//!   │ no moves                 └──────────────────── pass_begin() ◄──────────────────┘
//!   ▼                                                                                │
//! Done ◄──────────────────────── no moves / nothing committed ───────────────────────┘
//! ```
//!
//! `pass_begin` computes moves under each vector's write lock and reserves a
//! temporary destination allocation for every move. Between the two calls the
//! caller copies resource content without any allocator lock held, then sets
//! each move's [`MoveOperation`]:
//!
//! - `Copy`: the source id takes over the destination memory; the old memory
//!   (held by the temporary id) is freed.
//! - `Ignore`: the destination is released and the source block is treated as
//!   immovable for later passes.
//! - `Destroy`: the caller destroyed the source resource; the source is
//!   released and the destination stays as a regular allocation under the
//!   `dst_tmp` id.
//!
//! The caller must not allocate from or free into a vector with moves in
//! flight. This is not enforced.
//!
//! ============================================================================
//! ALGORITHMS
//! ============================================================================
//!
//! - Fast: only moves allocations from later blocks into earlier ones.
//! - Balanced: like Full, but repacks within a block only when the local gap
//!   is significant compared to average free-region and allocation sizes.
//! - Full: moves between blocks, otherwise repacks within the block toward the
//!   lowest offset.
//!
//! Linear block vectors cannot be defragmented.

mod algorithms;

use crate::block::BlockId;
use crate::block_vector::{AllocationId, BlockVector};
use crate::config::DefragmentationConfig;
use crate::error::{GmaError, Result};
use crate::logging::{log_event, AllocEvent};
use crate::metadata::MetadataAlgorithm;
use crate::stats::DefragmentationStats;
use crate::ensure;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Move selection algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DefragmentationAlgorithm {
    Fast,
    #[default]
    Balanced,
    Full,
}

impl FromStr for DefragmentationAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(DefragmentationAlgorithm::Fast),
            "balanced" => Ok(DefragmentationAlgorithm::Balanced),
            "full" => Ok(DefragmentationAlgorithm::Full),
            other => Err(format!("unknown defragmentation algorithm '{}'", other)),
        }
    }
}

/// Outcome of one move, chosen by the caller before `pass_end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MoveOperation {
    #[default]
    Copy,
    Ignore,
    Destroy,
}

/// One relocation proposed by `pass_begin`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefragmentationMove {
    pub operation: MoveOperation,
    /// Allocation being moved; keeps its id after a `Copy`
    pub src: AllocationId,
    /// Temporary allocation reserving the destination
    pub dst_tmp: AllocationId,
    /// Bytes to copy
    pub size: u64,
    /// Index of the owning vector in the context
    pub vector: usize,
}

/// Context lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragmentationState {
    Idle,
    PassActive,
    PassCommitted,
    Done,
}

/// Averages steering the Balanced algorithm, per vector
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct VectorState {
    /// `None` until computed or after invalidation
    pub(crate) averages: Option<Averages>,
    /// Blocks at the front of the vector that hold immovable allocations
    pub(crate) immovable_block_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Averages {
    pub(crate) free_size: u64,
    pub(crate) alloc_size: u64,
}

/// Resumable defragmentation over one or more block vectors
///
/// Incremental block sorting is suspended on every vector for the lifetime of
/// the context.
#[derive(Debug)]
pub struct DefragmentationContext<'a> {
    vectors: Vec<&'a BlockVector>,
    config: DefragmentationConfig,
    state: DefragmentationState,
    pub(crate) vector_states: Vec<VectorState>,
    pub(crate) moves: Vec<DefragmentationMove>,
    pub(crate) pass_stats: DefragmentationStats,
    global_stats: DefragmentationStats,
    pub(crate) ignored_allocations: u32,
    pass_index: u32,
}

impl<'a> DefragmentationContext<'a> {
    /// Start defragmenting `vectors`
    ///
    /// Fails with `Unsupported` if any vector uses linear metadata.
    pub fn new(vectors: &[&'a BlockVector], config: DefragmentationConfig) -> Result<Self> {
        if let Some(linear) = vectors
            .iter()
            .position(|v| v.algorithm() == MetadataAlgorithm::Linear)
        {
            return Err(GmaError::Unsupported(format!(
                "vector {} uses linear metadata, which cannot be defragmented",
                linear
            )));
        }

        for vector in vectors {
            vector.set_incremental_sort(false);
            vector.sort_by_free_size();
        }

        Ok(DefragmentationContext {
            vectors: vectors.to_vec(),
            config,
            state: DefragmentationState::Idle,
            vector_states: vec![VectorState::default(); vectors.len()],
            moves: Vec::new(),
            pass_stats: DefragmentationStats::default(),
            global_stats: DefragmentationStats::default(),
            ignored_allocations: 0,
            pass_index: 0,
        })
    }

    /// Convenience constructor for a single vector
    pub fn for_vector(vector: &'a BlockVector, config: DefragmentationConfig) -> Result<Self> {
        Self::new(&[vector], config)
    }

    #[inline]
    pub fn state(&self) -> DefragmentationState {
        self.state
    }

    /// Totals of every committed pass
    #[inline]
    pub fn stats(&self) -> DefragmentationStats {
        self.global_stats
    }

    #[inline]
    pub(crate) fn config(&self) -> &DefragmentationConfig {
        &self.config
    }

    /// Compute the next batch of moves
    ///
    /// An empty result means there is nothing left to do and the context is
    /// `Done`. Otherwise the caller copies the content of every move, sets its
    /// operation and hands the list back to [`pass_end`](Self::pass_end).
    pub fn pass_begin(&mut self) -> Result<Vec<DefragmentationMove>> {
        ensure!(
            matches!(
                self.state,
                DefragmentationState::Idle | DefragmentationState::PassCommitted
            ),
            GmaError::InvalidState {
                expected: "Idle or PassCommitted".to_string(),
                actual: format!("{:?}", self.state),
            }
        );

        self.ignored_allocations = 0;
        self.pass_index += 1;

        for index in 0..self.vectors.len() {
            let vector = self.vectors[index];
            let mut inner = vector.lock_write();
            let immovable = self.vector_states[index].immovable_block_count;
            let end = match inner.blocks.len() {
                0 => false,
                1 if immovable == 0 => self.realloc_within_block(vector, &mut inner, index, 0),
                1 => false,
                _ => self.compute_defragmentation(vector, &mut inner, index),
            };
            drop(inner);
            if end {
                break;
            }
        }

        log_event(AllocEvent::DefragPassBegin {
            pass: self.pass_index,
            moves: self.moves.len(),
        });

        if self.moves.is_empty() {
            self.state = DefragmentationState::Done;
        } else {
            self.state = DefragmentationState::PassActive;
        }
        Ok(self.moves.clone())
    }

    /// Commit the moves returned by the last `pass_begin`
    ///
    /// Returns true when another pass may find more work: a move changed the
    /// layout, or an ignored move marked a new block as immovable. Returns
    /// false when the context is `Done`.
    pub fn pass_end(&mut self, moves: &[DefragmentationMove]) -> Result<bool> {
        ensure!(
            self.state == DefragmentationState::PassActive,
            GmaError::InvalidState {
                expected: "PassActive".to_string(),
                actual: format!("{:?}", self.state),
            }
        );
        ensure!(
            moves.len() == self.moves.len()
                && moves.iter().zip(&self.moves).all(|(given, pending)| {
                    given.src == pending.src
                        && given.dst_tmp == pending.dst_tmp
                        && given.vector == pending.vector
                }),
            GmaError::InvalidArgument("move list does not match the active pass".to_string())
        );

        let mut changed = false;
        let mut immovable: Vec<(usize, BlockId)> = Vec::new();

        for mv in moves {
            let vector = self.vectors[mv.vector];
            let mut prev_count = 0;
            let mut current_count = 0;
            let mut freed_block_size = 0;

            match mv.operation {
                MoveOperation::Copy => {
                    vector.swap_block_allocation(mv.src, mv.dst_tmp)?;
                    prev_count = vector.block_count();
                    freed_block_size = self.block_size_of(vector, mv.dst_tmp)?;
                    vector.free(mv.dst_tmp)?;
                    current_count = vector.block_count();
                    changed = true;
                }
                MoveOperation::Ignore => {
                    self.pass_stats.bytes_moved -= mv.size;
                    self.pass_stats.allocations_moved -= 1;
                    vector.free(mv.dst_tmp)?;

                    let (block, _) = vector.placement(mv.src).ok_or_else(|| {
                        GmaError::Internal(format!("moved allocation {} vanished", mv.src))
                    })?;
                    if !immovable.contains(&(mv.vector, block)) {
                        immovable.push((mv.vector, block));
                    }
                }
                MoveOperation::Destroy => {
                    self.pass_stats.bytes_moved -= mv.size;
                    self.pass_stats.allocations_moved -= 1;

                    vector.adopt_destination(mv.src, mv.dst_tmp)?;
                    prev_count = vector.block_count();
                    freed_block_size = self.block_size_of(vector, mv.src)?;
                    vector.free(mv.src)?;
                    current_count = vector.block_count();
                    changed = true;
                }
            }

            if prev_count > current_count {
                self.pass_stats.heaps_freed += (prev_count - current_count) as u32;
                self.pass_stats.bytes_freed += freed_block_size;
            }
        }
        self.moves.clear();

        log_event(AllocEvent::DefragPassEnd {
            pass: self.pass_index,
            bytes_moved: self.pass_stats.bytes_moved,
            allocations_moved: self.pass_stats.allocations_moved,
            heaps_freed: self.pass_stats.heaps_freed,
        });
        self.global_stats.add(&self.pass_stats);
        self.pass_stats = DefragmentationStats::default();

        // Blocks holding immovable allocations go to the front so later passes
        // stop treating them as sources
        let mut new_immovable = false;
        for (vector_index, block) in immovable {
            let state = &mut self.vector_states[vector_index];
            let mut inner = self.vectors[vector_index].lock_write();
            let start = state.immovable_block_count.min(inner.blocks.len());
            if let Some(found) = inner.blocks[start..].iter().position(|b| b.id() == block) {
                inner.blocks.swap(start + found, start);
                state.immovable_block_count = start + 1;
                new_immovable = true;
            }
        }

        let more = changed || new_immovable;
        self.state = if more {
            DefragmentationState::PassCommitted
        } else {
            DefragmentationState::Done
        };
        Ok(more)
    }

    fn block_size_of(&self, vector: &BlockVector, id: AllocationId) -> Result<u64> {
        vector
            .placement(id)
            .map(|(_, size)| size)
            .ok_or_else(|| GmaError::Internal(format!("moved allocation {} vanished", id)))
    }
}

impl Drop for DefragmentationContext<'_> {
    fn drop(&mut self) {
        if self.state == DefragmentationState::PassActive {
            for mv in std::mem::take(&mut self.moves) {
                if let Err(err) = self.vectors[mv.vector].free(mv.dst_tmp) {
                    log::error!("failed to release defragmentation destination {}: {}", mv.dst_tmp, err);
                }
            }
        }
        for vector in &self.vectors {
            vector.set_incremental_sort(true);
        }
    }
}
