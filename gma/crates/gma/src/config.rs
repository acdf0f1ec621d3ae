//! Configuration Module - Block Vector and Defragmentation Tuning
//!
//! Policy parameters for one block vector (block sizing, block count limits,
//! placement algorithm) and for a defragmentation context (algorithm and
//! per-pass limits). Numeric heuristics shared by the engine live at the bottom
//! of the file as named constants.

use crate::budget::HeapType;
use crate::defrag::DefragmentationAlgorithm;
use crate::device::ResourceClass;
use crate::metadata::MetadataAlgorithm;
use serde::{Deserialize, Serialize};

/// Configuration for one block vector
///
/// # Examples
///
/// ```rust
/// use gma::{BlockVectorConfig, MetadataAlgorithm};
///
/// let config = BlockVectorConfig {
///     preferred_block_size: 16 * 1024 * 1024,
///     algorithm: MetadataAlgorithm::Linear,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVectorConfig {
    /// Heap type every block of this vector is created in
    ///
    /// Custom heaps are exempt from budget checks.
    /// Default: `HeapType::Default`
    pub heap_type: HeapType,

    /// Resource class the vector serves (tags JSON output and heap creation)
    ///
    /// Default: `ResourceClass::Unknown`
    pub resource_class: ResourceClass,

    /// Preferred size of a new block in bytes
    ///
    /// Requests larger than this (plus the debug margin) are rejected up front
    /// so the caller can fall back to a dedicated allocation.
    /// Default: 64MB
    pub preferred_block_size: u64,

    /// Blocks kept alive even when empty
    ///
    /// Default: 0
    pub min_block_count: usize,

    /// Upper bound on block count
    ///
    /// Default: `usize::MAX`
    pub max_block_count: usize,

    /// Always create blocks of exactly `preferred_block_size`
    ///
    /// When false, the first blocks of a vector start at 1/2, 1/4 or 1/8 of the
    /// preferred size while demand is small.
    /// Default: false
    pub explicit_block_size: bool,

    /// Alignment applied to every allocation on top of the requested one
    ///
    /// Must be a power of two.
    /// Default: 1
    pub min_allocation_alignment: u64,

    /// Suballocation algorithm used by every block of this vector
    ///
    /// Default: `MetadataAlgorithm::Tlsf`
    pub algorithm: MetadataAlgorithm,

    /// Bytes reserved after every allocation
    ///
    /// Default: 0
    pub debug_margin: u64,
}

impl Default for BlockVectorConfig {
    fn default() -> Self {
        BlockVectorConfig {
            heap_type: HeapType::Default,
            resource_class: ResourceClass::Unknown,
            preferred_block_size: DEFAULT_BLOCK_SIZE,
            min_block_count: 0,
            max_block_count: usize::MAX,
            explicit_block_size: false,
            min_allocation_alignment: 1,
            algorithm: MetadataAlgorithm::Tlsf,
            debug_margin: 0,
        }
    }
}

impl BlockVectorConfig {
    /// Validate configuration
    ///
    /// # Examples
    ///
    /// ```rust
    /// use gma::BlockVectorConfig;
    ///
    /// let config = BlockVectorConfig {
    ///     preferred_block_size: 0,
    ///     ..Default::default()
    /// };
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preferred_block_size == 0 {
            return Err(ConfigError::InvalidBlockSize(
                "preferred_block_size must be > 0".to_string(),
            ));
        }

        if self.max_block_count == 0 {
            return Err(ConfigError::InvalidBlockCount(
                "max_block_count must be > 0".to_string(),
            ));
        }

        if self.min_block_count > self.max_block_count {
            return Err(ConfigError::InvalidBlockCount(
                "min_block_count cannot exceed max_block_count".to_string(),
            ));
        }

        if !self.min_allocation_alignment.is_power_of_two() {
            return Err(ConfigError::InvalidAlignment(format!(
                "min_allocation_alignment ({}) must be a power of two",
                self.min_allocation_alignment
            )));
        }

        if self.debug_margin >= self.preferred_block_size {
            return Err(ConfigError::InvalidDebugMargin(format!(
                "debug_margin ({}) must be smaller than preferred_block_size ({})",
                self.debug_margin, self.preferred_block_size
            )));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with:
    /// - GMA_PREFERRED_BLOCK_SIZE
    /// - GMA_MIN_BLOCK_COUNT
    /// - GMA_MAX_BLOCK_COUNT
    /// - GMA_ALGORITHM (`generic`, `linear`, `tlsf`)
    /// - GMA_DEBUG_MARGIN
    ///
    /// Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = env_parse::<u64>("GMA_PREFERRED_BLOCK_SIZE") {
            config.preferred_block_size = size;
        }

        if let Some(count) = env_parse::<usize>("GMA_MIN_BLOCK_COUNT") {
            config.min_block_count = count;
        }

        if let Some(count) = env_parse::<usize>("GMA_MAX_BLOCK_COUNT") {
            config.max_block_count = count;
        }

        if let Some(algorithm) = env_parse::<MetadataAlgorithm>("GMA_ALGORITHM") {
            config.algorithm = algorithm;
        }

        if let Some(margin) = env_parse::<u64>("GMA_DEBUG_MARGIN") {
            config.debug_margin = margin;
        }

        config
    }
}

/// Configuration for a defragmentation context
///
/// A zero limit means "unlimited".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DefragmentationConfig {
    /// Move selection algorithm
    ///
    /// Default: `DefragmentationAlgorithm::Balanced`
    pub algorithm: DefragmentationAlgorithm,

    /// Maximum bytes moved in one pass (0 = unlimited)
    pub max_bytes_per_pass: u64,

    /// Maximum allocations moved in one pass (0 = unlimited)
    pub max_allocations_per_pass: u32,
}

impl DefragmentationConfig {
    /// Build configuration from environment variables
    ///
    /// - GMA_DEFRAG_ALGORITHM (`fast`, `balanced`, `full`)
    /// - GMA_DEFRAG_MAX_BYTES
    /// - GMA_DEFRAG_MAX_ALLOCATIONS
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(algorithm) = env_parse::<DefragmentationAlgorithm>("GMA_DEFRAG_ALGORITHM") {
            config.algorithm = algorithm;
        }

        if let Some(bytes) = env_parse::<u64>("GMA_DEFRAG_MAX_BYTES") {
            config.max_bytes_per_pass = bytes;
        }

        if let Some(count) = env_parse::<u32>("GMA_DEFRAG_MAX_ALLOCATIONS") {
            config.max_allocations_per_pass = count;
        }

        config
    }

    /// Per-pass byte limit with 0 mapped to unlimited
    pub fn pass_byte_limit(&self) -> u64 {
        if self.max_bytes_per_pass == 0 {
            u64::MAX
        } else {
            self.max_bytes_per_pass
        }
    }

    /// Per-pass allocation limit with 0 mapped to unlimited
    pub fn pass_allocation_limit(&self) -> u32 {
        if self.max_allocations_per_pass == 0 {
            u32::MAX
        } else {
            self.max_allocations_per_pass
        }
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid block size: {0}")]
    InvalidBlockSize(String),

    #[error("Invalid block count: {0}")]
    InvalidBlockCount(String),

    #[error("Invalid alignment: {0}")]
    InvalidAlignment(String),

    #[error("Invalid debug margin: {0}")]
    InvalidDebugMargin(String),
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|val| val.trim().parse().ok())
}

// ============================================================================
// CONSTANTS & HELPERS
// ============================================================================

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * 1024;

/// Preferred block size when none is configured
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * MB;

/// How many times a new block may be halved below the preferred size
pub const NEW_BLOCK_SIZE_SHIFT_MAX: u32 = 3;

/// Allocations a defragmentation pass may skip for exceeding the byte limit
/// before the pass ends early
pub const MAX_ALLOCS_TO_IGNORE: u32 = 16;

/// Budget counter operations between two queries of the memory info source
pub const BUDGET_REFETCH_INTERVAL: u32 = 30;

/// Linear metadata compacts its 1st vector only above this many items
pub const LINEAR_COMPACTION_MIN_ITEMS: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BlockVectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.preferred_block_size, 64 * MB);
        assert_eq!(config.algorithm, MetadataAlgorithm::Tlsf);
        assert!(!config.explicit_block_size);
    }

    #[test]
    fn test_invalid_block_count() {
        let config = BlockVectorConfig {
            min_block_count: 4,
            max_block_count: 2,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBlockCount(_))
        ));
    }

    #[test]
    fn test_invalid_alignment() {
        let config = BlockVectorConfig {
            min_allocation_alignment: 3,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAlignment(_))
        ));
    }

    #[test]
    fn test_margin_must_fit_block() {
        let config = BlockVectorConfig {
            preferred_block_size: 1024,
            debug_margin: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defrag_limits_zero_means_unlimited() {
        let config = DefragmentationConfig::default();
        assert_eq!(config.algorithm, DefragmentationAlgorithm::Balanced);
        assert_eq!(config.pass_byte_limit(), u64::MAX);
        assert_eq!(config.pass_allocation_limit(), u32::MAX);

        let limited = DefragmentationConfig {
            max_bytes_per_pass: 4096,
            max_allocations_per_pass: 8,
            ..Default::default()
        };
        assert_eq!(limited.pass_byte_limit(), 4096);
        assert_eq!(limited.pass_allocation_limit(), 8);
    }

    #[test]
    fn test_config_serializes() {
        let config = BlockVectorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: BlockVectorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
