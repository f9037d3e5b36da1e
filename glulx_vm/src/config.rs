//! VM configuration parameters.
//!
//! Only two values matter to a story: how much memory the code cache may use
//! and how much undo history to keep. The rest exists for tests and benches.

use glulx_jit::code_cache::MIN_CACHE_SIZE;
use glulx_jit::CacheConfig;
use thiserror::Error;

/// Configuration for a [`Machine`](crate::Machine).
///
/// # Example
///
/// ```ignore
/// use glulx_vm::VmConfig;
///
/// let config = VmConfig {
///     cache_size: 256 * 1024,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    // =========================================================================
    // Code Cache
    // =========================================================================
    /// Code cache budget in bytes.
    ///
    /// Values below the cache minimum are raised to it.
    ///
    /// Default: 1MB
    pub cache_size: usize,

    /// Fuse adjacent micro-ops while compiling.
    ///
    /// Default: true
    pub peephole: bool,

    // =========================================================================
    // Memory
    // =========================================================================
    /// Largest memory size `setmemsize` or a restored save file may ask for.
    ///
    /// Larger `setmemsize` requests fail with status 1; larger save files are
    /// refused before any memory is allocated.
    ///
    /// Default: 64MB
    pub max_memory: u32,

    // =========================================================================
    // Undo
    // =========================================================================
    /// Total estimated size of the undo chain in bytes.
    ///
    /// The oldest records are dropped once a new record pushes the chain
    /// past this size.
    ///
    /// Default: 2MB
    pub undo_budget: usize,

    /// Maximum number of undo records regardless of their size.
    ///
    /// Default: 32
    pub max_undo_records: usize,

    // =========================================================================
    // Determinism
    // =========================================================================
    /// Seed for the random number generator.
    ///
    /// `None` seeds from the clock.
    ///
    /// Default: None
    pub random_seed: Option<u32>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            cache_size: 1024 * 1024, // 1MB
            peephole: true,
            max_memory: 64 * 1024 * 1024, // 64MB
            undo_budget: 2 * 1024 * 1024, // 2MB
            max_undo_records: 32,
            random_seed: None,
        }
    }
}

impl VmConfig {
    /// Small cache, fixed seed. Keeps test runs reproducible and makes cache
    /// pressure easy to reach.
    pub fn for_testing() -> Self {
        Self {
            cache_size: MIN_CACHE_SIZE,
            random_seed: Some(0x5EED),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }

    pub fn with_max_memory(mut self, bytes: u32) -> Self {
        self.max_memory = bytes;
        self
    }

    pub fn with_undo_budget(mut self, bytes: usize) -> Self {
        self.undo_budget = bytes;
        self
    }

    pub fn with_peephole(mut self, enabled: bool) -> Self {
        self.peephole = enabled;
        self
    }

    pub fn with_max_undo_records(mut self, records: usize) -> Self {
        self.max_undo_records = records;
        self
    }

    pub fn with_random_seed(mut self, seed: u32) -> Self {
        self.random_seed = Some(seed);
        self
    }

    /// The code cache's share of this configuration.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            size: self.cache_size.max(MIN_CACHE_SIZE),
            peephole: self.peephole,
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_undo_records == 0 && self.undo_budget != 0 {
            return Err(ConfigError::NoUndoRecords);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An undo budget was given but no record may be kept.
    #[error("undo budget is set but max_undo_records is 0")]
    NoUndoRecords,
}

// =============================================================================
// Tests
// =============================================================================
