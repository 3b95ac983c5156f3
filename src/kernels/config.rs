// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Tile configuration for the tiled attention kernels.
//!
//! `block_m` is the number of query rows processed together, `block_n` the
//! number of key/value rows loaded per step of the online softmax. Results
//! do not depend on the tile sizes beyond floating-point reassociation.

use crate::error::{FlashAttnError, Result};

/// Tile sizes for one kernel launch.
///
/// # Example
///
/// ```rust
/// use flash_attn_rs::kernels::TileConfig;
///
/// let config = TileConfig::default();
/// assert_eq!(config.num_kv_tiles(130), 3);
///
/// let decode = TileConfig::for_decode();
/// assert!(decode.block_n > decode.block_m);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileConfig {
    /// Query rows per tile.
    pub block_m: usize,

    /// Key/value rows per tile.
    pub block_n: usize,

    /// Skip key tiles (forward) and query tiles (backward) that lie entirely
    /// outside the visible band. Skipping never changes the result.
    pub skip_masked_tiles: bool,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            block_m: 64,
            block_n: 64,
            skip_masked_tiles: true,
        }
    }
}

impl TileConfig {
    /// Few query rows, long key tiles: one decoded token against a long cache.
    #[must_use]
    pub fn for_decode() -> Self {
        Self {
            block_m: 16,
            block_n: 128,
            skip_masked_tiles: true,
        }
    }

    /// Tall query tiles for long prompts.
    #[must_use]
    pub fn for_prefill() -> Self {
        Self {
            block_m: 128,
            block_n: 64,
            skip_masked_tiles: true,
        }
    }

    /// Set custom tile sizes.
    ///
    /// Zero sizes are reported by [`Self::validate`], which every entry
    /// point calls.
    #[must_use]
    pub const fn with_block_sizes(mut self, block_m: usize, block_n: usize) -> Self {
        self.block_m = block_m;
        self.block_n = block_n;
        self
    }

    /// Visit every tile, including fully masked ones.
    #[must_use]
    pub const fn without_tile_skipping(mut self) -> Self {
        self.skip_masked_tiles = false;
        self
    }

    /// Check that both tile sizes are non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`FlashAttnError::Configuration`] for a zero tile size.
    pub fn validate(&self) -> Result<()> {
        if self.block_m == 0 || self.block_n == 0 {
            return Err(FlashAttnError::Configuration(format!(
                "tile sizes must be > 0, got {}x{}",
                self.block_m, self.block_n
            )));
        }
        Ok(())
    }

    /// Number of query tiles for a sequence length.
    #[must_use]
    pub const fn num_q_tiles(&self, seq_len: usize) -> usize {
        seq_len.div_ceil(self.block_m)
    }

    /// Number of key/value tiles for a sequence length.
    #[must_use]
    pub const fn num_kv_tiles(&self, seq_len: usize) -> usize {
        seq_len.div_ceil(self.block_n)
    }

    /// Scratch memory per work unit in bytes (f32).
    ///
    /// Layout:
    /// - Q, O tiles: `block_m × head_dim` each
    /// - K, V tiles: `block_n × head_dim` each
    /// - Scores: `block_n`
    /// - Statistics: `block_m × 2` (running max and sum)
    #[must_use]
    pub const fn workspace_bytes(&self, head_dim: usize) -> usize {
        let qo = 2 * self.block_m * head_dim;
        let kv = 2 * self.block_n * head_dim;
        let scores = self.block_n;
        let stats = 2 * self.block_m;

        (qo + kv + scores + stats) * std::mem::size_of::<f32>()
    }
}
