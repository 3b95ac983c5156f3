// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Error types for flash-attn-rs.

use thiserror::Error;

/// Result type alias for flash-attn-rs operations.
pub type Result<T> = std::result::Result<T, FlashAttnError>;

/// Errors that can occur in flash-attn-rs operations.
///
/// Every variant is a usage error at the call site; none of them is
/// transient, so there is nothing to retry.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FlashAttnError {
    /// Invalid attention descriptor (head counts, layout/offset conflicts,
    /// bias and `ALiBi` together on the decode path, ...).
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Tensor rank, size or stride mismatch.
    #[error("shape error: {0}")]
    Shape(String),

    /// Shape mismatch with both shapes known.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Feature requested that this backend does not implement.
    #[error("unsupported feature: {0}")]
    Unsupported(String),

    /// Quantization codec error.
    #[error("quantization error: {0}")]
    Quantization(String),

    /// GPU kernel error.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
