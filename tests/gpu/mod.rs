// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! GPU-specific tests for flash-attn-rs.
//!
//! Tests that need a device are gated on the `cuda` feature and skip when
//! no CUDA GPU is usable.
//!
//! ## Running GPU Tests
//!
//! ```bash
//! cargo test --features cuda --test integration
//! ```

pub mod flash_attention;

/// Check if a CUDA GPU is available for testing.
#[cfg(feature = "cuda")]
pub fn is_gpu_available() -> bool {
    use candle_core::{DType, Device, Tensor};

    match Device::new_cuda(0) {
        Ok(device) => match Tensor::ones((2, 2), DType::F32, &device).and_then(|t| t.sum_all()) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("GPU detected but tensor operations failed: {}", e);
                false
            }
        },
        Err(e) => {
            tracing::warn!("No CUDA GPU available: {}", e);
            false
        }
    }
}

#[cfg(not(feature = "cuda"))]
pub fn is_gpu_available() -> bool {
    false
}

/// Skip a test if no GPU is available.
///
/// Works with `Result<(), _>` return types by returning `Ok(())`.
#[macro_export]
macro_rules! require_gpu {
    () => {
        if !crate::gpu::is_gpu_available() {
            eprintln!("SKIP: Test requires CUDA GPU - use 'cargo test --features cuda'");
            return Ok(());
        }
    };
}
