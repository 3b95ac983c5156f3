// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! `CubeCL` GPU path for the attention forward pass.
//!
//! With the `cuda` feature enabled, [`super::flash_attn_forward`] hands dense
//! calls on CUDA tensors to the kernel in [`kernel`] and falls back to the
//! host path whenever the kernel does not cover the descriptor or the
//! launch fails.
//!
//! ## Module Structure
//!
//! - [`interop`] - Candle ↔ `CubeCL` buffer conversion
//! - `kernel` - the row-parallel online-softmax kernel and its dispatch

pub mod interop;
pub(crate) mod kernel;

pub use interop::{f32_bytes_to_tensor, has_cubecl_cuda_support, tensor_to_f32_bytes};

#[cfg(feature = "cuda")]
pub(crate) use kernel::try_forward;
