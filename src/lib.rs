// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! # flash-attn-rs
//!
//! Tiled, memory-efficient scaled dot-product attention on top of
//! [Candle](https://github.com/huggingface/candle).
//!
//! - Forward pass with online softmax and per-row log-sum-exp
//! - Backward pass recomputing probabilities from the saved log-sum-exp
//! - Causal masks, sliding windows, `ALiBi` and additive bias
//! - Grouped-query attention and packed variable-length batches
//! - Decode against a KV cache (contiguous or paged)
//! - Int4 group quantization of cached keys and values
//!
//! ## Status
//!
//! All kernels run on the host, parallelized with rayon. With the `cuda`
//! feature the dense forward pass dispatches to a `CubeCL` kernel.
//!
//! ## Quick Start
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use flash_attn_rs::kernels::{flash_attn_forward, AttentionDescriptor};
//!
//! let device = Device::Cpu;
//! // [batch, seq, heads, head_dim]
//! let q = Tensor::randn(0f32, 1.0, (2, 16, 4, 32), &device).unwrap();
//! let desc = AttentionDescriptor::builder(AttentionDescriptor::default_scale(32))
//!     .causal(true)
//!     .build()
//!     .unwrap();
//! let res = flash_attn_forward(&q, &q, &q, &desc).unwrap();
//! assert_eq!(res.out.dims(), q.dims());
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod kernels;

pub use error::{FlashAttnError, Result};
