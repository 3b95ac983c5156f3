// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Attention kernels.
//!
//! - [`descriptor`] - call descriptors, layouts, masks and score terms
//! - [`forward`] / [`backward`] - tiled training kernels
//! - [`decode`] and [`kv_cache`] - incremental decoding against a cache
//! - [`quantize`] - int4 cache compression
//! - [`reference`] - untiled attention for validation

pub mod backward;
pub mod config;
pub mod cubecl;
pub mod decode;
pub mod descriptor;
pub mod forward;
pub(crate) mod host;
pub mod kv_cache;
pub(crate) mod mask;
pub mod quantize;
pub mod reference;

pub use backward::{
    backward_preprocess, flash_attn_backward, flash_attn_backward_with_config, BackwardOutput,
};
pub use config::TileConfig;
pub use decode::{flash_attn_decode, flash_attn_decode_with_config, flash_attn_with_kvcache, KvInput};
pub use descriptor::{
    AlibiSlopes, AttentionBias, AttentionDescriptor, AttentionDescriptorBuilder, AttentionShape,
    BlockTable, Capabilities, DeltaFormulation, Layout, NumericPolicy, SlidingWindow, TensorDims,
};
pub use forward::{flash_attn_forward, flash_attn_forward_with_config, ForwardOutput};
pub use kv_cache::{update_cache, KvCache};
pub use quantize::{dequantize_kv_int4, quantize_kv_int4, QuantizedKv};
pub use reference::attention_reference;
