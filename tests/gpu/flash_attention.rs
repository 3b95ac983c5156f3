// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Device forward pass against the host path.
//!
//! On a CUDA device the dense forward pass runs the `CubeCL` kernel; the
//! host path on the CPU is the reference. Without a GPU every check here
//! skips.

use anyhow::Result;
use candle_core::Device;

use flash_attn_rs::kernels::cubecl::has_cubecl_cuda_support;
use flash_attn_rs::kernels::{flash_attn_forward, AttentionDescriptor, Layout};

use crate::helpers::{AttentionProblem, ValidationUtils};
use crate::require_gpu;

/// `has_cubecl_cuda_support` agrees with GPU availability.
pub fn test_cubecl_support_detection() {
    let support = has_cubecl_cuda_support();
    if !crate::gpu::is_gpu_available() {
        assert!(!support);
    }
    println!("CubeCL CUDA support: {support}");
}

fn compare_device_to_host(problem: &AttentionProblem, desc: &AttentionDescriptor) -> Result<()> {
    let gpu = Device::new_cuda(0)?;
    let (q, k, v) = problem.qkv(&Device::Cpu)?;
    let host = flash_attn_forward(&q, &k, &v, desc)?;

    let device = flash_attn_forward(&q.to_device(&gpu)?, &k.to_device(&gpu)?, &v.to_device(&gpu)?, desc)?;
    let out = device.out.to_device(&Device::Cpu)?;
    let lse = device.lse.to_device(&Device::Cpu)?;

    let metrics = ValidationUtils::calculate_accuracy_metrics(&host.out, &out)?;
    println!("  device vs host: {metrics:?}");
    ValidationUtils::assert_close(&host.out, &out, 1e-4, 1e-4, "device out")?;
    ValidationUtils::assert_close(&host.lse, &lse, 1e-4, 1e-4, "device lse")?;
    Ok(())
}

pub fn test_device_forward_matches_host() -> Result<()> {
    require_gpu!();
    let problem = AttentionProblem::square(2, 4, 128, 64);
    let desc = AttentionDescriptor::builder(AttentionDescriptor::default_scale(64)).build()?;
    compare_device_to_host(&problem, &desc)?;

    let bhsd = AttentionDescriptor::builder(0.125).layout(Layout::Bhsd).build()?;
    compare_device_to_host(&AttentionProblem::square(1, 2, 33, 16), &bhsd)
}

pub fn test_device_causal_grouped() -> Result<()> {
    require_gpu!();
    // Unequal lengths exercise the tail-aligned diagonal on the device.
    let problem = AttentionProblem::square(1, 8, 96, 32)
        .with_kv_heads(2)
        .with_lengths(40, 96);
    let desc = AttentionDescriptor::builder(0.2).causal(true).build()?;
    compare_device_to_host(&problem, &desc)?;

    // Leading query rows see no key at all.
    let masked = AttentionProblem::square(1, 2, 4, 16).with_lengths(9, 4);
    compare_device_to_host(&masked, &desc)
}
