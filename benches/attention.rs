// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Attention kernel benchmarks.
//!
//! - Forward (prefill) at several sequence lengths, causal and dense
//! - Backward for the same shapes
//! - Single-token decode against a long cache, dense and int4
//! - Int4 quantization of a cache

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use flash_attn_rs::kernels::{
    flash_attn_backward, flash_attn_decode, flash_attn_forward, flash_attn_forward_with_config,
    quantize_kv_int4, AttentionDescriptor, KvInput, TileConfig,
};

use candle_core::{Device, Tensor};

const SEQ_LENS: &[usize] = &[256, 1024];
const HEADS: usize = 8;
const HEAD_DIM: usize = 64;

fn qkv(batch: usize, seq: usize, device: &Device) -> Option<(Tensor, Tensor, Tensor)> {
    let shape = (batch, seq, HEADS, HEAD_DIM);
    Some((
        Tensor::randn(0.0f32, 1.0, shape, device).ok()?,
        Tensor::randn(0.0f32, 1.0, shape, device).ok()?,
        Tensor::randn(0.0f32, 1.0, shape, device).ok()?,
    ))
}

fn benchmark_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("flash_attn_forward");
    let device = Device::Cpu;

    for &seq_len in SEQ_LENS {
        let Some((q, k, v)) = qkv(1, seq_len, &device) else {
            continue;
        };
        for causal in [false, true] {
            let Ok(desc) = AttentionDescriptor::builder(AttentionDescriptor::default_scale(HEAD_DIM))
                .causal(causal)
                .build()
            else {
                continue;
            };
            let id = format!("s{seq_len}_causal{causal}");
            group.bench_with_input(BenchmarkId::new("default", &id), &desc, |b, desc| {
                b.iter(|| flash_attn_forward(&q, &k, &v, desc).unwrap());
            });
            let tiles = TileConfig::for_prefill();
            group.bench_with_input(BenchmarkId::new("prefill_tiles", &id), &desc, |b, desc| {
                b.iter(|| flash_attn_forward_with_config(&q, &k, &v, desc, &tiles).unwrap());
            });
        }

        let workspace = TileConfig::default().workspace_bytes(HEAD_DIM);
        println!("Per-unit workspace (seq={seq_len}): {} KB", workspace / 1024);
    }

    group.finish();
}

fn benchmark_backward(c: &mut Criterion) {
    let mut group = c.benchmark_group("flash_attn_backward");
    let device = Device::Cpu;

    for &seq_len in SEQ_LENS {
        let Some((q, k, v)) = qkv(1, seq_len, &device) else {
            continue;
        };
        let Ok(desc) = AttentionDescriptor::builder(AttentionDescriptor::default_scale(HEAD_DIM))
            .causal(true)
            .build()
        else {
            continue;
        };
        let Ok(fwd) = flash_attn_forward(&q, &k, &v, &desc) else {
            continue;
        };
        let Ok(d_out) = Tensor::randn(0.0f32, 1.0, q.dims(), &device) else {
            continue;
        };

        group.bench_function(BenchmarkId::new("causal", seq_len), |b| {
            b.iter(|| flash_attn_backward(&d_out, &q, &k, &v, &fwd.out, &fwd.lse, &desc).unwrap());
        });
    }

    group.finish();
}

fn benchmark_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("flash_attn_decode");
    let device = Device::Cpu;

    for &cache_len in &[1024, 4096] {
        let Some((_, k, v)) = qkv(4, cache_len, &device) else {
            continue;
        };
        let Ok(q) = Tensor::randn(0.0f32, 1.0, (4, 1, HEADS, HEAD_DIM), &device) else {
            continue;
        };
        let Ok(desc) = AttentionDescriptor::builder(AttentionDescriptor::default_scale(HEAD_DIM)).build() else {
            continue;
        };

        group.bench_function(BenchmarkId::new("dense", cache_len), |b| {
            b.iter(|| flash_attn_decode(&q, KvInput::Dense { k: &k, v: &v }, &desc).unwrap());
        });

        let (Ok(kq), Ok(vq)) = (quantize_kv_int4(&k, 32), quantize_kv_int4(&v, 32)) else {
            continue;
        };
        println!(
            "Int4 cache (len={cache_len}): {:.2}x smaller than f32",
            kq.compression_ratio()
        );
        group.bench_function(BenchmarkId::new("int4", cache_len), |b| {
            b.iter(|| flash_attn_decode(&q, KvInput::Quantized { k: &kq, v: &vq }, &desc).unwrap());
        });
    }

    group.finish();
}

fn benchmark_quantize(c: &mut Criterion) {
    let mut group = c.benchmark_group("quantize_kv_int4");
    let device = Device::Cpu;

    for &group_size in &[32, 64] {
        let Ok(cache) = Tensor::randn(0.0f32, 1.0, (4, 2048, HEADS, HEAD_DIM), &device) else {
            continue;
        };
        group.bench_function(BenchmarkId::new("group", group_size), |b| {
            b.iter(|| quantize_kv_int4(&cache, group_size).unwrap());
        });
    }

    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .sample_size(10)
        .measurement_time(std::time::Duration::from_secs(5));
    targets = benchmark_forward, benchmark_backward, benchmark_decode, benchmark_quantize
);
criterion_main!(benches);
