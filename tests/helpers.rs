// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Test utilities and fixtures for attention integration tests.
//!
//! Inputs are generated from a hash of `(seed, index)` so every run sees the
//! same tensors, independent of candle's RNG.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Shape of one attention problem in `[batch, seq, heads, head_dim]` form.
#[derive(Debug, Clone)]
pub struct AttentionProblem {
    pub batch: usize,
    pub heads_q: usize,
    pub heads_k: usize,
    pub seq_q: usize,
    pub seq_k: usize,
    pub head_dim: usize,
    pub seed: u64,
}

impl Default for AttentionProblem {
    fn default() -> Self {
        Self {
            batch: 2,
            heads_q: 4,
            heads_k: 4,
            seq_q: 37,
            seq_k: 37,
            head_dim: 24,
            seed: 42,
        }
    }
}

impl AttentionProblem {
    /// Square self-attention problem.
    pub fn square(batch: usize, heads: usize, seq: usize, head_dim: usize) -> Self {
        Self {
            batch,
            heads_q: heads,
            heads_k: heads,
            seq_q: seq,
            seq_k: seq,
            head_dim,
            ..Self::default()
        }
    }

    pub fn with_kv_heads(mut self, heads_k: usize) -> Self {
        self.heads_k = heads_k;
        self
    }

    pub fn with_lengths(mut self, seq_q: usize, seq_k: usize) -> Self {
        self.seq_q = seq_q;
        self.seq_k = seq_k;
        self
    }

    /// Q, K and V in `[batch, seq, heads, head_dim]` layout.
    pub fn qkv(&self, device: &Device) -> Result<(Tensor, Tensor, Tensor)> {
        let q = TestFixtures::normal_tensor(
            (self.batch, self.seq_q, self.heads_q, self.head_dim),
            1.0,
            self.seed,
            device,
        )?;
        let k = TestFixtures::normal_tensor(
            (self.batch, self.seq_k, self.heads_k, self.head_dim),
            1.0,
            self.seed + 1,
            device,
        )?;
        let v = TestFixtures::normal_tensor(
            (self.batch, self.seq_k, self.heads_k, self.head_dim),
            1.0,
            self.seed + 2,
            device,
        )?;
        Ok((q, k, v))
    }

    /// Upstream gradient shaped like the output.
    pub fn d_out(&self, device: &Device) -> Result<Tensor> {
        TestFixtures::normal_tensor(
            (self.batch, self.seq_q, self.heads_q, self.head_dim),
            1.0,
            self.seed + 3,
            device,
        )
    }
}

/// Test fixtures for deterministic tensors.
pub struct TestFixtures;

impl TestFixtures {
    /// Uniform values in `[-max, max]`.
    pub fn uniform_values(count: usize, max: f32, seed: u64) -> Vec<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        (0..count)
            .map(|i| {
                let mut hasher = DefaultHasher::new();
                (seed, i as u64).hash(&mut hasher);
                let normalized = (hasher.finish() as f64) / (u64::MAX as f64);
                ((normalized * 2.0 - 1.0) * f64::from(max)) as f32
            })
            .collect()
    }

    /// Normal values with mean 0 via Box-Muller.
    pub fn normal_values(count: usize, std: f32, seed: u64) -> Vec<f32> {
        let uniform = Self::uniform_values(count * 2, 1.0, seed);
        uniform
            .chunks_exact(2)
            .take(count)
            .map(|pair| {
                let u1 = pair[0].abs().max(1e-8);
                let u2 = pair[1];
                (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos() * std
            })
            .collect()
    }

    pub fn normal_tensor<S: Into<candle_core::Shape>>(
        shape: S,
        std: f32,
        seed: u64,
        device: &Device,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let values = Self::normal_values(shape.elem_count(), std, seed);
        Ok(Tensor::from_vec(values, shape, device)?)
    }

    /// Repeat each KV head `group` times along the head axis of a
    /// `[batch, seq, heads, dim]` tensor.
    pub fn repeat_kv(t: &Tensor, group: usize) -> Result<Tensor> {
        let (b, s, h, d) = t.dims4()?;
        Ok(t.unsqueeze(3)?
            .expand((b, s, h, group, d))?
            .reshape((b, s, h * group, d))?)
    }
}

/// Accuracy metrics for numerical validation.
#[derive(Debug, Clone)]
pub struct AccuracyMetrics {
    /// Mean Absolute Error.
    pub mae: f32,
    /// Maximum absolute error.
    pub max_error: f32,
    /// Cosine similarity between tensors.
    pub cosine_similarity: f32,
}

/// Utility functions for accuracy validation.
pub struct ValidationUtils;

impl ValidationUtils {
    pub fn calculate_accuracy_metrics(expected: &Tensor, actual: &Tensor) -> Result<AccuracyMetrics> {
        let a = expected.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let b = actual.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a.len(), b.len(), "Tensor dimensions must match");

        let mut sum_abs_error = 0.0;
        let mut max_error: f32 = 0.0;
        let (mut dot, mut norm_a, mut norm_b) = (0.0, 0.0, 0.0);
        for (x, y) in a.iter().zip(&b) {
            let error = (x - y).abs();
            sum_abs_error += error;
            max_error = max_error.max(error);
            dot += x * y;
            norm_a += x * x;
            norm_b += y * y;
        }
        let cosine_similarity = if norm_a > 0.0 && norm_b > 0.0 {
            dot / (norm_a.sqrt() * norm_b.sqrt())
        } else {
            0.0
        };
        Ok(AccuracyMetrics {
            mae: sum_abs_error / a.len().max(1) as f32,
            max_error,
            cosine_similarity,
        })
    }

    /// Largest absolute difference; both `-inf` at a position counts as 0.
    pub fn max_abs_diff(expected: &Tensor, actual: &Tensor) -> Result<f32> {
        let a = expected.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let b = actual.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a.len(), b.len(), "Tensor dimensions must match");
        Ok(a.iter()
            .zip(&b)
            .map(|(x, y)| if x == y { 0.0 } else { (x - y).abs() })
            .fold(0.0, f32::max))
    }

    /// Assert `max |expected - actual| <= atol + rtol * |expected|` elementwise.
    pub fn assert_close(expected: &Tensor, actual: &Tensor, atol: f32, rtol: f32, what: &str) -> Result<()> {
        let a = expected.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let b = actual.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a.len(), b.len(), "{what}: length mismatch");
        for (i, (x, y)) in a.iter().zip(&b).enumerate() {
            if x == y {
                continue;
            }
            assert!(
                (x - y).abs() <= atol + rtol * x.abs(),
                "{what}: element {i} differs: expected {x}, got {y}"
            );
        }
        Ok(())
    }
}
