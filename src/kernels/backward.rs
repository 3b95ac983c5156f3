// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Attention backward pass.
//!
//! Two phases:
//!
//! 1. **Preprocess**: per query row, `delta = rowsum(O * dO)` or, with
//!    [`DeltaFormulation::UseProbabilities`], `rowsum(P * dP)`. Completes for
//!    every row before phase 2 starts.
//! 2. **Main pass**: recomputes `P = exp(S - lse)` tile by tile from the
//!    stored log-sum-exp and accumulates
//!    `dV += P^T dO`, `dP = dO V^T`, `dS = P * (dP - delta) * scale`,
//!    `dK += dS^T Q`, `dQ += dS K`.
//!
//! The main pass is key-outer, query-inner. One work unit is a
//! `(batch, kv head)` pair: it owns the dK/dV rows of that head and the dQ
//! rows of every query head in its group, so units never write the same
//! memory and the scatter afterwards is serial. Results are bitwise
//! reproducible across runs.

use candle_core::{DType, Tensor};
use rayon::prelude::*;

use super::config::TileConfig;
use super::descriptor::{AttentionDescriptor, AttentionShape, DeltaFormulation};
use super::forward::{KvTileSource, StridedKv};
use super::host::{axpy, dot, gather_rows, scatter_rows, stage, unstage, RowAddressing, StatsIndex};
use super::mask::ScorePolicy;
use crate::error::{FlashAttnError, Result};

/// Gradients returned by [`flash_attn_backward`].
#[derive(Debug, Clone)]
pub struct BackwardOutput {
    /// Gradient w.r.t. Q (shape and dtype of Q).
    pub dq: Tensor,
    /// Gradient w.r.t. K, summed over each query-head group.
    pub dk: Tensor,
    /// Gradient w.r.t. V, summed over each query-head group.
    pub dv: Tensor,
    /// Per-row `delta` used by the main pass (shape of the LSE, f32).
    pub delta: Tensor,
}

/// Whether two same-shaped tensors walk memory the same way. Strides of
/// size-1 axes are never used for addressing and are ignored.
fn same_memory_layout(a: &Tensor, b: &Tensor) -> bool {
    a.dims()
        .iter()
        .zip(a.stride().iter().zip(b.stride()))
        .all(|(&dim, (sa, sb))| dim <= 1 || sa == sb)
}

/// Staged, validated backward inputs.
struct Staged {
    shape: AttentionShape,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    out: Vec<f32>,
    d_out: Vec<f32>,
    lse: Vec<f32>,
    q_addr: RowAddressing,
    k_addr: RowAddressing,
    stats: StatsIndex,
}

#[allow(clippy::too_many_arguments)]
fn stage_inputs(
    d_out: &Tensor,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    out: &Tensor,
    lse: &Tensor,
    desc: &AttentionDescriptor,
) -> Result<Staged> {
    desc.ensure_supported()?;
    let shape = desc.resolve(q, k, v)?;
    if out.dims() != q.dims() {
        return Err(FlashAttnError::ShapeMismatch {
            expected: q.dims().to_vec(),
            actual: out.dims().to_vec(),
        });
    }
    if d_out.dims() != out.dims() {
        return Err(FlashAttnError::ShapeMismatch {
            expected: out.dims().to_vec(),
            actual: d_out.dims().to_vec(),
        });
    }
    if !same_memory_layout(d_out, out) {
        return Err(FlashAttnError::Shape(format!(
            "dO strides {:?} differ from O strides {:?}",
            d_out.stride(),
            out.stride()
        )));
    }
    let stats = StatsIndex::new(&shape, desc.cu_seqlens_q());
    let lse_dims = stats.dims(shape.batch);
    if lse.dims() != lse_dims.as_slice() {
        return Err(FlashAttnError::ShapeMismatch {
            expected: lse_dims,
            actual: lse.dims().to_vec(),
        });
    }

    Ok(Staged {
        q_addr: RowAddressing::for_queries(desc.layout(), &shape, desc.cu_seqlens_q()),
        k_addr: RowAddressing::for_keys(desc.layout(), &shape, desc.cu_seqlens_k()),
        stats,
        q: stage(q)?,
        k: stage(k)?,
        v: stage(v)?,
        out: stage(out)?,
        d_out: stage(d_out)?,
        lse: stage(lse)?,
        shape,
    })
}

impl Staged {
    fn units(&self, heads: usize) -> Vec<(usize, usize)> {
        (0..self.shape.batch)
            .flat_map(|b| (0..heads).map(move |h| (b, h)))
            .collect()
    }

    fn rows(&self, src: &[f32], b: usize, h: usize) -> Vec<f32> {
        let d = self.shape.head_dim;
        let q_len = self.shape.q_lens[b];
        let mut rows = vec![0.0; q_len * d];
        gather_rows(src, &self.q_addr, b, h, 0, q_len, d, &mut rows);
        rows
    }

    fn row_stats(&self, src: &[f32], b: usize, h: usize) -> Vec<f32> {
        let base = self.stats.index(b, h, 0);
        src[base..base + self.shape.q_lens[b]].to_vec()
    }

    fn kv_source(&self, b: usize, kv_head: usize) -> StridedKv<'_> {
        StridedKv {
            k: &self.k,
            v: &self.v,
            addr: &self.k_addr,
            batch: b,
            head: kv_head,
            head_dim: self.shape.head_dim,
        }
    }

    /// Phase 1: `delta` for every query row.
    fn delta(&self, desc: &AttentionDescriptor) -> Vec<f32> {
        let shape = &self.shape;
        let d = shape.head_dim;
        let group = shape.group_size();
        let units = self.units(shape.heads_q);
        let per_unit: Vec<Vec<f32>> = units
            .par_iter()
            .map(|&(b, h)| {
                let d_out = self.rows(&self.d_out, b, h);
                match desc.delta_formulation() {
                    DeltaFormulation::UseOutput => {
                        let out = self.rows(&self.out, b, h);
                        d_out
                            .chunks_exact(d)
                            .zip(out.chunks_exact(d))
                            .map(|(g, o)| dot(g, o))
                            .collect()
                    }
                    DeltaFormulation::UseProbabilities => {
                        let q = self.rows(&self.q, b, h);
                        let lse = self.row_stats(&self.lse, b, h);
                        let (q_len, k_len) = (shape.q_lens[b], shape.k_lens[b]);
                        let policy = ScorePolicy::new(desc, b, h, shape.heads_q, q_len, k_len);
                        let kv = self.kv_source(b, h / group);
                        probability_delta(&q, &d_out, &lse, &kv, &policy, d)
                    }
                }
            })
            .collect();

        let mut delta = vec![0.0; self.stats.len(shape.batch)];
        for (&(b, h), rows) in units.iter().zip(&per_unit) {
            let base = self.stats.index(b, h, 0);
            delta[base..base + rows.len()].copy_from_slice(rows);
        }
        delta
    }
}

/// `rowsum(P * dP)` recomputed from Q, K, V and the stored LSE.
fn probability_delta<S: KvTileSource>(
    q: &[f32],
    d_out: &[f32],
    lse: &[f32],
    kv: &S,
    policy: &ScorePolicy<'_>,
    d: usize,
) -> Vec<f32> {
    let mut k_row = vec![0.0; d];
    let mut v_row = vec![0.0; d];
    (0..policy.q_len())
        .map(|i| {
            if lse[i] == f32::NEG_INFINITY {
                return 0.0;
            }
            let lse_i = policy.from_natural(lse[i]);
            let q_i = &q[i * d..(i + 1) * d];
            let do_i = &d_out[i * d..(i + 1) * d];
            policy
                .key_range(i)
                .map(|j| {
                    kv.load(j, j + 1, &mut k_row, &mut v_row);
                    let s = policy.score(dot(q_i, &k_row), i, j);
                    policy.exp(s - lse_i) * dot(do_i, &v_row)
                })
                .sum()
        })
        .collect()
}

/// Per-head inputs of one backward unit.
struct HeadRows<'a> {
    q: Vec<f32>,
    d_out: Vec<f32>,
    lse: Vec<f32>,
    delta: Vec<f32>,
    policy: ScorePolicy<'a>,
}

/// Gradients produced by one `(batch, kv head)` unit.
struct UnitGrads {
    dq: Vec<f32>,
    dk: Vec<f32>,
    dv: Vec<f32>,
}

/// Phase 2 for one unit: key tiles outer, query rows inner.
fn backward_unit<S: KvTileSource>(
    heads: &[HeadRows<'_>],
    kv: &S,
    k_len: usize,
    tiles: &TileConfig,
    d: usize,
) -> UnitGrads {
    let q_len = heads.first().map_or(0, |h| h.policy.q_len());
    let mut dq = vec![0.0; heads.len() * q_len * d];
    let mut dk = vec![0.0; k_len * d];
    let mut dv = vec![0.0; k_len * d];
    let mut k_tile = vec![0.0; tiles.block_n * d];
    let mut v_tile = vec![0.0; tiles.block_n * d];

    for kv_start in (0..k_len).step_by(tiles.block_n) {
        let kv_end = (kv_start + tiles.block_n).min(k_len);
        let n = kv_end - kv_start;
        kv.load(kv_start, kv_end, &mut k_tile[..n * d], &mut v_tile[..n * d]);
        let dk_tile = &mut dk[kv_start * d..kv_end * d];
        let dv_tile = &mut dv[kv_start * d..kv_end * d];

        for (g, head) in heads.iter().enumerate() {
            let policy = &head.policy;
            let scale = policy.softmax_scale();
            let queries = if tiles.skip_masked_tiles {
                policy.queries_for_keys(kv_start..kv_end)
            } else {
                0..q_len
            };
            for i in queries {
                if head.lse[i] == f32::NEG_INFINITY {
                    continue;
                }
                let lse_i = policy.from_natural(head.lse[i]);
                let q_i = &head.q[i * d..(i + 1) * d];
                let do_i = &head.d_out[i * d..(i + 1) * d];
                let dq_i = &mut dq[(g * q_len + i) * d..(g * q_len + i + 1) * d];
                for c in 0..n {
                    let k_c = &k_tile[c * d..(c + 1) * d];
                    let s = policy.score(dot(q_i, k_c), i, kv_start + c);
                    if s == f32::NEG_INFINITY {
                        continue;
                    }
                    let p = policy.exp(s - lse_i);
                    axpy(p, do_i, &mut dv_tile[c * d..(c + 1) * d]);
                    let dp = dot(do_i, &v_tile[c * d..(c + 1) * d]);
                    let ds = p * (dp - head.delta[i]) * scale;
                    axpy(ds, q_i, &mut dk_tile[c * d..(c + 1) * d]);
                    axpy(ds, k_c, dq_i);
                }
            }
        }
    }
    UnitGrads { dq, dk, dv }
}

/// Preprocessing phase on its own: the per-row `delta` the main pass uses.
///
/// # Errors
///
/// Same as [`flash_attn_backward`].
pub fn backward_preprocess(
    d_out: &Tensor,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    out: &Tensor,
    lse: &Tensor,
    desc: &AttentionDescriptor,
) -> Result<Tensor> {
    let staged = stage_inputs(d_out, q, k, v, out, lse, desc)?;
    let delta = staged.delta(desc);
    unstage(delta, &staged.stats.dims(staged.shape.batch), DType::F32, q.device())
}

/// Attention backward pass with the default [`TileConfig`].
///
/// `out` and `lse` must come from [`super::flash_attn_forward`] (or an
/// equivalent) with the same descriptor.
///
/// # Errors
///
/// Returns an error if shapes or strides of dO and O differ, the LSE shape
/// does not match, the tensors do not match the descriptor, or dropout is
/// requested.
pub fn flash_attn_backward(
    d_out: &Tensor,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    out: &Tensor,
    lse: &Tensor,
    desc: &AttentionDescriptor,
) -> Result<BackwardOutput> {
    flash_attn_backward_with_config(d_out, q, k, v, out, lse, desc, &TileConfig::default())
}

/// Attention backward pass with explicit tile sizes.
///
/// # Errors
///
/// Same as [`flash_attn_backward`].
#[allow(clippy::too_many_arguments)]
pub fn flash_attn_backward_with_config(
    d_out: &Tensor,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    out: &Tensor,
    lse: &Tensor,
    desc: &AttentionDescriptor,
    tiles: &TileConfig,
) -> Result<BackwardOutput> {
    tiles.validate()?;
    let staged = stage_inputs(d_out, q, k, v, out, lse, desc)?;
    let shape = &staged.shape;
    tracing::debug!(
        batch = shape.batch,
        heads_q = shape.heads_q,
        heads_k = shape.heads_k,
        seqlen_q = shape.max_seqlen_q,
        seqlen_k = shape.max_seqlen_k,
        head_dim = shape.head_dim,
        delta = ?desc.delta_formulation(),
        capabilities = ?desc.capabilities(),
        block_n = tiles.block_n,
        "flash attention backward"
    );

    let delta = staged.delta(desc);

    let d = shape.head_dim;
    let group = shape.group_size();
    let units = staged.units(shape.heads_k);
    let grads: Vec<UnitGrads> = units
        .par_iter()
        .map(|&(b, hk)| {
            let (q_len, k_len) = (shape.q_lens[b], shape.k_lens[b]);
            tracing::trace!(batch = b, kv_head = hk, q_len, k_len, "backward unit");
            let heads: Vec<HeadRows<'_>> = (hk * group..(hk + 1) * group)
                .map(|h| HeadRows {
                    q: staged.rows(&staged.q, b, h),
                    d_out: staged.rows(&staged.d_out, b, h),
                    lse: staged.row_stats(&staged.lse, b, h),
                    delta: staged.row_stats(&delta, b, h),
                    policy: ScorePolicy::new(desc, b, h, shape.heads_q, q_len, k_len),
                })
                .collect();
            backward_unit(&heads, &staged.kv_source(b, hk), k_len, tiles, d)
        })
        .collect();

    let mut dq = vec![0.0; staged.q.len()];
    let mut dk = vec![0.0; staged.k.len()];
    let mut dv = vec![0.0; staged.v.len()];
    for (&(b, hk), unit) in units.iter().zip(&grads) {
        let (q_len, k_len) = (shape.q_lens[b], shape.k_lens[b]);
        for g in 0..group {
            let rows = &unit.dq[g * q_len * d..(g + 1) * q_len * d];
            scatter_rows(rows, &staged.q_addr, b, hk * group + g, 0, q_len, d, &mut dq);
        }
        scatter_rows(&unit.dk, &staged.k_addr, b, hk, 0, k_len, d, &mut dk);
        scatter_rows(&unit.dv, &staged.k_addr, b, hk, 0, k_len, d, &mut dv);
    }

    let stats_dims = staged.stats.dims(shape.batch);
    Ok(BackwardOutput {
        dq: unstage(dq, q.dims(), q.dtype(), q.device())?,
        dk: unstage(dk, k.dims(), k.dtype(), k.device())?,
        dv: unstage(dv, v.dims(), v.dtype(), v.device())?,
        delta: unstage(delta, &stats_dims, DType::F32, q.device())?,
    })
}
