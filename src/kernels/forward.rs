// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Tiled attention forward pass.
//!
//! Each `(batch, query head)` pair is an independent work unit. A unit walks
//! its queries in tiles of `block_m` rows and, for each query tile, streams
//! key/value tiles of `block_n` rows in increasing key order, keeping a
//! running maximum `m`, running sum `l` and unnormalized accumulator per
//! row. The full score matrix is never materialized; memory per unit is
//! bounded by [`TileConfig::workspace_bytes`].
//!
//! Rows that see no key at all produce a zero output and a log-sum-exp of
//! `-inf`.
//!
//! ## Example
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use flash_attn_rs::kernels::{flash_attn_forward, AttentionDescriptor, Layout};
//!
//! let device = Device::Cpu;
//! let q = Tensor::randn(0f32, 1.0, (1, 2, 8, 16), &device).unwrap();
//! let desc = AttentionDescriptor::builder(0.25)
//!     .layout(Layout::Bhsd)
//!     .causal(true)
//!     .build()
//!     .unwrap();
//! let res = flash_attn_forward(&q, &q, &q, &desc).unwrap();
//! assert_eq!(res.out.dims(), &[1, 2, 8, 16]);
//! assert_eq!(res.lse.dims(), &[1, 2, 8]);
//! ```

use candle_core::{DType, Tensor};
use rayon::prelude::*;

use super::config::TileConfig;
use super::descriptor::AttentionDescriptor;
use super::host::{axpy, dot, gather_rows, scatter_rows, stage, unstage, RowAddressing, StatsIndex};
use super::mask::ScorePolicy;
use crate::error::Result;

/// Output of [`flash_attn_forward`].
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Attention output, same shape and dtype as Q.
    pub out: Tensor,
    /// Per-row log-sum-exp in natural-log units (f32): `[batch, heads_q,
    /// seqlen_q]`, or `[heads_q, total_q]` for packed layouts.
    pub lse: Tensor,
}

/// Source of key/value rows for one `(batch, kv head)`.
pub(crate) trait KvTileSource: Sync {
    /// Load rows `[start, end)` into row-major `head_dim`-wide tiles.
    fn load(&self, start: usize, end: usize, k_tile: &mut [f32], v_tile: &mut [f32]);
}

/// Keys and values of a staged Q/K/V-style tensor.
pub(crate) struct StridedKv<'a> {
    pub(crate) k: &'a [f32],
    pub(crate) v: &'a [f32],
    pub(crate) addr: &'a RowAddressing,
    pub(crate) batch: usize,
    pub(crate) head: usize,
    pub(crate) head_dim: usize,
}

impl KvTileSource for StridedKv<'_> {
    fn load(&self, start: usize, end: usize, k_tile: &mut [f32], v_tile: &mut [f32]) {
        let d = self.head_dim;
        gather_rows(self.k, self.addr, self.batch, self.head, start, end, d, k_tile);
        gather_rows(self.v, self.addr, self.batch, self.head, start, end, d, v_tile);
    }
}

/// Output rows and log-sum-exp of one work unit.
pub(crate) struct HeadOutput {
    pub(crate) out: Vec<f32>,
    pub(crate) lse: Vec<f32>,
}

struct Scratch {
    k_tile: Vec<f32>,
    v_tile: Vec<f32>,
    scores: Vec<f32>,
    row_max: Vec<f32>,
    row_sum: Vec<f32>,
}

impl Scratch {
    fn new(tiles: &TileConfig, head_dim: usize) -> Self {
        Self {
            k_tile: vec![0.0; tiles.block_n * head_dim],
            v_tile: vec![0.0; tiles.block_n * head_dim],
            scores: vec![0.0; tiles.block_n],
            row_max: vec![f32::NEG_INFINITY; tiles.block_m],
            row_sum: vec![0.0; tiles.block_m],
        }
    }
}

/// Run the online softmax for all queries of one unit.
///
/// `q_rows` holds `policy.q_len()` rows of `head_dim` elements.
pub(crate) fn forward_head<S: KvTileSource>(
    q_rows: &[f32],
    kv: &S,
    policy: &ScorePolicy<'_>,
    tiles: &TileConfig,
    head_dim: usize,
) -> HeadOutput {
    let q_len = policy.q_len();
    let mut out = vec![0.0; q_len * head_dim];
    let mut lse = vec![f32::NEG_INFINITY; q_len];
    let mut scratch = Scratch::new(tiles, head_dim);

    for q_start in (0..q_len).step_by(tiles.block_m) {
        let q_end = (q_start + tiles.block_m).min(q_len);
        let span = q_start * head_dim..q_end * head_dim;
        attend_query_tile(
            &q_rows[span.clone()],
            q_start..q_end,
            kv,
            policy,
            tiles,
            head_dim,
            &mut scratch,
            &mut out[span],
            &mut lse[q_start..q_end],
        );
    }
    HeadOutput { out, lse }
}

#[allow(clippy::too_many_arguments)]
fn attend_query_tile<S: KvTileSource>(
    q_tile: &[f32],
    rows: std::ops::Range<usize>,
    kv: &S,
    policy: &ScorePolicy<'_>,
    tiles: &TileConfig,
    d: usize,
    scratch: &mut Scratch,
    out_tile: &mut [f32],
    lse_tile: &mut [f32],
) {
    let Scratch {
        k_tile,
        v_tile,
        scores,
        row_max,
        row_sum,
    } = scratch;
    let n_rows = rows.len();
    let k_len = policy.k_len();
    row_max[..n_rows].fill(f32::NEG_INFINITY);
    row_sum[..n_rows].fill(0.0);

    let keys = if tiles.skip_masked_tiles {
        policy.keys_for_rows(rows.clone())
    } else {
        0..k_len
    };

    // Keep tile boundaries where an unskipped walk would put them.
    let mut kv_start = keys.start / tiles.block_n * tiles.block_n;
    while kv_start < keys.end {
        let kv_end = (kv_start + tiles.block_n).min(k_len);
        let n = kv_end - kv_start;
        kv.load(kv_start, kv_end, &mut k_tile[..n * d], &mut v_tile[..n * d]);

        for r in 0..n_rows {
            let i = rows.start + r;
            let q_row = &q_tile[r * d..(r + 1) * d];
            let mut tile_max = f32::NEG_INFINITY;
            for c in 0..n {
                let s = policy.score(dot(q_row, &k_tile[c * d..(c + 1) * d]), i, kv_start + c);
                scores[c] = s;
                tile_max = tile_max.max(s);
            }

            let m_prev = row_max[r];
            let m_new = m_prev.max(tile_max);
            if m_new == f32::NEG_INFINITY {
                continue;
            }
            let alpha = policy.exp(m_prev - m_new);
            let acc = &mut out_tile[r * d..(r + 1) * d];
            if alpha != 1.0 {
                acc.iter_mut().for_each(|a| *a *= alpha);
            }
            let mut l = row_sum[r] * alpha;
            for (c, &s) in scores[..n].iter().enumerate() {
                if s == f32::NEG_INFINITY {
                    continue;
                }
                let p = policy.exp(s - m_new);
                l += p;
                axpy(p, &v_tile[c * d..(c + 1) * d], acc);
            }
            row_sum[r] = l;
            row_max[r] = m_new;
        }
        kv_start = kv_end;
    }

    for r in 0..n_rows {
        let acc = &mut out_tile[r * d..(r + 1) * d];
        let l = row_sum[r];
        if l > 0.0 {
            let inv = 1.0 / l;
            acc.iter_mut().for_each(|a| *a *= inv);
            lse_tile[r] = policy.to_natural(row_max[r] + policy.log(l));
        } else {
            acc.fill(0.0);
            lse_tile[r] = f32::NEG_INFINITY;
        }
    }
}

/// Tiled attention forward pass with the default [`TileConfig`].
///
/// # Errors
///
/// Returns an error if the tensors do not match the descriptor, or if the
/// descriptor requests dropout.
pub fn flash_attn_forward(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    desc: &AttentionDescriptor,
) -> Result<ForwardOutput> {
    flash_attn_forward_with_config(q, k, v, desc, &TileConfig::default())
}

/// Tiled attention forward pass with explicit tile sizes.
///
/// With the `cuda` feature, CUDA tensors whose descriptor the device kernel
/// supports run on the GPU; everything else runs on the host path.
///
/// # Errors
///
/// Same as [`flash_attn_forward`].
pub fn flash_attn_forward_with_config(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    desc: &AttentionDescriptor,
    tiles: &TileConfig,
) -> Result<ForwardOutput> {
    tiles.validate()?;
    desc.ensure_supported()?;
    let shape = desc.resolve(q, k, v)?;
    tracing::debug!(
        batch = shape.batch,
        heads_q = shape.heads_q,
        heads_k = shape.heads_k,
        seqlen_q = shape.max_seqlen_q,
        seqlen_k = shape.max_seqlen_k,
        head_dim = shape.head_dim,
        layout = ?desc.layout(),
        capabilities = ?desc.capabilities(),
        block_m = tiles.block_m,
        block_n = tiles.block_n,
        "flash attention forward"
    );

    #[cfg(feature = "cuda")]
    {
        if let Some(res) = super::cubecl::try_forward(q, k, v, desc, &shape) {
            return Ok(res);
        }
    }

    let d = shape.head_dim;
    let qs = stage(q)?;
    let ks = stage(k)?;
    let vs = stage(v)?;
    let q_addr = RowAddressing::for_queries(desc.layout(), &shape, desc.cu_seqlens_q());
    let k_addr = RowAddressing::for_keys(desc.layout(), &shape, desc.cu_seqlens_k());
    let stats = StatsIndex::new(&shape, desc.cu_seqlens_q());
    let group = shape.group_size();

    let units: Vec<(usize, usize)> = (0..shape.batch)
        .flat_map(|b| (0..shape.heads_q).map(move |h| (b, h)))
        .collect();
    let results: Vec<HeadOutput> = units
        .par_iter()
        .map(|&(b, h)| {
            let (q_len, k_len) = (shape.q_lens[b], shape.k_lens[b]);
            tracing::trace!(batch = b, head = h, q_len, k_len, "forward unit");
            let mut q_rows = vec![0.0; q_len * d];
            gather_rows(&qs, &q_addr, b, h, 0, q_len, d, &mut q_rows);
            let kv = StridedKv {
                k: &ks,
                v: &vs,
                addr: &k_addr,
                batch: b,
                head: h / group,
                head_dim: d,
            };
            let policy = ScorePolicy::new(desc, b, h, shape.heads_q, q_len, k_len);
            forward_head(&q_rows, &kv, &policy, tiles, d)
        })
        .collect();

    let mut out = vec![0.0; qs.len()];
    let mut lse = vec![f32::NEG_INFINITY; stats.len(shape.batch)];
    for (&(b, h), unit) in units.iter().zip(&results) {
        let q_len = shape.q_lens[b];
        scatter_rows(&unit.out, &q_addr, b, h, 0, q_len, d, &mut out);
        let base = stats.index(b, h, 0);
        lse[base..base + q_len].copy_from_slice(&unit.lse);
    }

    Ok(ForwardOutput {
        out: unstage(out, q.dims(), q.dtype(), q.device())?,
        lse: unstage(lse, &stats.dims(shape.batch), DType::F32, q.device())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{attention_reference, Layout, NumericPolicy};
    use candle_core::Device;

    fn max_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn qkv(b: usize, h: usize, hk: usize, sq: usize, sk: usize, d: usize) -> (Tensor, Tensor, Tensor) {
        let device = Device::Cpu;
        (
            Tensor::randn(0f32, 1.0, (b, h, sq, d), &device).unwrap(),
            Tensor::randn(0f32, 1.0, (b, hk, sk, d), &device).unwrap(),
            Tensor::randn(0f32, 1.0, (b, hk, sk, d), &device).unwrap(),
        )
    }

    #[test]
    fn test_forward_shapes() {
        let (q, k, v) = qkv(2, 4, 4, 5, 7, 8);
        let desc = AttentionDescriptor::builder(0.35).layout(Layout::Bhsd).build().unwrap();
        let res = flash_attn_forward(&q, &k, &v, &desc).unwrap();
        assert_eq!(res.out.dims(), &[2, 4, 5, 8]);
        assert_eq!(res.lse.dims(), &[2, 4, 5]);
        assert_eq!(res.lse.dtype(), DType::F32);
    }

    #[test]
    fn test_forward_matches_reference_across_tiles() {
        let (q, k, v) = qkv(1, 2, 2, 37, 45, 16);
        let desc = AttentionDescriptor::builder(0.25)
            .layout(Layout::Bhsd)
            .causal(true)
            .build()
            .unwrap();
        let reference = attention_reference(&q, &k, &v, &desc).unwrap();
        for tiles in [
            TileConfig::default(),
            TileConfig::default().with_block_sizes(8, 16),
            TileConfig::default().with_block_sizes(5, 3),
        ] {
            let res = flash_attn_forward_with_config(&q, &k, &v, &desc, &tiles).unwrap();
            assert!(max_diff(&res.out, &reference.out) < 1e-4, "{tiles:?}");
            assert!(max_diff(&res.lse, &reference.lse) < 1e-4, "{tiles:?}");
        }
    }

    #[test]
    fn test_tile_skipping_is_exact() {
        let (q, k, v) = qkv(1, 1, 1, 40, 40, 8);
        let desc = AttentionDescriptor::builder(0.3)
            .layout(Layout::Bhsd)
            .causal(true)
            .sliding_window(Some(6), None)
            .build()
            .unwrap();
        let tiles = TileConfig::default().with_block_sizes(8, 8);
        let skipped = flash_attn_forward_with_config(&q, &k, &v, &desc, &tiles).unwrap();
        let full =
            flash_attn_forward_with_config(&q, &k, &v, &desc, &tiles.without_tile_skipping()).unwrap();
        assert_eq!(max_diff(&skipped.out, &full.out), 0.0);
        assert_eq!(max_diff(&skipped.lse, &full.lse), 0.0);
    }

    #[test]
    fn test_fully_masked_rows() {
        // 4 queries, 2 keys, causal: rows 0 and 1 see nothing.
        let (q, k, v) = qkv(1, 1, 1, 4, 2, 4);
        let desc = AttentionDescriptor::builder(0.5)
            .layout(Layout::Bhsd)
            .causal(true)
            .build()
            .unwrap();
        let res = flash_attn_forward(&q, &k, &v, &desc).unwrap();
        let out = res.out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let lse = res.lse.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(out.iter().all(|x| x.is_finite()));
        assert!(out[..8].iter().all(|&x| x == 0.0));
        assert_eq!(lse[0], f32::NEG_INFINITY);
        assert_eq!(lse[1], f32::NEG_INFINITY);
        assert!(lse[2].is_finite() && lse[3].is_finite());
    }

    #[test]
    fn test_base2_policy_matches_natural() {
        let (q, k, v) = qkv(1, 2, 1, 9, 12, 8);
        let natural = AttentionDescriptor::builder(0.4)
            .layout(Layout::Bhsd)
            .alibi_slopes(vec![0.5, 0.25])
            .build()
            .unwrap();
        let base2 = AttentionDescriptor::builder(0.4)
            .layout(Layout::Bhsd)
            .alibi_slopes(vec![0.5, 0.25])
            .numeric_policy(NumericPolicy::Base2)
            .build()
            .unwrap();
        let a = flash_attn_forward(&q, &k, &v, &natural).unwrap();
        let b = flash_attn_forward(&q, &k, &v, &base2).unwrap();
        assert!(max_diff(&a.out, &b.out) < 1e-5);
        assert!(max_diff(&a.lse, &b.lse) < 1e-4);
    }

    #[test]
    fn test_dropout_unsupported() {
        let (q, k, v) = qkv(1, 1, 1, 2, 2, 4);
        let desc = AttentionDescriptor::builder(1.0)
            .layout(Layout::Bhsd)
            .dropout(0.1)
            .build()
            .unwrap();
        assert!(matches!(
            flash_attn_forward(&q, &k, &v, &desc),
            Err(crate::FlashAttnError::Unsupported(_))
        ));
    }

    #[test]
    fn test_preserves_dtype() {
        let (q, k, v) = qkv(1, 1, 1, 3, 3, 4);
        let q = q.to_dtype(DType::F64).unwrap();
        let desc = AttentionDescriptor::builder(0.5).layout(Layout::Bhsd).build().unwrap();
        let res = flash_attn_forward(&q, &k, &v, &desc).unwrap();
        assert_eq!(res.out.dtype(), DType::F64);
    }
}
