// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Decode attention: a few new query tokens against a long key/value cache.
//!
//! Q is `[batch, seqlen_q, heads_q, head_dim]` (or any dense layout). The
//! cache is direct, `[cache_rows, max_seq, heads_k, head_dim]`, paged
//! through the descriptor's [`BlockTable`], or int4-quantized
//! ([`QuantizedKv`] of the direct cache shape). Batch element `b` attends to
//! the first `cache_seqlens[b]` positions of cache row `cache_batch_idx[b]`.
//!
//! Several query heads may share one key/value head; the kv head of query
//! head `h` is `h / (heads_q / heads_k)`, so K/V are never replicated.
//! Quantized tiles are dequantized into the scratch tile right before the
//! online-softmax update.

use candle_core::Tensor;
use rayon::prelude::*;

use super::config::TileConfig;
use super::descriptor::{check_heads, AttentionDescriptor, AttentionShape, TensorDims};
use super::forward::{forward_head, HeadOutput, KvTileSource};
use super::host::{gather_rows, scatter_rows, stage, unstage, RowAddressing};
use super::kv_cache::{CacheAddressing, KvCache};
use super::mask::ScorePolicy;
use super::quantize::QuantizedKv;
use crate::error::{FlashAttnError, Result};

/// Keys and values for [`flash_attn_decode`].
#[derive(Debug, Clone, Copy)]
pub enum KvInput<'a> {
    /// Dense cache tensors, direct or paged.
    Dense {
        /// Keys.
        k: &'a Tensor,
        /// Values.
        v: &'a Tensor,
    },
    /// Int4-quantized direct cache.
    Quantized {
        /// Keys.
        k: &'a QuantizedKv,
        /// Values.
        v: &'a QuantizedKv,
    },
}

/// Cache rows behind one `(batch, kv head)`.
struct CacheKv<'a> {
    k: &'a [f32],
    v: &'a [f32],
    addr: &'a CacheAddressing<'a>,
    row: usize,
    head: usize,
}

impl KvTileSource for CacheKv<'_> {
    fn load(&self, start: usize, end: usize, k_tile: &mut [f32], v_tile: &mut [f32]) {
        let d = self.addr.head_dim();
        for (r, pos) in (start..end).enumerate() {
            let off = self.addr.offset(self.row, pos, self.head);
            k_tile[r * d..(r + 1) * d].copy_from_slice(&self.k[off..off + d]);
            v_tile[r * d..(r + 1) * d].copy_from_slice(&self.v[off..off + d]);
        }
    }
}

/// Quantized cache rows behind one `(batch, kv head)`.
struct QuantizedCacheKv<'a> {
    k: &'a QuantizedKv,
    v: &'a QuantizedKv,
    seq: usize,
    heads: usize,
    row: usize,
    head: usize,
}

impl KvTileSource for QuantizedCacheKv<'_> {
    fn load(&self, start: usize, end: usize, k_tile: &mut [f32], v_tile: &mut [f32]) {
        let d = self.k.row_len();
        for (r, pos) in (start..end).enumerate() {
            let row = (self.row * self.seq + pos) * self.heads + self.head;
            self.k.dequantize_row(row, &mut k_tile[r * d..(r + 1) * d]);
            self.v.dequantize_row(row, &mut v_tile[r * d..(r + 1) * d]);
        }
    }
}

/// Validated decode geometry.
struct DecodePlan {
    shape: AttentionShape,
    rows: Vec<usize>,
}

fn check_decode_descriptor(desc: &AttentionDescriptor) -> Result<()> {
    desc.ensure_supported()?;
    if desc.alibi_slopes().is_some() && desc.bias().is_some() {
        return Err(FlashAttnError::Configuration(
            "decode takes either ALiBi slopes or an additive bias, not both".to_string(),
        ));
    }
    if desc.layout().is_varlen() {
        return Err(FlashAttnError::Unsupported(
            "packed variable-length queries on the decode path".to_string(),
        ));
    }
    Ok(())
}

/// Resolve batch rows and valid lengths against a cache.
fn plan(
    desc: &AttentionDescriptor,
    qd: TensorDims,
    addr: &CacheAddressing<'_>,
    lengths: Option<&[usize]>,
) -> Result<DecodePlan> {
    if qd.head_dim == 0 || qd.head_dim != addr.head_dim() {
        return Err(FlashAttnError::Shape(format!(
            "head_dim mismatch: q={}, cache={}",
            qd.head_dim,
            addr.head_dim()
        )));
    }
    check_heads(qd.heads, addr.heads())?;

    let rows = match desc.cache_batch_idx() {
        Some(idx) => idx.to_vec(),
        None => (0..qd.batch).collect(),
    };
    if rows.len() != qd.batch {
        return Err(FlashAttnError::Shape(format!(
            "cache_batch_idx has {} entries for batch {}",
            rows.len(),
            qd.batch
        )));
    }

    let k_lens = match lengths.or(desc.cache_seqlens()) {
        Some(lens) if lens.len() == qd.batch => lens.to_vec(),
        Some(lens) => {
            return Err(FlashAttnError::Shape(format!(
                "cache_seqlens has {} entries for batch {}",
                lens.len(),
                qd.batch
            )))
        }
        None => vec![addr.capacity(); qd.batch],
    };
    for (&row, &len) in rows.iter().zip(&k_lens) {
        addr.check_len(row, len)?;
    }

    let shape = AttentionShape {
        batch: qd.batch,
        heads_q: qd.heads,
        heads_k: addr.heads(),
        head_dim: qd.head_dim,
        max_seqlen_q: qd.seq,
        max_seqlen_k: addr.capacity(),
        total_q: qd.seq,
        total_k: addr.capacity(),
        q_lens: vec![qd.seq; qd.batch],
        k_lens,
    };
    desc.check_score_terms(&shape)?;
    Ok(DecodePlan { shape, rows })
}

/// Run every `(batch, query head)` unit against cache sources.
fn run<S, F>(
    q: &Tensor,
    desc: &AttentionDescriptor,
    plan: &DecodePlan,
    tiles: &TileConfig,
    source: F,
) -> Result<Tensor>
where
    S: KvTileSource,
    F: Fn(usize, usize) -> S + Sync,
{
    let shape = &plan.shape;
    tracing::debug!(
        batch = shape.batch,
        heads_q = shape.heads_q,
        heads_k = shape.heads_k,
        seqlen_q = shape.max_seqlen_q,
        cache_lens = ?shape.k_lens,
        capabilities = ?desc.capabilities(),
        block_n = tiles.block_n,
        "flash attention decode"
    );
    let d = shape.head_dim;
    let group = shape.group_size();
    let qs = stage(q)?;
    let q_addr = RowAddressing::for_queries(desc.layout(), shape, None);

    let units: Vec<(usize, usize)> = (0..shape.batch)
        .flat_map(|b| (0..shape.heads_q).map(move |h| (b, h)))
        .collect();
    let results: Vec<HeadOutput> = units
        .par_iter()
        .map(|&(b, h)| {
            let (q_len, k_len) = (shape.q_lens[b], shape.k_lens[b]);
            let mut q_rows = vec![0.0; q_len * d];
            gather_rows(&qs, &q_addr, b, h, 0, q_len, d, &mut q_rows);
            let kv = source(plan.rows[b], h / group);
            let policy = ScorePolicy::new(desc, b, h, shape.heads_q, q_len, k_len);
            forward_head(&q_rows, &kv, &policy, tiles, d)
        })
        .collect();

    let mut out = vec![0.0; qs.len()];
    for (&(b, h), unit) in units.iter().zip(&results) {
        scatter_rows(&unit.out, &q_addr, b, h, 0, shape.q_lens[b], d, &mut out);
    }
    unstage(out, q.dims(), q.dtype(), q.device())
}

/// Decode attention with [`TileConfig::for_decode`] tiles.
///
/// # Errors
///
/// Returns [`FlashAttnError::Configuration`] for bias together with
/// `ALiBi` or incompatible head counts, [`FlashAttnError::Unsupported`] for
/// a paged quantized cache, packed queries or dropout, and
/// [`FlashAttnError::Shape`] when lengths, rows or the block table do not
/// fit the cache.
pub fn flash_attn_decode(q: &Tensor, kv: KvInput<'_>, desc: &AttentionDescriptor) -> Result<Tensor> {
    flash_attn_decode_with_config(q, kv, desc, &TileConfig::for_decode())
}

/// Decode attention with explicit tile sizes.
///
/// # Errors
///
/// Same as [`flash_attn_decode`].
pub fn flash_attn_decode_with_config(
    q: &Tensor,
    kv: KvInput<'_>,
    desc: &AttentionDescriptor,
    tiles: &TileConfig,
) -> Result<Tensor> {
    tiles.validate()?;
    check_decode_descriptor(desc)?;
    let qd = desc.layout().split_dims("q", q.dims())?;

    match kv {
        KvInput::Dense { k, v } => {
            if k.dims() != v.dims() {
                return Err(FlashAttnError::ShapeMismatch {
                    expected: k.dims().to_vec(),
                    actual: v.dims().to_vec(),
                });
            }
            let addr = CacheAddressing::new(k.dims(), desc.block_table())?;
            let plan = plan(desc, qd, &addr, None)?;
            let ks = stage(k)?;
            let vs = stage(v)?;
            run(q, desc, &plan, tiles, |row, head| CacheKv {
                k: &ks,
                v: &vs,
                addr: &addr,
                row,
                head,
            })
        }
        KvInput::Quantized { k, v } => {
            if desc.block_table().is_some() {
                return Err(FlashAttnError::Unsupported(
                    "quantized keys/values in a paged cache".to_string(),
                ));
            }
            if k.dims() != v.dims() {
                return Err(FlashAttnError::ShapeMismatch {
                    expected: k.dims().to_vec(),
                    actual: v.dims().to_vec(),
                });
            }
            let addr = CacheAddressing::new(k.dims(), None)?;
            let plan = plan(desc, qd, &addr, None)?;
            let (seq, heads) = (addr.capacity(), addr.heads());
            run(q, desc, &plan, tiles, |row, head| QuantizedCacheKv {
                k,
                v,
                seq,
                heads,
                row,
                head,
            })
        }
    }
}

/// Append new keys/values to an owned cache, then attend.
///
/// With `new_kv = Some((k_new, v_new))` (`[batch, new_len, heads_k,
/// head_dim]`), the new tokens are written at each row's current length and
/// the lengths advance before attention runs, so the queries see the cache
/// including the new tokens. Causal masking aligns the diagonal with the
/// tail of the updated cache.
///
/// The cache owns the lengths and block table; a descriptor that sets
/// `cache_seqlens` or `block_table` is rejected.
///
/// # Errors
///
/// Same as [`flash_attn_decode`], plus errors from [`KvCache::append`].
pub fn flash_attn_with_kvcache(
    q: &Tensor,
    cache: &mut KvCache,
    new_kv: Option<(&Tensor, &Tensor)>,
    desc: &AttentionDescriptor,
) -> Result<Tensor> {
    check_decode_descriptor(desc)?;
    if desc.cache_seqlens().is_some() || desc.block_table().is_some() {
        return Err(FlashAttnError::Configuration(
            "cache lengths and block table are owned by the KvCache".to_string(),
        ));
    }
    let qd = desc.layout().split_dims("q", q.dims())?;
    let rows = match desc.cache_batch_idx() {
        Some(idx) => idx.to_vec(),
        None => (0..qd.batch).collect(),
    };

    {
        // Validate the queries before the cache is touched.
        let addr = cache.addressing()?;
        let lens: Vec<usize> = rows
            .iter()
            .map(|&r| cache.lengths().get(r).copied().unwrap_or(0))
            .collect();
        plan(desc, qd, &addr, Some(&lens))?;
    }
    if let Some((k_new, v_new)) = new_kv {
        cache.append_rows(k_new, v_new, &rows)?;
    }

    let lens: Vec<usize> = rows.iter().map(|&r| cache.lengths()[r]).collect();
    let addr = cache.addressing()?;
    let plan = plan(desc, qd, &addr, Some(&lens))?;
    let (ks, vs) = cache.buffers();
    run(q, desc, &plan, &TileConfig::for_decode(), |row, head| CacheKv {
        k: ks,
        v: vs,
        addr: &addr,
        row,
        head,
    })
}
