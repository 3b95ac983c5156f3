// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Untiled attention built from candle tensor ops.
//!
//! Materializes the full `[seqlen_q, seqlen_k]` score matrix, so memory is
//! quadratic in sequence length. Used to validate the tiled kernels and as
//! a readable statement of the semantics they implement.

use candle_core::{DType, Tensor, D};

use super::descriptor::{AttentionDescriptor, AttentionShape, Layout};
use super::forward::ForwardOutput;
use crate::error::Result;

/// Finite stand-in for `-inf` so fully masked rows do not produce NaN.
const MASKED: f64 = -1e30;

/// Direct (materialized) attention with the same semantics as
/// [`super::flash_attn_forward`].
///
/// Computes in f64 when Q is f64 and in f32 otherwise.
///
/// # Errors
///
/// Returns an error if the tensors do not match the descriptor, or if the
/// descriptor requests dropout.
pub fn attention_reference(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    desc: &AttentionDescriptor,
) -> Result<ForwardOutput> {
    desc.ensure_supported()?;
    let shape = desc.resolve(q, k, v)?;
    let dtype = if q.dtype() == DType::F64 { DType::F64 } else { DType::F32 };
    let (q, k, v) = (q.to_dtype(dtype)?, k.to_dtype(dtype)?, v.to_dtype(dtype)?);

    let (out, lse) = match (desc.cu_seqlens_q(), desc.cu_seqlens_k()) {
        (Some(cu_q), Some(cu_k)) => {
            // One dense [1, seq, heads, dim] problem per packed sequence.
            let mut outs = Vec::with_capacity(shape.batch);
            let mut lses = Vec::with_capacity(shape.batch);
            for b in 0..shape.batch {
                let (q_len, k_len) = (shape.q_lens[b], shape.k_lens[b]);
                if q_len == 0 {
                    continue;
                }
                let qb = q.narrow(0, cu_q[b], q_len)?.unsqueeze(0)?;
                let (out, lse) = if k_len == 0 {
                    let dims = (1, q_len, shape.heads_q, shape.head_dim);
                    let zeros = Tensor::zeros(dims, dtype, q.device())?;
                    let lse = Tensor::full(f32::NEG_INFINITY, (1, shape.heads_q, q_len), q.device())?;
                    (zeros, lse)
                } else {
                    let kb = k.narrow(0, cu_k[b], k_len)?.unsqueeze(0)?;
                    let vb = v.narrow(0, cu_k[b], k_len)?.unsqueeze(0)?;
                    let (out, lse) = dense(
                        &to_bhsd(&qb, Layout::Bshd)?,
                        &to_bhsd(&kb, Layout::Bshd)?,
                        &to_bhsd(&vb, Layout::Bshd)?,
                        desc,
                        &shape,
                        b,
                    )?;
                    (out.transpose(1, 2)?, lse)
                };
                outs.push(out.squeeze(0)?);
                lses.push(lse.squeeze(0)?);
            }
            (Tensor::cat(&outs, 0)?, Tensor::cat(&lses, 1)?)
        }
        _ => {
            let per_batch = (0..shape.batch)
                .map(|b| {
                    let pick = |t: &Tensor| to_bhsd(&t.narrow(0, b, 1)?, desc.layout());
                    dense(&pick(&q)?, &pick(&k)?, &pick(&v)?, desc, &shape, b)
                })
                .collect::<Result<Vec<_>>>()?;
            let (outs, lses): (Vec<_>, Vec<_>) = per_batch.into_iter().unzip();
            let out = from_bhsd(&Tensor::cat(&outs, 0)?, desc.layout(), q.dims())?;
            (out, Tensor::cat(&lses, 0)?)
        }
    };

    Ok(ForwardOutput {
        out: out.contiguous()?.to_dtype(q.dtype())?,
        lse,
    })
}

fn to_bhsd(t: &Tensor, layout: Layout) -> Result<Tensor> {
    let t = match layout {
        Layout::Bhsd => t.clone(),
        Layout::Bshd | Layout::Thd => t.transpose(1, 2)?,
        Layout::Bsghd => {
            let (b, s, g, h, d) = t.dims5()?;
            t.reshape((b, s, g * h, d))?.transpose(1, 2)?
        }
    };
    Ok(t.contiguous()?)
}

fn from_bhsd(t: &Tensor, layout: Layout, dims: &[usize]) -> Result<Tensor> {
    Ok(match layout {
        Layout::Bhsd => t.clone(),
        Layout::Bshd | Layout::Thd => t.transpose(1, 2)?,
        Layout::Bsghd => t.transpose(1, 2)?.contiguous()?.reshape(dims)?,
    })
}

/// Attention for one batch element in `[1, heads, seq, dim]` form; returns
/// the output in the same form and the LSE as `[1, heads_q, seqlen_q]` f32.
fn dense(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    desc: &AttentionDescriptor,
    shape: &AttentionShape,
    batch: usize,
) -> Result<(Tensor, Tensor)> {
    let (_, heads_q, q_len, _) = q.dims4()?;
    let (_, heads_k, k_len, head_dim) = k.dims4()?;
    let group = heads_q / heads_k;
    let (k, v) = if group > 1 {
        let expand = |t: &Tensor| -> Result<Tensor> {
            Ok(t.unsqueeze(2)?
                .expand((1, heads_k, group, k_len, head_dim))?
                .reshape((1, heads_q, k_len, head_dim))?)
        };
        (expand(k)?, expand(v)?)
    } else {
        (k.clone(), v.clone())
    };

    let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * f64::from(desc.softmax_scale()))?;
    let (terms, visible) = score_terms(desc, shape, batch, heads_q, q_len, k_len);
    let terms = Tensor::from_vec(terms, (1, heads_q, q_len, k_len), q.device())?.to_dtype(q.dtype())?;
    let scores = (scores + terms)?;

    let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
    let row_mask: Vec<f64> = visible.iter().map(|&any| if any { 1.0 } else { 0.0 }).collect();
    let row_mask = Tensor::from_vec(row_mask, (1, heads_q, q_len, 1), q.device())?.to_dtype(q.dtype())?;
    let weights = weights.broadcast_mul(&row_mask)?;
    let out = weights.matmul(&v.contiguous()?)?;

    let max = scores.max_keepdim(D::Minus1)?;
    let sum = scores.broadcast_sub(&max)?.exp()?.sum_keepdim(D::Minus1)?;
    let lse = (max + sum.log()?)?.squeeze(D::Minus1)?;
    let lse: Vec<f32> = lse
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?
        .into_iter()
        .zip(&visible)
        .map(|(l, &any)| if any { l } else { f32::NEG_INFINITY })
        .collect();
    let lse = Tensor::from_vec(lse, (1, heads_q, q_len), q.device())?;
    Ok((out, lse))
}

/// Additive score terms (mask, `ALiBi`, bias) as `[heads_q, q_len, k_len]`
/// values, plus whether each row sees any key.
#[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
fn score_terms(
    desc: &AttentionDescriptor,
    shape: &AttentionShape,
    batch: usize,
    heads_q: usize,
    q_len: usize,
    k_len: usize,
) -> (Vec<f64>, Vec<bool>) {
    let window = desc.mask_window();
    let diagonal = k_len as i64 - q_len as i64;
    let mut terms = vec![0.0; heads_q * q_len * k_len];
    let mut visible = vec![false; heads_q * q_len];
    for h in 0..heads_q {
        let slope = desc.alibi_slopes().map(|s| f64::from(s.slope(batch, h, shape.heads_q)));
        let bias = desc.bias().map(|b| b.plane(batch, h));
        for i in 0..q_len {
            for j in 0..k_len {
                let rel = j as i64 - (i as i64 + diagonal);
                let inside = window.left.map_or(true, |l| rel >= -(l as i64))
                    && window.right.map_or(true, |r| rel <= r as i64);
                let idx = (h * q_len + i) * k_len + j;
                if !inside {
                    terms[idx] = MASKED;
                    continue;
                }
                visible[h * q_len + i] = true;
                if let Some(slope) = slope {
                    terms[idx] -= slope * rel.unsigned_abs() as f64;
                }
                if let Some(plane) = bias {
                    terms[idx] += f64::from(plane[i * k_len + j]);
                }
            }
        }
    }
    (terms, visible)
}
