// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Attention forward `CubeCL` kernel.
//!
//! One unit per query row. Each unit streams every visible key of its
//! `(batch, kv head)`, keeping the running max, running sum and output row
//! of the online softmax, and writes the output row plus its log-sum-exp.
//!
//! ```text
//! m = -inf, l = 0, o = 0
//! for j in visible keys:
//!     s     = (q . k_j) * scale
//!     m_new = max(m, s)
//!     alpha = exp(m - m_new)
//!     p     = exp(s - m_new)
//!     l     = l * alpha + p
//!     o     = o * alpha + p * v_j
//!     m     = m_new
//! o /= l, lse = m + ln(l)     (o = 0, lse = -inf when l == 0)
//! ```
//!
//! Supported: dense layouts, grouped heads, causal with the tail-aligned
//! diagonal. Anything else (windows, `ALiBi`, bias, packed batches, paged
//! caches) runs on the host path.

use super::super::descriptor::{AttentionDescriptor, AttentionShape};

#[cfg(feature = "cuda")]
use super::super::descriptor::Layout;
#[cfg(feature = "cuda")]
use super::super::forward::ForwardOutput;
#[cfg(feature = "cuda")]
use super::interop::{f32_bytes_to_tensor, has_cubecl_cuda_support, tensor_to_f32_bytes};
#[cfg(feature = "cuda")]
use crate::error::{FlashAttnError, Result};
#[cfg(feature = "cuda")]
use candle_core::{Device, Tensor};
#[cfg(feature = "cuda")]
use cubecl::prelude::*;
#[cfg(feature = "cuda")]
use cubecl_cuda::CudaRuntime;

/// Whether the device kernel implements this call.
#[cfg_attr(not(feature = "cuda"), allow(dead_code))]
pub(crate) fn supports(desc: &AttentionDescriptor, shape: &AttentionShape) -> bool {
    let caps = desc.capabilities();
    !(caps.windowed || caps.alibi || caps.bias || caps.varlen || caps.paged)
        && shape.head_dim > 0
        && shape.max_seqlen_k > 0
}

/// Forward kernel over `[batch, heads, seq, head_dim]` buffers.
///
/// Grid: one unit per `(batch, head, query row)`.
#[cfg(feature = "cuda")]
#[cube(launch)]
fn flash_attention_rows<F: Float>(
    q: &Array<F>,
    k: &Array<F>,
    v: &Array<F>,
    out: &mut Array<F>,
    lse: &mut Array<F>,
    scale: F,
    seq_q: u32,
    seq_k: u32,
    head_dim: u32,
    heads_q: u32,
    group: u32,
    causal: u32,
) {
    let row = ABSOLUTE_POS;
    let total_rows = lse.len();
    if row >= total_rows {
        terminate!();
    }

    let i = row % seq_q;
    let bh = row / seq_q;
    let b = bh / heads_q;
    let h = bh % heads_q;
    let heads_k = heads_q / group;
    let kv_base = (b * heads_k + h / group) * seq_k * head_dim;
    let q_base = row * head_dim;

    for d in 0..head_dim {
        out[q_base + d] = F::new(0.0);
    }

    let mut m = F::new(-1e30);
    let mut l = F::new(0.0);
    for j in 0..seq_k {
        // Tail-aligned diagonal: key j is visible iff j <= i + seq_k - seq_q.
        if causal == 0 || j + seq_q <= i + seq_k {
            let mut s = F::new(0.0);
            for d in 0..head_dim {
                s += q[q_base + d] * k[kv_base + j * head_dim + d];
            }
            s = s * scale;
            let m_new = F::max(m, s);
            let alpha = F::exp(m - m_new);
            let p = F::exp(s - m_new);
            l = l * alpha + p;
            for d in 0..head_dim {
                out[q_base + d] = out[q_base + d] * alpha + p * v[kv_base + j * head_dim + d];
            }
            m = m_new;
        }
    }

    if l > F::new(0.0) {
        for d in 0..head_dim {
            out[q_base + d] = out[q_base + d] / l;
        }
        lse[row] = m + F::log(l);
    } else {
        lse[row] = F::new(f32::NEG_INFINITY);
    }
}

/// Run the forward pass on the GPU if possible.
///
/// Returns `None` when the tensors are not on a CUDA device, the kernel
/// does not support the descriptor, or the launch fails (logged).
#[cfg(feature = "cuda")]
pub(crate) fn try_forward(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    desc: &AttentionDescriptor,
    shape: &AttentionShape,
) -> Option<ForwardOutput> {
    if !matches!(q.device(), Device::Cuda(_)) || !has_cubecl_cuda_support() || !supports(desc, shape) {
        return None;
    }
    match launch(q, k, v, desc, shape) {
        Ok(res) => Some(res),
        Err(e) => {
            tracing::warn!(error = %e, "CubeCL attention launch failed, using host path");
            None
        }
    }
}

#[cfg(feature = "cuda")]
fn to_bhsd(t: &Tensor, layout: Layout) -> Result<Tensor> {
    let t = match layout {
        Layout::Bshd | Layout::Thd => t.transpose(1, 2)?,
        Layout::Bsghd => {
            let (b, s, g, h, d) = t.dims5()?;
            t.reshape((b, s, g * h, d))?.transpose(1, 2)?
        }
        Layout::Bhsd => t.clone(),
    };
    Ok(t.contiguous()?)
}

#[cfg(feature = "cuda")]
fn launch(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    desc: &AttentionDescriptor,
    shape: &AttentionShape,
) -> Result<ForwardOutput> {
    let layout = desc.layout();
    let (batch, heads_q, seq_q, seq_k, head_dim) = (
        shape.batch,
        shape.heads_q,
        shape.max_seqlen_q,
        shape.max_seqlen_k,
        shape.head_dim,
    );
    tracing::debug!(batch, heads_q, seq_q, seq_k, head_dim, "launching CubeCL attention");

    let q_bytes = tensor_to_f32_bytes(&to_bhsd(q, layout)?)?;
    let k_bytes = tensor_to_f32_bytes(&to_bhsd(k, layout)?)?;
    let v_bytes = tensor_to_f32_bytes(&to_bhsd(v, layout)?)?;
    let q_elems = batch * heads_q * seq_q * head_dim;
    let kv_elems = batch * shape.heads_k * seq_k * head_dim;
    let rows = batch * heads_q * seq_q;

    let device = cubecl_cuda::CudaDevice::new(0);
    let client = CudaRuntime::client(&device);
    let q_handle = client.create(&q_bytes);
    let k_handle = client.create(&k_bytes);
    let v_handle = client.create(&v_bytes);
    let out_handle = client.empty(q_elems * std::mem::size_of::<f32>());
    let lse_handle = client.empty(rows * std::mem::size_of::<f32>());

    let dim = |name: &str, x: usize| {
        u32::try_from(x).map_err(|_| FlashAttnError::Kernel(format!("{name} = {x} exceeds the u32 launch range")))
    };
    let block = 128u32;
    let cube_count = CubeCount::Static(dim("rows", rows)?.div_ceil(block), 1, 1);
    let scalars = [
        dim("seqlen_q", seq_q)?,
        dim("seqlen_k", seq_k)?,
        dim("head_dim", head_dim)?,
        dim("heads_q", heads_q)?,
        dim("group", shape.group_size())?,
    ];

    // SAFETY: every handle was created above with exactly the element
    // counts passed here.
    unsafe {
        flash_attention_rows::launch::<f32, CudaRuntime>(
            &client,
            cube_count,
            CubeDim::new(block, 1, 1),
            ArrayArg::from_raw_parts::<f32>(&q_handle, q_elems, 1),
            ArrayArg::from_raw_parts::<f32>(&k_handle, kv_elems, 1),
            ArrayArg::from_raw_parts::<f32>(&v_handle, kv_elems, 1),
            ArrayArg::from_raw_parts::<f32>(&out_handle, q_elems, 1),
            ArrayArg::from_raw_parts::<f32>(&lse_handle, rows, 1),
            ScalarArg::new(desc.softmax_scale()),
            ScalarArg::new(scalars[0]),
            ScalarArg::new(scalars[1]),
            ScalarArg::new(scalars[2]),
            ScalarArg::new(scalars[3]),
            ScalarArg::new(scalars[4]),
            ScalarArg::new(u32::from(desc.is_causal())),
        );
    }

    let out_bytes = client.read_one(out_handle);
    let lse_bytes = client.read_one(lse_handle);
    let out = f32_bytes_to_tensor(&out_bytes, &[batch, heads_q, seq_q, head_dim], q.device())?;
    let out = match layout {
        Layout::Bhsd => out,
        Layout::Bshd | Layout::Thd => out.transpose(1, 2)?.contiguous()?,
        Layout::Bsghd => out.transpose(1, 2)?.contiguous()?.reshape(q.dims())?,
    };
    Ok(ForwardOutput {
        out: out.to_dtype(q.dtype())?,
        lse: f32_bytes_to_tensor(&lse_bytes, &[batch, heads_q, seq_q], q.device())?,
    })
}
