// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Host staging of candle tensors and per-layout row addressing.
//!
//! Kernels work on flat f32 buffers. A [`RowAddressing`] maps a logical
//! `(batch, head, position)` triple to the offset of that row's `head_dim`
//! elements, so the tile loops never branch on the layout.

use candle_core::{DType, Device, Tensor};

use super::descriptor::{AttentionShape, Layout};
use crate::error::Result;

/// Copy a tensor into a contiguous f32 buffer (row-major over its dims).
pub(crate) fn stage(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

/// Build a tensor of `dtype` on `device` from an f32 buffer.
pub(crate) fn unstage(data: Vec<f32>, dims: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
    let tensor = Tensor::from_vec(data, dims, device)?;
    if dtype == DType::F32 {
        Ok(tensor)
    } else {
        Ok(tensor.to_dtype(dtype)?)
    }
}

/// Offsets of `head_dim`-wide rows in a staged buffer.
#[derive(Debug, Clone)]
pub(crate) struct RowAddressing {
    batch_stride: usize,
    head_stride: usize,
    seq_stride: usize,
    starts: Option<Vec<usize>>,
}

impl RowAddressing {
    /// Addressing for a tensor with `heads` heads and `seq` positions per
    /// batch element. `starts` are the cumulative offsets of packed layouts.
    pub(crate) fn new(
        layout: Layout,
        seq: usize,
        heads: usize,
        head_dim: usize,
        starts: Option<&[usize]>,
    ) -> Self {
        let (batch_stride, head_stride, seq_stride) = match layout {
            Layout::Bhsd => (heads * seq * head_dim, seq * head_dim, head_dim),
            Layout::Bshd | Layout::Bsghd => (seq * heads * head_dim, head_dim, heads * head_dim),
            Layout::Thd => (0, head_dim, heads * head_dim),
        };
        Self {
            batch_stride,
            head_stride,
            seq_stride,
            starts: starts.map(<[usize]>::to_vec),
        }
    }

    /// Addressing of the query tensor of a resolved shape.
    pub(crate) fn for_queries(layout: Layout, shape: &AttentionShape, starts: Option<&[usize]>) -> Self {
        Self::new(layout, shape.total_q, shape.heads_q, shape.head_dim, starts)
    }

    /// Addressing of the key/value tensors of a resolved shape.
    pub(crate) fn for_keys(layout: Layout, shape: &AttentionShape, starts: Option<&[usize]>) -> Self {
        Self::new(layout, shape.total_k, shape.heads_k, shape.head_dim, starts)
    }

    /// Offset of row `(batch, head, pos)`.
    #[inline]
    pub(crate) fn row(&self, batch: usize, head: usize, pos: usize) -> usize {
        let base = match &self.starts {
            Some(starts) => starts[batch] * self.seq_stride,
            None => batch * self.batch_stride,
        };
        base + head * self.head_stride + pos * self.seq_stride
    }
}

/// Offsets of per-row statistics (LSE, delta).
///
/// Dense layouts store `[batch, heads, seqlen_q]`; packed layouts store
/// `[heads, total_q]`.
#[derive(Debug, Clone)]
pub(crate) struct StatsIndex {
    heads: usize,
    seq: usize,
    starts: Option<Vec<usize>>,
}

impl StatsIndex {
    pub(crate) fn new(shape: &AttentionShape, starts: Option<&[usize]>) -> Self {
        Self {
            heads: shape.heads_q,
            seq: if starts.is_some() { shape.total_q } else { shape.max_seqlen_q },
            starts: starts.map(<[usize]>::to_vec),
        }
    }

    /// Tensor dims of the statistics buffer.
    pub(crate) fn dims(&self, batch: usize) -> Vec<usize> {
        match self.starts {
            Some(_) => vec![self.heads, self.seq],
            None => vec![batch, self.heads, self.seq],
        }
    }

    /// Total element count.
    pub(crate) fn len(&self, batch: usize) -> usize {
        self.dims(batch).iter().product()
    }

    /// Offset of the statistic for `(batch, head, pos)`.
    #[inline]
    pub(crate) fn index(&self, batch: usize, head: usize, pos: usize) -> usize {
        match &self.starts {
            Some(starts) => head * self.seq + starts[batch] + pos,
            None => (batch * self.heads + head) * self.seq + pos,
        }
    }
}

/// Copy rows `[start, end)` of one `(batch, head)` into `dst` (row-major,
/// `head_dim` wide).
#[inline]
#[allow(clippy::too_many_arguments)]
pub(crate) fn gather_rows(
    src: &[f32],
    addr: &RowAddressing,
    batch: usize,
    head: usize,
    start: usize,
    end: usize,
    head_dim: usize,
    dst: &mut [f32],
) {
    for (r, pos) in (start..end).enumerate() {
        let off = addr.row(batch, head, pos);
        dst[r * head_dim..(r + 1) * head_dim].copy_from_slice(&src[off..off + head_dim]);
    }
}

/// Inverse of [`gather_rows`].
#[inline]
#[allow(clippy::too_many_arguments)]
pub(crate) fn scatter_rows(
    src: &[f32],
    addr: &RowAddressing,
    batch: usize,
    head: usize,
    start: usize,
    end: usize,
    head_dim: usize,
    dst: &mut [f32],
) {
    for (r, pos) in (start..end).enumerate() {
        let off = addr.row(batch, head, pos);
        dst[off..off + head_dim].copy_from_slice(&src[r * head_dim..(r + 1) * head_dim]);
    }
}

#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `acc += alpha * x`
#[inline]
pub(crate) fn axpy(alpha: f32, x: &[f32], acc: &mut [f32]) {
    for (a, v) in acc.iter_mut().zip(x) {
        *a += alpha * v;
    }
}
