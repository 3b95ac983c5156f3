// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Key/value cache splicing.
//!
//! A cache is either direct, `[batch, max_seq, heads, head_dim]`, or paged,
//! `[num_blocks, block_size, heads, head_dim]` addressed through a
//! [`BlockTable`]. Appending `n` tokens to batch element `b` with current
//! length `len_b` writes logical positions `[len_b, len_b + n)` and leaves
//! every other position untouched. All bounds are checked before the first
//! write, so a failed call leaves the cache unchanged.

use candle_core::{DType, Device, Tensor};

use super::descriptor::BlockTable;
use super::host::{stage, unstage};
use crate::error::{FlashAttnError, Result};

#[derive(Debug, Clone, Copy)]
enum CacheKind<'a> {
    Direct { rows: usize, seq: usize },
    Paged { table: &'a BlockTable, num_blocks: usize },
}

/// Maps `(cache row, logical position, head)` to a buffer offset.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CacheAddressing<'a> {
    kind: CacheKind<'a>,
    heads: usize,
    head_dim: usize,
}

impl<'a> CacheAddressing<'a> {
    /// Interpret cache dims, paged when a block table is given.
    pub(crate) fn new(dims: &[usize], table: Option<&'a BlockTable>) -> Result<Self> {
        let [d0, d1, heads, head_dim]: [usize; 4] = dims.try_into().map_err(|_| {
            FlashAttnError::Shape(format!("cache: expected a rank-4 tensor, got {dims:?}"))
        })?;
        let kind = match table {
            Some(table) => {
                if d1 != table.block_size() {
                    return Err(FlashAttnError::Shape(format!(
                        "paged cache block size {d1} does not match block table ({})",
                        table.block_size()
                    )));
                }
                CacheKind::Paged {
                    table,
                    num_blocks: d0,
                }
            }
            None => CacheKind::Direct { rows: d0, seq: d1 },
        };
        Ok(Self {
            kind,
            heads,
            head_dim,
        })
    }

    pub(crate) fn heads(&self) -> usize {
        self.heads
    }

    pub(crate) fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Number of addressable cache rows.
    pub(crate) fn rows(&self) -> usize {
        match self.kind {
            CacheKind::Direct { rows, .. } => rows,
            CacheKind::Paged { table, .. } => table.batch(),
        }
    }

    /// Logical positions per row.
    pub(crate) fn capacity(&self) -> usize {
        match self.kind {
            CacheKind::Direct { seq, .. } => seq,
            CacheKind::Paged { table, .. } => table.capacity(),
        }
    }

    pub(crate) fn is_paged(&self) -> bool {
        matches!(self.kind, CacheKind::Paged { .. })
    }

    /// Check that positions `[0, len)` of `row` exist.
    pub(crate) fn check_len(&self, row: usize, len: usize) -> Result<()> {
        match self.kind {
            CacheKind::Direct { rows, seq } => {
                if row >= rows || len > seq {
                    return Err(FlashAttnError::Shape(format!(
                        "cache: row {row} length {len} outside [{rows}, {seq}]"
                    )));
                }
                Ok(())
            }
            CacheKind::Paged { table, num_blocks } => table.check_range(row, len, num_blocks),
        }
    }

    /// Offset of the `head_dim` elements at `(row, pos, head)`.
    #[inline]
    pub(crate) fn offset(&self, row: usize, pos: usize, head: usize) -> usize {
        let slot = match self.kind {
            CacheKind::Direct { seq, .. } => row * seq + pos,
            CacheKind::Paged { table, .. } => {
                let (block, off) = table.slot(row, pos);
                block * table.block_size() + off
            }
        };
        (slot * self.heads + head) * self.head_dim
    }
}

/// Write `src` (`[batch, new_len, heads, head_dim]`) at positions
/// `[lengths[b], lengths[b] + new_len)` of cache row `rows[b]`.
pub(crate) fn splice(
    dst: &mut [f32],
    addr: &CacheAddressing<'_>,
    src: &[f32],
    src_dims: &[usize],
    lengths: &[usize],
    rows: &[usize],
) -> Result<()> {
    let [batch, new_len, heads, head_dim]: [usize; 4] = src_dims.try_into().map_err(|_| {
        FlashAttnError::Shape(format!("new tokens: expected a rank-4 tensor, got {src_dims:?}"))
    })?;
    if heads != addr.heads() || head_dim != addr.head_dim() {
        return Err(FlashAttnError::ShapeMismatch {
            expected: vec![batch, new_len, addr.heads(), addr.head_dim()],
            actual: src_dims.to_vec(),
        });
    }
    if lengths.len() != batch || rows.len() != batch {
        return Err(FlashAttnError::Shape(format!(
            "cache update: {batch} batch elements but {} lengths",
            lengths.len()
        )));
    }
    for (b, (&row, &len)) in rows.iter().zip(lengths).enumerate() {
        addr.check_len(row, len + new_len).map_err(|e| {
            FlashAttnError::Shape(format!("cache update overflows for batch element {b}: {e}"))
        })?;
    }

    for (b, (&row, &len)) in rows.iter().zip(lengths).enumerate() {
        for t in 0..new_len {
            for h in 0..heads {
                let from = ((b * new_len + t) * heads + h) * head_dim;
                let to = addr.offset(row, len + t, h);
                dst[to..to + head_dim].copy_from_slice(&src[from..from + head_dim]);
            }
        }
    }
    Ok(())
}

/// Write new tokens into a cache at per-batch lengths, returning the
/// updated cache.
///
/// `cache` is `[batch, max_seq, heads, head_dim]`, or
/// `[num_blocks, block_size, heads, head_dim]` when `block_table` is given.
/// `new_tokens` is `[batch, new_len, heads, head_dim]`.
///
/// # Errors
///
/// Returns [`FlashAttnError::Shape`] if a write would pass the end of the
/// cache (or of the batch row of the block table), or a block-table entry
/// is out of range.
pub fn update_cache(
    cache: &Tensor,
    new_tokens: &Tensor,
    lengths: &[usize],
    block_table: Option<&BlockTable>,
) -> Result<Tensor> {
    let addr = CacheAddressing::new(cache.dims(), block_table)?;
    tracing::debug!(
        cache = ?cache.dims(),
        new = ?new_tokens.dims(),
        paged = addr.is_paged(),
        "kv cache update"
    );
    let rows: Vec<usize> = (0..lengths.len()).collect();
    let mut data = stage(cache)?;
    splice(&mut data, &addr, &stage(new_tokens)?, new_tokens.dims(), lengths, &rows)?;
    unstage(data, cache.dims(), cache.dtype(), cache.device())
}

/// Owned key/value cache with per-row lengths.
///
/// # Example
///
/// ```rust
/// use candle_core::{Device, Tensor};
/// use flash_attn_rs::kernels::KvCache;
///
/// let device = Device::Cpu;
/// let mut cache = KvCache::new(2, 32, 4, 16, &device);
/// let k = Tensor::ones((2, 3, 4, 16), candle_core::DType::F32, &device).unwrap();
/// cache.append(&k, &k).unwrap();
/// assert_eq!(cache.lengths(), &[3, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct KvCache {
    k: Vec<f32>,
    v: Vec<f32>,
    dims: [usize; 4],
    lengths: Vec<usize>,
    block_table: Option<BlockTable>,
    device: Device,
}

impl KvCache {
    /// Empty direct cache `[batch, max_seq, heads, head_dim]`.
    #[must_use]
    pub fn new(batch: usize, max_seq: usize, heads: usize, head_dim: usize, device: &Device) -> Self {
        let dims = [batch, max_seq, heads, head_dim];
        let numel = dims.iter().product();
        Self {
            k: vec![0.0; numel],
            v: vec![0.0; numel],
            dims,
            lengths: vec![0; batch],
            block_table: None,
            device: device.clone(),
        }
    }

    /// Empty paged cache `[num_blocks, block_size, heads, head_dim]` with
    /// one length counter per block-table row.
    #[must_use]
    pub fn paged(
        num_blocks: usize,
        heads: usize,
        head_dim: usize,
        block_table: BlockTable,
        device: &Device,
    ) -> Self {
        let dims = [num_blocks, block_table.block_size(), heads, head_dim];
        let numel = dims.iter().product();
        Self {
            k: vec![0.0; numel],
            v: vec![0.0; numel],
            dims,
            lengths: vec![0; block_table.batch()],
            block_table: Some(block_table),
            device: device.clone(),
        }
    }

    /// Wrap existing cache tensors.
    ///
    /// # Errors
    ///
    /// Returns an error if K and V differ in shape, the dims do not fit the
    /// block table, or a length exceeds the capacity of its row.
    pub fn from_tensors(
        k: &Tensor,
        v: &Tensor,
        lengths: Vec<usize>,
        block_table: Option<BlockTable>,
    ) -> Result<Self> {
        if k.dims() != v.dims() {
            return Err(FlashAttnError::ShapeMismatch {
                expected: k.dims().to_vec(),
                actual: v.dims().to_vec(),
            });
        }
        let addr = CacheAddressing::new(k.dims(), block_table.as_ref())?;
        if lengths.len() != addr.rows() {
            return Err(FlashAttnError::Shape(format!(
                "cache: {} lengths for {} rows",
                lengths.len(),
                addr.rows()
            )));
        }
        for (row, &len) in lengths.iter().enumerate() {
            addr.check_len(row, len)?;
        }
        let dims: [usize; 4] = [k.dims()[0], k.dims()[1], addr.heads(), addr.head_dim()];
        Ok(Self {
            k: stage(k)?,
            v: stage(v)?,
            dims,
            lengths,
            block_table,
            device: k.device().clone(),
        })
    }

    /// Append `[batch, new_len, heads, head_dim]` keys and values to every
    /// row and advance the lengths.
    ///
    /// # Errors
    ///
    /// Returns an error if the shapes differ or the append overflows a row;
    /// the cache is unchanged in that case.
    pub fn append(&mut self, k_new: &Tensor, v_new: &Tensor) -> Result<()> {
        let rows: Vec<usize> = (0..self.lengths.len()).collect();
        self.append_rows(k_new, v_new, &rows)
    }

    /// Append batch element `b` of the new tokens to cache row `rows[b]`.
    pub(crate) fn append_rows(&mut self, k_new: &Tensor, v_new: &Tensor, rows: &[usize]) -> Result<()> {
        if k_new.dims() != v_new.dims() {
            return Err(FlashAttnError::ShapeMismatch {
                expected: k_new.dims().to_vec(),
                actual: v_new.dims().to_vec(),
            });
        }
        let mut seen = vec![false; self.lengths.len()];
        for &row in rows {
            match seen.get_mut(row) {
                Some(s) if !*s => *s = true,
                Some(_) => {
                    return Err(FlashAttnError::Configuration(format!(
                        "cache row {row} appears twice in one append"
                    )))
                }
                None => {
                    return Err(FlashAttnError::Shape(format!(
                        "cache row {row} out of range ({} rows)",
                        self.lengths.len()
                    )))
                }
            }
        }
        let new_len = k_new.dims().get(1).copied().unwrap_or(0);
        let lengths: Vec<usize> = rows.iter().map(|&r| self.lengths[r]).collect();
        let k_src = stage(k_new)?;
        let v_src = stage(v_new)?;

        let addr = CacheAddressing::new(&self.dims, self.block_table.as_ref())?;
        splice(&mut self.k, &addr, &k_src, k_new.dims(), &lengths, rows)?;
        splice(&mut self.v, &addr, &v_src, v_new.dims(), &lengths, rows)?;
        for &row in rows {
            self.lengths[row] += new_len;
        }
        tracing::trace!(new_len, lengths = ?self.lengths, "kv cache append");
        Ok(())
    }

    /// Keys as a tensor of the cache dims.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor cannot be created on the cache device.
    pub fn k(&self) -> Result<Tensor> {
        unstage(self.k.clone(), &self.dims, DType::F32, &self.device)
    }

    /// Values as a tensor of the cache dims.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor cannot be created on the cache device.
    pub fn v(&self) -> Result<Tensor> {
        unstage(self.v.clone(), &self.dims, DType::F32, &self.device)
    }

    /// Valid length of each row.
    #[must_use]
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Cache dims.
    #[must_use]
    pub fn dims(&self) -> [usize; 4] {
        self.dims
    }

    /// Block table of a paged cache.
    #[must_use]
    pub fn block_table(&self) -> Option<&BlockTable> {
        self.block_table.as_ref()
    }

    /// Logical positions per row.
    #[must_use]
    pub fn capacity(&self) -> usize {
        match &self.block_table {
            Some(table) => table.capacity(),
            None => self.dims[1],
        }
    }

    /// Device the cache tensors are created on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Forget all cached tokens. Buffers keep their contents.
    pub fn reset(&mut self) {
        self.lengths.fill(0);
    }

    pub(crate) fn addressing(&self) -> Result<CacheAddressing<'_>> {
        CacheAddressing::new(&self.dims, self.block_table.as_ref())
    }

    pub(crate) fn buffers(&self) -> (&[f32], &[f32]) {
        (&self.k, &self.v)
    }
}
