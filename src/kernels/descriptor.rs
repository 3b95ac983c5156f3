// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Attention descriptor: shape, scaling, masking and bias configuration for
//! a single attention call.
//!
//! A descriptor is produced by [`AttentionDescriptorBuilder`] and is
//! immutable afterwards. Everything that can be checked without tensors is
//! checked in [`AttentionDescriptorBuilder::build`]; the tensor-dependent
//! checks run in [`AttentionDescriptor::resolve`], which yields the
//! [`AttentionShape`] the kernels iterate over.
//!
//! ## Example
//!
//! ```rust
//! use flash_attn_rs::kernels::{AttentionDescriptor, Layout};
//!
//! let desc = AttentionDescriptor::builder(0.125)
//!     .layout(Layout::Bhsd)
//!     .causal(true)
//!     .build()
//!     .unwrap();
//! assert!(desc.is_causal());
//! ```

use candle_core::{DType, Tensor};

use crate::error::{FlashAttnError, Result};

/// Memory layout of the Q/K/V tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Layout {
    /// `[batch, heads, seq, dim]`.
    Bhsd,
    /// `[batch, seq, heads, dim]`.
    #[default]
    Bshd,
    /// Packed variable-length batch: `[total_tokens, heads, dim]` addressed
    /// through cumulative sequence offsets.
    Thd,
    /// Grouped heads: `[batch, seq, kv_groups, heads_per_group, dim]`.
    /// K/V carry `[batch, seq, kv_groups, 1, dim]`.
    Bsghd,
}

impl Layout {
    /// Whether this layout uses cumulative sequence offsets.
    #[must_use]
    pub const fn is_varlen(self) -> bool {
        matches!(self, Self::Thd)
    }

    /// Tensor rank expected for this layout.
    #[must_use]
    pub const fn rank(self) -> usize {
        match self {
            Self::Bhsd | Self::Bshd => 4,
            Self::Thd => 3,
            Self::Bsghd => 5,
        }
    }

    /// Split a tensor's dims into `(batch, seq, heads, head_dim)`.
    ///
    /// For [`Layout::Thd`] the batch is reported as 1 and `seq` is the total
    /// token count.
    ///
    /// # Errors
    ///
    /// Returns [`FlashAttnError::Shape`] if the rank does not match.
    pub fn split_dims(self, name: &str, dims: &[usize]) -> Result<TensorDims> {
        if dims.len() != self.rank() {
            return Err(FlashAttnError::Shape(format!(
                "{name}: expected rank {} for {self:?} layout, got {dims:?}",
                self.rank()
            )));
        }
        let split = match self {
            Self::Bhsd => TensorDims::new(dims[0], dims[2], dims[1], dims[3]),
            Self::Bshd => TensorDims::new(dims[0], dims[1], dims[2], dims[3]),
            Self::Thd => TensorDims::new(1, dims[0], dims[1], dims[2]),
            Self::Bsghd => TensorDims::new(dims[0], dims[1], dims[2] * dims[3], dims[4]),
        };
        Ok(split)
    }
}

/// Logical dims of one Q/K/V tensor, independent of layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorDims {
    /// Batch size (1 for packed layouts).
    pub batch: usize,
    /// Sequence length (total tokens for packed layouts).
    pub seq: usize,
    /// Number of heads.
    pub heads: usize,
    /// Head dimension.
    pub head_dim: usize,
}

impl TensorDims {
    const fn new(batch: usize, seq: usize, heads: usize, head_dim: usize) -> Self {
        Self {
            batch,
            seq,
            heads,
            head_dim,
        }
    }
}

/// Exponent base used by the online softmax.
///
/// Both policies produce the same outputs within floating tolerance and both
/// store the log-sum-exp in natural-log units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NumericPolicy {
    /// `exp` / `ln`.
    #[default]
    Natural,
    /// `exp2` / `log2` with scores pre-multiplied by `log2(e)`.
    Base2,
}

/// How the backward pass computes the softmax-gradient correction `delta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeltaFormulation {
    /// `delta = rowsum(O * dO)`.
    #[default]
    UseOutput,
    /// `delta = rowsum(P * dP)`, recomputed from Q, K, V and the LSE.
    UseProbabilities,
}

/// Visible key band around the (tail-aligned) diagonal.
///
/// Key `j` is visible to query `i` iff
/// `-left <= j - i - (seqlen_k - seqlen_q) <= right`; `None` leaves that
/// side unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SlidingWindow {
    /// Keys visible before the diagonal.
    pub left: Option<usize>,
    /// Keys visible after the diagonal.
    pub right: Option<usize>,
}

impl SlidingWindow {
    /// No restriction.
    pub const UNBOUNDED: Self = Self {
        left: None,
        right: None,
    };

    /// Causal band: nothing to the right of the diagonal.
    #[must_use]
    pub const fn causal() -> Self {
        Self {
            left: None,
            right: Some(0),
        }
    }

    /// Create a window with explicit bounds.
    #[must_use]
    pub const fn new(left: Option<usize>, right: Option<usize>) -> Self {
        Self { left, right }
    }

    /// Tighter of the two windows on each side.
    #[must_use]
    pub fn intersect(self, other: Self) -> Self {
        let tighter = |a: Option<usize>, b: Option<usize>| match (a, b) {
            (Some(x), Some(y)) => Some(x.min(y)),
            (x, None) => x,
            (None, y) => y,
        };
        Self {
            left: tighter(self.left, other.left),
            right: tighter(self.right, other.right),
        }
    }

    /// Whether neither side is bounded.
    #[must_use]
    pub const fn is_unbounded(self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

/// Per-head `ALiBi` slopes, either shared across the batch (`heads` entries)
/// or per batch element (`batch * heads` entries).
#[derive(Debug, Clone, PartialEq)]
pub struct AlibiSlopes {
    slopes: Vec<f32>,
}

impl AlibiSlopes {
    /// Wrap raw slopes.
    #[must_use]
    pub fn new(slopes: Vec<f32>) -> Self {
        Self { slopes }
    }

    /// Standard geometric slopes `2^(-8 i / heads)` for `i = 1..=heads`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn geometric(heads: usize) -> Self {
        let slopes = (1..=heads)
            .map(|i| 2f32.powf(-8.0 * i as f32 / heads as f32))
            .collect();
        Self { slopes }
    }

    /// Raw slope values.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.slopes
    }

    /// Slope for a `(batch, head)` pair.
    #[must_use]
    pub fn slope(&self, batch: usize, head: usize, heads: usize) -> f32 {
        if self.slopes.len() == heads {
            self.slopes[head]
        } else {
            self.slopes[batch * heads + head]
        }
    }

    fn check_len(&self, batch: usize, heads: usize) -> Result<()> {
        let len = self.slopes.len();
        if len == heads || len == batch * heads {
            Ok(())
        } else {
            Err(FlashAttnError::Configuration(format!(
                "ALiBi slopes: expected {heads} or {} entries, got {len}",
                batch * heads
            )))
        }
    }
}

/// Additive attention bias `[1 | batch, heads, seqlen_q, seqlen_k]` staged
/// on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionBias {
    data: Vec<f32>,
    dims: [usize; 4],
}

impl AttentionBias {
    /// Stage a bias tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor is not rank 4 or cannot be read.
    pub fn from_tensor(bias: &Tensor) -> Result<Self> {
        let dims: [usize; 4] = bias.dims().try_into().map_err(|_| {
            FlashAttnError::Shape(format!(
                "bias: expected [batch|1, heads, seqlen_q, seqlen_k], got {:?}",
                bias.dims()
            ))
        })?;
        let data = bias.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self { data, dims })
    }

    /// Bias dims.
    #[must_use]
    pub fn dims(&self) -> [usize; 4] {
        self.dims
    }

    /// Row-major `[seqlen_q, seqlen_k]` plane for one `(batch, head)`.
    #[must_use]
    pub fn plane(&self, batch: usize, head: usize) -> &[f32] {
        let [bb, heads, sq, sk] = self.dims;
        let b = if bb == 1 { 0 } else { batch };
        let start = (b * heads + head) * sq * sk;
        &self.data[start..start + sq * sk]
    }

    fn check_shape(&self, batch: usize, heads: usize, seqlen_q: usize, seqlen_k: usize) -> Result<()> {
        let [bb, h, sq, sk] = self.dims;
        if (bb == 1 || bb == batch) && h == heads && sq == seqlen_q && sk == seqlen_k {
            Ok(())
        } else {
            Err(FlashAttnError::ShapeMismatch {
                expected: vec![batch, heads, seqlen_q, seqlen_k],
                actual: self.dims.to_vec(),
            })
        }
    }
}

/// Block table mapping logical cache blocks to physical storage blocks.
///
/// Row `b` lists the physical blocks backing batch element `b`; logical
/// position `p` lives in block `table[b][p / block_size]` at offset
/// `p % block_size`. Physical blocks may be shared between rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTable {
    table: Vec<u32>,
    batch: usize,
    max_blocks_per_seq: usize,
    block_size: usize,
}

impl BlockTable {
    /// Create a block table from a row-major `[batch, max_blocks_per_seq]` matrix.
    ///
    /// # Errors
    ///
    /// Returns [`FlashAttnError::Configuration`] if the matrix size does not
    /// match or `block_size` is zero.
    pub fn new(
        table: Vec<u32>,
        batch: usize,
        max_blocks_per_seq: usize,
        block_size: usize,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(FlashAttnError::Configuration(
                "block table: block_size must be > 0".to_string(),
            ));
        }
        if table.len() != batch * max_blocks_per_seq {
            return Err(FlashAttnError::Configuration(format!(
                "block table: {} entries for [{batch}, {max_blocks_per_seq}]",
                table.len()
            )));
        }
        Ok(Self {
            table,
            batch,
            max_blocks_per_seq,
            block_size,
        })
    }

    /// Read a 2-D integer tensor `[batch, max_blocks_per_seq]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor is not 2-D, holds a negative entry or
    /// `block_size` is zero.
    pub fn from_tensor(table: &Tensor, block_size: usize) -> Result<Self> {
        let (batch, max_blocks) = table.dims2()?;
        let raw = table.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
        let table = raw
            .into_iter()
            .map(|entry| {
                u32::try_from(entry).map_err(|_| {
                    FlashAttnError::Configuration(format!("block table: invalid entry {entry}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(table, batch, max_blocks, block_size)
    }

    /// Number of rows.
    #[must_use]
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Blocks per row.
    #[must_use]
    pub fn max_blocks_per_seq(&self) -> usize {
        self.max_blocks_per_seq
    }

    /// Positions per block.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Logical positions addressable per row.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.max_blocks_per_seq * self.block_size
    }

    /// Physical blocks listed by one row.
    #[must_use]
    pub fn row(&self, batch: usize) -> &[u32] {
        let start = batch * self.max_blocks_per_seq;
        &self.table[start..start + self.max_blocks_per_seq]
    }

    /// Map a logical position to `(physical_block, offset)`.
    ///
    /// # Errors
    ///
    /// Returns [`FlashAttnError::Shape`] if the row or position is out of range.
    pub fn physical_slot(&self, batch: usize, pos: usize) -> Result<(usize, usize)> {
        if batch >= self.batch || pos >= self.capacity() {
            return Err(FlashAttnError::Shape(format!(
                "block table: position ({batch}, {pos}) outside [{}, {}]",
                self.batch,
                self.capacity()
            )));
        }
        Ok(self.slot(batch, pos))
    }

    /// Unchecked variant of [`Self::physical_slot`] for validated ranges.
    #[inline]
    pub(crate) fn slot(&self, batch: usize, pos: usize) -> (usize, usize) {
        let logical = pos / self.block_size;
        let block = self.table[batch * self.max_blocks_per_seq + logical] as usize;
        (block, pos % self.block_size)
    }

    /// Check that every block backing `[0, len)` of `batch` exists.
    pub(crate) fn check_range(&self, batch: usize, len: usize, num_blocks: usize) -> Result<()> {
        if batch >= self.batch || len > self.capacity() {
            return Err(FlashAttnError::Shape(format!(
                "block table: row {batch} cannot address {len} positions (capacity {})",
                self.capacity()
            )));
        }
        let used = len.div_ceil(self.block_size);
        if let Some(bad) = self.row(batch)[..used]
            .iter()
            .find(|&&block| block as usize >= num_blocks)
        {
            return Err(FlashAttnError::Shape(format!(
                "block table: row {batch} references block {bad}, cache has {num_blocks}"
            )));
        }
        Ok(())
    }
}

/// Capability set of one call, used for logging and backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    /// Causal masking.
    pub causal: bool,
    /// Sliding window beyond plain causal.
    pub windowed: bool,
    /// `ALiBi` bias.
    pub alibi: bool,
    /// Additive bias tensor.
    pub bias: bool,
    /// Packed variable-length offsets.
    pub varlen: bool,
    /// Paged cache.
    pub paged: bool,
}

/// Validated, immutable configuration of one attention call.
#[derive(Debug, Clone)]
pub struct AttentionDescriptor {
    softmax_scale: f32,
    layout: Layout,
    causal: bool,
    user_window: SlidingWindow,
    mask_window: SlidingWindow,
    alibi: Option<AlibiSlopes>,
    bias: Option<AttentionBias>,
    dropout_p: f32,
    cu_seqlens_q: Option<Vec<usize>>,
    cu_seqlens_k: Option<Vec<usize>>,
    cache_seqlens: Option<Vec<usize>>,
    cache_batch_idx: Option<Vec<usize>>,
    block_table: Option<BlockTable>,
    numeric_policy: NumericPolicy,
    delta_formulation: DeltaFormulation,
}

impl AttentionDescriptor {
    /// Start building a descriptor with the given softmax scale.
    #[must_use]
    pub fn builder(softmax_scale: f32) -> AttentionDescriptorBuilder {
        AttentionDescriptorBuilder::new(softmax_scale)
    }

    /// Conventional scale `1 / sqrt(head_dim)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn default_scale(head_dim: usize) -> f32 {
        1.0 / (head_dim as f32).sqrt()
    }

    /// Softmax scale.
    #[must_use]
    pub fn softmax_scale(&self) -> f32 {
        self.softmax_scale
    }

    /// Tensor layout.
    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Whether causal masking is enabled.
    #[must_use]
    pub fn is_causal(&self) -> bool {
        self.causal
    }

    /// Window requested through the builder, without the causal bound.
    #[must_use]
    pub fn sliding_window(&self) -> SlidingWindow {
        self.user_window
    }

    /// Effective visible band: the user window merged with the causal bound.
    #[must_use]
    pub fn mask_window(&self) -> SlidingWindow {
        self.mask_window
    }

    /// `ALiBi` slopes, if configured.
    #[must_use]
    pub fn alibi_slopes(&self) -> Option<&AlibiSlopes> {
        self.alibi.as_ref()
    }

    /// Additive bias, if configured.
    #[must_use]
    pub fn bias(&self) -> Option<&AttentionBias> {
        self.bias.as_ref()
    }

    /// Dropout probability.
    #[must_use]
    pub fn dropout(&self) -> f32 {
        self.dropout_p
    }

    /// Cumulative query offsets for packed layouts.
    #[must_use]
    pub fn cu_seqlens_q(&self) -> Option<&[usize]> {
        self.cu_seqlens_q.as_deref()
    }

    /// Cumulative key offsets for packed layouts.
    #[must_use]
    pub fn cu_seqlens_k(&self) -> Option<&[usize]> {
        self.cu_seqlens_k.as_deref()
    }

    /// Valid cache length per batch element.
    #[must_use]
    pub fn cache_seqlens(&self) -> Option<&[usize]> {
        self.cache_seqlens.as_deref()
    }

    /// Cache row used by each batch element.
    #[must_use]
    pub fn cache_batch_idx(&self) -> Option<&[usize]> {
        self.cache_batch_idx.as_deref()
    }

    /// Block table for paged caches.
    #[must_use]
    pub fn block_table(&self) -> Option<&BlockTable> {
        self.block_table.as_ref()
    }

    /// Softmax exponent base.
    #[must_use]
    pub fn numeric_policy(&self) -> NumericPolicy {
        self.numeric_policy
    }

    /// Backward `delta` formulation.
    #[must_use]
    pub fn delta_formulation(&self) -> DeltaFormulation {
        self.delta_formulation
    }

    /// Capability set of this descriptor.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            causal: self.causal,
            windowed: !self.user_window.is_unbounded(),
            alibi: self.alibi.is_some(),
            bias: self.bias.is_some(),
            varlen: self.layout.is_varlen(),
            paged: self.block_table.is_some(),
        }
    }

    /// Reject features the host kernels do not implement.
    pub(crate) fn ensure_supported(&self) -> Result<()> {
        if self.dropout_p > 0.0 {
            return Err(FlashAttnError::Unsupported(format!(
                "dropout is not supported by the host backend (p = {})",
                self.dropout_p
            )));
        }
        Ok(())
    }

    /// Validate Q/K/V against this descriptor and resolve the iteration shape.
    ///
    /// # Errors
    ///
    /// Returns [`FlashAttnError::Shape`] / [`FlashAttnError::ShapeMismatch`]
    /// for rank or size mismatches and [`FlashAttnError::Configuration`]
    /// when head counts or `ALiBi` slopes are incompatible.
    pub fn resolve(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<AttentionShape> {
        let qd = self.layout.split_dims("q", q.dims())?;
        let kd = self.layout.split_dims("k", k.dims())?;
        if k.dims() != v.dims() {
            return Err(FlashAttnError::ShapeMismatch {
                expected: k.dims().to_vec(),
                actual: v.dims().to_vec(),
            });
        }
        if qd.head_dim == 0 {
            return Err(FlashAttnError::Shape("head_dim must be > 0".to_string()));
        }
        if qd.head_dim != kd.head_dim {
            return Err(FlashAttnError::Shape(format!(
                "head_dim mismatch: q={}, k={}",
                qd.head_dim, kd.head_dim
            )));
        }
        if self.layout == Layout::Bsghd {
            let (qg, kg) = (q.dims()[2], k.dims()[2]);
            if qg != kg || k.dims()[3] != 1 {
                let mut expected = k.dims().to_vec();
                expected[2] = qg;
                expected[3] = 1;
                return Err(FlashAttnError::ShapeMismatch {
                    expected,
                    actual: k.dims().to_vec(),
                });
            }
        }
        check_heads(qd.heads, kd.heads)?;

        let (q_lens, k_lens) = match (&self.cu_seqlens_q, &self.cu_seqlens_k) {
            (Some(cu_q), Some(cu_k)) => {
                check_offsets_cover("cu_seqlens_q", cu_q, qd.seq)?;
                check_offsets_cover("cu_seqlens_k", cu_k, kd.seq)?;
                (lengths_from_offsets(cu_q), lengths_from_offsets(cu_k))
            }
            _ => {
                if qd.batch != kd.batch {
                    return Err(FlashAttnError::Shape(format!(
                        "batch mismatch: q={}, k={}",
                        qd.batch, kd.batch
                    )));
                }
                (vec![qd.seq; qd.batch], vec![kd.seq; kd.batch])
            }
        };

        let shape = AttentionShape {
            batch: q_lens.len(),
            heads_q: qd.heads,
            heads_k: kd.heads,
            head_dim: qd.head_dim,
            max_seqlen_q: q_lens.iter().copied().max().unwrap_or(0),
            max_seqlen_k: k_lens.iter().copied().max().unwrap_or(0),
            total_q: qd.seq,
            total_k: kd.seq,
            q_lens,
            k_lens,
        };
        self.check_score_terms(&shape)?;
        Ok(shape)
    }

    /// Check `ALiBi` and bias against a resolved shape.
    pub(crate) fn check_score_terms(&self, shape: &AttentionShape) -> Result<()> {
        if let Some(alibi) = &self.alibi {
            alibi.check_len(shape.batch, shape.heads_q)?;
        }
        if let Some(bias) = &self.bias {
            bias.check_shape(shape.batch, shape.heads_q, shape.max_seqlen_q, shape.max_seqlen_k)?;
        }
        Ok(())
    }
}

/// Resolved iteration shape of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionShape {
    /// Batch size.
    pub batch: usize,
    /// Query heads.
    pub heads_q: usize,
    /// Key/value heads.
    pub heads_k: usize,
    /// Head dimension.
    pub head_dim: usize,
    /// Longest query sequence.
    pub max_seqlen_q: usize,
    /// Longest key sequence.
    pub max_seqlen_k: usize,
    /// Query tokens along the sequence axis of the tensor.
    pub total_q: usize,
    /// Key tokens along the sequence axis of the tensor.
    pub total_k: usize,
    /// Query length per batch element.
    pub q_lens: Vec<usize>,
    /// Valid key length per batch element.
    pub k_lens: Vec<usize>,
}

impl AttentionShape {
    /// Query heads served by each key/value head.
    #[must_use]
    pub fn group_size(&self) -> usize {
        self.heads_q / self.heads_k
    }

    /// Whether several query heads share a key/value head.
    #[must_use]
    pub fn is_grouped(&self) -> bool {
        self.heads_q != self.heads_k
    }
}

pub(crate) fn check_heads(heads_q: usize, heads_k: usize) -> Result<()> {
    if heads_k == 0 || heads_q % heads_k != 0 {
        return Err(FlashAttnError::Configuration(format!(
            "query heads ({heads_q}) must be a multiple of key/value heads ({heads_k})"
        )));
    }
    Ok(())
}

fn lengths_from_offsets(offsets: &[usize]) -> Vec<usize> {
    offsets.windows(2).map(|w| w[1] - w[0]).collect()
}

fn check_offsets_cover(name: &str, offsets: &[usize], tokens: usize) -> Result<()> {
    match offsets.last() {
        Some(&last) if last == tokens => Ok(()),
        last => Err(FlashAttnError::Shape(format!(
            "{name}: last offset {last:?} does not match {tokens} packed tokens"
        ))),
    }
}

fn check_offsets(name: &str, offsets: &[usize]) -> Result<()> {
    if offsets.len() < 2 || offsets[0] != 0 {
        return Err(FlashAttnError::Configuration(format!(
            "{name}: expected at least two offsets starting at 0, got {offsets:?}"
        )));
    }
    if offsets.windows(2).any(|w| w[1] < w[0]) {
        return Err(FlashAttnError::Configuration(format!(
            "{name}: offsets must be non-decreasing, got {offsets:?}"
        )));
    }
    Ok(())
}

/// Builder for [`AttentionDescriptor`]. Every setter is idempotent: calling
/// it again replaces the previous value.
#[derive(Debug, Clone)]
pub struct AttentionDescriptorBuilder {
    softmax_scale: f32,
    layout: Option<Layout>,
    causal: bool,
    window: SlidingWindow,
    alibi: Option<AlibiSlopes>,
    bias: Option<Tensor>,
    dropout_p: f32,
    varlen: Option<(Vec<usize>, Vec<usize>)>,
    cache_seqlens: Option<Vec<usize>>,
    cache_batch_idx: Option<Vec<usize>>,
    block_table: Option<BlockTable>,
    numeric_policy: NumericPolicy,
    delta_formulation: DeltaFormulation,
}

impl AttentionDescriptorBuilder {
    fn new(softmax_scale: f32) -> Self {
        Self {
            softmax_scale,
            layout: None,
            causal: false,
            window: SlidingWindow::UNBOUNDED,
            alibi: None,
            bias: None,
            dropout_p: 0.0,
            varlen: None,
            cache_seqlens: None,
            cache_batch_idx: None,
            block_table: None,
            numeric_policy: NumericPolicy::Natural,
            delta_formulation: DeltaFormulation::UseOutput,
        }
    }

    /// Set the tensor layout.
    #[must_use]
    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Enable or disable causal masking.
    #[must_use]
    pub fn causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    /// Restrict attention to a band around the diagonal.
    #[must_use]
    pub fn sliding_window(mut self, left: Option<usize>, right: Option<usize>) -> Self {
        self.window = SlidingWindow::new(left, right);
        self
    }

    /// Set `ALiBi` slopes (`heads` or `batch * heads` entries).
    #[must_use]
    pub fn alibi_slopes(mut self, slopes: impl Into<Vec<f32>>) -> Self {
        self.alibi = Some(AlibiSlopes::new(slopes.into()));
        self
    }

    /// Set an additive bias `[1 | batch, heads, seqlen_q, seqlen_k]`.
    #[must_use]
    pub fn bias(mut self, bias: &Tensor) -> Self {
        self.bias = Some(bias.clone());
        self
    }

    /// Set the dropout probability.
    #[must_use]
    pub fn dropout(mut self, p: f32) -> Self {
        self.dropout_p = p;
        self
    }

    /// Use the packed layout with cumulative query/key offsets
    /// (`batch + 1` entries each). Selects [`Layout::Thd`] unless a layout
    /// was set explicitly.
    #[must_use]
    pub fn varlen(mut self, cu_seqlens_q: impl Into<Vec<usize>>, cu_seqlens_k: impl Into<Vec<usize>>) -> Self {
        self.varlen = Some((cu_seqlens_q.into(), cu_seqlens_k.into()));
        self
    }

    /// Valid cache length per batch element (decode path).
    #[must_use]
    pub fn cache_seqlens(mut self, lens: impl Into<Vec<usize>>) -> Self {
        self.cache_seqlens = Some(lens.into());
        self
    }

    /// Cache row used by each batch element (decode path).
    #[must_use]
    pub fn cache_batch_idx(mut self, idx: impl Into<Vec<usize>>) -> Self {
        self.cache_batch_idx = Some(idx.into());
        self
    }

    /// Address the cache through a block table (decode path).
    #[must_use]
    pub fn block_table(mut self, table: BlockTable) -> Self {
        self.block_table = Some(table);
        self
    }

    /// Select the softmax exponent base.
    #[must_use]
    pub fn numeric_policy(mut self, policy: NumericPolicy) -> Self {
        self.numeric_policy = policy;
        self
    }

    /// Select the backward `delta` formulation.
    #[must_use]
    pub fn delta_formulation(mut self, formulation: DeltaFormulation) -> Self {
        self.delta_formulation = formulation;
        self
    }

    /// Validate and produce the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`FlashAttnError::Configuration`] for an invalid scale,
    /// dropout, slopes, or a layout/offset conflict.
    pub fn build(self) -> Result<AttentionDescriptor> {
        if !self.softmax_scale.is_finite() || self.softmax_scale <= 0.0 {
            return Err(FlashAttnError::Configuration(format!(
                "softmax scale must be finite and positive, got {}",
                self.softmax_scale
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_p) {
            return Err(FlashAttnError::Configuration(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout_p
            )));
        }
        if let Some(alibi) = &self.alibi {
            if alibi.as_slice().iter().any(|s| !s.is_finite() || *s < 0.0) {
                return Err(FlashAttnError::Configuration(
                    "ALiBi slopes must be finite and non-negative".to_string(),
                ));
            }
        }

        let layout = match (self.layout, &self.varlen) {
            (None, Some(_)) => Layout::Thd,
            (None, None) => Layout::default(),
            (Some(layout), varlen) => {
                if layout.is_varlen() != varlen.is_some() {
                    return Err(FlashAttnError::Configuration(format!(
                        "layout {layout:?} {} cumulative sequence offsets",
                        if varlen.is_some() { "does not take" } else { "requires" }
                    )));
                }
                layout
            }
        };

        let (cu_seqlens_q, cu_seqlens_k) = match self.varlen {
            Some((cu_q, cu_k)) => {
                check_offsets("cu_seqlens_q", &cu_q)?;
                check_offsets("cu_seqlens_k", &cu_k)?;
                if cu_q.len() != cu_k.len() {
                    return Err(FlashAttnError::Configuration(format!(
                        "cu_seqlens_q has {} entries, cu_seqlens_k has {}",
                        cu_q.len(),
                        cu_k.len()
                    )));
                }
                (Some(cu_q), Some(cu_k))
            }
            None => (None, None),
        };

        if self.bias.is_some() && layout.is_varlen() {
            return Err(FlashAttnError::Configuration(
                "additive bias is not defined for packed variable-length batches".to_string(),
            ));
        }
        let bias = self.bias.as_ref().map(AttentionBias::from_tensor).transpose()?;

        let mask_window = if self.causal {
            self.window.intersect(SlidingWindow::causal())
        } else {
            self.window
        };

        Ok(AttentionDescriptor {
            softmax_scale: self.softmax_scale,
            layout,
            causal: self.causal,
            user_window: self.window,
            mask_window,
            alibi: self.alibi,
            bias,
            dropout_p: self.dropout_p,
            cu_seqlens_q,
            cu_seqlens_k,
            cache_seqlens: self.cache_seqlens,
            cache_batch_idx: self.cache_batch_idx,
            block_table: self.block_table,
            numeric_policy: self.numeric_policy,
            delta_formulation: self.delta_formulation,
        })
    }
}
