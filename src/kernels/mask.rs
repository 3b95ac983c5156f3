// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Score policy for one `(batch, head)`: visibility band, `ALiBi`, additive
//! bias and the exponent base of the online softmax.
//!
//! The diagonal is aligned to the tail of the key sequence: with
//! `offset = seqlen_k - seqlen_q`, key `j` sits on query `i`'s diagonal when
//! `j == i + offset`. Scores leave [`ScorePolicy::score`] already in the
//! policy's exponent units, so callers only ever use [`ScorePolicy::exp`].

use std::f32::consts::{LN_2, LOG2_E};
use std::ops::Range;

use super::descriptor::{AttentionDescriptor, NumericPolicy, SlidingWindow};

/// Per-head scoring rules.
#[derive(Debug, Clone)]
pub(crate) struct ScorePolicy<'a> {
    scale: f32,
    term_scale: f32,
    base2: bool,
    window: SlidingWindow,
    offset: isize,
    q_len: usize,
    k_len: usize,
    alibi_slope: Option<f32>,
    bias: Option<(&'a [f32], usize)>,
}

#[allow(clippy::cast_possible_wrap)]
impl<'a> ScorePolicy<'a> {
    /// Policy for query head `head` of batch element `batch`.
    pub(crate) fn new(
        desc: &'a AttentionDescriptor,
        batch: usize,
        head: usize,
        heads_q: usize,
        q_len: usize,
        k_len: usize,
    ) -> Self {
        let base2 = desc.numeric_policy() == NumericPolicy::Base2;
        let term_scale = if base2 { LOG2_E } else { 1.0 };
        Self {
            scale: desc.softmax_scale() * term_scale,
            term_scale,
            base2,
            window: desc.mask_window(),
            offset: k_len as isize - q_len as isize,
            q_len,
            k_len,
            alibi_slope: desc.alibi_slopes().map(|s| s.slope(batch, head, heads_q)),
            bias: desc
                .bias()
                .map(|b| (b.plane(batch, head), b.dims()[3])),
        }
    }

    pub(crate) fn q_len(&self) -> usize {
        self.q_len
    }

    pub(crate) fn k_len(&self) -> usize {
        self.k_len
    }

    /// Whether key `j` is visible to query `i`.
    #[inline]
    pub(crate) fn visible(&self, i: usize, j: usize) -> bool {
        let rel = j as isize - i as isize - self.offset;
        self.window.left.map_or(true, |l| rel >= -(l as isize))
            && self.window.right.map_or(true, |r| rel <= r as isize)
    }

    /// Keys visible to query `i`.
    pub(crate) fn key_range(&self, i: usize) -> Range<usize> {
        let lo = self.key_lo(i);
        let hi = self.key_hi(i);
        lo.min(hi)..hi
    }

    /// Keys visible to at least one query in `rows`.
    pub(crate) fn keys_for_rows(&self, rows: Range<usize>) -> Range<usize> {
        if rows.is_empty() {
            return 0..0;
        }
        let lo = self.key_lo(rows.start);
        let hi = self.key_hi(rows.end - 1);
        lo.min(hi)..hi
    }

    /// Queries that see at least one key in `keys`.
    pub(crate) fn queries_for_keys(&self, keys: Range<usize>) -> Range<usize> {
        if keys.is_empty() {
            return 0..0;
        }
        let q_len = self.q_len as isize;
        let lo = self.window.right.map_or(0, |r| {
            (keys.start as isize - self.offset - r as isize).clamp(0, q_len)
        });
        let hi = self.window.left.map_or(q_len, |l| {
            (keys.end as isize - self.offset + l as isize).clamp(0, q_len)
        });
        let (lo, hi) = (lo as usize, hi as usize);
        lo.min(hi)..hi
    }

    fn key_lo(&self, i: usize) -> usize {
        let k_len = self.k_len as isize;
        self.window.left.map_or(0, |l| {
            (i as isize + self.offset - l as isize).clamp(0, k_len) as usize
        })
    }

    fn key_hi(&self, i: usize) -> usize {
        let k_len = self.k_len as isize;
        self.window.right.map_or(self.k_len, |r| {
            (i as isize + self.offset + r as isize + 1).clamp(0, k_len) as usize
        })
    }

    /// Final score of `(i, j)` from the raw `q . k` product, in exponent
    /// units; masked pairs are `-inf`.
    #[inline]
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn score(&self, qk: f32, i: usize, j: usize) -> f32 {
        if !self.visible(i, j) {
            return f32::NEG_INFINITY;
        }
        let mut s = qk * self.scale;
        if let Some(slope) = self.alibi_slope {
            let dist = (i as isize + self.offset - j as isize).unsigned_abs();
            s -= slope * dist as f32 * self.term_scale;
        }
        if let Some((plane, cols)) = self.bias {
            s += plane[i * cols + j] * self.term_scale;
        }
        s
    }

    /// Natural softmax scale, as used by `dS = P * (dP - delta) * scale`.
    pub(crate) fn softmax_scale(&self) -> f32 {
        self.scale / self.term_scale
    }

    #[inline]
    pub(crate) fn exp(&self, x: f32) -> f32 {
        if self.base2 {
            x.exp2()
        } else {
            x.exp()
        }
    }

    #[inline]
    pub(crate) fn log(&self, x: f32) -> f32 {
        if self.base2 {
            x.log2()
        } else {
            x.ln()
        }
    }

    /// Convert a log-sum-exp in exponent units to natural-log units.
    #[inline]
    pub(crate) fn to_natural(&self, lse: f32) -> f32 {
        if self.base2 {
            lse * LN_2
        } else {
            lse
        }
    }

    /// Inverse of [`Self::to_natural`].
    #[inline]
    pub(crate) fn from_natural(&self, lse: f32) -> f32 {
        if self.base2 {
            lse * LOG2_E
        } else {
            lse
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn desc(builder: crate::kernels::AttentionDescriptorBuilder) -> AttentionDescriptor {
        builder.build().unwrap()
    }

    #[test]
    fn test_causal_tail_aligned() {
        let d = desc(AttentionDescriptor::builder(1.0).causal(true));
        // 2 queries against 5 keys: offset 3.
        let p = ScorePolicy::new(&d, 0, 0, 1, 2, 5);
        assert_eq!(p.key_range(0), 0..4);
        assert_eq!(p.key_range(1), 0..5);
        assert!(p.visible(0, 3));
        assert!(!p.visible(0, 4));
    }

    #[test]
    fn test_causal_more_queries_than_keys() {
        let d = desc(AttentionDescriptor::builder(1.0).causal(true));
        // 5 queries against 2 keys: the first 3 rows see nothing.
        let p = ScorePolicy::new(&d, 0, 0, 1, 5, 2);
        assert!(p.key_range(0).is_empty());
        assert!(p.key_range(2).is_empty());
        assert_eq!(p.key_range(3), 0..1);
        assert_eq!(p.key_range(4), 0..2);
        assert_eq!(p.queries_for_keys(0..2), 3..5);
        assert_eq!(p.queries_for_keys(1..2), 4..5);
    }

    #[test]
    fn test_sliding_window_ranges() {
        let d = desc(AttentionDescriptor::builder(1.0).sliding_window(Some(2), Some(1)));
        let p = ScorePolicy::new(&d, 0, 0, 1, 8, 8);
        assert_eq!(p.key_range(0), 0..2);
        assert_eq!(p.key_range(4), 2..6);
        assert_eq!(p.key_range(7), 5..8);
        assert_eq!(p.keys_for_rows(2..5), 0..6);
        assert_eq!(p.queries_for_keys(4..6), 3..8);
        for i in 0..8 {
            for j in 0..8 {
                assert_eq!(p.visible(i, j), p.key_range(i).contains(&j), "({i}, {j})");
            }
        }
    }

    #[test]
    fn test_unbounded_ranges() {
        let d = desc(AttentionDescriptor::builder(1.0));
        let p = ScorePolicy::new(&d, 0, 0, 1, 3, 7);
        assert_eq!(p.key_range(0), 0..7);
        assert_eq!(p.queries_for_keys(6..7), 0..3);
        assert_eq!(p.keys_for_rows(0..0), 0..0);
    }

    #[test]
    fn test_alibi_and_bias_terms() {
        let bias = Tensor::new(&[[[[0.5f32, -1.0], [2.0, 0.0]]]], &Device::Cpu).unwrap();
        let d = desc(
            AttentionDescriptor::builder(0.5)
                .alibi_slopes(vec![0.25])
                .bias(&bias),
        );
        let p = ScorePolicy::new(&d, 0, 0, 1, 2, 2);
        // 0.5 * 4.0 - 0.25 * |0 - 1| - 1.0
        assert!((p.score(4.0, 0, 1) - 0.75).abs() < 1e-6);
        assert!((p.score(4.0, 1, 0) - 3.75).abs() < 1e-6);
    }

    #[test]
    fn test_base2_matches_natural() {
        let nat = desc(AttentionDescriptor::builder(0.3).alibi_slopes(vec![0.1]));
        let b2 = desc(
            AttentionDescriptor::builder(0.3)
                .alibi_slopes(vec![0.1])
                .numeric_policy(NumericPolicy::Base2),
        );
        let pn = ScorePolicy::new(&nat, 0, 0, 1, 4, 4);
        let p2 = ScorePolicy::new(&b2, 0, 0, 1, 4, 4);
        let en = pn.exp(pn.score(1.7, 3, 1));
        let e2 = p2.exp(p2.score(1.7, 3, 1));
        assert!((en - e2).abs() < 1e-5);
        assert!((p2.to_natural(p2.log(10.0)) - 10f32.ln()).abs() < 1e-5);
        assert!((p2.from_natural(p2.to_natural(3.0)) - 3.0).abs() < 1e-6);
        assert!((p2.softmax_scale() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_masked_score_is_neg_inf() {
        let d = desc(AttentionDescriptor::builder(1.0).causal(true));
        let p = ScorePolicy::new(&d, 0, 0, 1, 4, 4);
        assert_eq!(p.score(1.0, 0, 1), f32::NEG_INFINITY);
    }
}
