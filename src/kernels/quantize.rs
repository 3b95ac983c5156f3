// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Grouped int4 codec for KV-cache tensors.
//!
//! The last dimension is split into groups of `group_size` elements. Each
//! group stores its `(min, max)` as two f16 values followed by
//! `group_size / 2` bytes of 4-bit codes, two per byte with the lower index
//! in the low nibble. Reconstruction is
//! `min + code * (max - min) / 15`, so the per-element error is at most one
//! quantization step `(max - min) / 15` of its group.
//!
//! Codes are computed against the f16-rounded `(min, max)`, which makes the
//! stored parameters the exact ones used for reconstruction. A constant
//! group stores code 0 everywhere and reconstructs to its (f16) value.
//!
//! ## Example
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use flash_attn_rs::kernels::{dequantize_kv_int4, quantize_kv_int4};
//!
//! let device = Device::Cpu;
//! let kv = Tensor::randn(0f32, 1.0, (2, 16, 4, 64), &device).unwrap();
//! let packed = quantize_kv_int4(&kv, 32).unwrap();
//! assert!(packed.compression_ratio() > 6.0);
//! let restored = dequantize_kv_int4(&packed, 32, &device).unwrap();
//! assert_eq!(restored.dims(), kv.dims());
//! ```

use candle_core::{Device, Tensor};
use half::f16;
use rayon::prelude::*;

use super::host::stage;
use crate::error::{FlashAttnError, Result};

/// Number of quantization steps of a 4-bit code.
const LEVELS: f32 = 15.0;

/// Packed int4 tensor with per-group f16 `(min, max)`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedKv {
    dims: Vec<usize>,
    group_size: usize,
    params: Vec<f16>,
    codes: Vec<u8>,
}

impl QuantizedKv {
    /// Quantize a row-major f32 buffer with the given dims.
    ///
    /// # Errors
    ///
    /// Returns [`FlashAttnError::Quantization`] if `group_size` is zero or
    /// odd, does not divide the last dimension, or the data holds a
    /// non-finite value or one outside the f16 range;
    /// [`FlashAttnError::Shape`] if `data` does not match `dims`.
    pub fn from_f32(data: &[f32], dims: &[usize], group_size: usize) -> Result<Self> {
        check_group_size(dims, group_size)?;
        let numel: usize = dims.iter().product();
        if data.len() != numel {
            return Err(FlashAttnError::Shape(format!(
                "quantize: {} values for dims {dims:?}",
                data.len()
            )));
        }
        if let Some(bad) = data.iter().find(|x| !x.is_finite()) {
            return Err(FlashAttnError::Quantization(format!(
                "cannot quantize non-finite value {bad}"
            )));
        }
        // Group min/max are stored as f16.
        let limit = f16::MAX.to_f32();
        if let Some(bad) = data.iter().find(|x| x.abs() > limit) {
            return Err(FlashAttnError::Quantization(format!(
                "value {bad} is outside the f16 range of the group parameters"
            )));
        }

        let num_groups = numel / group_size;
        let mut params = vec![f16::ZERO; 2 * num_groups];
        let mut codes = vec![0u8; numel / 2];
        params
            .par_chunks_mut(2)
            .zip(codes.par_chunks_mut(group_size / 2))
            .zip(data.par_chunks(group_size))
            .for_each(|((p, c), group)| quantize_group(group, p, c));

        Ok(Self {
            dims: dims.to_vec(),
            group_size,
            params,
            codes,
        })
    }

    /// Logical dims.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Elements per group.
    #[must_use]
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Number of groups.
    #[must_use]
    pub fn num_groups(&self) -> usize {
        self.params.len() / 2
    }

    /// `(min, max)` of one group.
    #[must_use]
    pub fn group_params(&self, group: usize) -> (f16, f16) {
        (self.params[2 * group], self.params[2 * group + 1])
    }

    /// Packed codes, two per byte, low nibble first.
    #[must_use]
    pub fn codes(&self) -> &[u8] {
        &self.codes
    }

    /// Elements in the last dimension.
    #[must_use]
    pub fn row_len(&self) -> usize {
        self.dims.last().copied().unwrap_or(0)
    }

    /// Bytes of packed storage (codes plus parameters).
    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.codes.len() + self.params.len() * std::mem::size_of::<f16>()
    }

    /// Size of the same tensor in f32 divided by [`Self::nbytes`].
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compression_ratio(&self) -> f64 {
        let numel: usize = self.dims.iter().product();
        (numel * std::mem::size_of::<f32>()) as f64 / self.nbytes() as f64
    }

    /// Dequantize one last-dimension row into `out` (`row_len` elements).
    ///
    /// # Panics
    ///
    /// Panics if `row` is out of range or `out` is shorter than a row.
    pub fn dequantize_row(&self, row: usize, out: &mut [f32]) {
        let len = self.row_len();
        let groups_per_row = len / self.group_size;
        let half_group = self.group_size / 2;
        for (g, dst) in out[..len].chunks_exact_mut(self.group_size).enumerate() {
            let group = row * groups_per_row + g;
            let codes = &self.codes[group * half_group..(group + 1) * half_group];
            dequantize_group(self.group_params(group), codes, dst);
        }
    }

    /// Dequantize everything into a row-major f32 buffer.
    #[must_use]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let numel: usize = self.dims.iter().product();
        let mut out = vec![0.0; numel];
        out.par_chunks_mut(self.group_size)
            .zip(self.codes.par_chunks(self.group_size / 2))
            .zip(self.params.par_chunks(2))
            .for_each(|((dst, codes), p)| dequantize_group((p[0], p[1]), codes, dst));
        out
    }
}

fn check_group_size(dims: &[usize], group_size: usize) -> Result<()> {
    if group_size == 0 || group_size % 2 != 0 {
        return Err(FlashAttnError::Quantization(format!(
            "group size must be even and non-zero, got {group_size}"
        )));
    }
    let last = dims.last().copied().unwrap_or(0);
    if last == 0 || last % group_size != 0 {
        return Err(FlashAttnError::Quantization(format!(
            "last dimension {last} is not divisible by group size {group_size}"
        )));
    }
    Ok(())
}

fn quantize_group(group: &[f32], params: &mut [f16], codes: &mut [u8]) {
    let (lo, hi) = group
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
    let (lo, hi) = (f16::from_f32(lo), f16::from_f32(hi));
    params[0] = lo;
    params[1] = hi;

    let lo = lo.to_f32();
    let step = (hi.to_f32() - lo) / LEVELS;
    let code = |x: f32| -> u8 {
        if step > 0.0 {
            // Clamped to [0, 15] before the cast.
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let c = ((x - lo) / step).round().clamp(0.0, LEVELS) as u8;
            c
        } else {
            0
        }
    };
    for (byte, pair) in codes.iter_mut().zip(group.chunks_exact(2)) {
        *byte = code(pair[0]) | (code(pair[1]) << 4);
    }
}

fn dequantize_group((lo, hi): (f16, f16), codes: &[u8], out: &mut [f32]) {
    let lo = lo.to_f32();
    let step = (hi.to_f32() - lo) / LEVELS;
    for (pair, &byte) in out.chunks_exact_mut(2).zip(codes) {
        pair[0] = lo + f32::from(byte & 0x0f) * step;
        pair[1] = lo + f32::from(byte >> 4) * step;
    }
}

/// Quantize a tensor to grouped int4.
///
/// Group `(min, max)` are rounded to f16 before the codes are chosen, so the
/// one-step error bound and the exact reconstruction of constant groups
/// hold relative to those rounded values. A constant group of `0.1` comes
/// back as `0.099975586`, and a group whose spread is below the f16 spacing
/// at its magnitude (`[1000.0, 1000.1, ..]`) collapses to its rounded min.
///
/// # Errors
///
/// See [`QuantizedKv::from_f32`].
pub fn quantize_kv_int4(tensor: &Tensor, group_size: usize) -> Result<QuantizedKv> {
    tracing::debug!(dims = ?tensor.dims(), group_size, "int4 quantize");
    check_group_size(tensor.dims(), group_size)?;
    QuantizedKv::from_f32(&stage(tensor)?, tensor.dims(), group_size)
}

/// Dequantize a packed tensor to f32 on `device`.
///
/// Each element is `min + code * (max - min) / 15` with the group's stored
/// f16 `(min, max)`; the result matches the original input only up to that
/// f16 rounding (see [`quantize_kv_int4`]).
///
/// # Errors
///
/// Returns [`FlashAttnError::Quantization`] if `group_size` differs from
/// the one the tensor was packed with.
pub fn dequantize_kv_int4(packed: &QuantizedKv, group_size: usize, device: &Device) -> Result<Tensor> {
    if group_size != packed.group_size {
        return Err(FlashAttnError::Quantization(format!(
            "tensor was packed with group size {}, got {group_size}",
            packed.group_size
        )));
    }
    Ok(Tensor::from_vec(packed.to_f32_vec(), packed.dims(), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packing_low_nibble_first() {
        // min 0, max 15: step 1, codes equal the values.
        let data = [0.0, 15.0, 3.0, 7.0];
        let q = QuantizedKv::from_f32(&data, &[1, 4], 4).unwrap();
        assert_eq!(q.codes(), &[0xf0, 0x73]);
        assert_eq!(q.group_params(0), (f16::from_f32(0.0), f16::from_f32(15.0)));
        assert_eq!(q.to_f32_vec(), data.to_vec());
    }

    #[test]
    fn test_error_within_one_step() {
        let data: Vec<f32> = (0..64).map(|i| ((i * 37) % 23) as f32 * 0.173 - 1.9).collect();
        let q = QuantizedKv::from_f32(&data, &[2, 32], 8).unwrap();
        let restored = q.to_f32_vec();
        for (g, (orig, rest)) in data.chunks(8).zip(restored.chunks(8)).enumerate() {
            let (lo, hi) = q.group_params(g);
            let step = (hi.to_f32() - lo.to_f32()) / 15.0;
            for (a, b) in orig.iter().zip(rest) {
                assert!((a - b).abs() <= step + 1e-3, "group {g}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_constant_group_is_exact() {
        let data = vec![0.75f32; 16];
        let q = QuantizedKv::from_f32(&data, &[16], 8).unwrap();
        assert!(q.codes().iter().all(|&c| c == 0));
        assert_eq!(q.to_f32_vec(), data);
    }

    #[test]
    fn test_dequantize_row_matches_full() {
        let data: Vec<f32> = (0..48).map(|i| (i as f32 * 0.41).sin()).collect();
        let q = QuantizedKv::from_f32(&data, &[3, 16], 4).unwrap();
        let full = q.to_f32_vec();
        let mut row = vec![0.0; 16];
        q.dequantize_row(2, &mut row);
        assert_eq!(row, full[32..48].to_vec());
    }

    #[test]
    fn test_invalid_group_sizes() {
        let data = vec![0.0f32; 12];
        for gs in [0, 3, 8] {
            assert!(matches!(
                QuantizedKv::from_f32(&data, &[12], gs),
                Err(FlashAttnError::Quantization(_))
            ));
        }
    }

    #[test]
    fn test_rejects_non_finite() {
        let data = [1.0, f32::NAN];
        assert!(matches!(
            QuantizedKv::from_f32(&data, &[2], 2),
            Err(FlashAttnError::Quantization(_))
        ));
    }

    #[test]
    fn test_rejects_values_beyond_f16_range() {
        for data in [[1e5f32; 4], [7e4, 1.0, 2.0, 3.0], [-1e5, 0.0, 0.0, 0.0]] {
            assert!(matches!(
                QuantizedKv::from_f32(&data, &[4], 4),
                Err(FlashAttnError::Quantization(_))
            ));
        }

        // The f16 extremes themselves stay finite.
        let max = f16::MAX.to_f32();
        let q = QuantizedKv::from_f32(&[max, -max, 0.0, 1.0], &[4], 4).unwrap();
        let restored = q.to_f32_vec();
        assert!(restored.iter().all(|x| x.is_finite()), "{restored:?}");
        assert_eq!(restored[1], -max);
        assert!((restored[0] - max).abs() <= max * 1e-6, "{restored:?}");
    }

    #[test]
    fn test_size_accounting() {
        let q = QuantizedKv::from_f32(&vec![1.0f32; 128], &[128], 32).unwrap();
        // 64 code bytes + 4 groups * 2 * 2 bytes.
        assert_eq!(q.nbytes(), 80);
        assert!((q.compression_ratio() - 6.4).abs() < 1e-9);
    }

    #[test]
    fn test_dequantize_group_size_mismatch() {
        let t = Tensor::ones((2, 8), candle_core::DType::F32, &Device::Cpu).unwrap();
        let q = quantize_kv_int4(&t, 4).unwrap();
        assert!(dequantize_kv_int4(&q, 8, &Device::Cpu).is_err());
        let back = dequantize_kv_int4(&q, 4, &Device::Cpu).unwrap();
        assert_eq!(back.dims(), &[2, 8]);
    }
}
