// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Candle ↔ `CubeCL` buffer conversion.
//!
//! `CubeCL` handles are created from little-endian f32 bytes; these helpers
//! move tensors in and out of that form. Any float dtype is accepted on the
//! way in and converted to f32.

use candle_core::{DType, Device, Tensor};

use crate::error::{FlashAttnError, Result};

/// Whether the `CubeCL` CUDA kernel can be launched.
///
/// `true` only when the `cuda` feature is enabled and candle sees a CUDA
/// device.
///
/// # Example
///
/// ```rust
/// use flash_attn_rs::kernels::cubecl::has_cubecl_cuda_support;
///
/// if !has_cubecl_cuda_support() {
///     println!("running on the host path");
/// }
/// ```
#[must_use]
pub fn has_cubecl_cuda_support() -> bool {
    #[cfg(feature = "cuda")]
    {
        matches!(Device::cuda_if_available(0), Ok(Device::Cuda(_)))
    }

    #[cfg(not(feature = "cuda"))]
    {
        false
    }
}

/// Flatten a tensor into little-endian f32 bytes.
///
/// # Errors
///
/// Returns an error if the tensor cannot be converted to f32 or copied to
/// the host.
pub fn tensor_to_f32_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let data = tensor
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    Ok(data.iter().flat_map(|x| x.to_le_bytes()).collect())
}

/// Build an f32 tensor of `shape` on `device` from little-endian bytes.
///
/// # Errors
///
/// Returns [`FlashAttnError::Shape`] if the byte count does not match the
/// shape.
pub fn f32_bytes_to_tensor(bytes: &[u8], shape: &[usize], device: &Device) -> Result<Tensor> {
    let num_elements: usize = shape.iter().product();
    let expected = num_elements * std::mem::size_of::<f32>();
    if bytes.len() != expected {
        return Err(FlashAttnError::Shape(format!(
            "byte count mismatch: expected {expected} for shape {shape:?}, got {}",
            bytes.len()
        )));
    }
    let data: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}
