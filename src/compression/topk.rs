//! Top-k sparsification: transmit the k entries largest in magnitude.
//!
//! Selection is deterministic: ties break toward the lower index, and the
//! wire frame lists pairs in ascending index order, so identical inputs
//! produce identical frames.

use crate::compression::{read_u32, write_u32};
use crate::compression::traits::{require_float, Compressor, Scalar};
use crate::error::{Result, ServerError};
use crate::types::DataType;

/// Wire frame: `[n:u32][k:u32][(index:u32, value:T) * k]`.
pub struct TopkCompressor {
    dtype: DataType,
    k: usize,
    cbuf: Vec<u8>,
    dbuf: Vec<u8>,
    order: Vec<u32>,
}

impl TopkCompressor {
    pub fn new(size: usize, dtype: DataType, k: usize) -> Result<Self> {
        require_float(dtype, "topk")?;
        let count = size / dtype.size_in_bytes();
        Ok(Self {
            dtype,
            k,
            cbuf: vec![0u8; 8 + count * (4 + dtype.size_in_bytes())],
            dbuf: vec![0u8; size],
            order: Vec::with_capacity(count),
        })
    }

    /// Indices selected for the current frame, in wire order.
    fn selected(&self) -> &[u32] {
        &self.order
    }

    fn compress_impl<T: Scalar>(&mut self, grad: &[u8]) -> usize {
        let n = grad.len() / T::SIZE;
        let k = self.k.min(n);

        self.order.clear();
        self.order.extend(0..n as u32);
        let value = |idx: u32| T::read(&grad[idx as usize * T::SIZE..(idx as usize + 1) * T::SIZE]);
        self.order.sort_unstable_by(|&a, &b| {
            value(b)
                .abs_val()
                .partial_cmp(&value(a).abs_val())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        self.order.truncate(k);
        self.order.sort_unstable();

        write_u32(&mut self.cbuf[0..4], n as u32);
        write_u32(&mut self.cbuf[4..8], k as u32);
        let pair = 4 + T::SIZE;
        for (i, &idx) in self.order.iter().enumerate() {
            let off = 8 + i * pair;
            write_u32(&mut self.cbuf[off..off + 4], idx);
            value(idx).write(&mut self.cbuf[off + 4..off + pair]);
        }
        8 + k * pair
    }

    fn decompress_impl<T: Scalar>(&mut self, compressed: &[u8]) -> Result<usize> {
        if compressed.len() < 8 {
            return Err(ServerError::CompressedPayload(
                "topk frame shorter than header".into(),
            ));
        }
        let n = read_u32(&compressed[0..4]) as usize;
        let k = read_u32(&compressed[4..8]) as usize;
        let pair = 4 + T::SIZE;
        if compressed.len() < 8 + k * pair || n * T::SIZE > self.dbuf.len() {
            return Err(ServerError::CompressedPayload(format!(
                "topk frame of {} bytes cannot hold {} pairs over {} elements",
                compressed.len(),
                k,
                n
            )));
        }
        self.dbuf[..n * T::SIZE].fill(0);
        for i in 0..k {
            let off = 8 + i * pair;
            let idx = read_u32(&compressed[off..off + 4]) as usize;
            if idx >= n {
                return Err(ServerError::CompressedPayload(format!(
                    "topk index {idx} out of range for {n} elements"
                )));
            }
            self.dbuf[idx * T::SIZE..(idx + 1) * T::SIZE]
                .copy_from_slice(&compressed[off + 4..off + pair]);
        }
        Ok(n * T::SIZE)
    }

    fn zero_error_at_selected<T: Scalar>(&self, error: &mut [u8]) {
        for &idx in self.selected() {
            T::zero().write(&mut error[idx as usize * T::SIZE..(idx as usize + 1) * T::SIZE]);
        }
    }
}

impl Compressor for TopkCompressor {
    fn compress(&mut self, grad: &mut [u8]) -> Result<&[u8]> {
        let len = match self.dtype {
            DataType::F64 => self.compress_impl::<f64>(grad),
            _ => self.compress_impl::<f32>(grad),
        };
        Ok(&self.cbuf[..len])
    }

    fn decompress(&mut self, compressed: &[u8]) -> Result<&[u8]> {
        let len = match self.dtype {
            DataType::F64 => self.decompress_impl::<f64>(compressed)?,
            _ => self.decompress_impl::<f32>(compressed)?,
        };
        Ok(&self.dbuf[..len])
    }

    fn supports_fused_compress(&self) -> bool {
        true
    }

    /// `e <- corrected gradient`, zeroed at the selected k indices, in one
    /// pass over the tensor instead of a compress/decompress round-trip.
    fn fused_compress(&mut self, grad: &mut [u8], error: &mut [u8]) -> Result<&[u8]> {
        error[..grad.len()].copy_from_slice(grad);
        let len = match self.dtype {
            DataType::F64 => {
                let len = self.compress_impl::<f64>(grad);
                self.zero_error_at_selected::<f64>(error);
                len
            }
            _ => {
                let len = self.compress_impl::<f32>(grad);
                self.zero_error_at_selected::<f32>(error);
                len
            }
        };
        Ok(&self.cbuf[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::as_bytes_mut;

    fn f32s(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_keeps_largest_magnitudes() {
        let mut c = TopkCompressor::new(16, DataType::F32, 2).unwrap();
        let mut grad = [0.1f32, 3.0, 0.2, -5.0];
        let frame = c.compress(as_bytes_mut(&mut grad)).unwrap().to_vec();
        assert_eq!(c.selected(), &[1, 3]);
        let out = f32s(c.decompress(&frame).unwrap());
        assert_eq!(out, vec![0.0, 3.0, 0.0, -5.0]);
    }

    #[test]
    fn test_k_clamped_to_count_is_lossless() {
        let mut c = TopkCompressor::new(16, DataType::F32, 100).unwrap();
        let mut grad = [1.0f32, -2.0, 3.0, -4.0];
        let frame = c.compress(as_bytes_mut(&mut grad)).unwrap().to_vec();
        let out = f32s(c.decompress(&frame).unwrap());
        assert_eq!(out, vec![1.0, -2.0, 3.0, -4.0]);
    }

    #[test]
    fn test_tie_break_prefers_lower_index() {
        let mut c = TopkCompressor::new(16, DataType::F32, 1).unwrap();
        let mut grad = [2.0f32, -2.0, 2.0, 2.0];
        c.compress(as_bytes_mut(&mut grad)).unwrap();
        assert_eq!(c.selected(), &[0]);
    }

    #[test]
    fn test_fused_compress_updates_error() {
        let mut c = TopkCompressor::new(16, DataType::F32, 1).unwrap();
        let mut grad = [0.5f32, 0.25, 8.0, 0.125];
        let mut error = [0u8; 16];
        let frame = c
            .fused_compress(as_bytes_mut(&mut grad), &mut error)
            .unwrap()
            .to_vec();
        // error holds everything the frame did not carry
        assert_eq!(f32s(&error), vec![0.5, 0.25, 0.0, 0.125]);
        let out = f32s(c.decompress(&frame).unwrap());
        assert_eq!(out, vec![0.0, 0.0, 8.0, 0.0]);
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let mut c = TopkCompressor::new(16, DataType::F32, 1).unwrap();
        let mut frame = vec![0u8; 16];
        frame[0..4].copy_from_slice(&4u32.to_ne_bytes());
        frame[4..8].copy_from_slice(&1u32.to_ne_bytes());
        frame[8..12].copy_from_slice(&9u32.to_ne_bytes()); // index 9 of 4
        assert!(c.decompress(&frame).is_err());
    }
}
