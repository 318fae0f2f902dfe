//! Random-k sparsification: transmit k uniformly sampled entries.
//!
//! O(n)-free selection (no sort); decompression rescales by `n/k` so the
//! sparse update is unbiased in expectation. Sampling draws with
//! replacement from the shared xorshift128+ generator; a `seed`
//! hyper-parameter makes the stream reproducible per key.

use crate::compression::rng::Xorshift128Plus;
use crate::compression::{read_u32, write_u32};
use crate::compression::traits::{require_float, Compressor, Scalar};
use crate::error::{Result, ServerError};
use crate::types::DataType;

/// Wire frame: `[n:u32][k:u32][(index:u32, value:T) * k]`.
pub struct RandomkCompressor {
    dtype: DataType,
    k: usize,
    rng: Xorshift128Plus,
    cbuf: Vec<u8>,
    dbuf: Vec<u8>,
}

impl RandomkCompressor {
    pub fn new(size: usize, dtype: DataType, k: usize, seed: Option<u64>) -> Result<Self> {
        require_float(dtype, "randomk")?;
        let count = size / dtype.size_in_bytes();
        let mut rng = Xorshift128Plus::new();
        if let Some(seed) = seed {
            // offset by k so differently-sized configs draw distinct streams
            rng.set_seed(seed + k as u64);
        }
        Ok(Self {
            dtype,
            k,
            rng,
            cbuf: vec![0u8; 8 + count.max(k) * (4 + dtype.size_in_bytes())],
            dbuf: vec![0u8; size],
        })
    }

    fn compress_impl<T: Scalar>(&mut self, grad: &[u8]) -> usize {
        let n = grad.len() / T::SIZE;
        let k = self.k.min(n);

        write_u32(&mut self.cbuf[0..4], n as u32);
        write_u32(&mut self.cbuf[4..8], k as u32);
        let pair = 4 + T::SIZE;
        for i in 0..k {
            let idx = self.rng.randint(0, n as u64) as usize;
            let off = 8 + i * pair;
            write_u32(&mut self.cbuf[off..off + 4], idx as u32);
            self.cbuf[off + 4..off + pair]
                .copy_from_slice(&grad[idx * T::SIZE..(idx + 1) * T::SIZE]);
        }
        8 + k * pair
    }

    fn decompress_impl<T: Scalar>(&mut self, compressed: &[u8]) -> Result<usize> {
        if compressed.len() < 8 {
            return Err(ServerError::CompressedPayload(
                "randomk frame shorter than header".into(),
            ));
        }
        let n = read_u32(&compressed[0..4]) as usize;
        let k = read_u32(&compressed[4..8]) as usize;
        let pair = 4 + T::SIZE;
        if compressed.len() < 8 + k * pair || n * T::SIZE > self.dbuf.len() {
            return Err(ServerError::CompressedPayload(format!(
                "randomk frame of {} bytes cannot hold {} pairs over {} elements",
                compressed.len(),
                k,
                n
            )));
        }
        let scale = if k > 0 { n as f64 / k as f64 } else { 0.0 };
        self.dbuf[..n * T::SIZE].fill(0);
        for i in 0..k {
            let off = 8 + i * pair;
            let idx = read_u32(&compressed[off..off + 4]) as usize;
            if idx >= n {
                return Err(ServerError::CompressedPayload(format!(
                    "randomk index {idx} out of range for {n} elements"
                )));
            }
            let v = T::read(&compressed[off + 4..off + pair]).to_f64();
            T::from_f64(v * scale).write(&mut self.dbuf[idx * T::SIZE..(idx + 1) * T::SIZE]);
        }
        Ok(n * T::SIZE)
    }
}

impl Compressor for RandomkCompressor {
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
}
