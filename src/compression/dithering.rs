//! Multilevel stochastic quantization ("dithering").
//!
//! Magnitudes are normalized by the tensor max or L2 norm, quantized to
//! `s` levels with stochastic rounding (so the quantizer is unbiased),
//! and the surviving non-zero levels are written as a bit-packed stream
//! of Elias-delta coded index gaps and levels plus a sign bit each.
//!
//! Two partitions are supported: `linear` spaces the levels uniformly,
//! `natural` spaces them at powers of two, spending resolution near zero
//! where gradient mass concentrates.

use crate::compression::bitstream::{
    elias_delta_decode, elias_delta_encode, round_next_pow2, BitReader, BitWriter,
};
use crate::compression::rng::Xorshift128Plus;
use crate::compression::{read_u32, write_u32};
use crate::compression::traits::{require_float, Compressor, Scalar};
use crate::error::{Result, ServerError};
use crate::types::DataType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Linear,
    Natural,
}

impl std::str::FromStr for Partition {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Partition::Linear),
            "natural" => Ok(Partition::Natural),
            other => Err(format!("unknown partition '{other}'")),
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Partition::Linear => "linear",
            Partition::Natural => "natural",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalize {
    Max,
    L2,
}

impl std::str::FromStr for Normalize {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "max" => Ok(Normalize::Max),
            "l2" => Ok(Normalize::L2),
            other => Err(format!("unknown normalization '{other}'")),
        }
    }
}

impl std::fmt::Display for Normalize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Normalize::Max => "max",
            Normalize::L2 => "l2",
        })
    }
}

/// Wire frame: `[n:u32][nnz:u32][scale:T][bit words:u32...]` where the bit
/// stream carries `nnz` runs of `(delta(index gap), delta(level), sign)`.
pub struct DitheringCompressor {
    dtype: DataType,
    s: u64,
    partition: Partition,
    normalize: Normalize,
    rng: Xorshift128Plus,
    cbuf: Vec<u8>,
    dbuf: Vec<u8>,
    words: Vec<u32>,
}

impl DitheringCompressor {
    pub fn new(
        size: usize,
        dtype: DataType,
        s: u64,
        partition: Partition,
        normalize: Normalize,
        seed: Option<u64>,
    ) -> Result<Self> {
        require_float(dtype, "dithering")?;
        let count = size / dtype.size_in_bytes();
        let mut rng = Xorshift128Plus::new();
        if let Some(seed) = seed {
            rng.set_seed(seed);
        }
        // worst case well under 3 words per surviving element
        let words = count * 3 + 4;
        Ok(Self {
            dtype,
            s,
            partition,
            normalize,
            rng,
            cbuf: vec![0u8; 8 + dtype.size_in_bytes() + words * 4],
            dbuf: vec![0u8; size],
            words: vec![0u32; words],
        })
    }

    fn quantize(&mut self, y: f64) -> u64 {
        match self.partition {
            Partition::Linear => {
                let y = y * self.s as f64;
                let low = y.floor();
                low as u64 + self.rng.bernoulli(y - low) as u64
            }
            Partition::Natural => {
                let y = y * (1u64 << (self.s - 1)) as f64;
                let low = (round_next_pow2(y.ceil() as u32) >> 1) as u64;
                let length = low.max(1);
                let p = (y - low as f64) / length as f64;
                low + length * self.rng.bernoulli(p) as u64
            }
        }
    }

    fn level_unit(&self) -> f64 {
        match self.partition {
            Partition::Linear => self.s as f64,
            Partition::Natural => (1u64 << (self.s - 1)) as f64,
        }
    }

    fn compress_impl<T: Scalar>(&mut self, grad: &[u8]) -> usize {
        let n = grad.len() / T::SIZE;

        let mut scale = 0.0f64;
        for i in 0..n {
            let v = T::read(&grad[i * T::SIZE..(i + 1) * T::SIZE]).to_f64();
            match self.normalize {
                Normalize::Max => scale = scale.max(v.abs()),
                Normalize::L2 => scale += v * v,
            }
        }
        if self.normalize == Normalize::L2 {
            scale = scale.sqrt();
        }

        let hdr = 8 + T::SIZE;
        write_u32(&mut self.cbuf[0..4], n as u32);
        T::from_f64(scale).write(&mut self.cbuf[8..hdr]);
        if scale == 0.0 {
            // all-zero tensor: nothing survives quantization
            write_u32(&mut self.cbuf[4..8], 0);
            return hdr;
        }

        let mut nnz = 0u32;
        let mut cursor = 0usize;
        let mut writer_words = std::mem::take(&mut self.words);
        let mut writer = BitWriter::new(&mut writer_words);
        for i in 0..n {
            let v = T::read(&grad[i * T::SIZE..(i + 1) * T::SIZE]).to_f64();
            let q = self.quantize(v.abs() / scale);
            if q == 0 {
                continue;
            }
            elias_delta_encode(&mut writer, (i - cursor + 1) as u64);
            elias_delta_encode(&mut writer, q);
            writer.put(v < 0.0);
            cursor = i + 1;
            nnz += 1;
        }
        writer.flush();
        let blocks = writer.blocks();
        self.words = writer_words;

        write_u32(&mut self.cbuf[4..8], nnz);
        for i in 0..blocks {
            write_u32(&mut self.cbuf[hdr + i * 4..hdr + i * 4 + 4], self.words[i]);
        }
        hdr + blocks * 4
    }

    fn decompress_impl<T: Scalar>(&mut self, compressed: &[u8]) -> Result<usize> {
        let hdr = 8 + T::SIZE;
        if compressed.len() < hdr {
            return Err(ServerError::CompressedPayload(
                "dithering frame shorter than header".into(),
            ));
        }
        let n = read_u32(&compressed[0..4]) as usize;
        let nnz = read_u32(&compressed[4..8]) as usize;
        let scale = T::read(&compressed[8..hdr]).to_f64();
        if n * T::SIZE > self.dbuf.len() {
            return Err(ServerError::CompressedPayload(format!(
                "dithering frame declares {n} elements beyond the registered size"
            )));
        }
        let blocks = (compressed.len() - hdr) / 4;
        if blocks > self.words.len() {
            return Err(ServerError::CompressedPayload(format!(
                "dithering stream of {blocks} words exceeds the registered size"
            )));
        }
        for i in 0..blocks {
            self.words[i] = read_u32(&compressed[hdr + i * 4..hdr + i * 4 + 4]);
        }

        self.dbuf[..n * T::SIZE].fill(0);
        let unit = self.level_unit();
        let mut reader = BitReader::new(&self.words[..blocks.max(1)]);
        let mut cursor = 0usize;
        for _ in 0..nnz {
            let gap = elias_delta_decode(&mut reader) as usize;
            let q = elias_delta_decode(&mut reader);
            let neg = reader.get();
            let idx = cursor + gap - 1;
            if idx >= n {
                return Err(ServerError::CompressedPayload(format!(
                    "dithering index {idx} out of range for {n} elements"
                )));
            }
            let mut v = q as f64 * scale / unit;
            if neg {
                v = -v;
            }
            T::from_f64(v).write(&mut self.dbuf[idx * T::SIZE..(idx + 1) * T::SIZE]);
            cursor = idx + 1;
        }
        Ok(n * T::SIZE)
    }
}

impl Compressor for DitheringCompressor {
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
