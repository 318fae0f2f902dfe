//! 1-bit sign compression with an optional per-tensor scale.
//!
//! Each element is reduced to its sign bit; with scaling enabled the
//! magnitude is the tensor's mean absolute value, which keeps the update
//! unbiased in L1 norm. 32x compression for fp32.

use crate::compression::bitstream::{BitReader, BitWriter};
use crate::compression::{read_u32, write_u32};
use crate::compression::traits::{require_float, Compressor, Scalar};
use crate::error::{Result, ServerError};
use crate::types::DataType;

/// Wire frame: `[n:u32][sign words:ceil(n/32)*u32][scale:T]`.
pub struct OnebitCompressor {
    dtype: DataType,
    use_scale: bool,
    cbuf: Vec<u8>,
    dbuf: Vec<u8>,
    words: Vec<u32>,
}

impl OnebitCompressor {
    pub fn new(size: usize, dtype: DataType, use_scale: bool) -> Result<Self> {
        require_float(dtype, "onebit")?;
        let count = size / dtype.size_in_bytes();
        let words = (count + 31) / 32;
        Ok(Self {
            dtype,
            use_scale,
            cbuf: vec![0u8; 4 + words * 4 + dtype.size_in_bytes()],
            dbuf: vec![0u8; size],
            words: vec![0u32; words.max(1)],
        })
    }

    fn compress_impl<T: Scalar>(&mut self, grad: &[u8]) -> usize {
        let n = grad.len() / T::SIZE;
        let nwords = (n + 31) / 32;

        let scale = if self.use_scale && n > 0 {
            let mut l1 = 0.0f64;
            for i in 0..n {
                l1 += T::read(&grad[i * T::SIZE..(i + 1) * T::SIZE])
                    .abs_val()
                    .to_f64();
            }
            l1 / n as f64
        } else {
            1.0
        };

        let mut writer = BitWriter::new(&mut self.words[..nwords.max(1)]);
        for i in 0..n {
            writer.put(T::read(&grad[i * T::SIZE..(i + 1) * T::SIZE]).is_negative());
        }
        writer.flush();

        write_u32(&mut self.cbuf[0..4], n as u32);
        for i in 0..nwords {
            write_u32(&mut self.cbuf[4 + i * 4..8 + i * 4], self.words[i]);
        }
        let scale_off = 4 + nwords * 4;
        T::from_f64(scale).write(&mut self.cbuf[scale_off..scale_off + T::SIZE]);
        scale_off + T::SIZE
    }

    fn decompress_impl<T: Scalar>(&mut self, compressed: &[u8]) -> Result<usize> {
        if compressed.len() < 4 {
            return Err(ServerError::CompressedPayload(
                "onebit frame shorter than header".into(),
            ));
        }
        let n = read_u32(&compressed[0..4]) as usize;
        let nwords = (n + 31) / 32;
        let expect = 4 + nwords * 4 + T::SIZE;
        if compressed.len() < expect || n * T::SIZE > self.dbuf.len() {
            return Err(ServerError::CompressedPayload(format!(
                "onebit frame of {} bytes cannot hold {} elements",
                compressed.len(),
                n
            )));
        }
        for i in 0..nwords {
            self.words[i] = read_u32(&compressed[4 + i * 4..8 + i * 4]);
        }
        let scale = T::read(&compressed[4 + nwords * 4..expect]).to_f64();

        let mut reader = BitReader::new(&self.words[..nwords.max(1)]);
        for i in 0..n {
            let v = if reader.get() { -scale } else { scale };
            T::from_f64(v).write(&mut self.dbuf[i * T::SIZE..(i + 1) * T::SIZE]);
        }
        Ok(n * T::SIZE)
    }
}

impl Compressor for OnebitCompressor {
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
