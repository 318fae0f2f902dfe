//! Momentum decorator: fold a momentum term into the gradient before the
//! wrapped compressor runs.
//!
//! Per step: `m <- mu*m + g`, then the corrected gradient is either
//! `g + mu*m` (nesterov) or `m` itself (vanilla). Decompression passes
//! straight through to the wrapped compressor.

use crate::compression::traits::{require_float, Compressor, Scalar};
use crate::error::Result;
use crate::reduce::CpuReducer;
use crate::types::DataType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MomentumKind {
    Nesterov,
    Vanilla,
}

impl std::str::FromStr for MomentumKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "nesterov" => Ok(MomentumKind::Nesterov),
            "vanilla" => Ok(MomentumKind::Vanilla),
            other => Err(format!("unknown momentum type '{other}'")),
        }
    }
}

impl std::fmt::Display for MomentumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MomentumKind::Nesterov => "nesterov",
            MomentumKind::Vanilla => "vanilla",
        })
    }
}

pub struct MomentumCompressor {
    inner: Box<dyn Compressor>,
    kind: MomentumKind,
    mu: f32,
    dtype: DataType,
    mbuf: Vec<u8>,
    reducer: CpuReducer,
}

impl MomentumCompressor {
    pub fn new(
        inner: Box<dyn Compressor>,
        size: usize,
        dtype: DataType,
        kind: MomentumKind,
        mu: f32,
    ) -> Result<Self> {
        require_float(dtype, "momentum")?;
        Ok(Self {
            inner,
            kind,
            mu,
            dtype,
            mbuf: vec![0u8; size],
            reducer: CpuReducer::new(),
        })
    }

    /// `m <- g + mu*m`, in place over the momentum buffer.
    fn update_mom<T: Scalar>(m: &mut [u8], grad: &[u8], mu: f32) {
        let n = grad.len() / T::SIZE;
        for i in 0..n {
            let off = i * T::SIZE;
            let g = T::read(&grad[off..off + T::SIZE]).to_f64();
            let mv = T::read(&m[off..off + T::SIZE]).to_f64();
            T::from_f64(g + mu as f64 * mv).write(&mut m[off..off + T::SIZE]);
        }
    }
}

impl Compressor for MomentumCompressor {
    fn compress(&mut self, grad: &mut [u8]) -> Result<&[u8]> {
        match self.dtype {
            DataType::F64 => Self::update_mom::<f64>(&mut self.mbuf, grad, self.mu),
            _ => Self::update_mom::<f32>(&mut self.mbuf, grad, self.mu),
        }
        match self.kind {
            MomentumKind::Nesterov => {
                // p = g + mu*m
                let len = grad.len();
                self.reducer
                    .sum_alpha(grad, &self.mbuf[..len], len, self.dtype, self.mu)?;
            }
            MomentumKind::Vanilla => {
                let len = grad.len();
                grad.copy_from_slice(&self.mbuf[..len]);
            }
        }
        self.inner.compress(grad)
    }

    fn decompress(&mut self, compressed: &[u8]) -> Result<&[u8]> {
        self.inner.decompress(compressed)
    }
}
