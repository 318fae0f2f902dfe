//! Error-feedback decorators: remember what compression threw away and
//! fold it into the next step's gradient.
//!
//! Three variants:
//! - vanilla: `g <- g + e`, then `e <- g - decompress(compress(g))`.
//! - corrected: the residue is scaled by `lr_prev / lr_cur` before the
//!   fold, compensating for learning-rate schedules. The current rate is
//!   read from a shared-memory channel written by the training loop.
//! - sparse: like corrected, but the fold touches only `k`
//!   uniformly-drawn indices per step (zeroing those residues), bounding
//!   the per-step cost for very large tensors.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::compression::rng::Xorshift128Plus;
use crate::compression::traits::{require_float, Compressor};
use crate::error::{Result, ServerError};
use crate::reduce::CpuReducer;
use crate::types::DataType;

/// File the training loop publishes the current learning rate through.
pub const LR_FILE: &str = "lr.s";

/// Read side of the one-writer/many-reader learning-rate register: an
/// 8-byte file mapped read-only and reinterpreted as a native-endian f64.
pub struct LrChannel {
    map: Mmap,
}

impl LrChannel {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            ServerError::lr_channel_with_source(format!("open {} failed", path.display()), e)
        })?;
        let map = unsafe { Mmap::map(&file) }.map_err(|e| {
            ServerError::lr_channel_with_source(format!("mmap {} failed", path.display()), e)
        })?;
        if map.len() < 8 {
            return Err(ServerError::lr_channel(format!(
                "{} holds {} bytes, expected 8",
                path.display(),
                map.len()
            )));
        }
        Ok(Self { map })
    }

    /// Current learning rate as last written by the trainer.
    pub fn read(&self) -> f64 {
        f64::from_ne_bytes(self.map[..8].try_into().expect("mapping holds 8 bytes"))
    }
}

/// Compress via the wrapped codec and refresh the residue, preferring the
/// codec's fused single-pass path.
fn finish_compress<'a>(
    inner: &'a mut Box<dyn Compressor>,
    grad: &mut [u8],
    error: &mut [u8],
    scratch: &'a mut [u8],
    dtype: DataType,
    reducer: &CpuReducer,
) -> Result<&'a [u8]> {
    if inner.supports_fused_compress() {
        return inner.fused_compress(grad, error);
    }

    let clen = {
        let frame = inner.compress(grad)?;
        let clen = frame.len();
        scratch[..clen].copy_from_slice(frame);
        clen
    };
    let dense = inner.decompress(&scratch[..clen])?;
    // e = g - decompress(compress(g))
    reducer.sum3(
        &mut error[..grad.len()],
        grad,
        &dense[..grad.len()],
        grad.len(),
        dtype,
        -1.0,
    )?;
    let scratch: &'a [u8] = scratch;
    Ok(&scratch[..clen])
}

pub struct VanillaErrorFeedback {
    inner: Box<dyn Compressor>,
    dtype: DataType,
    error: Vec<u8>,
    scratch: Vec<u8>,
    reducer: CpuReducer,
}

impl VanillaErrorFeedback {
    pub fn new(inner: Box<dyn Compressor>, size: usize, dtype: DataType) -> Result<Self> {
        require_float(dtype, "error feedback")?;
        Ok(Self {
            inner,
            dtype,
            error: vec![0u8; size],
            scratch: scratch_for(size, dtype),
            reducer: CpuReducer::new(),
        })
    }
}

impl Compressor for VanillaErrorFeedback {
    fn compress(&mut self, grad: &mut [u8]) -> Result<&[u8]> {
        let len = grad.len();
        self.reducer
            .sum_alpha(grad, &self.error[..len], len, self.dtype, 1.0)?;
        finish_compress(
            &mut self.inner,
            grad,
            &mut self.error,
            &mut self.scratch,
            self.dtype,
            &self.reducer,
        )
    }

    fn decompress(&mut self, compressed: &[u8]) -> Result<&[u8]> {
        self.inner.decompress(compressed)
    }
}

pub struct CorrectedErrorFeedback {
    inner: Box<dyn Compressor>,
    dtype: DataType,
    error: Vec<u8>,
    scratch: Vec<u8>,
    reducer: CpuReducer,
    lr: LrChannel,
    pre_lr: f64,
}

impl CorrectedErrorFeedback {
    pub fn new(
        inner: Box<dyn Compressor>,
        size: usize,
        dtype: DataType,
        lr: LrChannel,
    ) -> Result<Self> {
        require_float(dtype, "error feedback")?;
        let pre_lr = lr.read();
        Ok(Self {
            inner,
            dtype,
            error: vec![0u8; size],
            scratch: scratch_for(size, dtype),
            reducer: CpuReducer::new(),
            lr,
            pre_lr,
        })
    }
}

impl Compressor for CorrectedErrorFeedback {
    fn compress(&mut self, grad: &mut [u8]) -> Result<&[u8]> {
        let cur_lr = self.lr.read();
        let ratio = (self.pre_lr / cur_lr) as f32;
        let len = grad.len();
        self.reducer
            .sum_alpha(grad, &self.error[..len], len, self.dtype, ratio)?;
        self.pre_lr = cur_lr;
        finish_compress(
            &mut self.inner,
            grad,
            &mut self.error,
            &mut self.scratch,
            self.dtype,
            &self.reducer,
        )
    }

    fn decompress(&mut self, compressed: &[u8]) -> Result<&[u8]> {
        self.inner.decompress(compressed)
    }
}

pub struct SparseErrorFeedback {
    inner: Box<dyn Compressor>,
    dtype: DataType,
    k: usize,
    rng: Xorshift128Plus,
    selected: Vec<u32>,
    error: Vec<u8>,
    scratch: Vec<u8>,
    reducer: CpuReducer,
    lr: LrChannel,
    pre_lr: f64,
}

impl SparseErrorFeedback {
    pub fn new(
        inner: Box<dyn Compressor>,
        size: usize,
        dtype: DataType,
        k: usize,
        seed: Option<u64>,
        lr: LrChannel,
    ) -> Result<Self> {
        require_float(dtype, "error feedback")?;
        let mut rng = Xorshift128Plus::new();
        if let Some(seed) = seed {
            rng.set_seed(seed + k as u64);
        }
        let pre_lr = lr.read();
        Ok(Self {
            inner,
            dtype,
            k,
            rng,
            selected: Vec::with_capacity(k),
            error: vec![0u8; size],
            scratch: scratch_for(size, dtype),
            reducer: CpuReducer::new(),
            lr,
            pre_lr,
        })
    }
}

impl Compressor for SparseErrorFeedback {
    fn compress(&mut self, grad: &mut [u8]) -> Result<&[u8]> {
        let cur_lr = self.lr.read();
        let ratio = (self.pre_lr / cur_lr) as f32;
        let n = grad.len() / self.dtype.size_in_bytes();
        self.selected.clear();
        for _ in 0..self.k {
            self.selected.push(self.rng.randint(0, n as u64) as u32);
        }
        self.reducer
            .sparse_sum(grad, &mut self.error, self.dtype, ratio, &self.selected)?;
        self.pre_lr = cur_lr;
        finish_compress(
            &mut self.inner,
            grad,
            &mut self.error,
            &mut self.scratch,
            self.dtype,
            &self.reducer,
        )
    }

    fn decompress(&mut self, compressed: &[u8]) -> Result<&[u8]> {
        self.inner.decompress(compressed)
    }
}

/// Compressed frames never exceed the dense size plus per-element framing
/// overhead (index pairs or bit-stream words); size the fallback scratch
/// for the worst producer.
fn scratch_for(size: usize, dtype: DataType) -> Vec<u8> {
    let count = size / dtype.size_in_bytes();
    vec![0u8; 32 + size + count * 16]
}
