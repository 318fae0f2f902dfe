//! Gradient compression pipeline.
//!
//! When network bandwidth is the bottleneck, workers can negotiate a
//! compressor per key: each worker sends a config-push carrying serialized
//! hyper-parameters, the server builds the matching pipeline from the
//! registry, and from then on that key's pushes are decompressed before
//! aggregation and its merged tensor is re-compressed before pull.
//!
//! # Available codecs
//!
//! - [`OnebitCompressor`]: sign bit per element plus an optional L1 scale.
//!   32x for fp32; pairs well with error feedback.
//! - [`TopkCompressor`]: the k entries largest in magnitude as
//!   (index, value) pairs. Best accuracy retention, O(n log n).
//! - [`RandomkCompressor`]: k uniformly sampled entries, rescaled by `n/k`
//!   on decompression. O(n); unbiased in expectation.
//! - [`DitheringCompressor`]: multilevel stochastic quantization with a
//!   linear or natural (power-of-two) partition, Elias-delta coded.
//! - [`NoCompression`]: identity pass-through, useful as a baseline or to
//!   run the decorators alone.
//!
//! # Decorators
//!
//! [`MomentumCompressor`] (nesterov or vanilla) and the error-feedback
//! family ([`VanillaErrorFeedback`], [`CorrectedErrorFeedback`],
//! [`SparseErrorFeedback`]) wrap a base codec. Composition order is fixed:
//! momentum outermost, then error feedback, then the codec.
//!
//! # Config wire format
//!
//! `"<count> <key1> <value1> <key2> <value2> ..."`, whitespace separated,
//! booleans as `true`/`false`. See [`Kwargs`].

pub mod bitstream;
pub mod dithering;
pub mod error_feedback;
pub mod momentum;
pub mod none;
pub mod onebit;
pub mod randomk;
pub mod rng;
pub mod topk;
pub mod traits;

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use crate::error::{Result, ServerError};
use crate::types::DataType;

pub use dithering::{DitheringCompressor, Normalize, Partition};
pub use error_feedback::{
    CorrectedErrorFeedback, LrChannel, SparseErrorFeedback, VanillaErrorFeedback, LR_FILE,
};
pub use momentum::{MomentumCompressor, MomentumKind};
pub use none::NoCompression;
pub use onebit::OnebitCompressor;
pub use randomk::RandomkCompressor;
pub use rng::Xorshift128Plus;
pub use topk::TopkCompressor;
pub use traits::Compressor;

pub(crate) fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_ne_bytes(bytes.try_into().expect("slice length matches type size"))
}

pub(crate) fn write_u32(bytes: &mut [u8], v: u32) {
    bytes.copy_from_slice(&v.to_ne_bytes());
}

/// Hyper-parameter bag shipped inside a config-push.
#[derive(Debug, Default, Clone)]
pub struct Kwargs {
    entries: HashMap<String, String>,
}

impl Kwargs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Display) {
        self.entries.insert(key.into(), value.to_string());
    }

    /// Parse the `"<count> <k> <v> ..."` wire form. Entries beyond the
    /// declared count are ignored, short payloads yield what they carry.
    pub fn deserialize(content: &str) -> Self {
        let mut tokens = content.split_whitespace();
        let count: usize = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0);
        let mut entries = HashMap::with_capacity(count);
        for _ in 0..count {
            let (Some(k), Some(v)) = (tokens.next(), tokens.next()) else {
                break;
            };
            entries.insert(k.to_string(), v.to_string());
        }
        Self { entries }
    }

    /// Serialize to the wire form.
    pub fn serialize(&self) -> String {
        let mut out = self.entries.len().to_string();
        // sorted so the payload is deterministic
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        for k in keys {
            out.push(' ');
            out.push_str(k);
            out.push(' ');
            out.push_str(&self.entries[k]);
        }
        out
    }

    /// Required hyper-parameter with a validity predicate.
    pub fn get_checked<T>(
        &self,
        name: &'static str,
        check: impl Fn(&T) -> bool,
    ) -> Result<T>
    where
        T: FromStr + Display,
    {
        match self.get_opt_checked(name, check)? {
            Some(v) => Ok(v),
            None => Err(ServerError::MissingHyperParam { name }),
        }
    }

    /// Required hyper-parameter.
    pub fn get<T>(&self, name: &'static str) -> Result<T>
    where
        T: FromStr + Display,
    {
        self.get_checked(name, |_| true)
    }

    /// Optional hyper-parameter with a validity predicate; present but
    /// unparsable or invalid values are errors, absence is not.
    pub fn get_opt_checked<T>(
        &self,
        name: &'static str,
        check: impl Fn(&T) -> bool,
    ) -> Result<Option<T>>
    where
        T: FromStr + Display,
    {
        let Some(raw) = self.entries.get(name) else {
            return Ok(None);
        };
        let value: T = raw.parse().map_err(|_| ServerError::InvalidHyperParam {
            name,
            value: raw.clone(),
        })?;
        if !check(&value) {
            return Err(ServerError::InvalidHyperParam {
                name,
                value: raw.clone(),
            });
        }
        tracing::info!(name, %value, "register hyper-parameter");
        Ok(Some(value))
    }

    /// Optional hyper-parameter.
    pub fn get_opt<T>(&self, name: &'static str) -> Result<Option<T>>
    where
        T: FromStr + Display,
    {
        self.get_opt_checked(name, |_| true)
    }
}

type BaseFactory = fn(&Kwargs, usize, DataType) -> Result<Box<dyn Compressor>>;
type WrapFactory = fn(&Kwargs, usize, DataType, Box<dyn Compressor>) -> Result<Box<dyn Compressor>>;

/// Name -> factory tables for the base codecs and the decorators.
pub struct CompressorRegistry;

impl CompressorRegistry {
    const BASE: &'static [(&'static str, BaseFactory)] = &[
        ("none", Self::make_none),
        ("onebit", Self::make_onebit),
        ("topk", Self::make_topk),
        ("randomk", Self::make_randomk),
        ("dithering", Self::make_dithering),
    ];

    const WRAP: &'static [(&'static str, WrapFactory)] = &[
        ("vanilla_ef", Self::make_vanilla_ef),
        ("corrected_ef", Self::make_corrected_ef),
        ("sparse_ef", Self::make_sparse_ef),
        ("nesterov_momentum", Self::make_nesterov_momentum),
        ("vanilla_momentum", Self::make_vanilla_momentum),
    ];

    /// Build the full pipeline a config-push asks for: base codec, then
    /// error feedback, then momentum outermost.
    pub fn create(kwargs: &Kwargs, size: usize, dtype: DataType) -> Result<Box<dyn Compressor>> {
        let base: String = kwargs.get("compressor_type")?;
        let mut comp = Self::base(&base)?(kwargs, size, dtype)?;
        if let Some(ef) = kwargs.get_opt::<String>("ef_type")? {
            comp = Self::wrap(&format!("{ef}_ef"))?(kwargs, size, dtype, comp)?;
        }
        if let Some(momentum) = kwargs.get_opt::<String>("momentum_type")? {
            comp = Self::wrap(&format!("{momentum}_momentum"))?(kwargs, size, dtype, comp)?;
        }
        Ok(comp)
    }

    fn base(name: &str) -> Result<BaseFactory> {
        Self::BASE
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, f)| *f)
            .ok_or_else(|| ServerError::UnknownCompressor { name: name.into() })
    }

    fn wrap(name: &str) -> Result<WrapFactory> {
        Self::WRAP
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, f)| *f)
            .ok_or_else(|| ServerError::UnknownCompressor { name: name.into() })
    }

    fn make_none(_kwargs: &Kwargs, size: usize, _dtype: DataType) -> Result<Box<dyn Compressor>> {
        Ok(Box::new(NoCompression::new(size)))
    }

    fn make_onebit(kwargs: &Kwargs, size: usize, dtype: DataType) -> Result<Box<dyn Compressor>> {
        let use_scale = kwargs.get_opt::<bool>("onebit_scaling")?.unwrap_or(false);
        Ok(Box::new(OnebitCompressor::new(size, dtype, use_scale)?))
    }

    fn make_topk(kwargs: &Kwargs, size: usize, dtype: DataType) -> Result<Box<dyn Compressor>> {
        let factor = kwargs.get_checked::<f32>("compressor_k", |&k| k > 0.0)?;
        let k = traits::resolve_k(factor, size, dtype);
        Ok(Box::new(TopkCompressor::new(size, dtype, k)?))
    }

    fn make_randomk(kwargs: &Kwargs, size: usize, dtype: DataType) -> Result<Box<dyn Compressor>> {
        let factor = kwargs.get_checked::<f32>("compressor_k", |&k| k > 0.0)?;
        let k = traits::resolve_k(factor, size, dtype);
        let seed = kwargs.get_opt_checked::<u64>("seed", |&s| s != 0)?;
        Ok(Box::new(RandomkCompressor::new(size, dtype, k, seed)?))
    }

    fn make_dithering(
        kwargs: &Kwargs,
        size: usize,
        dtype: DataType,
    ) -> Result<Box<dyn Compressor>> {
        let s = kwargs.get_checked::<u64>("compressor_k", |&s| s > 0 && s <= 32)?;
        let partition = kwargs
            .get_opt::<Partition>("dithering_partition")?
            .unwrap_or(Partition::Linear);
        let normalize = kwargs
            .get_opt::<Normalize>("dithering_normalize")?
            .unwrap_or(Normalize::Max);
        let seed = kwargs.get_opt_checked::<u64>("seed", |&s| s != 0)?;
        Ok(Box::new(DitheringCompressor::new(
            size, dtype, s, partition, normalize, seed,
        )?))
    }

    fn make_vanilla_ef(
        _kwargs: &Kwargs,
        size: usize,
        dtype: DataType,
        inner: Box<dyn Compressor>,
    ) -> Result<Box<dyn Compressor>> {
        tracing::info!("vanilla error feedback registered");
        Ok(Box::new(VanillaErrorFeedback::new(inner, size, dtype)?))
    }

    fn make_corrected_ef(
        _kwargs: &Kwargs,
        size: usize,
        dtype: DataType,
        inner: Box<dyn Compressor>,
    ) -> Result<Box<dyn Compressor>> {
        let lr = LrChannel::open(LR_FILE)?;
        tracing::info!("corrected error feedback registered");
        Ok(Box::new(CorrectedErrorFeedback::new(inner, size, dtype, lr)?))
    }

    fn make_sparse_ef(
        kwargs: &Kwargs,
        size: usize,
        dtype: DataType,
        inner: Box<dyn Compressor>,
    ) -> Result<Box<dyn Compressor>> {
        let factor = kwargs.get_checked::<f32>("compressor_k", |&k| k > 0.0)?;
        let k = traits::resolve_k(factor, size, dtype);
        let seed = kwargs.get_opt_checked::<u64>("seed", |&s| s != 0)?;
        let lr = LrChannel::open(LR_FILE)?;
        tracing::info!(size, k, "sparse error feedback registered");
        Ok(Box::new(SparseErrorFeedback::new(
            inner, size, dtype, k, seed, lr,
        )?))
    }

    fn make_nesterov_momentum(
        kwargs: &Kwargs,
        size: usize,
        dtype: DataType,
        inner: Box<dyn Compressor>,
    ) -> Result<Box<dyn Compressor>> {
        let mu = kwargs.get::<f32>("momentum_mu")?;
        tracing::info!(mu, "nesterov momentum registered");
        Ok(Box::new(MomentumCompressor::new(
            inner,
            size,
            dtype,
            MomentumKind::Nesterov,
            mu,
        )?))
    }

    fn make_vanilla_momentum(
        kwargs: &Kwargs,
        size: usize,
        dtype: DataType,
        inner: Box<dyn Compressor>,
    ) -> Result<Box<dyn Compressor>> {
        let mu = kwargs.get::<f32>("momentum_mu")?;
        tracing::info!(mu, "vanilla momentum registered");
        Ok(Box::new(MomentumCompressor::new(
            inner,
            size,
            dtype,
            MomentumKind::Vanilla,
            mu,
        )?))
    }
}
