//! Server-side aggregation core for synchronous distributed training.
//!
//! A fixed set of workers pushes per-key gradient tensors and pulls the
//! merged result each step. The core serializes push/pull traffic per
//! key, shards the reductions over a pool of engine threads, optionally
//! runs a gradient (de)compression pipeline inline, and enforces the
//! push-then-pull barrier every worker observes.
//!
//! The key-value RPC transport stays outside this crate: it delivers
//! `(KVMeta, KVPairs)` callbacks into [`AggServer::handle`] and ships
//! whatever the core hands to [`transport::KvServer::respond`]. Responses
//! for a key reuse one cached allocation whose backing address never
//! moves, so RDMA transports register each region exactly once.

pub mod buffer;
pub mod compression;
pub mod config;
mod engine;
pub mod error;
pub mod queue;
pub mod reduce;
pub mod server;
pub mod store;
pub mod transport;
pub mod types;

pub use compression::{Compressor, CompressorRegistry, Kwargs};
pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use server::AggServer;
pub use transport::{KVMeta, KVPairs, KvServer, SBuf};
pub use types::{DataHandleType, DataType, Key, RequestType, WorkerId};
