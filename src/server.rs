//! Request dispatcher and per-key state machine.
//!
//! The transport invokes [`AggServer::handle`] once per inbound request.
//! The dispatcher is serialized by a coarse mutex (push and pull race on
//! the shared maps otherwise), decodes the packed request type, and walks
//! one of four paths: compressor config, store init, push, or pull.
//!
//! Synchronous steps flow through the shard engine: the first push of a
//! step is copied into the store, later pushes are summed in, and the
//! W-th push schedules the finalize that compresses or downcasts the
//! merged tensor and releases any pulls that arrived early. Push
//! acknowledgements never wait for the merge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::buffer::{align, AlignedBuf};
use crate::compression::{Compressor, CompressorRegistry, Kwargs};
use crate::config::ServerConfig;
use crate::engine;
use crate::error::{Result, ServerError};
use crate::queue::{EngineMessage, EngineOp, PriorityQueue};
use crate::reduce::CpuReducer;
use crate::store::{KeyFlags, StoreEntry, UpdateBuf};
use crate::transport::{KVMeta, KVPairs, KvServer, SBuf};
use crate::types::{DataHandleType, DataType, Key, RequestType};

/// One shard: a private queue and the pull-barrier flags for the keys it
/// owns.
pub(crate) struct Shard {
    pub(crate) queue: PriorityQueue,
    pub(crate) flags: Mutex<HashMap<Key, KeyFlags>>,
}

impl Shard {
    fn new(enable_schedule: bool) -> Self {
        Self {
            queue: PriorityQueue::new(enable_schedule),
            flags: Mutex::new(HashMap::new()),
        }
    }
}

/// Key-to-shard assignment: first sight of a key picks the least-loaded
/// shard (ties toward the lowest index) and the mapping is cached for the
/// process lifetime so per-key ordering holds.
struct LoadBalancer {
    acc_load: Vec<f64>,
    assignment: HashMap<Key, usize>,
}

impl LoadBalancer {
    fn new(shards: usize) -> Self {
        Self {
            acc_load: vec![0.0; shards],
            assignment: HashMap::new(),
        }
    }

    fn shard_of(&mut self, key: Key, workload: f64) -> usize {
        if let Some(&tid) = self.assignment.get(&key) {
            return tid;
        }
        let mut tid = 0;
        for (i, &load) in self.acc_load.iter().enumerate() {
            if load < self.acc_load[tid] {
                tid = i;
            }
        }
        self.acc_load[tid] += workload;
        self.assignment.insert(key, tid);
        tid
    }
}

pub(crate) struct ServerInner {
    pub(crate) cfg: ServerConfig,
    pub(crate) num_workers: usize,
    pub(crate) transport: Arc<dyn KvServer>,
    pub(crate) reducer: CpuReducer,
    handle_mu: Mutex<()>,
    pub(crate) store: Mutex<HashMap<Key, StoreEntry>>,
    pub(crate) update_buf: Mutex<HashMap<Key, UpdateBuf>>,
    pub(crate) fp16_copy: Mutex<HashMap<Key, StoreEntry>>,
    pub(crate) compressors: Mutex<HashMap<Key, Arc<Mutex<Box<dyn Compressor>>>>>,
    push_resp: Mutex<HashMap<Key, Box<KVPairs>>>,
    pull_resp: Mutex<HashMap<Key, Box<KVPairs>>>,
    pub(crate) shards: Vec<Shard>,
    balancer: Mutex<LoadBalancer>,
    timestamp: AtomicU64,
    pub(crate) debug_mu: Mutex<()>,
}

/// The aggregation core. One instance per server process.
///
/// Construction spawns the engine threads (sync mode); [`AggServer::shutdown`]
/// or drop pushes a terminate message to every shard, joins the threads,
/// and only then releases the store and shadow buffers, so no pull
/// response in flight outlives its backing memory.
pub struct AggServer {
    inner: Arc<ServerInner>,
    threads: Vec<JoinHandle<()>>,
}

impl AggServer {
    pub fn start(
        cfg: ServerConfig,
        num_workers: usize,
        transport: Arc<dyn KvServer>,
    ) -> Result<Self> {
        let shard_count = cfg.engine_thread_num.max(1);
        let shards = (0..shard_count)
            .map(|_| Shard::new(cfg.enable_schedule))
            .collect();
        let spawn_engine = cfg.sync_mode && !cfg.engine_blocking;
        tracing::info!(
            shards = shard_count,
            num_workers,
            sync = cfg.sync_mode,
            "aggregation server starting"
        );

        let inner = Arc::new(ServerInner {
            cfg,
            num_workers,
            transport,
            reducer: CpuReducer::new(),
            handle_mu: Mutex::new(()),
            store: Mutex::new(HashMap::new()),
            update_buf: Mutex::new(HashMap::new()),
            fp16_copy: Mutex::new(HashMap::new()),
            compressors: Mutex::new(HashMap::new()),
            push_resp: Mutex::new(HashMap::new()),
            pull_resp: Mutex::new(HashMap::new()),
            shards,
            balancer: Mutex::new(LoadBalancer::new(shard_count)),
            timestamp: AtomicU64::new(0),
            debug_mu: Mutex::new(()),
        });

        let mut threads = Vec::new();
        if spawn_engine {
            for tid in 0..shard_count {
                let inner = Arc::clone(&inner);
                let handle = std::thread::Builder::new()
                    .name(format!("engine-{tid}"))
                    .spawn(move || engine::engine_thread(inner, tid))
                    .map_err(ServerError::EngineSpawn)?;
                threads.push(handle);
            }
        }

        Ok(Self { inner, threads })
    }

    /// Transport callback: exactly one call per inbound request, exactly
    /// one response issued per call. Any error is fatal to the process.
    pub fn handle(&self, meta: &KVMeta, data: &KVPairs) -> Result<()> {
        let _guard = self.inner.handle_mu.lock();
        let ht = DataHandleType::unpack(meta.cmd)
            .ok_or(ServerError::UnknownRequestType { cmd: meta.cmd })?;

        if data.keys.len() != 1 {
            return Err(ServerError::PairArity {
                keys: data.keys.len(),
                lens: data.lens.len(),
            });
        }
        if meta.push {
            if data.lens.len() != 1 {
                return Err(ServerError::PairArity {
                    keys: data.keys.len(),
                    lens: data.lens.len(),
                });
            }
            if data.vals.len() != data.lens[0] {
                return Err(ServerError::PayloadLength {
                    declared: data.lens[0],
                    actual: data.vals.len(),
                });
            }
        }

        let key = data.keys[0];
        if self.inner.cfg.log_key_info {
            if meta.push {
                tracing::info!(key, sender = meta.sender, size = data.lens[0], "push");
            } else {
                tracing::info!(key, sender = meta.sender, "pull");
            }
        }

        match ht.request_type {
            RequestType::ConfigPushPull => self.inner.handle_config(key, meta, data),
            RequestType::DefaultPushPull | RequestType::CompressedPushPull => {
                self.inner.handle_default(key, ht, meta, data)
            }
            RequestType::RowSparsePushPull => Err(ServerError::RowSparseUnsupported { key }),
        }
    }

    /// Terminate every engine thread and wait for them. Idempotent.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        for shard in &self.inner.shards {
            shard.queue.push(EngineMessage::terminate());
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("aggregation server shut down");
    }
}

impl Drop for AggServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ServerInner {
    fn next_id(&self) -> u64 {
        self.timestamp.fetch_add(1, Ordering::Relaxed)
    }

    fn shard_of(&self, key: Key, workload: f64) -> usize {
        self.balancer.lock().shard_of(key, workload)
    }

    /// Compressor registration round. The first config round for a key
    /// builds the pipeline; the metas are buffered and all W workers are
    /// acknowledged together.
    fn handle_config(&self, key: Key, meta: &KVMeta, data: &KVPairs) -> Result<()> {
        let registered = self.compressors.lock().contains_key(&key);
        if !registered {
            let payload = data.vals.as_slice();
            let content = std::str::from_utf8(&payload[..data.lens[0]]).map_err(|_| {
                ServerError::CompressedPayload("config payload is not valid UTF-8".into())
            })?;
            let kwargs = Kwargs::deserialize(content);
            let (len, dtype) = {
                let store = self.store.lock();
                match store.get(&key) {
                    Some(e) if e.initialized() => (e.len, e.dtype),
                    _ => {
                        return Err(ServerError::StoreNotInitialized {
                            key,
                            op: "compressor config",
                        })
                    }
                }
            };
            let compressor = CompressorRegistry::create(&kwargs, align(len), dtype)?;
            self.compressors
                .lock()
                .insert(key, Arc::new(Mutex::new(compressor)));
            if self.cfg.log_key_info {
                tracing::info!(key, "registered compressor");
            }
        }

        let pending = {
            let mut update_buf = self.update_buf.lock();
            let u = update_buf.entry(key).or_default();
            u.request.push(meta.clone());
            if u.request.len() < self.num_workers {
                return Ok(());
            }
            std::mem::take(&mut u.request)
        };
        for req in &pending {
            self.send_push_response(key, req);
        }
        Ok(())
    }

    fn handle_default(
        &self,
        key: Key,
        ht: DataHandleType,
        meta: &KVMeta,
        data: &KVPairs,
    ) -> Result<()> {
        let mixed_precision = ht.dtype == DataType::F16;
        if meta.push {
            let len = data.lens[0];
            let initialized = self
                .store
                .lock()
                .get(&key)
                .map(|e| e.initialized())
                .unwrap_or(false);
            if !initialized {
                self.handle_init(key, ht, len, meta, mixed_precision)
            } else {
                self.handle_push(key, ht, len, meta, data, mixed_precision)
            }
        } else {
            self.handle_pull(key, meta)
        }
    }

    /// First push round for a key: collect W metas, then allocate the
    /// store (and the fp16 shadow for mixed-precision keys) and answer
    /// every worker at once, so each one observes a live store before its
    /// next request.
    fn handle_init(
        &self,
        key: Key,
        ht: DataHandleType,
        len: usize,
        meta: &KVMeta,
        mixed_precision: bool,
    ) -> Result<()> {
        let pending = {
            let mut update_buf = self.update_buf.lock();
            let absent = !update_buf.contains_key(&key);
            let u = update_buf.entry(key).or_default();
            if self.cfg.sync_mode && absent {
                u.merged.len = len;
                u.merged.dtype = ht.dtype;
            }
            u.request.push(meta.clone());
            if u.request.len() < self.num_workers {
                return Ok(());
            }
            std::mem::take(&mut u.request)
        };

        if self.cfg.log_key_info {
            tracing::info!(
                key,
                requests = pending.len(),
                size = len,
                "collected all init pushes"
            );
        }

        // fp16 keys aggregate in fp32: the store is promoted to twice the
        // wire length and the shadow keeps the fp16 rendition
        let (store_len, store_dtype) = if mixed_precision {
            (len * 2, DataType::F32)
        } else {
            (len, ht.dtype)
        };
        if mixed_precision {
            let mut fp16_copy = self.fp16_copy.lock();
            let shadow = fp16_copy.entry(key).or_default();
            shadow.buf = Some(AlignedBuf::zeroed(align(len))?);
            shadow.len = len;
            shadow.dtype = DataType::F16;
        }
        {
            let mut store = self.store.lock();
            let entry = store.entry(key).or_default();
            entry.buf = Some(AlignedBuf::zeroed(align(store_len))?);
            entry.len = store_len;
            entry.dtype = store_dtype;
        }

        for req in &pending {
            self.send_push_response(key, req);
        }
        Ok(())
    }

    fn handle_push(
        &self,
        key: Key,
        ht: DataHandleType,
        len: usize,
        meta: &KVMeta,
        data: &KVPairs,
        mixed_precision: bool,
    ) -> Result<()> {
        let (store_ptr, store_len, store_dtype) = {
            let store = self.store.lock();
            let entry = store.get(&key).ok_or(ServerError::StoreNotInitialized {
                key,
                op: "push",
            })?;
            (entry.ptr(), entry.len, entry.dtype)
        };
        let compressor = self.compressors.lock().get(&key).cloned();

        if compressor.is_none() {
            let expected = if mixed_precision {
                store_len / 2
            } else {
                store_len
            };
            if len != expected {
                return Err(ServerError::LengthMismatch {
                    key,
                    expected,
                    got: len,
                });
            }
        }

        let mut workload = store_len as f32;
        if compressor.is_some() {
            workload *= self.cfg.lb_factor;
        }
        let tid = self.shard_of(key, workload as f64);

        let (first, count) = {
            let mut update_buf = self.update_buf.lock();
            let u = update_buf.entry(key).or_default();
            let first = u.request.is_empty();
            if first && self.cfg.sync_mode && !self.cfg.engine_blocking {
                // keep the first payload alive until the engine copies it
                u.tmp_sarray = Some(data.vals.clone());
            }
            u.request.push(meta.clone());
            (first, u.request.len())
        };

        if self.cfg.sync_mode {
            if self.cfg.engine_blocking {
                self.blocking_reduce(
                    first,
                    store_ptr,
                    store_len,
                    store_dtype,
                    data,
                    len,
                    mixed_precision,
                    compressor.as_deref(),
                )?;
            } else {
                let op = if first {
                    EngineOp::CopyFirst
                } else {
                    EngineOp::SumRecv
                };
                if self.cfg.debug_mode && self.cfg.debug_key == key {
                    let stage = if first { "COPY_FIRST" } else { "OTHER_WORKER_SUM" };
                    let _debug = self.debug_mu.lock();
                    tracing::info!(
                        stage,
                        key,
                        len,
                        stored = %debug_tensor(store_ptr, store_len),
                        recved = %debug_tensor(data.vals.as_ptr(), len),
                        "push scheduled"
                    );
                }
                self.shards[tid].queue.push(EngineMessage {
                    id: self.next_id(),
                    key,
                    dtype: ht.dtype,
                    op,
                    dst: store_ptr,
                    src: data.vals.as_ptr(),
                    len,
                    compressed_len: len,
                    sarray: Some(data.vals.clone()),
                    mixed_precision,
                });
            }
        } else {
            // async mode: accumulate on the dispatcher thread, no barrier
            unsafe {
                if mixed_precision {
                    self.reducer
                        .sum_mixed_ptr(store_ptr, data.vals.as_ptr(), len);
                } else {
                    self.reducer
                        .sum_ptr(store_ptr, data.vals.as_ptr(), len, store_dtype)?;
                }
            }
        }

        self.send_push_response(key, meta);

        if self.cfg.sync_mode && count == self.num_workers {
            if self.cfg.debug_mode && self.cfg.debug_key == key {
                let _debug = self.debug_mu.lock();
                tracing::info!(
                    stage = "ALL_RECV",
                    key,
                    stored = %debug_tensor(store_ptr, store_len),
                    "final push of the step"
                );
            }
            if self.cfg.engine_blocking {
                self.finalize_merge(key, store_ptr, store_len, store_dtype, mixed_precision)?;
            } else {
                self.shards[tid].queue.push(EngineMessage {
                    id: self.next_id(),
                    key,
                    dtype: store_dtype,
                    op: EngineOp::AllRecv,
                    dst: store_ptr,
                    src: store_ptr,
                    len: store_len,
                    compressed_len: store_len,
                    sarray: None,
                    mixed_precision,
                });
                self.shards[tid].queue.clear_counter(key);
            }
            self.update_buf
                .lock()
                .entry(key)
                .or_default()
                .request
                .clear();
        } else if !self.cfg.sync_mode {
            // async: the request buffer carries no barrier meaning
            self.update_buf
                .lock()
                .entry(key)
                .or_default()
                .request
                .clear();
        }
        Ok(())
    }

    /// Legacy engine-blocking path: the whole reduction runs on the
    /// dispatcher thread, shards are bypassed.
    #[allow(clippy::too_many_arguments)]
    fn blocking_reduce(
        &self,
        first: bool,
        store_ptr: u64,
        store_len: usize,
        store_dtype: DataType,
        data: &KVPairs,
        len: usize,
        mixed_precision: bool,
        compressor: Option<&Mutex<Box<dyn Compressor>>>,
    ) -> Result<()> {
        // exclusive: blocking mode has no engine threads and the
        // dispatcher is serialized by handle_mu
        let store =
            unsafe { std::slice::from_raw_parts_mut(store_ptr as *mut u8, store_len) };
        let payload = &data.vals.as_slice()[..len];
        if let Some(compressor) = compressor {
            let mut compressor = compressor.lock();
            let dense = compressor.decompress(payload)?;
            if first {
                self.reducer.copy(store, dense);
            } else {
                let dlen = dense.len();
                self.reducer.sum(store, dense, dlen, store_dtype)?;
            }
        } else if mixed_precision {
            if first {
                self.reducer.promote(store, payload);
            } else {
                self.reducer.sum_mixed_precision(store, payload);
            }
        } else if first {
            self.reducer.copy(store, payload);
        } else {
            self.reducer.sum(store, payload, len, store_dtype)?;
        }
        Ok(())
    }

    /// Finalize the step for a key: produce what pulls will see.
    /// Compressed keys expose the compressor output, mixed-precision keys
    /// the downcast shadow, everything else the store itself.
    pub(crate) fn finalize_merge(
        &self,
        key: Key,
        store_ptr: u64,
        store_len: usize,
        store_dtype: DataType,
        mixed_precision: bool,
    ) -> Result<()> {
        let compressor = self.compressors.lock().get(&key).cloned();
        let (ptr, len, dtype) = if let Some(compressor) = compressor {
            let mut compressor = compressor.lock();
            let grad =
                unsafe { std::slice::from_raw_parts_mut(store_ptr as *mut u8, store_len) };
            let frame = compressor.compress(grad)?;
            // the frame lives in a compressor-owned buffer whose address
            // is stable for the life of the pipeline
            (frame.as_ptr() as u64, frame.len(), store_dtype)
        } else if mixed_precision {
            let (shadow_ptr, shadow_len) = {
                let fp16_copy = self.fp16_copy.lock();
                let shadow =
                    fp16_copy
                        .get(&key)
                        .ok_or(ServerError::StoreNotInitialized {
                            key,
                            op: "mixed-precision finalize",
                        })?;
                (shadow.ptr(), shadow.len)
            };
            unsafe { self.reducer.demote_ptr(shadow_ptr, store_ptr, shadow_len) };
            (shadow_ptr, shadow_len, DataType::F16)
        } else {
            (store_ptr, store_len, store_dtype)
        };

        let mut update_buf = self.update_buf.lock();
        let u = update_buf.entry(key).or_default();
        u.merged.ptr = ptr;
        u.merged.len = len;
        u.merged.dtype = dtype;
        Ok(())
    }

    fn handle_pull(&self, key: Key, meta: &KVMeta) -> Result<()> {
        let initialized = self
            .store
            .lock()
            .get(&key)
            .map(|e| e.initialized())
            .unwrap_or(false);
        if !initialized {
            return Err(ServerError::StoreNotInitialized { key, op: "pull" });
        }

        if self.cfg.engine_blocking || !self.cfg.sync_mode {
            return self.send_pull_response(key, meta);
        }

        let tid = self.shard_of(key, 0.0);
        let mut flags = self.shards[tid].flags.lock();
        let f = flags.entry(key).or_default();
        if f.is_push_finished && !f.seen_sender.contains(&meta.sender) {
            self.send_pull_response(key, meta)?;
            f.pull_cnt += 1;
            f.seen_sender.insert(meta.sender);
            if f.pull_cnt == self.num_workers {
                f.reset();
            }
        } else {
            // merge still in flight (or this sender already answered):
            // park the pull for the engine to drain
            f.q_pull_reqmeta.push(meta.clone());
        }
        Ok(())
    }

    /// Push and config acks reuse one cached blank response per key so the
    /// transport sees a stable allocation.
    pub(crate) fn send_push_response(&self, key: Key, meta: &KVMeta) {
        let mut push_resp = self.push_resp.lock();
        let pairs = push_resp
            .entry(key)
            .or_insert_with(|| Box::new(KVPairs::blank()));
        self.transport.respond(meta, pairs);
    }

    /// Pull responses are built once per key and then mutated in place:
    /// the value view is repointed at the current merged buffer, whose
    /// address never changes for a given key, so RDMA transports keep
    /// their memory registration.
    pub(crate) fn send_pull_response(&self, key: Key, meta: &KVMeta) -> Result<()> {
        let mut pull_resp = self.pull_resp.lock();
        let merged = {
            let update_buf = self.update_buf.lock();
            update_buf
                .get(&key)
                .map(|u| u.merged)
                .unwrap_or_default()
        };
        if !merged.ready() {
            return Err(ServerError::MergedNotReady { key });
        }

        let pairs = pull_resp.entry(key).or_insert_with(|| {
            Box::new(KVPairs {
                keys: vec![key],
                lens: Vec::new(),
                vals: SBuf::empty(),
            })
        });
        if pairs.lens.is_empty() {
            pairs.lens.push(merged.len);
        } else {
            pairs.lens[0] = merged.len;
        }
        pairs.vals = SBuf::View {
            ptr: merged.ptr,
            len: merged.len,
        };
        self.transport.respond(meta, pairs);
        Ok(())
    }
}

/// Head of a tensor for debug traces: the first four f32 values.
pub(crate) fn debug_tensor(ptr: u64, len: usize) -> String {
    if ptr == 0 {
        return "<null>".into();
    }
    let n = (len / 4).min(4);
    let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, n * 4) };
    let vals: Vec<String> = bytes
        .chunks_exact(4)
        .map(|c| format!("{}", f32::from_ne_bytes(c.try_into().expect("chunk of 4"))))
        .collect();
    format!("0x{ptr:x}=[{}]", vals.join(" "))
}
