//! Runtime configuration for the aggregation core.
//!
//! All values have defaults matching a plain synchronous deployment.
//! Override via the environment variables the cluster launcher already
//! sets, or by constructing a custom `ServerConfig`.

/// Tuning and mode flags for the server core.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of shards / engine threads.
    pub engine_thread_num: usize,

    /// Synchronous training: per-key push barrier, engine threads do the
    /// reductions. Cleared by `BYTEPS_ENABLE_ASYNC`.
    pub sync_mode: bool,

    /// Legacy path: reductions and finalize run on the dispatcher thread,
    /// bypassing the shard queues.
    pub engine_blocking: bool,

    /// Priority ordering inside the shard queues instead of strict FIFO.
    pub enable_schedule: bool,

    /// Multiplier on the workload of compressed keys when picking a shard.
    pub lb_factor: f32,

    /// Verbose per-key tracing of engine reductions.
    pub debug_mode: bool,

    /// The key traced when `debug_mode` is set.
    pub debug_key: u64,

    /// Log every push and pull request.
    pub log_key_info: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            engine_thread_num: 4,
            sync_mode: true,
            engine_blocking: false,
            enable_schedule: false,
            lb_factor: 1.0,
            debug_mode: false,
            debug_key: 0,
            log_key_info: false,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .map(|v| v != 0)
        .unwrap_or(false)
}

impl ServerConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `BYTEPS_SERVER_ENGINE_THREAD` (default 4, clamped to >= 1)
    /// - `BYTEPS_ENABLE_ASYNC`
    /// - `BYTEPS_SERVER_ENGINE_BLOCKING`
    /// - `BYTEPS_SERVER_ENABLE_SCHEDULE`
    /// - `BYTEPS_SERVER_LOAD_BALANCE_FACTOR`
    /// - `BYTEPS_SERVER_DEBUG`, `BYTEPS_SERVER_DEBUG_KEY`
    /// - `PS_KEY_LOG`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("BYTEPS_SERVER_ENGINE_THREAD") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.engine_thread_num = n.max(1);
            }
        }
        cfg.sync_mode = !env_flag("BYTEPS_ENABLE_ASYNC");
        cfg.engine_blocking = env_flag("BYTEPS_SERVER_ENGINE_BLOCKING");
        cfg.enable_schedule = env_flag("BYTEPS_SERVER_ENABLE_SCHEDULE");
        if let Ok(v) = std::env::var("BYTEPS_SERVER_LOAD_BALANCE_FACTOR") {
            if let Ok(f) = v.parse::<f32>() {
                cfg.lb_factor = f;
            }
        }
        cfg.debug_mode = env_flag("BYTEPS_SERVER_DEBUG");
        if let Ok(v) = std::env::var("BYTEPS_SERVER_DEBUG_KEY") {
            if let Ok(k) = v.parse::<u64>() {
                cfg.debug_key = k;
            }
        }
        cfg.log_key_info = env_flag("PS_KEY_LOG");

        if cfg.engine_blocking {
            tracing::info!("server engine running in blocking mode");
        }
        if !cfg.sync_mode {
            tracing::info!("asynchronous training enabled");
        }
        if cfg.debug_mode {
            tracing::info!(key = cfg.debug_key, "debug mode enabled");
        }
        if cfg.enable_schedule {
            tracing::info!("engine scheduling enabled");
        }

        cfg
    }
}
