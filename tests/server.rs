//! End-to-end scenarios: a mock transport drives the dispatcher the way
//! the key-value RPC layer would, and the tests observe the responses.

use std::sync::Arc;
use std::time::{Duration, Instant};

use half::f16;
use parking_lot::Mutex;

use syncps::compression::{OnebitCompressor, TopkCompressor};
use syncps::{
    AggServer, Compressor, DataHandleType, DataType, KVMeta, KVPairs, KvServer, RequestType,
    SBuf, ServerConfig,
};

/// One response captured off the wire. View payloads are copied at
/// respond time, the way a real transport would serialize them.
#[derive(Debug, Clone)]
struct Captured {
    sender: u32,
    push: bool,
    keys: Vec<u64>,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct MockTransport {
    log: Mutex<Vec<Captured>>,
}

impl KvServer for MockTransport {
    fn respond(&self, meta: &KVMeta, pairs: &KVPairs) {
        let bytes = unsafe { pairs.vals.view_slice() }.to_vec();
        self.log.lock().push(Captured {
            sender: meta.sender,
            push: meta.push,
            keys: pairs.keys.clone(),
            bytes,
        });
    }
}

impl MockTransport {
    fn wait_until(&self, count: usize) -> Vec<Captured> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            {
                let log = self.log.lock();
                if log.len() >= count {
                    return log.clone();
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for responses");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn pull_responses(&self) -> Vec<Captured> {
        self.log
            .lock()
            .iter()
            .filter(|c| !c.push)
            .cloned()
            .collect()
    }

    fn clear(&self) {
        self.log.lock().clear();
    }
}

fn push_meta(sender: u32, rt: RequestType, dtype: DataType) -> KVMeta {
    KVMeta {
        cmd: DataHandleType::new(rt, dtype).pack(),
        push: true,
        sender,
    }
}

fn pull_meta(sender: u32, rt: RequestType, dtype: DataType) -> KVMeta {
    KVMeta {
        cmd: DataHandleType::new(rt, dtype).pack(),
        push: false,
        sender,
    }
}

fn push_pairs(key: u64, bytes: Vec<u8>) -> KVPairs {
    KVPairs {
        keys: vec![key],
        lens: vec![bytes.len()],
        vals: SBuf::from_vec(bytes),
    }
}

fn pull_pairs(key: u64) -> KVPairs {
    KVPairs {
        keys: vec![key],
        lens: Vec::new(),
        vals: SBuf::empty(),
    }
}

fn f32_bytes(vals: &[f32]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn as_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

fn cfg_with_shards(n: usize) -> ServerConfig {
    ServerConfig {
        engine_thread_num: n,
        ..ServerConfig::default()
    }
}

/// Run the init-push round for a key so the store exists.
fn init_key(server: &AggServer, key: u64, dtype: DataType, len: usize, workers: u32) {
    for w in 0..workers {
        server
            .handle(
                &push_meta(w, RequestType::DefaultPushPull, dtype),
                &push_pairs(key, vec![0u8; len]),
            )
            .unwrap();
    }
}

#[test]
fn dense_fp32_sum_two_workers() {
    let transport = Arc::new(MockTransport::default());
    let mut server = AggServer::start(cfg_with_shards(1), 2, transport.clone()).unwrap();

    init_key(&server, 1, DataType::F32, 16, 2);
    transport.wait_until(2); // both init acks arrive together
    transport.clear();

    server
        .handle(
            &push_meta(0, RequestType::DefaultPushPull, DataType::F32),
            &push_pairs(1, f32_bytes(&[1.0, 2.0, 3.0, 4.0])),
        )
        .unwrap();
    server
        .handle(
            &push_meta(1, RequestType::DefaultPushPull, DataType::F32),
            &push_pairs(1, f32_bytes(&[10.0, 20.0, 30.0, 40.0])),
        )
        .unwrap();
    for w in 0..2 {
        server
            .handle(
                &pull_meta(w, RequestType::DefaultPushPull, DataType::F32),
                &pull_pairs(1),
            )
            .unwrap();
    }

    let log = transport.wait_until(4); // 2 push acks + 2 pull responses
    let pushes: Vec<_> = log.iter().filter(|c| c.push).collect();
    let pulls: Vec<_> = log.iter().filter(|c| !c.push).collect();
    assert_eq!(pushes.len(), 2, "exactly one push ack per worker");
    assert_eq!(pulls.len(), 2, "exactly one pull response per worker");

    let mut senders: Vec<u32> = pulls.iter().map(|c| c.sender).collect();
    senders.sort();
    assert_eq!(senders, vec![0, 1]);
    for pull in pulls {
        assert_eq!(pull.keys, vec![1]);
        assert_eq!(as_f32s(&pull.bytes), vec![11.0, 22.0, 33.0, 44.0]);
    }

    server.shutdown();
}

#[test]
fn pull_before_push_is_deferred() {
    let transport = Arc::new(MockTransport::default());
    let mut server = AggServer::start(cfg_with_shards(2), 2, transport.clone()).unwrap();

    init_key(&server, 7, DataType::F32, 4, 2);
    transport.wait_until(2);
    transport.clear();

    // worker 0 pulls before any push of the step
    server
        .handle(
            &pull_meta(0, RequestType::DefaultPushPull, DataType::F32),
            &pull_pairs(7),
        )
        .unwrap();
    std::thread::sleep(Duration::from_millis(10));
    assert!(
        transport.pull_responses().is_empty(),
        "pull must wait for the merge"
    );

    server
        .handle(
            &push_meta(0, RequestType::DefaultPushPull, DataType::F32),
            &push_pairs(7, f32_bytes(&[1.0])),
        )
        .unwrap();
    server
        .handle(
            &push_meta(1, RequestType::DefaultPushPull, DataType::F32),
            &push_pairs(7, f32_bytes(&[2.0])),
        )
        .unwrap();
    server
        .handle(
            &pull_meta(1, RequestType::DefaultPushPull, DataType::F32),
            &pull_pairs(7),
        )
        .unwrap();

    transport.wait_until(4);
    let pulls = transport.pull_responses();
    assert_eq!(pulls.len(), 2);
    for pull in pulls {
        assert_eq!(as_f32s(&pull.bytes), vec![3.0]);
    }

    server.shutdown();
}

#[test]
fn mixed_precision_aggregates_in_fp32() {
    let transport = Arc::new(MockTransport::default());
    let mut server = AggServer::start(cfg_with_shards(1), 2, transport.clone()).unwrap();

    let halves = |vals: &[f32]| -> Vec<u8> {
        vals.iter()
            .flat_map(|&v| f16::from_f32(v).to_ne_bytes())
            .collect()
    };

    init_key(&server, 3, DataType::F16, 16, 2); // 8 fp16 elements
    transport.wait_until(2);
    transport.clear();

    let a = [0.5f32, 1.0, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0];
    let b = [1.0f32; 8];
    server
        .handle(
            &push_meta(0, RequestType::DefaultPushPull, DataType::F16),
            &push_pairs(3, halves(&a)),
        )
        .unwrap();
    server
        .handle(
            &push_meta(1, RequestType::DefaultPushPull, DataType::F16),
            &push_pairs(3, halves(&b)),
        )
        .unwrap();
    server
        .handle(
            &pull_meta(0, RequestType::DefaultPushPull, DataType::F16),
            &pull_pairs(3),
        )
        .unwrap();

    transport.wait_until(3);
    let pulls = transport.pull_responses();
    assert_eq!(pulls.len(), 1);
    let out: Vec<f32> = pulls[0]
        .bytes
        .chunks_exact(2)
        .map(|c| f16::from_ne_bytes(c.try_into().unwrap()).to_f32())
        .collect();
    let expected: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
    assert_eq!(out, expected);

    server.shutdown();
}

#[test]
fn topk_compression_end_to_end() {
    let transport = Arc::new(MockTransport::default());
    let mut server = AggServer::start(cfg_with_shards(1), 2, transport.clone()).unwrap();

    init_key(&server, 5, DataType::F32, 16, 2);
    transport.wait_until(2);
    transport.clear();

    // both workers negotiate topk with k=2
    let config = "2 compressor_type topk compressor_k 2";
    for w in 0..2 {
        server
            .handle(
                &push_meta(w, RequestType::ConfigPushPull, DataType::F32),
                &push_pairs(5, config.as_bytes().to_vec()),
            )
            .unwrap();
    }
    transport.wait_until(2);
    transport.clear();

    // worker-side codec produces the frames the server decompresses
    let mut worker_codec = TopkCompressor::new(16, DataType::F32, 2).unwrap();
    let mut g0 = f32_bytes(&[0.1, 3.0, 0.2, -5.0]);
    let frame0 = worker_codec.compress(&mut g0).unwrap().to_vec();
    let mut g1 = f32_bytes(&[0.0, 4.0, 0.1, -6.0]);
    let frame1 = worker_codec.compress(&mut g1).unwrap().to_vec();

    server
        .handle(
            &push_meta(0, RequestType::CompressedPushPull, DataType::F32),
            &push_pairs(5, frame0),
        )
        .unwrap();
    server
        .handle(
            &push_meta(1, RequestType::CompressedPushPull, DataType::F32),
            &push_pairs(5, frame1),
        )
        .unwrap();
    server
        .handle(
            &pull_meta(0, RequestType::CompressedPushPull, DataType::F32),
            &pull_pairs(5),
        )
        .unwrap();

    transport.wait_until(3);
    let pulls = transport.pull_responses();
    assert_eq!(pulls.len(), 1);
    let frame = &pulls[0].bytes;

    // frame header: n=4 elements, k=2 pairs at indices 1 and 3
    let n = u32::from_ne_bytes(frame[0..4].try_into().unwrap());
    let k = u32::from_ne_bytes(frame[4..8].try_into().unwrap());
    assert_eq!((n, k), (4, 2));
    let mut indices = vec![
        u32::from_ne_bytes(frame[8..12].try_into().unwrap()),
        u32::from_ne_bytes(frame[16..20].try_into().unwrap()),
    ];
    indices.sort();
    assert_eq!(indices, vec![1, 3]);

    let dense = as_f32s(worker_codec.decompress(frame).unwrap());
    assert_eq!(dense, vec![0.0, 7.0, 0.0, -11.0]);

    server.shutdown();
}

#[test]
fn onebit_with_nesterov_momentum_over_steps() {
    let transport = Arc::new(MockTransport::default());
    // W=1: the single push of a step is both the copy and the finalize
    let mut server = AggServer::start(cfg_with_shards(1), 1, transport.clone()).unwrap();

    init_key(&server, 9, DataType::F32, 16, 1);
    transport.wait_until(1);
    transport.clear();

    let config =
        "4 compressor_type onebit onebit_scaling true momentum_type nesterov momentum_mu 0.9";
    server
        .handle(
            &push_meta(0, RequestType::ConfigPushPull, DataType::F32),
            &push_pairs(9, config.as_bytes().to_vec()),
        )
        .unwrap();
    transport.wait_until(1);
    transport.clear();

    let mut worker_codec = OnebitCompressor::new(16, DataType::F32, true).unwrap();
    let mut scales = Vec::new();
    for step in 0..3usize {
        let mut grad = f32_bytes(&[1.0, 1.0, 1.0, 1.0]);
        let frame = worker_codec.compress(&mut grad).unwrap().to_vec();
        server
            .handle(
                &push_meta(0, RequestType::CompressedPushPull, DataType::F32),
                &push_pairs(9, frame),
            )
            .unwrap();
        server
            .handle(
                &pull_meta(0, RequestType::CompressedPushPull, DataType::F32),
                &pull_pairs(9),
            )
            .unwrap();
        let expected = 2 * (step + 1);
        transport.wait_until(expected);
    }

    for pull in transport.pull_responses() {
        let dense = as_f32s(worker_codec.decompress(&pull.bytes).unwrap());
        // sign stays positive; the magnitude is the onebit scale
        assert!(dense.iter().all(|&v| v > 0.0));
        assert!(dense.windows(2).all(|w| w[0] == w[1]));
        scales.push(dense[0]);
    }
    assert_eq!(scales.len(), 3);
    // momentum keeps growing: 1.9, 2.71, 3.439
    assert!((scales[0] - 1.9).abs() < 1e-4, "step 1 scale {}", scales[0]);
    assert!(scales[0] < scales[1] && scales[1] < scales[2]);

    server.shutdown();
}

#[test]
fn engine_blocking_mode_runs_inline() {
    let transport = Arc::new(MockTransport::default());
    let cfg = ServerConfig {
        engine_blocking: true,
        ..cfg_with_shards(1)
    };
    let mut server = AggServer::start(cfg, 2, transport.clone()).unwrap();

    init_key(&server, 2, DataType::F32, 8, 2);
    transport.clear();

    server
        .handle(
            &push_meta(0, RequestType::DefaultPushPull, DataType::F32),
            &push_pairs(2, f32_bytes(&[1.0, 2.0])),
        )
        .unwrap();
    server
        .handle(
            &push_meta(1, RequestType::DefaultPushPull, DataType::F32),
            &push_pairs(2, f32_bytes(&[3.0, 4.0])),
        )
        .unwrap();
    // no engine threads: the response is already synchronous
    server
        .handle(
            &pull_meta(0, RequestType::DefaultPushPull, DataType::F32),
            &pull_pairs(2),
        )
        .unwrap();

    let pulls = transport.pull_responses();
    assert_eq!(pulls.len(), 1);
    assert_eq!(as_f32s(&pulls[0].bytes), vec![4.0, 6.0]);

    server.shutdown();
}

#[test]
fn async_mode_has_no_barrier() {
    let transport = Arc::new(MockTransport::default());
    let cfg = ServerConfig {
        sync_mode: false,
        ..cfg_with_shards(1)
    };
    let mut server = AggServer::start(cfg, 2, transport.clone()).unwrap();

    init_key(&server, 4, DataType::F32, 8, 2);
    transport.clear();

    // pushes are acknowledged immediately, reductions run inline
    for w in 0..2 {
        server
            .handle(
                &push_meta(w, RequestType::DefaultPushPull, DataType::F32),
                &push_pairs(4, f32_bytes(&[1.0, 1.0])),
            )
            .unwrap();
    }
    assert_eq!(transport.log.lock().iter().filter(|c| c.push).count(), 2);

    // async mode never produces a merged view; a pull is a protocol error
    let err = server
        .handle(
            &pull_meta(0, RequestType::DefaultPushPull, DataType::F32),
            &pull_pairs(4),
        )
        .unwrap_err();
    assert!(err.to_string().contains("merged buffer"));

    server.shutdown();
}

#[test]
fn multiple_keys_across_shards() {
    let transport = Arc::new(MockTransport::default());
    let mut server = AggServer::start(cfg_with_shards(4), 2, transport.clone()).unwrap();

    for key in 10..18u64 {
        init_key(&server, key, DataType::F32, 8, 2);
    }
    transport.wait_until(16);
    transport.clear();

    for key in 10..18u64 {
        for w in 0..2 {
            server
                .handle(
                    &push_meta(w, RequestType::DefaultPushPull, DataType::F32),
                    &push_pairs(key, f32_bytes(&[key as f32, w as f32])),
                )
                .unwrap();
        }
        for w in 0..2 {
            server
                .handle(
                    &pull_meta(w, RequestType::DefaultPushPull, DataType::F32),
                    &pull_pairs(key),
                )
                .unwrap();
        }
    }

    let log = transport.wait_until(8 * 4);
    for key in 10..18u64 {
        let pulls: Vec<_> = log
            .iter()
            .filter(|c| !c.push && c.keys == vec![key])
            .collect();
        assert_eq!(pulls.len(), 2, "key {key}");
        for pull in pulls {
            assert_eq!(as_f32s(&pull.bytes), vec![key as f32 * 2.0, 1.0]);
        }
    }

    server.shutdown();
}

#[test]
fn barrier_resets_between_steps() {
    let transport = Arc::new(MockTransport::default());
    let mut server = AggServer::start(cfg_with_shards(1), 2, transport.clone()).unwrap();

    init_key(&server, 6, DataType::F32, 4, 2);
    transport.wait_until(2);
    transport.clear();

    for step in 1..=3u32 {
        for w in 0..2 {
            server
                .handle(
                    &push_meta(w, RequestType::DefaultPushPull, DataType::F32),
                    &push_pairs(6, f32_bytes(&[step as f32])),
                )
                .unwrap();
        }
        for w in 0..2 {
            server
                .handle(
                    &pull_meta(w, RequestType::DefaultPushPull, DataType::F32),
                    &pull_pairs(6),
                )
                .unwrap();
        }
        let log = transport.wait_until(4);
        let pulls: Vec<_> = log.iter().filter(|c| !c.push).collect();
        assert_eq!(pulls.len(), 2, "step {step}");
        for pull in pulls {
            // each step merges fresh: no carry-over from the last one
            assert_eq!(as_f32s(&pull.bytes), vec![step as f32 * 2.0]);
        }
        transport.clear();
    }

    server.shutdown();
}

#[test]
fn protocol_violations_are_errors() {
    let transport = Arc::new(MockTransport::default());
    let mut server = AggServer::start(cfg_with_shards(1), 1, transport.clone()).unwrap();

    // pull before the store exists
    let err = server
        .handle(
            &pull_meta(0, RequestType::DefaultPushPull, DataType::F32),
            &pull_pairs(99),
        )
        .unwrap_err();
    assert!(err.to_string().contains("no initialized store"));

    // row-sparse is explicitly unimplemented
    let err = server
        .handle(
            &push_meta(0, RequestType::RowSparsePushPull, DataType::F32),
            &push_pairs(99, vec![0u8; 4]),
        )
        .unwrap_err();
    assert!(err.to_string().contains("row-sparse"));

    // unknown command word
    let err = server
        .handle(
            &KVMeta {
                cmd: 0xffff,
                push: true,
                sender: 0,
            },
            &push_pairs(99, vec![0u8; 4]),
        )
        .unwrap_err();
    assert!(err.to_string().contains("unrecognized"));

    // declared and actual payload sizes must agree
    let err = server
        .handle(
            &push_meta(0, RequestType::DefaultPushPull, DataType::F32),
            &KVPairs {
                keys: vec![99],
                lens: vec![8],
                vals: SBuf::from_vec(vec![0u8; 4]),
            },
        )
        .unwrap_err();
    assert!(err.to_string().contains("declares"));

    server.shutdown();
}

#[test]
fn push_length_mismatch_is_fatal() {
    let transport = Arc::new(MockTransport::default());
    let mut server = AggServer::start(cfg_with_shards(1), 1, transport.clone()).unwrap();

    init_key(&server, 11, DataType::F32, 16, 1);
    transport.wait_until(1);

    let err = server
        .handle(
            &push_meta(0, RequestType::DefaultPushPull, DataType::F32),
            &push_pairs(11, vec![0u8; 12]),
        )
        .unwrap_err();
    assert!(err.to_string().contains("store was initialized with 16"));

    server.shutdown();
}

#[test]
fn shutdown_joins_engine_threads() {
    let transport = Arc::new(MockTransport::default());
    let mut server = AggServer::start(cfg_with_shards(4), 2, transport.clone()).unwrap();

    init_key(&server, 1, DataType::F32, 8, 2);
    transport.wait_until(2);

    let start = Instant::now();
    server.shutdown();
    assert!(start.elapsed() < Duration::from_secs(1));
    // idempotent
    server.shutdown();
}
