//! Per-shard engine thread: pops messages in shard order and performs the
//! copy / sum / finalize work of the step.
//!
//! Within one shard the queue yields a key's messages in program order,
//! so `CopyFirst, SumRecv x (W-2), AllRecv` execute as enqueued; distinct
//! keys on different shards are fully independent.

use std::sync::Arc;

use crate::error::{Result, ServerError};
use crate::queue::{EngineMessage, EngineOp};
use crate::server::{debug_tensor, ServerInner};

pub(crate) fn engine_thread(inner: Arc<ServerInner>, tid: usize) {
    loop {
        let msg = inner.shards[tid].queue.wait_and_pop();
        if msg.op == EngineOp::Terminate {
            break;
        }
        if let Err(e) = process(&inner, tid, &msg) {
            // a failed reduction would silently desynchronize every
            // worker; tear the process down instead
            tracing::error!(shard = tid, key = msg.key, error = %e, "engine failure");
            panic!("engine thread {tid} failed on key {}: {e}", msg.key);
        }
    }
    tracing::debug!(shard = tid, "engine thread exiting");
}

fn process(inner: &ServerInner, tid: usize, msg: &EngineMessage) -> Result<()> {
    debug_assert!(msg.dst != 0 && msg.src != 0);
    let compressor = inner.compressors.lock().get(&msg.key).cloned();
    let is_debug = inner.cfg.debug_mode && inner.cfg.debug_key == msg.key;

    match msg.op {
        EngineOp::CopyFirst | EngineOp::SumRecv => {
            if is_debug {
                let _debug = inner.debug_mu.lock();
                tracing::info!(
                    stage = stage_name(msg.op, "BEFORE"),
                    dst = %debug_tensor(msg.dst, msg.len),
                    src = %debug_tensor(msg.src, msg.len),
                    "engine reduce"
                );
            }
            if let Some(compressor) = compressor {
                // compressed payload: restore full precision, then reduce
                let mut compressor = compressor.lock();
                let payload = msg
                    .sarray
                    .as_ref()
                    .ok_or_else(|| {
                        ServerError::CompressedPayload("compressed push lost its payload".into())
                    })?
                    .as_slice();
                let dense = compressor.decompress(&payload[..msg.compressed_len])?;
                reduce(inner, msg.op, msg.dst, dense.as_ptr() as u64, dense.len(), msg, false)?;
            } else {
                reduce(inner, msg.op, msg.dst, msg.src, msg.len, msg, msg.mixed_precision)?;
            }
            if is_debug {
                let _debug = inner.debug_mu.lock();
                tracing::info!(
                    stage = stage_name(msg.op, "AFTER"),
                    dst = %debug_tensor(msg.dst, msg.len),
                    src = %debug_tensor(msg.src, msg.len),
                    "engine reduce"
                );
            }
        }
        EngineOp::AllRecv => {
            inner.finalize_merge(msg.key, msg.dst, msg.len, msg.dtype, msg.mixed_precision)?;

            let mut flags = inner.shards[tid].flags.lock();
            let f = flags.entry(msg.key).or_default();
            f.is_push_finished = true;
            let mut i = 0;
            while i < f.q_pull_reqmeta.len() {
                if f.seen_sender.contains(&f.q_pull_reqmeta[i].sender) {
                    i += 1;
                    continue;
                }
                let req = f.q_pull_reqmeta.remove(i);
                inner.send_pull_response(msg.key, &req)?;
                f.pull_cnt += 1;
                f.seen_sender.insert(req.sender);
                if f.pull_cnt == inner.num_workers {
                    f.reset();
                    break;
                }
            }
        }
        EngineOp::Terminate => unreachable!("terminate is handled by the thread loop"),
    }
    Ok(())
}

fn reduce(
    inner: &ServerInner,
    op: EngineOp,
    dst: u64,
    src: u64,
    len: usize,
    msg: &EngineMessage,
    mixed_precision: bool,
) -> Result<()> {
    match op {
        EngineOp::CopyFirst => unsafe {
            if mixed_precision {
                inner.reducer.promote_ptr(dst, src, len);
            } else {
                inner.reducer.copy_ptr(dst, src, len);
            }
        },
        EngineOp::SumRecv => unsafe {
            if mixed_precision {
                inner.reducer.sum_mixed_ptr(dst, src, len);
            } else {
                inner.reducer.sum_ptr(dst, src, len, msg.dtype)?;
            }
        },
        _ => unreachable!("reduce only handles copy and sum"),
    }
    Ok(())
}

fn stage_name(op: EngineOp, phase: &'static str) -> &'static str {
    match (op, phase) {
        (EngineOp::CopyFirst, "BEFORE") => "ENGINE_COPY_MERGED_TO_STORE_BEFORE",
        (EngineOp::CopyFirst, _) => "ENGINE_COPY_MERGED_TO_STORE_AFTER",
        (_, "BEFORE") => "ENGINE_SUM_RECV_BEFORE",
        (_, _) => "ENGINE_SUM_RECV_AFTER",
    }
}
