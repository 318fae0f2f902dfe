//! Per-key server state: the authoritative merged buffer, the in-flight
//! step bookkeeping, and the per-shard pull barrier flags.

use std::collections::HashSet;

use crate::buffer::AlignedBuf;
use crate::transport::{KVMeta, SBuf};
use crate::types::{DataType, WorkerId};

/// Authoritative buffer for one key (also used for the fp16 shadow).
///
/// `len` and `dtype` are the post-promotion values: an fp16 key aggregates
/// as fp32 at twice the wire length, with the shadow holding the fp16
/// rendition for transmission. Created on the init-push round, outlives
/// every step, freed at shutdown.
#[derive(Debug)]
pub struct StoreEntry {
    pub buf: Option<AlignedBuf>,
    pub len: usize,
    pub dtype: DataType,
}

impl Default for StoreEntry {
    fn default() -> Self {
        Self {
            buf: None,
            len: 0,
            dtype: DataType::F32,
        }
    }
}

impl StoreEntry {
    pub fn initialized(&self) -> bool {
        self.buf.is_some()
    }

    pub fn ptr(&self) -> u64 {
        self.buf.as_ref().map(|b| b.as_ptr()).unwrap_or(0)
    }
}

/// Non-owning alias of whatever a pull response should expose: the store,
/// the fp16 shadow, or a compressor output buffer. The owner outlives
/// every response in flight (shutdown joins the engine first).
#[derive(Debug, Clone, Copy)]
pub struct Merged {
    pub ptr: u64,
    pub len: usize,
    pub dtype: DataType,
}

impl Default for Merged {
    fn default() -> Self {
        Self {
            ptr: 0,
            len: 0,
            dtype: DataType::F32,
        }
    }
}

impl Merged {
    pub fn ready(&self) -> bool {
        self.ptr != 0
    }
}

/// Per-key step bookkeeping on the dispatcher side.
#[derive(Debug, Default)]
pub struct UpdateBuf {
    /// What pull responses expose once the step's merge completes.
    pub merged: Merged,
    /// Request metas of the pushes collected so far this step (also
    /// reused to collect init and config rounds). Never exceeds W.
    pub request: Vec<KVMeta>,
    /// The first incoming push payload, retained so its memory stays
    /// alive until the engine consumes it.
    pub tmp_sarray: Option<SBuf>,
}

/// Pull-barrier state for one key, owned by its shard.
#[derive(Debug, Default)]
pub struct KeyFlags {
    /// True once the step's finalize has run.
    pub is_push_finished: bool,
    /// Workers answered this step.
    pub pull_cnt: usize,
    /// Senders already answered this step.
    pub seen_sender: HashSet<WorkerId>,
    /// Pulls that arrived before the merge completed.
    pub q_pull_reqmeta: Vec<KVMeta>,
}

impl KeyFlags {
    /// Reset the barrier for the next step. The three fields reset
    /// together and only together; queued pulls are carried separately.
    pub fn reset(&mut self) {
        self.is_push_finished = false;
        self.pull_cnt = 0;
        self.seen_sender.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_entry_lifecycle() {
        let mut e = StoreEntry::default();
        assert!(!e.initialized());
        assert_eq!(e.ptr(), 0);
        e.buf = Some(AlignedBuf::zeroed(64).unwrap());
        e.len = 60;
        assert!(e.initialized());
        assert_ne!(e.ptr(), 0);
    }

    #[test]
    fn test_merged_ready() {
        let mut m = Merged::default();
        assert!(!m.ready());
        m.ptr = 0x1000;
        m.len = 16;
        assert!(m.ready());
    }

    #[test]
    fn test_flags_reset_together() {
        let mut f = KeyFlags::default();
        f.is_push_finished = true;
        f.pull_cnt = 3;
        f.seen_sender.extend([0, 1, 2]);
        f.q_pull_reqmeta.push(KVMeta {
            cmd: 0,
            push: false,
            sender: 9,
        });
        f.reset();
        assert!(!f.is_push_finished);
        assert_eq!(f.pull_cnt, 0);
        assert!(f.seen_sender.is_empty());
        // queued pulls survive a reset
        assert_eq!(f.q_pull_reqmeta.len(), 1);
    }
}
