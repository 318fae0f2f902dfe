//! Engine messages and the per-shard blocking priority queue.

use std::collections::{BinaryHeap, HashMap};

use parking_lot::{Condvar, Mutex};

use crate::transport::SBuf;
use crate::types::{DataType, Key};

/// Operations an engine thread executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOp {
    /// First push of the step: copy the payload into the store.
    CopyFirst,
    /// Pushes 2..W-1: accumulate the payload into the store.
    SumRecv,
    /// W-th push seen: finalize the merge and release queued pulls.
    AllRecv,
    /// Shut the engine thread down.
    Terminate,
}

/// One unit of engine work. `dst`/`src` are raw addresses; the retained
/// payload keeps `src` alive until the message is consumed.
#[derive(Debug, Clone)]
pub struct EngineMessage {
    /// Monotonic id assigned by the dispatcher; FIFO tie-break.
    pub id: u64,
    pub key: Key,
    pub dtype: DataType,
    pub op: EngineOp,
    pub dst: u64,
    pub src: u64,
    pub len: usize,
    /// Compressed byte length of the payload (`lens[0]`); equals `len`
    /// for uncompressed keys.
    pub compressed_len: usize,
    /// The inbound payload backing `src`, if any.
    pub sarray: Option<SBuf>,
    pub mixed_precision: bool,
}

impl EngineMessage {
    pub fn terminate() -> Self {
        Self {
            id: 0,
            key: 0,
            dtype: DataType::F32,
            op: EngineOp::Terminate,
            dst: 0,
            src: 0,
            len: 0,
            compressed_len: 0,
            sarray: None,
            mixed_precision: false,
        }
    }
}

struct Entry {
    priority: i64,
    msg: EngineMessage,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.msg.id == other.msg.id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // max-heap: higher priority first, then older message first
        self.priority
            .cmp(&other.priority)
            .then(other.msg.id.cmp(&self.msg.id))
    }
}

struct QueueState {
    heap: BinaryHeap<Entry>,
    push_cnt: HashMap<Key, u64>,
}

/// Blocking priority queue feeding one engine thread.
///
/// With scheduling disabled every message carries priority 0 and the id
/// tie-break yields strict FIFO. With scheduling enabled the priority is
/// the negated per-key enqueue count: a key's own messages keep program
/// order (each later message sorts lower), while the first messages of a
/// fresh key overtake the tail of a long-running one.
pub struct PriorityQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    enable_schedule: bool,
}

impl PriorityQueue {
    pub fn new(enable_schedule: bool) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                push_cnt: HashMap::new(),
            }),
            cond: Condvar::new(),
            enable_schedule,
        }
    }

    pub fn push(&self, msg: EngineMessage) {
        let mut state = self.state.lock();
        let priority = match msg.op {
            // drain pending work before shutting down
            EngineOp::Terminate => i64::MIN,
            _ if self.enable_schedule => {
                let cnt = state.push_cnt.entry(msg.key).or_insert(0);
                let priority = -(*cnt as i64);
                *cnt += 1;
                priority
            }
            _ => 0,
        };
        state.heap.push(Entry { priority, msg });
        drop(state);
        self.cond.notify_one();
    }

    /// Block until a message is available.
    pub fn wait_and_pop(&self) -> EngineMessage {
        let mut state = self.state.lock();
        while state.heap.is_empty() {
            self.cond.wait(&mut state);
        }
        state.heap.pop().expect("heap is non-empty").msg
    }

    /// Reset the scheduling counter for a key (called when its step
    /// finalizes).
    pub fn clear_counter(&self, key: Key) {
        if self.enable_schedule {
            self.state.lock().push_cnt.insert(key, 0);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
