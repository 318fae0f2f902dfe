//! Types crossing the seam to the key-value RPC transport.
//!
//! The transport (connection handling, key encoding, RDMA memory
//! registration) lives outside this crate. It invokes
//! [`crate::server::AggServer::handle`] once per inbound request and ships
//! whatever the core passes to [`KvServer::respond`]. Keys arrive already
//! decoded.

use std::sync::Arc;

use crate::types::{Key, WorkerId};

/// Request metadata delivered alongside each payload.
#[derive(Debug, Clone)]
pub struct KVMeta {
    /// Packed `(request type, dtype)`; see [`crate::types::DataHandleType`].
    pub cmd: u32,
    /// True for push, false for pull.
    pub push: bool,
    /// Originating worker.
    pub sender: WorkerId,
}

/// Byte payload of a request or response.
///
/// Inbound payloads are shared owned bytes; cloning is a refcount bump, so
/// the core can retain a push payload past the callback to keep its memory
/// alive until the merge consumes it. Outbound pull responses use the
/// non-owning `View` form: they alias the merged buffer so the transport
/// sees a stable address across steps and never re-registers the region.
#[derive(Debug, Clone)]
pub enum SBuf {
    Owned(Arc<Vec<u8>>),
    View { ptr: u64, len: usize },
}

impl SBuf {
    pub fn from_vec(v: Vec<u8>) -> Self {
        SBuf::Owned(Arc::new(v))
    }

    /// Empty owned payload (blank acknowledgement).
    pub fn empty() -> Self {
        SBuf::Owned(Arc::new(Vec::new()))
    }

    pub fn len(&self) -> usize {
        match self {
            SBuf::Owned(v) => v.len(),
            SBuf::View { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw address of the payload bytes.
    pub fn as_ptr(&self) -> u64 {
        match self {
            SBuf::Owned(v) => v.as_ptr() as u64,
            SBuf::View { ptr, .. } => *ptr,
        }
    }

    /// Borrow an owned payload. Panics on a `View`; views are produced by
    /// the core for the transport, never consumed back.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            SBuf::Owned(v) => v,
            SBuf::View { .. } => panic!("as_slice on a non-owning view"),
        }
    }

    /// Reconstruct a slice from a `View`.
    ///
    /// # Safety
    /// The aliased buffer must still be alive and must not be mutated for
    /// the lifetime of the returned slice.
    pub unsafe fn view_slice(&self) -> &[u8] {
        match self {
            SBuf::Owned(v) => v,
            SBuf::View { ptr, len } => unsafe {
                std::slice::from_raw_parts(*ptr as *const u8, *len)
            },
        }
    }
}

/// One request or response travelling over the transport.
///
/// The core only ever sees (and emits) single-key pairs.
#[derive(Debug, Clone)]
pub struct KVPairs {
    pub keys: Vec<Key>,
    pub lens: Vec<usize>,
    pub vals: SBuf,
}

impl KVPairs {
    /// Blank pair used for push and config acknowledgements.
    pub fn blank() -> Self {
        Self {
            keys: Vec::new(),
            lens: Vec::new(),
            vals: SBuf::empty(),
        }
    }
}

/// Response side of the transport.
///
/// `respond` is called exactly once per request the core was handed. For a
/// given key the core passes the same cached `KVPairs` allocation every
/// time, mutated in place, so RDMA transports can register its backing
/// memory once.
pub trait KvServer: Send + Sync {
    fn respond(&self, meta: &KVMeta, pairs: &KVPairs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sbuf_owned_clone_shares() {
        let a = SBuf::from_vec(vec![1, 2, 3]);
        let b = a.clone();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(b.len(), 3);
        assert_eq!(b.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_sbuf_view() {
        let backing = vec![9u8; 8];
        let v = SBuf::View {
            ptr: backing.as_ptr() as u64,
            len: 8,
        };
        assert_eq!(v.len(), 8);
        assert_eq!(unsafe { v.view_slice() }, &backing[..]);
    }

    #[test]
    fn test_blank_pairs() {
        let p = KVPairs::blank();
        assert!(p.keys.is_empty());
        assert!(p.lens.is_empty());
        assert!(p.vals.is_empty());
    }
}
