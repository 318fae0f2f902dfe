//! Identity pass-through codec.
//!
//! Useful as a baseline, and as the base stage when only the decorators
//! (momentum, error feedback) are wanted. Lossless by construction.

use crate::compression::traits::Compressor;
use crate::error::{Result, ServerError};

pub struct NoCompression {
    cbuf: Vec<u8>,
    dbuf: Vec<u8>,
}

impl NoCompression {
    pub fn new(size: usize) -> Self {
        Self {
            cbuf: vec![0u8; size],
            dbuf: vec![0u8; size],
        }
    }
}

impl Compressor for NoCompression {
    fn compress(&mut self, grad: &mut [u8]) -> Result<&[u8]> {
        self.cbuf[..grad.len()].copy_from_slice(grad);
        Ok(&self.cbuf[..grad.len()])
    }

    fn decompress(&mut self, compressed: &[u8]) -> Result<&[u8]> {
        if compressed.len() > self.dbuf.len() {
            return Err(ServerError::CompressedPayload(format!(
                "identity frame of {} bytes exceeds the registered size",
                compressed.len()
            )));
        }
        self.dbuf[..compressed.len()].copy_from_slice(compressed);
        Ok(&self.dbuf[..compressed.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_is_identity() {
        let mut c = NoCompression::new(16);
        let mut grad: Vec<u8> = (0..16).collect();
        let frame = c.compress(&mut grad).unwrap().to_vec();
        assert_eq!(frame, grad);
        assert_eq!(c.decompress(&frame).unwrap(), &grad[..]);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut c = NoCompression::new(4);
        assert!(c.decompress(&[0u8; 8]).is_err());
    }
}
