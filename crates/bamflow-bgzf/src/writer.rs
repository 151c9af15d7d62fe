//! Single-block BGZF compression.
//!
//! The writeback pipeline splits output into sub-blocks no larger than [`MAX_BLOCK_SIZE`] and
//! compresses each one independently, so the compressor here works one block at a time and
//! keeps no buffered state between calls.

use bgzf::{CompressionLevel, Compressor};
use std::io;

/// Largest uncompressed payload that fits in one BGZF block.
pub const MAX_BLOCK_SIZE: usize = bgzf::BGZF_BLOCK_SIZE;

/// Reusable BGZF block compressor.
pub struct BlockCompressor {
    inner: Compressor,
    level: u8,
}

impl BlockCompressor {
    /// Create a compressor at `level`, clamped into `1..=12`.
    ///
    /// # Errors
    ///
    /// Returns an error if the compression backend rejects the level.
    pub fn new(level: u32) -> io::Result<Self> {
        let level = level.clamp(1, 12) as u8;
        let compression = CompressionLevel::new(level).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("compression level {level}: {e}"))
        })?;
        Ok(Self { inner: Compressor::new(compression), level })
    }

    /// The effective compression level.
    #[must_use]
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Compress `data` into one complete BGZF block, appending it to `out`.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` exceeds [`MAX_BLOCK_SIZE`] or compression fails.
    pub fn compress_block(&mut self, data: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        if data.len() > MAX_BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block of {} bytes exceeds BGZF maximum {MAX_BLOCK_SIZE}", data.len()),
            ));
        }
        let mut block = Vec::new();
        self.inner
            .compress(data, &mut block)
            .map_err(|e| io::Error::other(format!("BGZF compression failed: {e}")))?;
        out.extend_from_slice(&block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{BGZF_FOOTER_SIZE, BGZF_HEADER_SIZE, RawBlock, decompress_into};
    use libdeflater::Decompressor;
    use rstest::rstest;

    #[rstest]
    #[case(1)]
    #[case(1000)]
    #[case(MAX_BLOCK_SIZE)]
    fn test_round_trip(#[case] len: usize) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut compressor = BlockCompressor::new(6).unwrap();
        let mut block = Vec::new();
        compressor.compress_block(&data, &mut block).unwrap();

        let view = RawBlock::new(&block).unwrap();
        assert_eq!(view.uncompressed_size(), len);
        assert!(block.len() >= BGZF_HEADER_SIZE + BGZF_FOOTER_SIZE);

        let mut out = Vec::new();
        decompress_into(&block, &mut Decompressor::new(), &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_oversized_block_rejected() {
        let mut compressor = BlockCompressor::new(1).unwrap();
        let data = vec![0u8; MAX_BLOCK_SIZE + 1];
        let err = compressor.compress_block(&data, &mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(6, 6)]
    #[case(99, 12)]
    fn test_level_is_clamped(#[case] requested: u32, #[case] expected: u8) {
        assert_eq!(BlockCompressor::new(requested).unwrap().level(), expected);
    }

    #[test]
    fn test_appends_to_existing_output() {
        let mut compressor = BlockCompressor::new(6).unwrap();
        let mut out = vec![9u8; 3];
        compressor.compress_block(b"abc", &mut out).unwrap();
        assert_eq!(&out[..3], &[9, 9, 9]);
        assert!(RawBlock::new(&out[3..]).is_ok());
    }
}
