//! Block codecs: the black-box compress/decompress boundary of the engine.
//!
//! A codec never holds per-call state. Compressor and decompressor contexts are pooled in
//! [`GrowingFreeList`]s so that concurrent workers never share one.

use std::io::{self, Read};

use bamflow_bgzf::{BGZF_EOF, BlockCompressor, MAX_BLOCK_SIZE, decompress_into, read_blocks_into};
use libdeflater::Decompressor;

use crate::pool::GrowingFreeList;

/// Size of one re-parse unit read by [`PlainCodec`].
pub const PLAIN_UNIT_SIZE: usize = 256 * 1024;

/// Compression boundary used by the decode and writeback pipelines.
pub trait BlockCodec: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Read up to `max_blocks` compressed blocks, reusing the buffers in `blocks`.
    ///
    /// Returns the number of blocks read; zero means end of input.
    fn read_blocks(
        &self,
        reader: &mut dyn Read,
        max_blocks: usize,
        blocks: &mut Vec<Vec<u8>>,
    ) -> io::Result<usize>;

    /// Decompress one block, appending to `out`.
    fn decompress_into(&self, block: &[u8], out: &mut Vec<u8>) -> io::Result<()>;

    /// Compress `data` (at most [`BlockCodec::max_block_size`] bytes) into one block appended to
    /// `out`.
    fn compress_into(&self, data: &[u8], out: &mut Vec<u8>) -> io::Result<()>;

    /// Largest uncompressed payload a single output block may carry.
    fn max_block_size(&self) -> usize;

    /// Bytes that terminate a complete output stream.
    fn eof_marker(&self) -> &'static [u8];
}

// ============================================================================
// BGZF
// ============================================================================

/// BGZF codec backed by libdeflate.
pub struct BgzfCodec {
    level: u32,
    decompressors: GrowingFreeList<Decompressor>,
    compressors: GrowingFreeList<Option<BlockCompressor>>,
}

impl BgzfCodec {
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self {
            level,
            decompressors: GrowingFreeList::new(Decompressor::new),
            compressors: GrowingFreeList::new(|| None),
        }
    }

    /// Number of compressor contexts created so far.
    #[must_use]
    pub fn compressor_contexts(&self) -> usize {
        self.compressors.allocated()
    }
}

impl BlockCodec for BgzfCodec {
    fn name(&self) -> &'static str {
        "bgzf"
    }

    fn read_blocks(
        &self,
        reader: &mut dyn Read,
        max_blocks: usize,
        blocks: &mut Vec<Vec<u8>>,
    ) -> io::Result<usize> {
        read_blocks_into(reader, max_blocks, blocks)
    }

    fn decompress_into(&self, block: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        let mut decompressor = self.decompressors.get();
        let result = decompress_into(block, &mut decompressor, out);
        self.decompressors.put(decompressor).map_err(io::Error::other)?;
        result
    }

    fn compress_into(&self, data: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        let mut slot = self.compressors.get();
        if slot.is_none() {
            *slot = Some(BlockCompressor::new(self.level)?);
        }
        let result = match slot.as_mut() {
            Some(compressor) => compressor.compress_block(data, out),
            None => Err(io::Error::other("compressor context missing")),
        };
        self.compressors.put(slot).map_err(io::Error::other)?;
        result
    }

    fn max_block_size(&self) -> usize {
        MAX_BLOCK_SIZE
    }

    fn eof_marker(&self) -> &'static [u8] {
        &BGZF_EOF
    }
}

// ============================================================================
// Plain
// ============================================================================

/// Identity codec for uncompressed text input and output.
///
/// Input is cut into fixed-size units regardless of record boundaries; the parser carries
/// partial records across units.
pub struct PlainCodec {
    unit_size: usize,
}

impl Default for PlainCodec {
    fn default() -> Self {
        Self { unit_size: PLAIN_UNIT_SIZE }
    }
}

impl PlainCodec {
    #[must_use]
    pub fn with_unit_size(unit_size: usize) -> Self {
        Self { unit_size: unit_size.max(1) }
    }
}

impl BlockCodec for PlainCodec {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn read_blocks(
        &self,
        reader: &mut dyn Read,
        max_blocks: usize,
        blocks: &mut Vec<Vec<u8>>,
    ) -> io::Result<usize> {
        let mut spare = std::mem::take(blocks);
        while blocks.len() < max_blocks {
            let mut unit = spare.pop().unwrap_or_default();
            unit.clear();
            let n = (&mut *reader).take(self.unit_size as u64).read_to_end(&mut unit)?;
            if n == 0 {
                break;
            }
            blocks.push(unit);
        }
        Ok(blocks.len())
    }

    fn decompress_into(&self, block: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        out.extend_from_slice(block);
        Ok(())
    }

    fn compress_into(&self, data: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        out.extend_from_slice(data);
        Ok(())
    }

    fn max_block_size(&self) -> usize {
        self.unit_size
    }

    fn eof_marker(&self) -> &'static [u8] {
        &[]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::io::Cursor;

    /// Run-length codec with a 2-byte length frame, used to exercise the codec contract without
    /// depending on deflate output.
    pub(crate) struct MockCodec {
        pub(crate) block_size: usize,
    }

    impl BlockCodec for MockCodec {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn read_blocks(
            &self,
            reader: &mut dyn Read,
            max_blocks: usize,
            blocks: &mut Vec<Vec<u8>>,
        ) -> io::Result<usize> {
            blocks.clear();
            while blocks.len() < max_blocks {
                let mut len = [0u8; 2];
                match reader.read_exact(&mut len) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e),
                }
                let mut block = vec![0u8; u16::from_le_bytes(len) as usize];
                reader.read_exact(&mut block)?;
                blocks.push(block);
            }
            Ok(blocks.len())
        }

        fn decompress_into(&self, block: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
            for pair in block.chunks(2) {
                let &[count, byte] = pair else {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "odd run length"));
                };
                out.extend(std::iter::repeat_n(byte, count as usize));
            }
            Ok(())
        }

        fn compress_into(&self, data: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
            let mut body = Vec::new();
            let mut iter = data.iter().peekable();
            while let Some(&byte) = iter.next() {
                let mut count = 1u8;
                while count < u8::MAX && iter.peek() == Some(&&byte) {
                    iter.next();
                    count += 1;
                }
                body.extend_from_slice(&[count, byte]);
            }
            out.extend_from_slice(&(body.len() as u16).to_le_bytes());
            out.extend_from_slice(&body);
            Ok(())
        }

        fn max_block_size(&self) -> usize {
            self.block_size
        }

        fn eof_marker(&self) -> &'static [u8] {
            &[]
        }
    }

    fn round_trip(codec: &dyn BlockCodec, data: &[u8]) -> Vec<u8> {
        let mut stream = Vec::new();
        for chunk in data.chunks(codec.max_block_size()) {
            codec.compress_into(chunk, &mut stream).unwrap();
        }
        stream.extend_from_slice(codec.eof_marker());

        let mut reader = Cursor::new(stream);
        let mut blocks = Vec::new();
        let mut out = Vec::new();
        while codec.read_blocks(&mut reader, 3, &mut blocks).unwrap() > 0 {
            for block in &blocks {
                codec.decompress_into(block, &mut out).unwrap();
            }
        }
        out
    }

    #[rstest]
    #[case::bgzf(Box::new(BgzfCodec::new(6)) as Box<dyn BlockCodec>)]
    #[case::plain(Box::new(PlainCodec::with_unit_size(1000)) as Box<dyn BlockCodec>)]
    #[case::mock(Box::new(MockCodec { block_size: 300 }) as Box<dyn BlockCodec>)]
    fn test_codec_round_trip(#[case] codec: Box<dyn BlockCodec>) {
        let data: Vec<u8> = (0..150_000u32).map(|i| (i / 7 % 13) as u8 + b'A').collect();
        assert_eq!(round_trip(codec.as_ref(), &data), data);
    }

    #[test]
    fn test_bgzf_contexts_are_reused() {
        let codec = BgzfCodec::new(1);
        let mut out = Vec::new();
        for _ in 0..5 {
            codec.compress_into(b"ACGT", &mut out).unwrap();
        }
        assert_eq!(codec.compressor_contexts(), 1);
    }

    #[test]
    fn test_bgzf_rejects_corrupt_block() {
        let codec = BgzfCodec::new(6);
        let mut block = Vec::new();
        codec.compress_into(b"hello world", &mut block).unwrap();
        let crc_at = block.len() - 8;
        block[crc_at] ^= 0xff;
        let mut out = Vec::new();
        assert!(codec.decompress_into(&block, &mut out).is_err());
    }

    proptest! {
        #[test]
        fn prop_mock_round_trip(data in proptest::collection::vec(0u8..4, 0..2000)) {
            let codec = MockCodec { block_size: 97 };
            prop_assert_eq!(round_trip(&codec, &data), data);
        }
    }
}
