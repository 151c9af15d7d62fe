//! Raw BGZF block reading and decompression.
//!
//! Blocks are read without inflating them so that decompression can be fanned out to worker
//! threads. Each block is framed as follows:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ header (18 bytes): 1f 8b 08 04 .. XLEN=6 "BC" 02 00 BSIZE │
//! ├──────────────────────────────────────────────────────────┤
//! │ raw deflate payload                                      │
//! ├──────────────────────────────────────────────────────────┤
//! │ footer (8 bytes): CRC32, ISIZE                           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! `BSIZE` is the total block length minus one.

use libdeflater::Decompressor;
use std::io::{self, Read};

// ============================================================================
// Constants
// ============================================================================

/// Size of the BGZF block header.
pub const BGZF_HEADER_SIZE: usize = 18;

/// Size of the BGZF block footer (CRC32 + ISIZE).
pub const BGZF_FOOTER_SIZE: usize = 8;

/// The empty block that terminates every BGZF file.
pub const BGZF_EOF: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02, 0x00,
    0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

// ============================================================================
// Block view
// ============================================================================

/// A borrowed view over one complete raw BGZF block.
#[derive(Debug, Clone, Copy)]
pub struct RawBlock<'a> {
    data: &'a [u8],
}

impl<'a> RawBlock<'a> {
    /// Wrap raw block bytes (header + payload + footer).
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is shorter than a header plus footer.
    pub fn new(data: &'a [u8]) -> io::Result<Self> {
        if data.len() < BGZF_HEADER_SIZE + BGZF_FOOTER_SIZE {
            return Err(invalid(format!("BGZF block too small: {} bytes", data.len())));
        }
        Ok(Self { data })
    }

    /// Total size of the block on disk.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether this block carries no payload bytes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uncompressed_size() == 0
    }

    /// Whether this is exactly the EOF marker block.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.data == BGZF_EOF
    }

    /// The deflate payload between header and footer.
    #[must_use]
    pub fn payload(&self) -> &'a [u8] {
        &self.data[BGZF_HEADER_SIZE..self.data.len() - BGZF_FOOTER_SIZE]
    }

    /// Uncompressed size recorded in the footer (ISIZE).
    #[must_use]
    pub fn uncompressed_size(&self) -> usize {
        let n = self.data.len();
        u32::from_le_bytes([self.data[n - 4], self.data[n - 3], self.data[n - 2], self.data[n - 1]])
            as usize
    }

    /// CRC32 of the uncompressed data recorded in the footer.
    #[must_use]
    pub fn crc32(&self) -> u32 {
        let n = self.data.len();
        u32::from_le_bytes([self.data[n - 8], self.data[n - 7], self.data[n - 6], self.data[n - 5]])
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

// ============================================================================
// Reading
// ============================================================================

/// Validate an 18-byte BGZF header and return the total block size.
fn block_size_from_header(header: &[u8; BGZF_HEADER_SIZE]) -> io::Result<usize> {
    if header[0] != 0x1f || header[1] != 0x8b {
        return Err(invalid(format!(
            "Invalid BGZF magic: expected 0x1f 0x8b, got 0x{:02x} 0x{:02x}",
            header[0], header[1]
        )));
    }
    if header[2] != 0x08 {
        return Err(invalid(format!(
            "Invalid compression method: expected 0x08, got 0x{:02x}",
            header[2]
        )));
    }
    if header[3] & 0x04 == 0 {
        return Err(invalid("BGZF block missing FEXTRA flag".to_string()));
    }
    if header[12] != b'B' || header[13] != b'C' {
        return Err(invalid(format!(
            "Invalid BGZF subfield ID: expected 'BC', got '{}{}'",
            header[12] as char, header[13] as char
        )));
    }
    let block_size = u16::from_le_bytes([header[16], header[17]]) as usize + 1;
    if block_size < BGZF_HEADER_SIZE + BGZF_FOOTER_SIZE {
        return Err(invalid(format!("BGZF block too small: {block_size} bytes")));
    }
    Ok(block_size)
}

/// Read one raw block into `out`, replacing its contents.
///
/// Returns `Ok(false)` on a clean end of input (no bytes available before the header).
///
/// # Errors
///
/// Returns an error if the header is malformed or the block is truncated.
pub fn read_block_into<R: Read + ?Sized>(reader: &mut R, out: &mut Vec<u8>) -> io::Result<bool> {
    let mut header = [0u8; BGZF_HEADER_SIZE];
    let mut filled = 0;
    while filled < BGZF_HEADER_SIZE {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(invalid(format!("Truncated BGZF header: {filled} bytes"))),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    let block_size = block_size_from_header(&header)?;
    out.clear();
    out.resize(block_size, 0);
    out[..BGZF_HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut out[BGZF_HEADER_SIZE..])?;
    Ok(true)
}

/// Read up to `max_blocks` non-EOF blocks, reusing the buffers already present in `blocks`.
///
/// On return `blocks` holds exactly the blocks read (possibly zero at end of input). EOF marker
/// blocks are skipped.
///
/// # Errors
///
/// Returns an error if any block is malformed or truncated.
pub fn read_blocks_into<R: Read + ?Sized>(
    reader: &mut R,
    max_blocks: usize,
    blocks: &mut Vec<Vec<u8>>,
) -> io::Result<usize> {
    let mut spare: Vec<Vec<u8>> = std::mem::take(blocks);
    let mut read = 0;
    while read < max_blocks {
        let mut buf = spare.pop().unwrap_or_default();
        if !read_block_into(reader, &mut buf)? {
            spare.push(buf);
            break;
        }
        if buf.as_slice() == BGZF_EOF {
            spare.push(buf);
            continue;
        }
        blocks.push(buf);
        read += 1;
    }
    Ok(read)
}

// ============================================================================
// Decompression
// ============================================================================

/// Inflate one raw block, appending the uncompressed bytes to `output`.
///
/// The CRC32 in the footer is verified against the inflated bytes.
///
/// # Errors
///
/// Returns an error if the block is malformed, inflation fails or the CRC does not match.
pub fn decompress_into(
    data: &[u8],
    decompressor: &mut Decompressor,
    output: &mut Vec<u8>,
) -> io::Result<()> {
    let block = RawBlock::new(data)?;
    if block.is_empty() {
        return Ok(());
    }

    let size = block.uncompressed_size();
    let start = output.len();
    output.resize(start + size, 0);
    let written = decompressor
        .deflate_decompress(block.payload(), &mut output[start..])
        .map_err(|e| invalid(format!("BGZF decompression failed: {e:?}")))?;
    if written != size {
        return Err(invalid(format!("BGZF ISIZE mismatch: expected {size}, inflated {written}")));
    }

    let actual = crc32fast::hash(&output[start..]);
    if actual != block.crc32() {
        return Err(invalid(format!(
            "BGZF CRC32 mismatch: expected 0x{:08x}, got 0x{actual:08x}, block_size={}",
            block.crc32(),
            block.len()
        )));
    }
    Ok(())
}
