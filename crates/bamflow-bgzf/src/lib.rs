#![deny(unsafe_code)]

//! BGZF block I/O for the bamflow engine.
//!
//! - [`reader`] - raw block framing, batch reading and CRC-checked decompression
//! - [`writer`] - single-block compression for the writeback pipeline

pub mod reader;
pub mod writer;

pub use reader::{
    BGZF_EOF, BGZF_FOOTER_SIZE, BGZF_HEADER_SIZE, RawBlock, decompress_into, read_block_into,
    read_blocks_into,
};
pub use writer::{BlockCompressor, MAX_BLOCK_SIZE};
