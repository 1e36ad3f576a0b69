//! zlib-stream inflation
//!
//! The gateway compresses the whole connection as one zlib stream. Each
//! logical message ends with a sync flush, so a message is complete once the
//! accumulated frames end with [`ZLIB_SUFFIX`]. The dictionary carries across
//! messages, which is why an `Inflater` lives exactly as long as one connection.

use super::DecodeError;
use flate2::{Decompress, FlushDecompress, Status};

/// Marker that terminates every complete compressed message.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Largest compressed or inflated message accepted before the stream is
/// declared corrupt.
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const CHUNK: usize = 32 * 1024;

pub struct Inflater {
    decompress: Decompress,
    compressed: Vec<u8>,
    output: Vec<u8>,
    limit: usize,
}

impl Inflater {
    pub fn new() -> Self {
        Self::with_limit(MAX_MESSAGE_SIZE)
    }

    /// `limit` bounds both the buffered compressed bytes and the inflated message.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            decompress: Decompress::new(true),
            compressed: Vec::new(),
            output: Vec::with_capacity(CHUNK),
            limit,
        }
    }

    /// Feeds one binary frame. Returns the inflated message once the suffix
    /// has been seen, `None` while more frames are needed.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, DecodeError> {
        self.compressed.extend_from_slice(frame);
        if self.compressed.len() > self.limit {
            self.compressed = Vec::new();
            return Err(DecodeError::TooLarge { limit: self.limit });
        }
        if !self.compressed.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        self.output.clear();
        let result = self.inflate_buffered();
        self.compressed.clear();
        result?;

        Ok(Some(std::mem::take(&mut self.output)))
    }

    fn inflate_buffered(&mut self) -> Result<(), DecodeError> {
        let mut offset = 0;
        loop {
            if self.output.capacity() - self.output.len() < CHUNK {
                self.output.reserve(CHUNK);
            }

            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self.decompress.decompress_vec(
                &self.compressed[offset..],
                &mut self.output,
                FlushDecompress::Sync,
            )?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = self.decompress.total_out() - before_out;
            offset += consumed;

            if self.output.len() > self.limit {
                return Err(DecodeError::TooLarge { limit: self.limit });
            }

            let input_done = offset >= self.compressed.len();
            let output_full = self.output.len() == self.output.capacity();
            if status == Status::StreamEnd || (input_done && !output_full) {
                return Ok(());
            }
            if consumed == 0 && produced == 0 && !output_full {
                return Ok(());
            }
        }
    }

    /// Bytes waiting for the rest of their message.
    pub fn buffered(&self) -> usize {
        self.compressed.len()
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}
