//! Stream framer splitting socket bytes into frames.
//!
//! [`FrameCodec`] is a [`Decoder`] for [`tokio_util::codec::FramedRead`].
//! Bytes after the last delimiter stay in the read buffer until the next
//! chunk arrives, so read boundaries never need to line up with frames.
//!
//! A frame that fails to decode is yielded as `Some(Err(..))` inside the
//! item rather than as a stream error: `FramedRead` terminates after a
//! decoder error, and one corrupt frame must not end the connection.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::codec::{decode_frame, FRAME_DELIMITER};
use super::Frame;
use crate::{AppError, Result};

/// Largest encoded frame accepted before the framer starts discarding: 16 MiB.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Outcome of framing one delimited chunk.
pub type Decoded = Result<Frame>;

/// Delimiter-based frame splitter.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    /// Offset already scanned for a delimiter.
    next_index: usize,
    /// Set while dropping the tail of an oversized frame.
    discarding: bool,
}

impl FrameCodec {
    /// Framer with the default [`MAX_FRAME_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_bytes(MAX_FRAME_BYTES)
    }

    /// Framer with a custom size limit.
    #[must_use]
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            if self.discarding {
                match src.iter().position(|&b| b == FRAME_DELIMITER) {
                    Some(end) => {
                        src.advance(end + 1);
                        self.discarding = false;
                        self.next_index = 0;
                        continue;
                    }
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            let scan_to = src.len().min(self.max_frame_bytes.saturating_add(1));
            let found = src[self.next_index.min(scan_to)..scan_to]
                .iter()
                .position(|&b| b == FRAME_DELIMITER)
                .map(|offset| offset + self.next_index.min(scan_to));

            match found {
                Some(end) => {
                    self.next_index = 0;
                    let chunk = src.split_to(end + 1);
                    if chunk[..end].trim_ascii().is_empty() {
                        continue;
                    }
                    return Ok(Some(decode_frame(&chunk[..end])));
                }
                None if src.len() > self.max_frame_bytes => {
                    self.discarding = true;
                    self.next_index = 0;
                    return Ok(Some(Err(AppError::Decode(format!(
                        "frame too long: exceeded {} bytes",
                        self.max_frame_bytes
                    )))));
                }
                None => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if self.discarding || src.trim_ascii().is_empty() {
            src.clear();
            return Ok(None);
        }
        let tail = src.split();
        self.next_index = 0;
        Ok(Some(Err(AppError::Decode(format!(
            "stream ended inside a frame ({} bytes pending)",
            tail.len()
        )))))
    }
}
