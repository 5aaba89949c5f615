//! Byte encoding for a single frame.
//!
//! A frame travels as `base64(version || gzip(json(record))) ++ '\n'`. The
//! base64 alphabet never contains [`FRAME_DELIMITER`], so frames can be split
//! on it without escaping.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::Frame;
use crate::{AppError, Result};

/// Byte terminating every encoded frame.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Version marker prefixed to every compressed payload.
pub const WIRE_VERSION: u8 = 1;

/// Largest decompressed record accepted by [`decode_frame`]: 64 MiB.
pub const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

/// Encode `frame` into delimited wire bytes.
///
/// # Errors
///
/// Returns [`AppError::Decode`] if the record cannot be serialized or
/// compressed.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let record = frame
        .to_record()
        .map_err(|err| AppError::Decode(format!("failed to serialize record: {err}")))?;
    let json = serde_json::to_vec(&record)
        .map_err(|err| AppError::Decode(format!("failed to serialize record: {err}")))?;

    let mut compressed = Vec::with_capacity(json.len() / 2 + 16);
    compressed.push(WIRE_VERSION);
    {
        let mut encoder = GzEncoder::new(&mut compressed, Compression::fast());
        encoder
            .write_all(&json)
            .map_err(|err| AppError::Decode(format!("compression failed: {err}")))?;
        encoder
            .finish()
            .map_err(|err| AppError::Decode(format!("compression failed: {err}")))?;
    }

    let mut encoded = STANDARD.encode(&compressed).into_bytes();
    encoded.push(FRAME_DELIMITER);
    Ok(encoded)
}

/// Decode one frame. A trailing delimiter and surrounding whitespace are
/// ignored.
///
/// # Errors
///
/// Returns [`AppError::Decode`] for any malformed input; never panics.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    let trimmed = bytes.trim_ascii();
    if trimmed.is_empty() {
        return Err(AppError::Decode("empty frame".into()));
    }

    let compressed = STANDARD
        .decode(trimmed)
        .map_err(|err| AppError::Decode(format!("invalid base64: {err}")))?;

    let Some((&version, body)) = compressed.split_first() else {
        return Err(AppError::Decode("missing wire version".into()));
    };
    if version != WIRE_VERSION {
        return Err(AppError::Decode(format!(
            "unsupported wire version {version} (expected {WIRE_VERSION})"
        )));
    }

    let mut json = Vec::new();
    GzDecoder::new(body)
        .take(MAX_RECORD_BYTES as u64 + 1)
        .read_to_end(&mut json)
        .map_err(|err| AppError::Decode(format!("decompression failed: {err}")))?;
    if json.len() > MAX_RECORD_BYTES {
        return Err(AppError::Decode(format!(
            "record exceeds {MAX_RECORD_BYTES} bytes"
        )));
    }

    let record: serde_json::Value = serde_json::from_slice(&json)
        .map_err(|err| AppError::Decode(format!("malformed json: {err}")))?;
    Frame::from_record(record).map_err(AppError::Decode)
}
