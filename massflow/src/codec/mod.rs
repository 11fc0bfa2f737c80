//! Wire codec for stage payloads.
//!
//! A message is the payload serialized as JSON inside a versioned envelope,
//! then LZ4 compressed with the uncompressed size prepended:
//!
//! ```text
//! lz4( {"version": 1, "payload": {"kind": "...", ...}} )
//! ```
//!
//! The prepended size is a little-endian `u32` and may not exceed
//! [`MAX_MESSAGE_BYTES`].

pub mod base64_serde;

use crate::errors::CodecError;
use crate::payload::StagePayload;
use crate::transport::Message;
use serde::{Deserialize, Serialize};

/// Version of the wire envelope written by this build.
pub const WIRE_VERSION: u16 = 1;

/// Largest uncompressed message body accepted in either direction.
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024 * 1024;

const SIZE_PREFIX_BYTES: usize = 4;

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    version: u16,
    payload: &'a StagePayload,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    version: u16,
    payload: serde_json::Value,
}

/// Size figures of one encoded message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CodecMetrics {
    /// Size of the JSON envelope in bytes.
    pub json_bytes: usize,
    /// Size of the compressed message in bytes.
    pub compressed_bytes: usize,
    /// Reduction in bytes.
    pub reduction_bytes: usize,
    /// Compression ratio (compressed/json).
    pub ratio: f64,
}

impl CodecMetrics {
    /// Creates new metrics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(json_bytes: usize, compressed_bytes: usize) -> Self {
        let ratio = if json_bytes == 0 {
            1.0
        } else {
            compressed_bytes as f64 / json_bytes as f64
        };

        Self {
            json_bytes,
            compressed_bytes,
            reduction_bytes: json_bytes.saturating_sub(compressed_bytes),
            ratio,
        }
    }
}

/// Encodes a payload into a wire message.
pub fn encode(payload: &StagePayload) -> Result<Message, CodecError> {
    encode_with_metrics(payload).map(|(message, _)| message)
}

/// Encodes a payload and reports how well it compressed.
pub fn encode_with_metrics(payload: &StagePayload) -> Result<(Message, CodecMetrics), CodecError> {
    let json = serde_json::to_vec(&OutgoingEnvelope {
        version: WIRE_VERSION,
        payload,
    })
    .map_err(CodecError::Encode)?;
    if json.len() > MAX_MESSAGE_BYTES {
        return Err(CodecError::TooLarge {
            declared: json.len(),
            limit: MAX_MESSAGE_BYTES,
        });
    }

    let message = lz4_flex::compress_prepend_size(&json);
    let metrics = CodecMetrics::new(json.len(), message.len());
    Ok((message, metrics))
}

/// Decodes a wire message into a payload.
///
/// Messages written with another envelope version are rejected before the
/// payload itself is looked at.
pub fn decode(message: &[u8]) -> Result<StagePayload, CodecError> {
    let declared = declared_size(message)?;
    if declared > MAX_MESSAGE_BYTES {
        return Err(CodecError::TooLarge {
            declared,
            limit: MAX_MESSAGE_BYTES,
        });
    }

    let json = lz4_flex::decompress_size_prepended(message)
        .map_err(|e| CodecError::Decompress(e.to_string()))?;

    let envelope: IncomingEnvelope = serde_json::from_slice(&json).map_err(CodecError::Decode)?;
    if envelope.version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion {
            expected: WIRE_VERSION,
            found: envelope.version,
        });
    }

    serde_json::from_value(envelope.payload).map_err(CodecError::Decode)
}

fn declared_size(message: &[u8]) -> Result<usize, CodecError> {
    let prefix: [u8; SIZE_PREFIX_BYTES] = message
        .get(..SIZE_PREFIX_BYTES)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| CodecError::Decompress("message shorter than its size prefix".to_string()))?;
    usize::try_from(u32::from_le_bytes(prefix))
        .map_err(|e| CodecError::Decompress(e.to_string()))
}
