use std::fmt;
use std::io::Cursor;

use rmpv::Value;

use crate::config;

pub const DEFAULT_MAX_ENVELOPE_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

/// An envelope on the wire: an ordered sequence of opaque byte segments.
/// The codec serializes it as a MessagePack array of binary values behind
/// a 4-byte big-endian length header.
pub type MessageSegments = Vec<Vec<u8>>;

#[derive(Debug)]
pub enum CodecError {
    PayloadTooLarge { size: usize, limit: usize },
    FrameTooShort { size: usize },
    FrameLengthMismatch { declared: usize, actual_payload: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    TrailingDataInPayload,
    EnvelopeMustBeArray,
    SegmentMustBeBinary,
    EmptyEnvelope,
    InvalidSizeLimit { configured: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::FrameTooShort { size } => {
                write!(f, "frame size {size} is smaller than 4-byte header")
            }
            Self::FrameLengthMismatch {
                declared,
                actual_payload,
            } => write!(
                f,
                "frame length mismatch: declared {declared} bytes, actual payload {actual_payload} bytes"
            ),
            Self::ProtocolZeroLength => {
                write!(f, "protocol error: frame length cannot be zero")
            }
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingDataInPayload => write!(f, "payload contains trailing MessagePack data"),
            Self::EnvelopeMustBeArray => write!(f, "wire envelope must be an array of segments"),
            Self::SegmentMustBeBinary => write!(f, "envelope segments must be binary values"),
            Self::EmptyEnvelope => write!(f, "wire envelope must carry at least one segment"),
            Self::InvalidSizeLimit { configured } => write!(
                f,
                "wire.max_envelope_size_bytes must be between {FRAME_HEADER_SIZE_BYTES} and {}, got {configured}",
                u32::MAX
            ),
        }
    }
}

impl std::error::Error for CodecError {}

#[derive(Clone, Copy, Debug)]
pub struct WireCodec {
    max_envelope_size_bytes: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self {
            max_envelope_size_bytes: DEFAULT_MAX_ENVELOPE_SIZE_BYTES,
        }
    }
}

impl WireCodec {
    /// The limit must also fit the 4-byte length header, or encoded frame
    /// lengths would silently truncate.
    pub fn new(max_envelope_size_bytes: usize) -> Result<Self, CodecError> {
        if max_envelope_size_bytes < FRAME_HEADER_SIZE_BYTES
            || max_envelope_size_bytes > u32::MAX as usize
        {
            return Err(CodecError::InvalidSizeLimit {
                configured: max_envelope_size_bytes,
            });
        }

        Ok(Self {
            max_envelope_size_bytes,
        })
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, CodecError> {
        Self::new(app_config.wire.max_envelope_size_bytes)
    }

    pub fn encode_frame(&self, segments: &[Vec<u8>]) -> Result<Vec<u8>, CodecError> {
        let payload = self.encode_payload(segments)?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
        let len = payload.len() as u32;
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode_frame(&self, frame: &[u8]) -> Result<MessageSegments, CodecError> {
        if frame.len() < FRAME_HEADER_SIZE_BYTES {
            return Err(CodecError::FrameTooShort { size: frame.len() });
        }

        let declared_len =
            u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if declared_len == 0 {
            return Err(CodecError::ProtocolZeroLength);
        }
        if declared_len > self.max_envelope_size_bytes {
            return Err(CodecError::ProtocolLengthTooLarge {
                length: declared_len,
                limit: self.max_envelope_size_bytes,
            });
        }

        let payload = &frame[FRAME_HEADER_SIZE_BYTES..];
        if payload.len() != declared_len {
            return Err(CodecError::FrameLengthMismatch {
                declared: declared_len,
                actual_payload: payload.len(),
            });
        }

        self.decode_payload(payload)
    }

    /// Incremental variant of `decode_frame` for per-connection receive
    /// buffers: consumes and decodes exactly one complete frame from the
    /// front of `buffer`, or leaves the buffer untouched when the frame is
    /// still partial.
    pub fn take_frame(&self, buffer: &mut Vec<u8>) -> Result<Option<MessageSegments>, CodecError> {
        if buffer.len() < FRAME_HEADER_SIZE_BYTES {
            return Ok(None);
        }

        let declared_len =
            u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if declared_len == 0 {
            return Err(CodecError::ProtocolZeroLength);
        }
        if declared_len > self.max_envelope_size_bytes {
            return Err(CodecError::ProtocolLengthTooLarge {
                length: declared_len,
                limit: self.max_envelope_size_bytes,
            });
        }

        let full_len = FRAME_HEADER_SIZE_BYTES + declared_len;
        if buffer.len() < full_len {
            return Ok(None);
        }

        let rest = buffer.split_off(full_len);
        let frame = std::mem::replace(buffer, rest);
        self.decode_payload(&frame[FRAME_HEADER_SIZE_BYTES..])
            .map(Some)
    }

    pub fn encode_payload(&self, segments: &[Vec<u8>]) -> Result<Vec<u8>, CodecError> {
        if segments.is_empty() {
            return Err(CodecError::EmptyEnvelope);
        }

        let value = Value::Array(
            segments
                .iter()
                .map(|segment| Value::Binary(segment.clone()))
                .collect(),
        );

        let mut encoded = Vec::new();
        rmpv::encode::write_value(&mut encoded, &value).map_err(CodecError::MessagePackEncode)?;

        if encoded.len() > self.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: encoded.len(),
                limit: self.max_envelope_size_bytes,
            });
        }

        Ok(encoded)
    }

    pub fn decode_payload(&self, payload: &[u8]) -> Result<MessageSegments, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }
        if payload.len() > self.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_envelope_size_bytes,
            });
        }

        let mut cursor = Cursor::new(payload);
        let value = rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
        if cursor.position() as usize != payload.len() {
            return Err(CodecError::TrailingDataInPayload);
        }

        parse_segments(value)
    }
}

fn parse_segments(value: Value) -> Result<MessageSegments, CodecError> {
    let Value::Array(items) = value else {
        return Err(CodecError::EnvelopeMustBeArray);
    };

    if items.is_empty() {
        return Err(CodecError::EmptyEnvelope);
    }

    let mut segments = MessageSegments::with_capacity(items.len());
    for item in items {
        let Value::Binary(bytes) = item else {
            return Err(CodecError::SegmentMustBeBinary);
        };
        segments.push(bytes);
    }

    Ok(segments)
}
