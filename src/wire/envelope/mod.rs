use std::fmt;

use crate::wire::codec::MessageSegments;

/// Reserved single-byte payload a worker sends right after connecting to
/// announce it is idle. Never forwarded to a client.
pub const READY_SIGNAL: &[u8] = &[0x01];

#[derive(Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    MissingAddress,
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingAddress => {
                write!(f, "envelope has no leading address segment to unwrap")
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// A routed message: a stack of opaque routing addresses followed by payload
/// segments. Each hop pushes the sender address on receipt and pops the
/// destination address on send, so the addresses carried in the envelope are
/// the only routing state anywhere in the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    segments: MessageSegments,
}

impl Envelope {
    pub fn from_segments(segments: MessageSegments) -> Self {
        Self { segments }
    }

    pub fn into_segments(self) -> MessageSegments {
        self.segments
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Prepends `address` as the new leading segment. Inverse of
    /// [`unwrap_address`](Self::unwrap_address): wrapping an unwrapped
    /// envelope with the unwrapped address restores it byte-for-byte.
    pub fn wrap(&mut self, address: Vec<u8>) {
        self.segments.insert(0, address);
    }

    /// Pops and returns the leading address segment.
    pub fn unwrap_address(&mut self) -> Result<Vec<u8>, EnvelopeError> {
        if self.segments.is_empty() {
            return Err(EnvelopeError::MissingAddress);
        }

        Ok(self.segments.remove(0))
    }

    pub fn first_segment(&self) -> Option<&[u8]> {
        self.segments.first().map(Vec::as_slice)
    }

    /// True when the leading segment is the reserved readiness announcement.
    pub fn leads_with_ready_signal(&self) -> bool {
        self.first_segment() == Some(READY_SIGNAL)
    }
}
