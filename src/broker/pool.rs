use std::collections::VecDeque;
use std::fmt;

/// Opaque routing token issued by the transport when a worker connects.
pub type WorkerIdentity = Vec<u8>;

#[derive(Debug, PartialEq, Eq)]
pub enum PoolError {
    DuplicateWorker { identity: String },
    PoolEmpty,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateWorker { identity } => {
                write!(f, "worker {identity} is already pooled as idle")
            }
            Self::PoolEmpty => write!(f, "cannot pop a worker from an empty pool"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Queue of currently idle worker identities, ordered by recency: the head
/// is the worker that has been idle longest and is dispatched next, new
/// arrivals join at the tail. Owned exclusively by the broker loop.
#[derive(Debug, Default)]
pub struct WorkerPool {
    idle: VecDeque<WorkerIdentity>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a newly idle worker at the tail. A worker already pooled is
    /// reported as `DuplicateWorker`; the broker treats that as a benign
    /// re-announcement and ignores it.
    pub fn push_back(&mut self, identity: WorkerIdentity) -> Result<(), PoolError> {
        if self.idle.contains(&identity) {
            return Err(PoolError::DuplicateWorker {
                identity: identity_hex(&identity),
            });
        }

        self.idle.push_back(identity);
        Ok(())
    }

    /// Removes and returns the least-recently-idle worker. The broker's
    /// arm/disarm gating must prevent calls on an empty pool; `PoolEmpty`
    /// here means that invariant was broken.
    pub fn pop_front(&mut self) -> Result<WorkerIdentity, PoolError> {
        self.idle.pop_front().ok_or(PoolError::PoolEmpty)
    }

    /// Removes a specific worker (detected-dead connection). No-op when the
    /// worker is not pooled, which is the common case for a worker that
    /// disconnects mid-request.
    pub fn remove(&mut self, identity: &[u8]) -> bool {
        let before = self.idle.len();
        self.idle.retain(|pooled| pooled != identity);
        self.idle.len() != before
    }

    pub fn len(&self) -> usize {
        self.idle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idle.is_empty()
    }
}

/// Compact hex rendering of an opaque routing identity for log lines.
pub fn identity_hex(identity: &[u8]) -> String {
    let mut rendered = String::with_capacity(identity.len() * 2);
    for byte in identity {
        rendered.push_str(&format!("{byte:02x}"));
    }
    rendered
}
