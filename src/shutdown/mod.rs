use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::SigId;

#[derive(Debug)]
pub enum ShutdownError {
    SignalRegistration(std::io::Error),
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignalRegistration(err) => {
                write!(f, "failed to register shutdown signal handler: {err}")
            }
        }
    }
}

impl std::error::Error for ShutdownError {}

/// Process-wide shutdown flag flipped by SIGINT/SIGTERM. The broker loop
/// checks it between poll iterations instead of being interrupted mid-frame.
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
    signal_ids: Vec<SigId>,
}

impl ShutdownSignal {
    pub fn install() -> Result<Self, ShutdownError> {
        let triggered = Arc::new(AtomicBool::new(false));
        let mut signal_ids = Vec::with_capacity(2);

        for signal in [SIGINT, SIGTERM] {
            let id = signal_hook::flag::register(signal, triggered.clone())
                .map_err(ShutdownError::SignalRegistration)?;
            signal_ids.push(id);
        }

        Ok(Self {
            triggered,
            signal_ids,
        })
    }

    /// A signal that no OS signal will ever flip, for tests and embedding.
    pub fn manual() -> Self {
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            signal_ids: Vec::new(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }
}

impl Drop for ShutdownSignal {
    fn drop(&mut self) {
        for id in self.signal_ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
