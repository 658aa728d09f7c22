pub mod pool;

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::events::{
    EventEmitter, EVENT_FRONTEND_ARMED, EVENT_FRONTEND_DISARMED, EVENT_WORKER_LOST,
    EVENT_WORKER_REGISTERED,
};
use crate::logging::Logger;
use crate::shutdown::ShutdownSignal;
use crate::transport::{EndpointConfig, EndpointEvent, RouterEndpoint};
use crate::wire::codec::{CodecError, WireCodec};
use crate::wire::envelope::Envelope;

use pool::{identity_hex, PoolError, WorkerPool};

#[derive(Debug)]
pub enum BrokerError {
    Codec(CodecError),
    Transport(crate::transport::TransportError),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(source) => write!(f, "broker wire codec setup failed: {source}"),
            Self::Transport(source) => write!(f, "broker endpoint setup failed: {source}"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Counters and gauges describing what the broker has done since startup.
/// Snapshots are cheap to clone and serialize; the heartbeat logs them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub idle_workers: usize,
    pub frontend_armed: bool,
    pub pending_requests: usize,
    pub requests_dispatched: u64,
    pub replies_forwarded: u64,
    pub ready_announcements: u64,
    pub undeliverable_dropped: u64,
    pub malformed_dropped: u64,
    pub worker_disconnects: u64,
}

impl BrokerStats {
    pub fn as_payload(&self) -> Value {
        json!({
            "idle_workers": self.idle_workers,
            "frontend_armed": self.frontend_armed,
            "pending_requests": self.pending_requests,
            "requests_dispatched": self.requests_dispatched,
            "replies_forwarded": self.replies_forwarded,
            "ready_announcements": self.ready_announcements,
            "undeliverable_dropped": self.undeliverable_dropped,
            "malformed_dropped": self.malformed_dropped,
            "worker_disconnects": self.worker_disconnects,
        })
    }
}

/// Shared read handle onto the broker's stats, safe to hand to the heartbeat
/// thread while the broker loop keeps the write side.
#[derive(Clone, Default)]
pub struct StatsHandle {
    inner: Arc<Mutex<BrokerStats>>,
}

impl StatsHandle {
    pub fn snapshot(&self) -> BrokerStats {
        self.inner
            .lock()
            .expect("broker stats lock poisoned")
            .clone()
    }

    pub fn as_payload(&self) -> Value {
        self.snapshot().as_payload()
    }

    fn update<F: FnOnce(&mut BrokerStats)>(&self, apply: F) {
        let mut stats = self.inner.lock().expect("broker stats lock poisoned");
        apply(&mut stats);
    }
}

/// The load-balancing core: one frontend endpoint for clients, one backend
/// endpoint for workers, and a queue of idle workers ordered by how long they
/// have been waiting. Each client request goes to the longest-idle worker;
/// each worker message re-pools its sender before anything else happens.
///
/// The frontend is only polled while at least one worker is idle. Client
/// requests that arrived in the same cycle a pool drained stay in
/// `pending_requests` and dispatch as soon as a worker returns.
pub struct Broker {
    frontend: RouterEndpoint,
    backend: RouterEndpoint,
    pool: WorkerPool,
    pending_requests: VecDeque<Envelope>,
    armed: bool,
    poll_interval: Duration,
    stats: StatsHandle,
    emitter: Option<Arc<EventEmitter>>,
}

impl Broker {
    pub fn bind(config: &AppConfig) -> Result<Self, BrokerError> {
        let codec = WireCodec::from_app_config(config).map_err(BrokerError::Codec)?;
        let frontend = RouterEndpoint::bind(
            "frontend",
            &EndpointConfig::from(config.frontend.clone()),
            codec,
        )
        .map_err(BrokerError::Transport)?;
        let backend = RouterEndpoint::bind(
            "backend",
            &EndpointConfig::from(config.backend.clone()),
            codec,
        )
        .map_err(BrokerError::Transport)?;

        Ok(Self {
            frontend,
            backend,
            pool: WorkerPool::new(),
            pending_requests: VecDeque::new(),
            armed: false,
            poll_interval: Duration::from_millis(config.broker.poll_interval_ms),
            stats: StatsHandle::default(),
            emitter: None,
        })
    }

    /// Attaches an emitter for lifecycle events (worker registered/lost,
    /// frontend armed/disarmed). Without one those transitions only log.
    pub fn set_emitter(&mut self, emitter: Arc<EventEmitter>) {
        self.emitter = Some(emitter);
    }

    pub fn stats_handle(&self) -> StatsHandle {
        self.stats.clone()
    }

    pub fn local_frontend_addr(&self) -> io::Result<SocketAddr> {
        self.frontend.local_addr()
    }

    pub fn local_backend_addr(&self) -> io::Result<SocketAddr> {
        self.backend.local_addr()
    }

    pub fn idle_worker_count(&self) -> usize {
        self.pool.len()
    }

    pub fn is_frontend_armed(&self) -> bool {
        self.armed
    }

    /// Runs the poll loop until the shutdown signal fires, then closes every
    /// connection. Sleeps only when a full cycle made no progress.
    pub fn run(&mut self, logger: &Logger, shutdown: &ShutdownSignal) {
        logger.info(
            Some("broker"),
            "broker loop started; frontend disarmed until a worker announces readiness",
        );

        while !shutdown.is_triggered() {
            let progressed = self.run_once(logger);
            if !progressed {
                thread::sleep(self.poll_interval);
            }
        }

        logger.info(Some("broker"), "shutdown signal received, closing endpoints");
        self.frontend.shutdown_all();
        self.backend.shutdown_all();
    }

    /// One poll cycle: drain the backend, drain the frontend if armed,
    /// dispatch whatever can be paired with an idle worker, re-derive the
    /// arming state. Returns whether anything happened.
    pub fn run_once(&mut self, logger: &Logger) -> bool {
        let mut progressed = false;

        if self.backend.accept_pending(logger) > 0 {
            progressed = true;
        }
        for event in self.backend.poll_events(logger) {
            progressed = true;
            self.on_backend_event(event, logger);
        }

        // The frontend stays untouched while no worker is idle; requests
        // queue in the kernel and clients feel the backpressure.
        if self.armed {
            if self.frontend.accept_pending(logger) > 0 {
                progressed = true;
            }
            // Admit at most as many requests as there are workers to take
            // them; anything beyond that stays unread in the sockets.
            let capacity = self.pool.len().saturating_sub(self.pending_requests.len());
            if capacity > 0 {
                for event in self.frontend.poll_events_with_budget(logger, capacity) {
                    progressed = true;
                    self.on_frontend_event(event, logger);
                }
            }
        }

        if self.dispatch_pending(logger) > 0 {
            progressed = true;
        }
        self.refresh_arming(logger);
        self.publish_gauges();

        progressed
    }

    fn on_backend_event(&mut self, event: EndpointEvent, logger: &Logger) {
        match event {
            EndpointEvent::PeerDisconnected { identity } => {
                let was_idle = self.pool.remove(&identity);
                self.stats.update(|stats| stats.worker_disconnects += 1);
                logger.log(
                    crate::logging::LogLevel::Info,
                    Some("broker"),
                    "worker disconnected",
                    Some(json!({
                        "worker": identity_hex(&identity),
                        "was_idle": was_idle,
                        "idle_workers": self.pool.len(),
                    })),
                );
                self.emit_lifecycle(
                    EVENT_WORKER_LOST,
                    json!({"worker": identity_hex(&identity), "idle_workers": self.pool.len()}),
                    logger,
                );
            }
            EndpointEvent::Message(mut envelope) => {
                let Ok(worker) = envelope.unwrap_address() else {
                    self.stats.update(|stats| stats.malformed_dropped += 1);
                    logger.warn(Some("broker"), "backend envelope carried no sender address");
                    return;
                };

                // Whatever a worker sends, it is idle again afterwards and
                // joins the tail of the queue.
                match self.pool.push_back(worker.clone()) {
                    Ok(()) => {
                        logger.log(
                            crate::logging::LogLevel::Debug,
                            Some("broker"),
                            "worker joined idle pool",
                            Some(json!({
                                "worker": identity_hex(&worker),
                                "idle_workers": self.pool.len(),
                            })),
                        );
                        self.emit_lifecycle(
                            EVENT_WORKER_REGISTERED,
                            json!({
                                "worker": identity_hex(&worker),
                                "idle_workers": self.pool.len(),
                            }),
                            logger,
                        );
                    }
                    Err(PoolError::DuplicateWorker { identity }) => {
                        // An already-idle worker spoke again without getting
                        // work; its queue position is preserved.
                        logger.warn(
                            Some("broker"),
                            &format!("ignoring duplicate readiness from idle worker {identity}"),
                        );
                    }
                    Err(PoolError::PoolEmpty) => {
                        unreachable!("push_back never reports an empty pool")
                    }
                }

                if envelope.leads_with_ready_signal() {
                    // Readiness control byte, reserved for the broker.
                    self.stats.update(|stats| stats.ready_announcements += 1);
                } else if envelope.is_empty() {
                    self.stats.update(|stats| stats.malformed_dropped += 1);
                    logger.warn(
                        Some("broker"),
                        &format!(
                            "worker {} sent an empty message, dropping it",
                            identity_hex(&worker)
                        ),
                    );
                } else {
                    self.forward_reply(envelope, &worker, logger);
                }
            }
        }
    }

    fn on_frontend_event(&mut self, event: EndpointEvent, logger: &Logger) {
        match event {
            EndpointEvent::PeerDisconnected { identity } => {
                logger.debug(
                    Some("broker"),
                    &format!("client {} disconnected", identity_hex(&identity)),
                );
            }
            EndpointEvent::Message(envelope) => {
                self.pending_requests.push_back(envelope);
            }
        }
    }

    /// Pairs queued requests with idle workers, oldest request to
    /// longest-idle worker, until one side runs out.
    fn dispatch_pending(&mut self, logger: &Logger) -> usize {
        let mut dispatched = 0;

        while !self.pending_requests.is_empty() && !self.pool.is_empty() {
            let mut request = self
                .pending_requests
                .pop_front()
                .expect("pending request queue drained mid-dispatch");
            let worker = self
                .pool
                .pop_front()
                .expect("worker pool drained while frontend armed");

            request.wrap(worker.clone());
            match self.backend.send(request) {
                Ok(()) => {
                    dispatched += 1;
                    self.stats.update(|stats| stats.requests_dispatched += 1);
                    logger.log(
                        crate::logging::LogLevel::Debug,
                        Some("broker"),
                        "request dispatched",
                        Some(json!({
                            "worker": identity_hex(&worker),
                            "idle_workers": self.pool.len(),
                        })),
                    );
                }
                Err(error) => {
                    // The worker vanished between re-pooling and dispatch;
                    // the request goes the way every undeliverable message
                    // does here.
                    self.stats.update(|stats| stats.undeliverable_dropped += 1);
                    logger.warn(
                        Some("broker"),
                        &format!(
                            "dropping request for vanished worker {}: {error}",
                            identity_hex(&worker)
                        ),
                    );
                }
            }
        }

        dispatched
    }

    fn forward_reply(&mut self, envelope: Envelope, worker: &[u8], logger: &Logger) {
        match self.frontend.send(envelope) {
            Ok(()) => {
                self.stats.update(|stats| stats.replies_forwarded += 1);
                logger.trace(
                    Some("broker"),
                    &format!("reply from worker {} forwarded", identity_hex(worker)),
                );
            }
            Err(error) => {
                // The client is gone or the envelope lost its address; the
                // reply is dropped and the worker stays pooled.
                self.stats.update(|stats| stats.undeliverable_dropped += 1);
                logger.debug(
                    Some("broker"),
                    &format!(
                        "dropping undeliverable reply from worker {}: {error}",
                        identity_hex(worker)
                    ),
                );
            }
        }
    }

    fn refresh_arming(&mut self, logger: &Logger) {
        let should_arm = !self.pool.is_empty();
        if should_arm == self.armed {
            return;
        }

        self.armed = should_arm;
        if should_arm {
            logger.log(
                crate::logging::LogLevel::Info,
                Some("broker"),
                "frontend armed",
                Some(json!({"idle_workers": self.pool.len()})),
            );
            self.emit_lifecycle(
                EVENT_FRONTEND_ARMED,
                json!({"idle_workers": self.pool.len()}),
                logger,
            );
        } else {
            logger.log(
                crate::logging::LogLevel::Info,
                Some("broker"),
                "frontend disarmed",
                Some(json!({"pending_requests": self.pending_requests.len()})),
            );
            self.emit_lifecycle(
                EVENT_FRONTEND_DISARMED,
                json!({"pending_requests": self.pending_requests.len()}),
                logger,
            );
        }
    }

    fn publish_gauges(&self) {
        let idle_workers = self.pool.len();
        let frontend_armed = self.armed;
        let pending_requests = self.pending_requests.len();
        self.stats.update(|stats| {
            stats.idle_workers = idle_workers;
            stats.frontend_armed = frontend_armed;
            stats.pending_requests = pending_requests;
        });
    }

    fn emit_lifecycle(&self, event_name: &'static str, payload: Value, logger: &Logger) {
        let Some(emitter) = &self.emitter else {
            return;
        };
        if let Err(error) = emitter.emit(event_name, Some(payload)) {
            logger.warn(
                Some("broker"),
                &format!("lifecycle listener rejected '{event_name}': {error}"),
            );
        }
    }
}
