use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use crate::broker::pool::identity_hex;
use crate::config;
use crate::logging::Logger;
use crate::wire::codec::{CodecError, WireCodec};
use crate::wire::envelope::Envelope;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_FRONTEND_PORT: u16 = 9870;
pub const DEFAULT_BACKEND_PORT: u16 = 9871;

const READ_CHUNK_SIZE_BYTES: usize = 64 * 1024;
const WRITE_RETRY_LIMIT: u32 = 200;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
}

impl From<config::ListenerConfig> for EndpointConfig {
    fn from(value: config::ListenerConfig) -> Self {
        Self {
            host: value.host,
            port: value.port,
        }
    }
}

#[derive(Debug)]
pub enum TransportError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        source: io::Error,
    },
    Encode(CodecError),
    EnvelopeMissingRoute,
    InvalidRouteAddress {
        length: usize,
    },
    UnknownRoute {
        identity: String,
    },
    Write {
        identity: String,
        source: io::Error,
    },
    WriteStalled {
        identity: String,
    },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP listener on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP listener to non-blocking mode: {source}")
            }
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::Encode(source) => write!(f, "failed to encode outbound frame: {source}"),
            Self::EnvelopeMissingRoute => {
                write!(f, "outbound envelope carries no leading route address")
            }
            Self::InvalidRouteAddress { length } => write!(
                f,
                "outbound route address must be a 16-byte identity, got {length} bytes"
            ),
            Self::UnknownRoute { identity } => {
                write!(f, "no live connection for route address {identity}")
            }
            Self::Write { identity, source } => {
                write!(f, "failed to write frame to connection {identity}: {source}")
            }
            Self::WriteStalled { identity } => write!(
                f,
                "write to connection {identity} stalled beyond retry budget"
            ),
        }
    }
}

impl std::error::Error for TransportError {}

/// An accepted peer connection with the routing identity the endpoint issued
/// for it on accept. The identity is the opaque token carried in envelope
/// address segments; peers never learn or choose it.
pub struct RouterConnection {
    identity: Uuid,
    peer_addr: SocketAddr,
    stream: TcpStream,
}

impl RouterConnection {
    fn accept(stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, TransportError> {
        stream
            .set_nodelay(true)
            .map_err(|source| TransportError::ConfigureAcceptedStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| TransportError::ConfigureAcceptedStream { source })?;

        Ok(Self {
            identity: Uuid::new_v4(),
            peer_addr,
            stream,
        })
    }

    /// The identity as the raw byte segment used in envelope address stacks.
    pub fn identity_segment(&self) -> Vec<u8> {
        self.identity.as_bytes().to_vec()
    }

    fn try_read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buffer)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let identity = identity_hex(self.identity.as_bytes());
        let mut written = 0;
        let mut stalled_attempts = 0;

        while written < frame.len() {
            match self.stream.write(&frame[written..]) {
                Ok(0) => {
                    return Err(TransportError::Write {
                        identity,
                        source: io::Error::from(io::ErrorKind::WriteZero),
                    });
                }
                Ok(count) => {
                    written += count;
                    stalled_attempts = 0;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    stalled_attempts += 1;
                    if stalled_attempts > WRITE_RETRY_LIMIT {
                        return Err(TransportError::WriteStalled { identity });
                    }
                    thread::sleep(WRITE_RETRY_DELAY);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => return Err(TransportError::Write { identity, source }),
            }
        }

        Ok(())
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// What one poll of an endpoint observed, in arrival order.
#[derive(Debug)]
pub enum EndpointEvent {
    /// A complete inbound envelope, already wrapped with the sender identity.
    Message(Envelope),
    /// A peer closed or broke its connection.
    PeerDisconnected { identity: Vec<u8> },
}

struct Route {
    connection: RouterConnection,
    read_buffer: Vec<u8>,
}

/// A bound, non-blocking listener plus its live connections. Receiving
/// prepends the sender identity to the decoded envelope; sending pops the
/// leading address segment and routes to the matching connection. That
/// contract is what lets the broker stay connection-agnostic.
pub struct RouterEndpoint {
    name: &'static str,
    listener: TcpListener,
    codec: WireCodec,
    routes: BTreeMap<Uuid, Route>,
}

impl RouterEndpoint {
    pub fn bind(
        name: &'static str,
        config: &EndpointConfig,
        codec: WireCodec,
    ) -> Result<Self, TransportError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address)
            .map_err(|source| TransportError::Bind { address, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| TransportError::SetNonBlocking { source })?;

        Ok(Self {
            name,
            listener,
            codec,
            routes: BTreeMap::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Accepts every pending connection, issuing a fresh routing identity
    /// per peer. Hard accept errors are logged and end this round; they do
    /// not tear the endpoint down.
    pub fn accept_pending(&mut self, logger: &Logger) -> usize {
        let mut accepted = 0;

        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => match RouterConnection::accept(stream, peer_addr) {
                    Ok(connection) => {
                        logger.log(
                            crate::logging::LogLevel::Debug,
                            Some("transport"),
                            &format!("{} endpoint accepted connection", self.name),
                            Some(json!({
                                "endpoint": self.name,
                                "identity": identity_hex(connection.identity.as_bytes()),
                                "peer_addr": connection.peer_addr.to_string(),
                            })),
                        );
                        self.routes.insert(
                            connection.identity,
                            Route {
                                connection,
                                read_buffer: Vec::new(),
                            },
                        );
                        accepted += 1;
                    }
                    Err(error) => {
                        logger.warn(
                            Some("transport"),
                            &format!(
                                "{} endpoint failed to configure accepted connection: {error}",
                                self.name
                            ),
                        );
                    }
                },
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => {
                    logger.warn(
                        Some("transport"),
                        &format!("{} endpoint accept error: {error}", self.name),
                    );
                    break;
                }
            }
        }

        accepted
    }

    /// Reads whatever each connection has available, reassembles complete
    /// frames, and returns the decoded envelopes (sender identity prepended)
    /// plus any disconnects observed. A receive failure closes only the one
    /// affected connection.
    pub fn poll_events(&mut self, logger: &Logger) -> Vec<EndpointEvent> {
        self.poll_events_with_budget(logger, usize::MAX)
    }

    /// Like [`RouterEndpoint::poll_events`], but decodes at most
    /// `max_messages` inbound envelopes. Once the budget is spent, no
    /// further connections are read, so surplus traffic stays in the kernel
    /// buffers instead of accumulating in broker memory.
    pub fn poll_events_with_budget(
        &mut self,
        logger: &Logger,
        max_messages: usize,
    ) -> Vec<EndpointEvent> {
        let mut events = Vec::new();
        let mut messages = 0;
        let identities: Vec<Uuid> = self.routes.keys().copied().collect();

        for identity in identities {
            if messages >= max_messages {
                break;
            }

            let mut closed = false;
            let mut failure: Option<String> = None;

            {
                let route = self
                    .routes
                    .get_mut(&identity)
                    .expect("route disappeared during poll");
                let mut chunk = [0_u8; READ_CHUNK_SIZE_BYTES];

                'connection: loop {
                    // Decode buffered bytes before reading more, so a spent
                    // budget leaves the socket untouched.
                    while messages < max_messages {
                        match self.codec.take_frame(&mut route.read_buffer) {
                            Ok(Some(segments)) => {
                                let mut envelope = Envelope::from_segments(segments);
                                envelope.wrap(route.connection.identity_segment());
                                events.push(EndpointEvent::Message(envelope));
                                messages += 1;
                            }
                            Ok(None) => break,
                            Err(error) => {
                                failure = Some(format!("malformed inbound frame: {error}"));
                                break 'connection;
                            }
                        }
                    }
                    if messages >= max_messages {
                        break;
                    }

                    match route.connection.try_read(&mut chunk) {
                        Ok(0) => {
                            closed = true;
                            break;
                        }
                        Ok(size) => route.read_buffer.extend_from_slice(&chunk[..size]),
                        Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                        Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                        Err(error) => {
                            failure = Some(format!("socket read error: {error}"));
                            break;
                        }
                    }
                }
            }

            if let Some(reason) = failure {
                logger.warn(
                    Some("transport"),
                    &format!(
                        "{} endpoint closing connection {}: {reason}",
                        self.name,
                        identity_hex(identity.as_bytes())
                    ),
                );
                self.drop_route(identity);
                events.push(EndpointEvent::PeerDisconnected {
                    identity: identity.as_bytes().to_vec(),
                });
            } else if closed {
                logger.debug(
                    Some("transport"),
                    &format!(
                        "{} endpoint peer {} disconnected",
                        self.name,
                        identity_hex(identity.as_bytes())
                    ),
                );
                self.drop_route(identity);
                events.push(EndpointEvent::PeerDisconnected {
                    identity: identity.as_bytes().to_vec(),
                });
            }
        }

        events
    }

    /// Pops the leading address segment and delivers the remaining envelope
    /// to the connection that identity belongs to. A vanished peer makes the
    /// message undeliverable; the caller decides whether that is worth more
    /// than a log line.
    pub fn send(&mut self, mut envelope: Envelope) -> Result<(), TransportError> {
        let address = envelope
            .unwrap_address()
            .map_err(|_| TransportError::EnvelopeMissingRoute)?;
        let identity = Uuid::from_slice(&address).map_err(|_| {
            TransportError::InvalidRouteAddress {
                length: address.len(),
            }
        })?;

        let frame = self
            .codec
            .encode_frame(envelope.segments())
            .map_err(TransportError::Encode)?;

        let Some(route) = self.routes.get_mut(&identity) else {
            return Err(TransportError::UnknownRoute {
                identity: identity_hex(&address),
            });
        };

        match route.connection.write_frame(&frame) {
            Ok(()) => Ok(()),
            Err(error) => {
                // A failed write means the peer is gone; drop the route so
                // later sends fail fast as UnknownRoute.
                self.drop_route(identity);
                Err(error)
            }
        }
    }

    pub fn shutdown_all(&mut self) {
        for route in self.routes.values() {
            route.connection.shutdown();
        }
        self.routes.clear();
    }

    fn drop_route(&mut self, identity: Uuid) {
        if let Some(route) = self.routes.remove(&identity) {
            route.connection.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::logging::{Logger, LoggerConfig};
    use crate::wire::codec::WireCodec;
    use crate::wire::envelope::Envelope;

    use super::{EndpointConfig, EndpointEvent, RouterEndpoint, TransportError};

    fn test_logger() -> Logger {
        Logger::with_sink(LoggerConfig::default(), Arc::new(crate::logging::StdoutSink))
    }

    fn loopback_endpoint() -> RouterEndpoint {
        RouterEndpoint::bind(
            "test",
            &EndpointConfig {
                host: "127.0.0.1".to_owned(),
                port: 0,
            },
            WireCodec::default(),
        )
        .expect("endpoint should bind")
    }

    fn connect(endpoint: &RouterEndpoint) -> TcpStream {
        let addr = endpoint.local_addr().expect("endpoint should have an addr");
        let stream = TcpStream::connect(addr).expect("peer should connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("read timeout should apply");
        stream
    }

    fn accept_one(endpoint: &mut RouterEndpoint, logger: &Logger) {
        for _ in 0..100 {
            if endpoint.accept_pending(logger) > 0 {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("endpoint failed to accept test connection");
    }

    fn poll_until_events(endpoint: &mut RouterEndpoint, logger: &Logger) -> Vec<EndpointEvent> {
        for _ in 0..200 {
            let events = endpoint.poll_events(logger);
            if !events.is_empty() {
                return events;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("endpoint produced no events in time");
    }

    fn read_segments(stream: &mut TcpStream, codec: &WireCodec) -> Vec<Vec<u8>> {
        let mut header = [0_u8; 4];
        stream
            .read_exact(&mut header)
            .expect("frame header should arrive");
        let len = u32::from_be_bytes(header) as usize;
        let mut payload = vec![0_u8; len];
        stream
            .read_exact(&mut payload)
            .expect("frame payload should arrive");
        codec
            .decode_payload(&payload)
            .expect("frame payload should decode")
    }

    #[test]
    fn inbound_envelope_is_wrapped_with_issued_identity() {
        let logger = test_logger();
        let mut endpoint = loopback_endpoint();
        let codec = WireCodec::default();
        let mut peer = connect(&endpoint);

        accept_one(&mut endpoint, &logger);
        assert_eq!(endpoint.route_count(), 1);

        let frame = codec
            .encode_frame(&[b"PING".to_vec()])
            .expect("frame should encode");
        peer.write_all(&frame).expect("peer write should work");

        let events = poll_until_events(&mut endpoint, &logger);
        let EndpointEvent::Message(envelope) = &events[0] else {
            panic!("expected a message event, got {:?}", events[0]);
        };
        assert_eq!(envelope.segment_count(), 2);
        assert_eq!(envelope.segments()[0].len(), 16);
        assert_eq!(envelope.segments()[1], b"PING".to_vec());
    }

    #[test]
    fn send_routes_by_leading_address_and_strips_it() {
        let logger = test_logger();
        let mut endpoint = loopback_endpoint();
        let codec = WireCodec::default();
        let mut peer = connect(&endpoint);

        accept_one(&mut endpoint, &logger);
        let frame = codec
            .encode_frame(&[b"hello".to_vec()])
            .expect("frame should encode");
        peer.write_all(&frame).expect("peer write should work");

        let events = poll_until_events(&mut endpoint, &logger);
        let EndpointEvent::Message(envelope) = events.into_iter().next().expect("one event")
        else {
            panic!("expected a message event");
        };
        let identity = envelope.segments()[0].clone();

        let reply = Envelope::from_segments(vec![identity, b"world".to_vec()]);
        endpoint.send(reply).expect("send should route");

        let segments = read_segments(&mut peer, &codec);
        assert_eq!(segments, vec![b"world".to_vec()]);
    }

    #[test]
    fn partial_frames_are_reassembled_across_polls() {
        let logger = test_logger();
        let mut endpoint = loopback_endpoint();
        let codec = WireCodec::default();
        let mut peer = connect(&endpoint);

        accept_one(&mut endpoint, &logger);
        let frame = codec
            .encode_frame(&[b"split-frame".to_vec()])
            .expect("frame should encode");
        let (head, tail) = frame.split_at(3);

        peer.write_all(head).expect("head write should work");
        thread::sleep(Duration::from_millis(20));
        let early = endpoint.poll_events(&logger);
        assert!(early.is_empty(), "partial frame must not decode: {early:?}");

        peer.write_all(tail).expect("tail write should work");
        let events = poll_until_events(&mut endpoint, &logger);
        let EndpointEvent::Message(envelope) = &events[0] else {
            panic!("expected a message event");
        };
        assert_eq!(envelope.segments()[1], b"split-frame".to_vec());
    }

    #[test]
    fn poll_budget_caps_decoded_messages_per_cycle() {
        let logger = test_logger();
        let mut endpoint = loopback_endpoint();
        let codec = WireCodec::default();
        let mut peer = connect(&endpoint);

        accept_one(&mut endpoint, &logger);
        for body in [b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec()] {
            let frame = codec.encode_frame(&[body]).expect("frame should encode");
            peer.write_all(&frame).expect("peer write should work");
        }

        let mut first = Vec::new();
        for _ in 0..200 {
            first = endpoint.poll_events_with_budget(&logger, 1);
            if !first.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(first.len(), 1, "budget of one must yield one message");
        let EndpointEvent::Message(envelope) = &first[0] else {
            panic!("expected a message event");
        };
        assert_eq!(envelope.segments()[1], b"m1".to_vec());

        let mut second = Vec::new();
        for _ in 0..200 {
            second = endpoint.poll_events_with_budget(&logger, 1);
            if !second.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(second.len(), 1, "budget of one must yield one message");
        let EndpointEvent::Message(envelope) = &second[0] else {
            panic!("expected a message event");
        };
        assert_eq!(envelope.segments()[1], b"m2".to_vec());

        let rest = poll_until_events(&mut endpoint, &logger);
        assert_eq!(rest.len(), 1);
        let EndpointEvent::Message(envelope) = &rest[0] else {
            panic!("expected a message event");
        };
        assert_eq!(envelope.segments()[1], b"m3".to_vec());
    }

    #[test]
    fn peer_disconnect_is_reported_and_route_is_dropped() {
        let logger = test_logger();
        let mut endpoint = loopback_endpoint();
        let peer = connect(&endpoint);

        accept_one(&mut endpoint, &logger);
        drop(peer);

        let events = poll_until_events(&mut endpoint, &logger);
        assert!(matches!(
            events[0],
            EndpointEvent::PeerDisconnected { ref identity } if identity.len() == 16
        ));
        assert_eq!(endpoint.route_count(), 0);
    }

    #[test]
    fn send_to_unknown_route_fails_without_panic() {
        let mut endpoint = loopback_endpoint();
        let envelope = Envelope::from_segments(vec![vec![0_u8; 16], b"lost".to_vec()]);

        let error = endpoint.send(envelope).expect_err("unknown route should fail");
        assert!(matches!(error, TransportError::UnknownRoute { .. }));
    }

    #[test]
    fn send_without_address_or_with_bad_address_fails() {
        let mut endpoint = loopback_endpoint();

        let error = endpoint
            .send(Envelope::from_segments(Vec::new()))
            .expect_err("empty envelope should fail");
        assert!(matches!(error, TransportError::EnvelopeMissingRoute));

        let error = endpoint
            .send(Envelope::from_segments(vec![vec![1, 2, 3], b"x".to_vec()]))
            .expect_err("short address should fail");
        assert!(matches!(
            error,
            TransportError::InvalidRouteAddress { length: 3 }
        ));
    }

    #[test]
    fn malformed_inbound_frame_closes_only_that_connection() {
        let logger = test_logger();
        let mut endpoint = loopback_endpoint();
        let codec = WireCodec::default();

        let mut bad_peer = connect(&endpoint);
        accept_one(&mut endpoint, &logger);
        let mut good_peer = connect(&endpoint);
        accept_one(&mut endpoint, &logger);
        assert_eq!(endpoint.route_count(), 2);

        // Zero declared length is a protocol violation.
        bad_peer
            .write_all(&[0, 0, 0, 0])
            .expect("bad peer write should work");
        let frame = codec
            .encode_frame(&[b"still-fine".to_vec()])
            .expect("frame should encode");
        good_peer.write_all(&frame).expect("good peer write should work");

        thread::sleep(Duration::from_millis(30));
        let mut saw_disconnect = false;
        let mut saw_message = false;
        for _ in 0..200 {
            for event in endpoint.poll_events(&logger) {
                match event {
                    EndpointEvent::PeerDisconnected { .. } => saw_disconnect = true,
                    EndpointEvent::Message(envelope) => {
                        assert_eq!(envelope.segments()[1], b"still-fine".to_vec());
                        saw_message = true;
                    }
                }
            }
            if saw_disconnect && saw_message {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert!(saw_disconnect, "malformed peer should be disconnected");
        assert!(saw_message, "healthy peer should keep working");
        assert_eq!(endpoint.route_count(), 1);
    }
}
