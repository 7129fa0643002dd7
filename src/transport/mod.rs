//! Transport strategies.
//!
//! Every connection control block is bound to one [`Strategy`] when it is
//! created, chosen from its [`Role`] and [`SecurityMode`]. The strategy is the
//! only place that knows whether bytes travel raw or through a TLS session, so
//! the event loop drives plaintext and encrypted connections through the same
//! five operations: accept, receive, parse, handle one, send, plus close.

mod tcp;
pub(crate) mod tls;
pub(crate) mod tls_config;

use crate::connection::{ConnectionBlock, Outbound, Socket};
use crate::error::Error;
use crate::http::{self, Reply, RequestHandler};
use crate::readiness::Readiness;

use rustls::ServerConfig;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::RawFd;
use std::sync::Arc;
use tls::TlsSession;
use tracing::{debug, info, warn};

/// Whether a control block waits for connections or talks to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Listening,
    Accepted,
}

/// Whether a connection's bytes pass through a TLS session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityMode {
    Plain,
    Encrypted,
}

/// Why a connection was closed.
///
/// These are the per-connection faults: each one closes exactly the connection
/// it happened on and never reaches the caller of the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its end in an orderly way.
    PeerClosed,
    /// The peer reset the connection or the pipe broke.
    Reset,
    /// Any other socket error.
    Io(ErrorKind),
    /// A write made no progress.
    ShortWrite,
    /// The request bytes cannot become a valid request by waiting for more.
    Malformed(String),
    HandshakeFailed(String),
    /// TLS record processing failed after the handshake.
    Tls(String),
    HandlerFailed(String),
    /// Closed by [`Server::close_connection`](crate::Server::close_connection).
    Requested,
    /// Closed by the shutdown coordinator.
    Shutdown,
}

impl CloseReason {
    pub(crate) fn from_io(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                CloseReason::Reset
            }
            ErrorKind::UnexpectedEof => CloseReason::PeerClosed,
            kind => CloseReason::Io(kind),
        }
    }
}

/// Outcome of a receive or send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    /// Bytes moved. The descriptor may have more to give.
    Done,
    /// There was nothing to do.
    Idle,
    /// The socket would block; wait for the next readiness edge.
    Blocked,
    /// The inbound buffer still holds unparsed bytes, or the request queue
    /// is full.
    Busy,
    Close(CloseReason),
}

/// Outcome of [`Strategy::handle_one`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Handled {
    /// The queue was empty.
    Empty,
    /// A response is still being sent, so the queue was left alone.
    Deferred,
    Responded,
    Ignored,
    Failed(CloseReason),
}

/// One step of a connection's teardown, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    /// `close_notify` was queued and flushed, or flushing failed.
    SessionShutdown { error: Option<ErrorKind> },
    SessionReleased,
    /// The unsent tail of a response was discarded.
    OutboundDiscarded { len: usize },
    /// `shutdown(Both)` on the stream.
    SocketShutdown { error: Option<ErrorKind> },
    /// Interest, latched readiness and poller registration were removed.
    /// `known` is false if the readiness manager had no record of the
    /// descriptor.
    Deregistered { known: bool },
    DescriptorClosed,
}

/// What closing one connection did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReport {
    pub fd: RawFd,
    pub role: Role,
    pub mode: SecurityMode,
    pub peer_addr: Option<SocketAddr>,
    pub reason: CloseReason,
    pub steps: Vec<Teardown>,
}

impl CloseReport {
    /// True if `a` happened before `b`. Missing steps compare false.
    pub fn happened_before(&self, a: &Teardown, b: &Teardown) -> bool {
        let pos = |step: &Teardown| {
            self.steps
                .iter()
                .position(|s| std::mem::discriminant(s) == std::mem::discriminant(step))
        };
        matches!((pos(a), pos(b)), (Some(a), Some(b)) if a < b)
    }
}

/// The operations bound to a control block at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    PlainListener,
    PlainStream,
    TlsListener,
    TlsStream,
}

// ============================================================================
// Constructors
// ============================================================================

impl Strategy {
    pub fn select(role: Role, mode: SecurityMode) -> Self {
        match (role, mode) {
            (Role::Listening, SecurityMode::Plain) => Strategy::PlainListener,
            (Role::Accepted, SecurityMode::Plain) => Strategy::PlainStream,
            (Role::Listening, SecurityMode::Encrypted) => Strategy::TlsListener,
            (Role::Accepted, SecurityMode::Encrypted) => Strategy::TlsStream,
        }
    }

    pub fn role(self) -> Role {
        match self {
            Strategy::PlainListener | Strategy::TlsListener => Role::Listening,
            Strategy::PlainStream | Strategy::TlsStream => Role::Accepted,
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

impl Strategy {
    /// Accepts one pending connection on a listening block.
    ///
    /// Returns `Ok(None)` once the backlog is empty. For the encrypted
    /// listener the new block carries a fresh TLS session whose handshake is
    /// driven by the block's own receive and send; no request is queued on it
    /// before the handshake completes.
    pub(crate) fn accept(
        self,
        listener: &mut ConnectionBlock,
        tls: &Arc<ServerConfig>,
    ) -> Result<Option<ConnectionBlock>, Error> {
        let fd = listener.fd();
        let Socket::Listener(socket) = &mut listener.socket else {
            return Err(Error::RoleMismatch {
                fd,
                operation: "accept",
            });
        };
        let mode = match self {
            Strategy::PlainListener => SecurityMode::Plain,
            Strategy::TlsListener => SecurityMode::Encrypted,
            Strategy::PlainStream | Strategy::TlsStream => {
                return Err(Error::RoleMismatch {
                    fd,
                    operation: "accept",
                })
            }
        };

        let Some((stream, peer_addr)) = tcp::accept(socket, fd) else {
            return Ok(None);
        };
        let session = match mode {
            SecurityMode::Plain => None,
            SecurityMode::Encrypted => Some(TlsSession::new(tls.clone())?),
        };
        ConnectionBlock::accepted(stream, peer_addr, mode, session).map(Some)
    }

    /// Reads at most one inbound buffer's worth of bytes.
    ///
    /// Nothing is read while the request queue is full; the socket is left
    /// to the kernel until the handler catches up.
    pub(crate) fn receive(self, ccb: &mut ConnectionBlock) -> Result<Step, Error> {
        let fd = ccb.fd();
        if !ccb.accepts_input() {
            return Ok(Step::Busy);
        }
        let ConnectionBlock {
            socket,
            session,
            inbound,
            ..
        } = ccb;
        let Socket::Stream(stream) = socket else {
            return Err(Error::RoleMismatch {
                fd,
                operation: "receive",
            });
        };
        match (self, session) {
            (Strategy::PlainStream, None) => Ok(tcp::receive(stream, inbound, fd)),
            (Strategy::TlsStream, Some(session)) => Ok(tls::receive(stream, session, inbound, fd)),
            _ => Err(Error::RoleMismatch {
                fd,
                operation: "receive",
            }),
        }
    }

    /// Moves received bytes through the request parser and queues every
    /// complete request in arrival order. Returns how many were queued.
    ///
    /// A no-op when the inbound buffer is empty, which is always the case for
    /// listening blocks.
    pub(crate) fn parse(self, ccb: &mut ConnectionBlock) -> Result<usize, CloseReason> {
        let ConnectionBlock {
            inbound,
            processing,
            cursor,
            queue,
            ..
        } = ccb;
        http::parse_into(inbound, processing, cursor, queue)
            .map_err(|err| CloseReason::Malformed(err.to_string()))
    }

    /// Pops one queued request and lets `handler` answer it.
    ///
    /// Nothing is popped while a previous response is still being sent. The
    /// popped request is dropped whatever the handler does with it.
    pub(crate) fn handle_one(
        self,
        ccb: &mut ConnectionBlock,
        handler: &mut dyn RequestHandler,
    ) -> Handled {
        if ccb.outbound.is_some() {
            return Handled::Deferred;
        }
        let Some(request) = ccb.queue.pop_front() else {
            return Handled::Empty;
        };
        let fd = ccb.fd();
        match handler.handle(&request) {
            Ok(Reply::Respond(response)) => {
                debug!(fd, status = response.status().code(), uri = %request.target, "Handled request");
                ccb.outbound = Some(Outbound::new(response.into_bytes()));
                Handled::Responded
            }
            Ok(Reply::Ignore) => {
                debug!(fd, method = %request.method, "Ignored request");
                Handled::Ignored
            }
            Err(err) => {
                warn!(fd, uri = %request.target, ?err, "Handler failed");
                Handled::Failed(CloseReason::HandlerFailed(err.to_string()))
            }
        }
    }

    /// Flushes the pending response, and for TLS any pending records.
    pub(crate) fn send(self, ccb: &mut ConnectionBlock) -> Result<Step, Error> {
        let fd = ccb.fd();
        let ConnectionBlock {
            socket,
            session,
            outbound,
            ..
        } = ccb;
        let Socket::Stream(stream) = socket else {
            return Err(Error::RoleMismatch {
                fd,
                operation: "send",
            });
        };
        match (self, session) {
            (Strategy::PlainStream, None) => Ok(tcp::send(stream, outbound, fd)),
            (Strategy::TlsStream, Some(session)) => Ok(tls::send(stream, session, outbound, fd)),
            _ => Err(Error::RoleMismatch {
                fd,
                operation: "send",
            }),
        }
    }

    /// Tears the block down and reports every step taken.
    ///
    /// The TLS session is shut down and released before the descriptor is
    /// closed. A failing step is recorded and logged but never stops the steps
    /// after it.
    pub(crate) fn close(
        self,
        mut ccb: ConnectionBlock,
        reason: CloseReason,
        readiness: &mut Readiness,
    ) -> CloseReport {
        let fd = ccb.fd();
        let mut steps = Vec::new();

        if let Some(mut session) = ccb.session.take() {
            let error = match &mut ccb.socket {
                Socket::Stream(stream) => tls::shutdown(stream, &mut session, fd).err(),
                Socket::Listener(_) => None,
            };
            steps.push(Teardown::SessionShutdown { error });
            drop(session);
            steps.push(Teardown::SessionReleased);
        }

        if let Some(outbound) = ccb.outbound.take() {
            let len = outbound.remaining().len();
            if len > 0 {
                debug!(fd, len, "Discarding unsent response bytes");
            }
            steps.push(Teardown::OutboundDiscarded { len });
        }

        if let Socket::Stream(stream) = &ccb.socket {
            let error = match stream.shutdown(Shutdown::Both) {
                Ok(()) => None,
                // The peer got there first.
                Err(err) if err.kind() == ErrorKind::NotConnected => None,
                Err(err) => {
                    warn!(fd, ?err, "Error shutting down connection");
                    Some(err.kind())
                }
            };
            steps.push(Teardown::SocketShutdown { error });
        }

        let known = readiness.deregister(fd);
        if !known {
            warn!(fd, "Closing a descriptor the readiness manager did not know");
        }
        steps.push(Teardown::Deregistered { known });

        let (role, mode) = (ccb.role(), ccb.mode());
        let (local_addr, peer_addr) = (ccb.local_addr(), ccb.peer_addr());
        drop(ccb);
        steps.push(Teardown::DescriptorClosed);

        let report = CloseReport {
            fd,
            role,
            mode,
            peer_addr,
            reason,
            steps,
        };
        match report.peer_addr {
            Some(peer_addr) => {
                info!(fd, %local_addr, %peer_addr, reason = ?report.reason, "Closed connection")
            }
            None => info!(fd, %local_addr, "Closed listener"),
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::QUEUE_CAPACITY;
    use crate::http::{Method, Request, Version};
    use mio::Interest;
    use std::io::Write;
    use std::time::{Duration, Instant};

    fn pair() -> (mio::net::TcpStream, SocketAddr, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer_addr) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (mio::net::TcpStream::from_std(server), peer_addr, client)
    }

    fn tls_context() -> Arc<ServerConfig> {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let key = rustls::pki_types::PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![certified.cert.der().clone()], key)
            .unwrap();
        Arc::new(config)
    }

    fn get(target: &str) -> Request {
        Request {
            method: Method::Get,
            target: target.to_string(),
            version: Version::Http11,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn receive_pauses_while_the_request_queue_is_full() {
        let (server, peer_addr, mut client) = pair();
        let mut block =
            ConnectionBlock::accepted(server, peer_addr, SecurityMode::Plain, None).unwrap();
        let strategy = block.strategy();
        for n in 0..QUEUE_CAPACITY {
            block.queue.push_back(get(&format!("/{n}")));
        }
        client.write_all(b"GET /next HTTP/1.1\r\n\r\n").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(strategy.receive(&mut block).unwrap(), Step::Busy);
        assert!(block.inbound.is_empty());

        block.queue.pop_front();
        let deadline = Instant::now() + Duration::from_secs(2);
        let step = loop {
            let step = strategy.receive(&mut block).unwrap();
            if step != Step::Blocked || Instant::now() > deadline {
                break step;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(step, Step::Done);
        assert_eq!(strategy.parse(&mut block), Ok(1));
        assert_eq!(block.queue.len(), QUEUE_CAPACITY);
        assert_eq!(block.queue.back().map(|r| r.target.as_str()), Some("/next"));
    }

    #[test]
    fn session_is_released_before_the_descriptor_when_its_shutdown_fails() {
        let (server, peer_addr, client) = pair();
        let session = TlsSession::new(tls_context()).unwrap();
        let mut block =
            ConnectionBlock::accepted(server, peer_addr, SecurityMode::Encrypted, Some(session))
                .unwrap();
        let mut readiness = Readiness::new(8).unwrap();
        readiness
            .register(block.fd(), Interest::READABLE | Interest::WRITABLE)
            .unwrap();

        // Closing a socket with unread data makes the client send a reset.
        if let Socket::Stream(stream) = &mut block.socket {
            stream.write_all(b"unread").unwrap();
        }
        std::thread::sleep(Duration::from_millis(50));
        drop(client);
        std::thread::sleep(Duration::from_millis(100));

        let report = block
            .strategy()
            .close(block, CloseReason::Reset, &mut readiness);

        assert!(matches!(
            report.steps[0],
            Teardown::SessionShutdown { error: Some(_) }
        ));
        assert!(report.happened_before(
            &Teardown::SessionShutdown { error: None },
            &Teardown::SessionReleased
        ));
        assert!(report.happened_before(&Teardown::SessionReleased, &Teardown::DescriptorClosed));
        assert!(report.steps.contains(&Teardown::Deregistered { known: true }));
        assert_eq!(readiness.ceiling(), 0);
    }

    #[test]
    fn strategy_is_selected_from_role_and_mode() {
        let mut selected = Vec::new();
        for role in [Role::Listening, Role::Accepted] {
            for mode in [SecurityMode::Plain, SecurityMode::Encrypted] {
                let strategy = Strategy::select(role, mode);
                assert_eq!(strategy.role(), role);
                assert!(!selected.contains(&strategy));
                selected.push(strategy);
            }
        }
    }

    #[test]
    fn io_errors_map_to_close_reasons() {
        assert_eq!(CloseReason::from_io(ErrorKind::ConnectionReset), CloseReason::Reset);
        assert_eq!(CloseReason::from_io(ErrorKind::BrokenPipe), CloseReason::Reset);
        assert_eq!(CloseReason::from_io(ErrorKind::UnexpectedEof), CloseReason::PeerClosed);
        assert_eq!(
            CloseReason::from_io(ErrorKind::PermissionDenied),
            CloseReason::Io(ErrorKind::PermissionDenied)
        );
    }

    #[test]
    fn report_orders_teardown_steps() {
        let report = CloseReport {
            fd: 7,
            role: Role::Accepted,
            mode: SecurityMode::Encrypted,
            peer_addr: None,
            reason: CloseReason::Shutdown,
            steps: vec![
                Teardown::SessionShutdown {
                    error: Some(ErrorKind::BrokenPipe),
                },
                Teardown::SessionReleased,
                Teardown::Deregistered { known: true },
                Teardown::DescriptorClosed,
            ],
        };
        assert!(report.happened_before(&Teardown::SessionReleased, &Teardown::DescriptorClosed));
        assert!(!report.happened_before(&Teardown::DescriptorClosed, &Teardown::SessionReleased));
        assert!(!report.happened_before(
            &Teardown::SocketShutdown { error: None },
            &Teardown::DescriptorClosed
        ));
    }
}
