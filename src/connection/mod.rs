//! Connection control blocks.
//!
//! A [`ConnectionBlock`] is everything the server knows about one descriptor:
//! its socket, role and security mode, the transport strategy bound to it at
//! creation, its three buffers, the parser cursor and the queue of parsed
//! requests waiting for a response. Dropping a block closes its descriptor, so
//! the registry owning the block is what keeps the descriptor alive.

mod buffer;

pub use buffer::{InboundBuffer, Outbound, ProcessingBuffer, PROCESSING_CAPACITY};
#[cfg(test)]
pub use buffer::INBOUND_CAPACITY;

/// Parsed requests a connection may hold before its socket stops being read.
pub const QUEUE_CAPACITY: usize = 32;

use crate::error::Error;
use crate::http::{ParseCursor, Request};
use crate::transport::tls::TlsSession;
use crate::transport::{Role, SecurityMode, Strategy};

use mio::net::{TcpListener, TcpStream};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use tracing::debug;

#[derive(Debug)]
pub(crate) enum Socket {
    Listener(TcpListener),
    Stream(TcpStream),
}

impl Socket {
    fn raw_fd(&self) -> RawFd {
        match self {
            Socket::Listener(listener) => listener.as_raw_fd(),
            Socket::Stream(stream) => stream.as_raw_fd(),
        }
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Socket::Listener(listener) => listener.local_addr(),
            Socket::Stream(stream) => stream.local_addr(),
        }
    }
}

pub(crate) struct ConnectionBlock {
    fd: RawFd,
    local_addr: SocketAddr,
    peer_addr: Option<SocketAddr>,
    role: Role,
    mode: SecurityMode,
    strategy: Strategy,
    pub(crate) socket: Socket,
    pub(crate) session: Option<TlsSession>,
    pub(crate) inbound: InboundBuffer,
    pub(crate) processing: ProcessingBuffer,
    pub(crate) cursor: ParseCursor,
    pub(crate) outbound: Option<Outbound>,
    pub(crate) queue: VecDeque<Request>,
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectionBlock {
    /// Wraps a bound listener. Listening blocks never own a TLS session.
    pub fn listening(listener: TcpListener, mode: SecurityMode) -> Result<Self, Error> {
        Self::create(Socket::Listener(listener), None, Role::Listening, mode, None)
    }

    /// Wraps an accepted stream. Encrypted streams must bring their session.
    pub fn accepted(
        stream: TcpStream,
        peer_addr: SocketAddr,
        mode: SecurityMode,
        session: Option<TlsSession>,
    ) -> Result<Self, Error> {
        Self::create(
            Socket::Stream(stream),
            Some(peer_addr),
            Role::Accepted,
            mode,
            session,
        )
    }

    fn create(
        socket: Socket,
        peer_addr: Option<SocketAddr>,
        role: Role,
        mode: SecurityMode,
        session: Option<TlsSession>,
    ) -> Result<Self, Error> {
        let fd = socket.raw_fd();
        let expects_session = role == Role::Accepted && mode == SecurityMode::Encrypted;
        if expects_session != session.is_some() {
            return Err(Error::TlsSession(format!(
                "descriptor {fd} ({role:?}, {mode:?}) created with a mismatched session"
            )));
        }
        let local_addr = socket.local_addr()?;
        let block = Self {
            fd,
            local_addr,
            peer_addr,
            role,
            mode,
            strategy: Strategy::select(role, mode),
            socket,
            session,
            inbound: InboundBuffer::new()?,
            processing: ProcessingBuffer::new()?,
            cursor: ParseCursor::default(),
            outbound: None,
            queue: VecDeque::new(),
        };
        debug!(fd, ?role, ?mode, "Created connection control block");
        Ok(block)
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl ConnectionBlock {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// True while a response is being written or the TLS session has records
    /// to flush.
    pub fn wants_write(&self) -> bool {
        self.outbound.is_some()
            || self
                .session
                .as_ref()
                .is_some_and(|session| session.wants_write())
    }

    /// False once the request queue is full. Receiving resumes when the
    /// handler drains it below the cap.
    pub fn accepts_input(&self) -> bool {
        self.queue.len() < QUEUE_CAPACITY
    }

    /// True when the write side has something to do on its next tick.
    pub fn has_pending_work(&self) -> bool {
        self.wants_write() || !self.queue.is_empty()
    }
}

impl std::fmt::Debug for ConnectionBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBlock")
            .field("fd", &self.fd)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("role", &self.role)
            .field("mode", &self.mode)
            .field("inbound", &self.inbound.len())
            .field("processing", &self.processing.len())
            .field("outbound", &self.outbound.as_ref().map(Outbound::len))
            .field("queued", &self.queue.len())
            .finish()
    }
}
