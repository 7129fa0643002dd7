//! Plaintext socket I/O.
//!
//! Non-blocking accept, receive and send on `mio` sockets. None of these
//! functions close anything; they report what happened and the event loop
//! decides.

use super::{CloseReason, Step};
use crate::connection::{InboundBuffer, Outbound};

use mio::net::{TcpListener, TcpStream};
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use tracing::{error, info, trace, warn};

/// Accepts one pending connection. `None` means the backlog is drained or the
/// accept failed in a way that only a new connection can fix.
pub(super) fn accept(listener: &mut TcpListener, fd: RawFd) -> Option<(TcpStream, SocketAddr)> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    warn!(fd, %peer_addr, ?err, "Failed to set TCP_NODELAY");
                }
                info!(listener = fd, %peer_addr, "Accepting connection");
                return Some((stream, peer_addr));
            }
            Err(err) => match err.kind() {
                // Further accepting would block, so we are done
                ErrorKind::WouldBlock => return None,
                ErrorKind::Interrupted => continue,
                ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                    warn!(fd, ?err, "Transient accept error");
                    continue;
                }
                _ => {
                    // Typically EMFILE. Existing connections are unaffected.
                    error!(fd, ?err, "Error accepting connection");
                    return None;
                }
            },
        }
    }
}

/// Reads once into the inbound buffer, which must be empty.
pub(super) fn receive(stream: &mut TcpStream, inbound: &mut InboundBuffer, fd: RawFd) -> Step {
    loop {
        let result = match inbound.spare() {
            Some(spare) => stream.read(spare),
            None => return Step::Busy,
        };
        match result {
            Ok(0) => {
                info!(fd, "Connection closed by peer");
                return Step::Close(CloseReason::PeerClosed);
            }
            Ok(len) => {
                inbound.filled(len);
                trace!(fd, len, "Read data from socket");
                return Step::Done;
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Step::Blocked,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                if err.kind() == ErrorKind::ConnectionReset {
                    warn!(fd, "Connection reset");
                } else {
                    error!(fd, ?err, "Error reading from socket");
                }
                return Step::Close(CloseReason::from_io(err.kind()));
            }
        }
    }
}

/// Writes as much of the pending response as the socket takes.
///
/// A response that would block keeps its unsent tail and is resumed on the
/// next writable tick. A write that makes no progress is a short write and
/// closes the connection.
pub(super) fn send(stream: &mut TcpStream, outbound: &mut Option<Outbound>, fd: RawFd) -> Step {
    let Some(pending) = outbound.as_mut() else {
        return Step::Idle;
    };
    while !pending.is_complete() {
        match stream.write(pending.remaining()) {
            Ok(0) => {
                warn!(fd, remaining = pending.remaining().len(), "Short write");
                return Step::Close(CloseReason::ShortWrite);
            }
            Ok(len) => {
                pending.advance(len);
                trace!(fd, len, remaining = pending.remaining().len(), "Wrote data to socket");
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Step::Blocked,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                if err.kind() == ErrorKind::BrokenPipe {
                    warn!(fd, "Broken pipe");
                } else if err.kind() == ErrorKind::ConnectionReset {
                    warn!(fd, "Connection reset");
                } else {
                    error!(fd, ?err, "Error writing to socket");
                }
                return Step::Close(CloseReason::from_io(err.kind()));
            }
        }
    }
    trace!(fd, len = pending.len(), "Response sent");
    *outbound = None;
    Step::Done
}
