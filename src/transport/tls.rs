//! TLS session I/O.
//!
//! Each encrypted connection owns a `rustls::ServerConnection`. The handshake
//! is not a separate phase: receive feeds records into the session and send
//! flushes whatever it wants to write, so handshake records and application
//! data travel through the same two operations.

use super::{CloseReason, Step};
use crate::connection::{InboundBuffer, Outbound};
use crate::error::Error;

use mio::net::TcpStream;
use rustls::{ServerConfig, ServerConnection};
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

// Internal connection status
#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionStatus {
    Handshaking,
    Established,
}

pub(crate) struct TlsSession {
    conn: ServerConnection,
    status: SessionStatus,
}

impl TlsSession {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, Error> {
        let conn = ServerConnection::new(config).map_err(|e| Error::TlsSession(e.to_string()))?;
        Ok(Self {
            conn,
            status: SessionStatus::Handshaking,
        })
    }

    pub fn is_handshaking(&self) -> bool {
        self.status == SessionStatus::Handshaking
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    // Records the end of the handshake once. Returns true on the transition.
    fn note_progress(&mut self) -> bool {
        if self.status == SessionStatus::Handshaking && !self.conn.is_handshaking() {
            self.status = SessionStatus::Established;
            true
        } else {
            false
        }
    }

    fn fault(&self, detail: String) -> CloseReason {
        match self.status {
            SessionStatus::Handshaking => CloseReason::HandshakeFailed(detail),
            SessionStatus::Established => CloseReason::Tls(detail),
        }
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("status", &self.status)
            .field("wants_write", &self.conn.wants_write())
            .finish()
    }
}

/// Decrypts at most one inbound buffer's worth of plaintext.
///
/// Plaintext already decrypted by the session is served before the socket is
/// read again, so records that arrive together are never stranded.
pub(super) fn receive(
    stream: &mut TcpStream,
    session: &mut TlsSession,
    inbound: &mut InboundBuffer,
    fd: RawFd,
) -> Step {
    loop {
        let plaintext = match inbound.spare() {
            Some(spare) => session.conn.reader().read(spare),
            None => return Step::Busy,
        };
        match plaintext {
            Ok(0) => {
                info!(fd, "TLS session closed by peer");
                return Step::Close(CloseReason::PeerClosed);
            }
            Ok(len) => {
                inbound.filled(len);
                trace!(fd, len, "Read plaintext from TLS");
                return Step::Done;
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                // No plaintext available, read more records
            }
            Err(err) => {
                warn!(fd, ?err, "Error reading plaintext from TLS");
                return Step::Close(CloseReason::from_io(err.kind()));
            }
        }

        match session.conn.read_tls(stream) {
            Ok(0) => {
                if session.is_handshaking() {
                    warn!(fd, "TLS handshake failed");
                    return Step::Close(session.fault("peer closed during handshake".into()));
                }
                info!(fd, "Connection closed by peer");
                return Step::Close(CloseReason::PeerClosed);
            }
            Ok(len) => {
                trace!(fd, len, "Read encrypted data from socket");
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Step::Blocked,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                if err.kind() == ErrorKind::ConnectionReset {
                    warn!(fd, "Connection reset");
                } else {
                    error!(fd, ?err, "Error reading from socket");
                }
                if session.is_handshaking() {
                    return Step::Close(session.fault(err.to_string()));
                }
                return Step::Close(CloseReason::from_io(err.kind()));
            }
        }

        if let Err(err) = session.conn.process_new_packets() {
            // Best effort to tell the peer why.
            if let Err(alert_err) = session.conn.write_tls(stream) {
                trace!(fd, ?alert_err, "Failed to flush TLS alert");
            }
            if session.is_handshaking() {
                warn!(fd, ?err, "TLS handshake failed");
            } else {
                error!(fd, ?err, "TLS error processing packets");
            }
            return Step::Close(session.fault(err.to_string()));
        }

        if session.note_progress() {
            let version = session.conn.protocol_version();
            info!(fd, ?version, "TLS handshake completed");
        }
    }
}

/// Encrypts the pending response and flushes every record the session holds.
///
/// While the handshake is running this only flushes handshake records.
pub(super) fn send(
    stream: &mut TcpStream,
    session: &mut TlsSession,
    outbound: &mut Option<Outbound>,
    fd: RawFd,
) -> Step {
    loop {
        let mut progress = false;

        if let Some(pending) = outbound.as_mut() {
            if !pending.is_complete() {
                match session.conn.writer().write(pending.remaining()) {
                    // TLS buffer is full
                    Ok(0) => {}
                    Ok(len) => {
                        pending.advance(len);
                        progress = true;
                        trace!(fd, len, remaining = pending.remaining().len(), "Wrote plaintext to TLS");
                    }
                    Err(err) => {
                        error!(fd, ?err, "Error writing plaintext to TLS");
                        return Step::Close(session.fault(err.to_string()));
                    }
                }
            }
        }

        while session.conn.wants_write() {
            match session.conn.write_tls(stream) {
                Ok(0) => {
                    warn!(fd, "Short write");
                    return Step::Close(CloseReason::ShortWrite);
                }
                Ok(len) => {
                    progress = true;
                    trace!(fd, len, "Wrote encrypted data to socket");
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

        match outbound.as_ref() {
            Some(pending) if pending.is_complete() => {
                trace!(fd, len = pending.len(), "Response sent");
                *outbound = None;
                return Step::Done;
            }
            Some(_) if progress => continue,
            _ if progress => return Step::Done,
            _ => return Step::Idle,
        }
    }
}

/// Queues `close_notify` and tries once to flush it. The stream is left open.
pub(super) fn shutdown(
    stream: &mut TcpStream,
    session: &mut TlsSession,
    fd: RawFd,
) -> Result<(), ErrorKind> {
    session.conn.send_close_notify();
    let result = flush(stream, session);
    match &result {
        Ok(()) => debug!(fd, "Sent close_notify"),
        Err(err) => debug!(fd, ?err, "Failed to flush close_notify"),
    }
    result.map_err(|err| err.kind())
}

fn flush(stream: &mut TcpStream, session: &mut TlsSession) -> io::Result<()> {
    while session.conn.wants_write() {
        match session.conn.write_tls(stream) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
