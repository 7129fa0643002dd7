//! Event loop and shutdown coordinator.
//!
//! A [`Server`] owns every piece of mutable state: the readiness manager, the
//! connection registry, the TLS context and the request handler. All of it is
//! touched only from the thread running [`Server::run`] (or calling
//! [`Server::tick`]); the one way in from another thread is a
//! [`ShutdownHandle`].
//!
//! # Example
//!
//! ```no_run
//! use liso::{Server, ServerConfig};
//!
//! let config = config::Config::builder()
//!     .add_source(config::File::with_name("lisod.toml"))
//!     .build()?;
//! let server = Server::bind(&ServerConfig::from_config(&config)?)?;
//! let handle = server.shutdown_handle();
//! // Hand `handle` to a signal watcher, then:
//! let report = server.run()?;
//! println!("closed {} connections", report.closed.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::config::ServerConfig;
use crate::connection::{ConnectionBlock, QUEUE_CAPACITY};
use crate::error::Error;
use crate::http::{RequestHandler, StaticFiles};
use crate::readiness::{Readiness, ShutdownHandle, WaitOutcome};
use crate::registry::Registry;
use crate::transport::tls_config::load_tls_server_config;
use crate::transport::{CloseReason, CloseReport, Handled, Role, SecurityMode, Step};

use mio::net::TcpListener;
use mio::Interest;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Result of one [`Server::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The wait timed out with nothing ready.
    Timeout,
    /// This many (descriptor, direction) pairs were serviced.
    Serviced(usize),
    /// The wait was interrupted; the caller should shut down.
    Shutdown,
}

/// What the shutdown coordinator did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// One report per block that was still open, in ascending descriptor
    /// order. Listeners included.
    pub closed: Vec<CloseReport>,
    /// Connections closed by the event loop before shutdown began.
    pub previously_closed: usize,
    /// True if no TLS session outlived the TLS context.
    pub tls_context_released: bool,
}

pub struct Server {
    readiness: Readiness,
    registry: Registry,
    tls: Arc<rustls::ServerConfig>,
    handler: Box<dyn RequestHandler>,
    poll_timeout: Duration,
    http_addr: SocketAddr,
    https_addr: SocketAddr,
    closed_count: usize,
}

// ============================================================================
// Constructors
// ============================================================================

impl Server {
    /// Binds both endpoints and serves files from the configured document
    /// root.
    pub fn bind(config: &ServerConfig) -> Result<Self, Error> {
        Self::with_handler(config, StaticFiles::new(config.document_root.clone()))
    }

    /// Binds both endpoints and answers requests with `handler`.
    ///
    /// Loads the TLS context first: a certificate and key that do not belong
    /// together abort startup before anything is bound.
    pub fn with_handler<H>(config: &ServerConfig, handler: H) -> Result<Self, Error>
    where
        H: RequestHandler + 'static,
    {
        config.validate()?;
        let tls = load_tls_server_config(&config.tls_server_cert, &config.tls_server_key)?;

        let mut readiness = Readiness::new(config.poll_capacity)?;
        let mut registry = Registry::new();
        let http_addr = listen(
            &mut readiness,
            &mut registry,
            config.http_addr(),
            SecurityMode::Plain,
        )?;
        let https_addr = listen(
            &mut readiness,
            &mut registry,
            config.https_addr(),
            SecurityMode::Encrypted,
        )?;

        Ok(Self {
            readiness,
            registry,
            tls,
            handler: Box::new(handler),
            poll_timeout: config.poll_timeout,
            http_addr,
            https_addr,
            closed_count: 0,
        })
    }
}

fn listen(
    readiness: &mut Readiness,
    registry: &mut Registry,
    addr: SocketAddr,
    mode: SecurityMode,
) -> Result<SocketAddr, Error> {
    let listener = TcpListener::bind(addr)?;
    let block = ConnectionBlock::listening(listener, mode)?;
    let (fd, local_addr) = (block.fd(), block.local_addr());

    readiness.register(fd, Interest::READABLE)?;
    if let Err(err) = registry.insert(block) {
        readiness.deregister(fd);
        return Err(err);
    }
    info!(fd, %local_addr, ?mode, "Listening for connections");
    Ok(local_addr)
}

// ============================================================================
// Accessors
// ============================================================================

impl Server {
    /// Address the endpoint for `mode` is bound to.
    pub fn local_addr(&self, mode: SecurityMode) -> SocketAddr {
        match mode {
            SecurityMode::Plain => self.http_addr,
            SecurityMode::Encrypted => self.https_addr,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.readiness.shutdown_handle()
    }

    /// Number of accepted connections currently open.
    pub fn connection_count(&self) -> usize {
        self.registry
            .iter()
            .filter(|block| block.role() == Role::Accepted)
            .count()
    }

    /// Descriptors of the accepted connections currently open, ascending.
    pub fn connections(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self
            .registry
            .iter()
            .filter(|block| block.role() == Role::Accepted)
            .map(|block| block.fd())
            .collect();
        fds.sort_unstable();
        fds
    }

    /// Connections closed by the event loop so far.
    pub fn closed_count(&self) -> usize {
        self.closed_count
    }

    /// One past the highest descriptor of interest.
    pub fn ceiling(&self) -> RawFd {
        self.readiness.ceiling()
    }
}

// ============================================================================
// Event Loop
// ============================================================================

impl Server {
    /// Runs until a shutdown is requested, then closes everything.
    #[instrument(skip(self))]
    pub fn run(mut self) -> Result<ShutdownReport, Error> {
        info!(http = %self.http_addr, https = %self.https_addr, "Server running");
        loop {
            match self.tick() {
                Ok(Tick::Shutdown) => break,
                Ok(_) => {}
                Err(err) => {
                    error!(?err, "Fatal error in event loop");
                    self.shutdown();
                    return Err(err);
                }
            }
        }
        Ok(self.shutdown())
    }

    /// Waits once and services every ready descriptor.
    ///
    /// Descriptors are visited in ascending order; each one's read side runs
    /// before its write side. Only invariant violations are returned as
    /// errors, everything else closes the one connection it happened on.
    #[instrument(skip(self))]
    pub fn tick(&mut self) -> Result<Tick, Error> {
        let ready = match self.readiness.wait(self.poll_timeout)? {
            WaitOutcome::Timeout => return Ok(Tick::Timeout),
            WaitOutcome::Interrupted => {
                info!("Shutdown requested");
                return Ok(Tick::Shutdown);
            }
            WaitOutcome::Ready(ready) => ready,
        };

        // Descriptors closed earlier in this tick still appear in the snapshot.
        let mut closed = Vec::new();
        for fd in ready.descriptors() {
            if ready.is_readable(fd) {
                self.service_read(fd, &mut closed)?;
            }
            if ready.is_writable(fd) && !closed.contains(&fd) {
                self.service_write(fd, &mut closed)?;
            }
        }
        Ok(Tick::Serviced(ready.count()))
    }

    /// Closes one connection outside the event loop.
    pub fn close_connection(&mut self, fd: RawFd) -> Result<CloseReport, Error> {
        let block = self
            .registry
            .remove(fd)
            .ok_or(Error::UnknownDescriptor { fd })?;
        self.closed_count += 1;
        Ok(block
            .strategy()
            .close(block, CloseReason::Requested, &mut self.readiness))
    }

    /// Closes every block exactly once and releases the TLS context.
    #[instrument(skip(self))]
    pub fn shutdown(self) -> ShutdownReport {
        let Server {
            mut readiness,
            mut registry,
            tls,
            closed_count,
            ..
        } = self;

        let mut closed = Vec::with_capacity(registry.len());
        for fd in registry.descriptors() {
            if let Some(block) = registry.remove(fd) {
                closed.push(block.strategy().close(block, CloseReason::Shutdown, &mut readiness));
            }
        }

        let tls_context_released = Arc::strong_count(&tls) == 1;
        if !tls_context_released {
            warn!("TLS sessions outlived shutdown");
        }
        drop(tls);
        info!(closed = closed.len(), previously_closed = closed_count, "Shut down");

        ShutdownReport {
            closed,
            previously_closed: closed_count,
            tls_context_released,
        }
    }
}

// ============================================================================
// Internal Event Processing
// ============================================================================

impl Server {
    fn service_read(&mut self, fd: RawFd, closed: &mut Vec<RawFd>) -> Result<(), Error> {
        if closed.contains(&fd) {
            return Ok(());
        }
        let Some(block) = self.registry.get_mut(fd) else {
            error!(fd, "Readable descriptor has no connection control block");
            return Err(Error::RegistryDesync { fd });
        };
        let strategy = block.strategy();

        if strategy.role() == Role::Listening {
            match strategy.accept(block, &self.tls) {
                Ok(Some(accepted)) => self.admit(accepted)?,
                Ok(None) => self.readiness.settle(fd, Interest::READABLE),
                Err(err) if err.abandons_admission() => warn!(fd, ?err, "Abandoned accept"),
                Err(err) => return Err(err),
            }
            return Ok(());
        }

        match strategy.receive(block)? {
            Step::Blocked => self.readiness.settle(fd, Interest::READABLE),
            // Re-armed by the write side once the queue has room.
            Step::Busy if !block.accepts_input() => {
                debug!(fd, queued = block.queue.len(), "Receive throttled");
                self.readiness.settle(fd, Interest::READABLE);
            }
            Step::Busy => {}
            Step::Close(reason) => {
                self.close(fd, reason, closed);
                return Ok(());
            }
            Step::Done | Step::Idle => {}
        }

        match strategy.parse(block) {
            Ok(0) => {}
            Ok(queued) => debug!(fd, queued, pending = block.queue.len(), "Queued requests"),
            Err(reason) => {
                warn!(fd, ?reason, "Malformed request");
                self.close(fd, reason, closed);
                return Ok(());
            }
        }
        if block.has_pending_work() {
            self.readiness.arm(fd, Interest::WRITABLE);
        }
        Ok(())
    }

    fn service_write(&mut self, fd: RawFd, closed: &mut Vec<RawFd>) -> Result<(), Error> {
        let Some(block) = self.registry.get_mut(fd) else {
            error!(fd, "Writable descriptor has no connection control block");
            return Err(Error::RegistryDesync { fd });
        };
        let strategy = block.strategy();
        if strategy.role() == Role::Listening {
            self.readiness.settle(fd, Interest::WRITABLE);
            return Ok(());
        }

        match strategy.handle_one(block, self.handler.as_mut()) {
            Handled::Failed(reason) => {
                self.close(fd, reason, closed);
                return Ok(());
            }
            Handled::Responded | Handled::Ignored if block.queue.len() == QUEUE_CAPACITY - 1 => {
                self.readiness.arm(fd, Interest::READABLE);
            }
            _ => {}
        }

        match strategy.send(block)? {
            Step::Blocked => self.readiness.settle(fd, Interest::WRITABLE),
            Step::Close(reason) => self.close(fd, reason, closed),
            Step::Done | Step::Idle | Step::Busy => {
                if !block.has_pending_work() {
                    self.readiness.settle(fd, Interest::WRITABLE);
                }
            }
        }
        Ok(())
    }

    // Registers a freshly accepted block. Resource limits and OS failures
    // drop the new connection; invariant violations are returned.
    fn admit(&mut self, block: ConnectionBlock) -> Result<(), Error> {
        let fd = block.fd();
        if let Err(err) = self
            .readiness
            .register(fd, Interest::READABLE | Interest::WRITABLE)
        {
            if !err.abandons_admission() {
                return Err(err);
            }
            warn!(fd, ?err, "Dropping accepted connection");
            return Ok(());
        }

        let (peer_addr, mode) = (block.peer_addr(), block.mode());
        if let Err(err) = self.registry.insert(block) {
            self.readiness.deregister(fd);
            error!(fd, ?err, "Accepted descriptor is already registered");
            return Err(err);
        }
        if let Some(peer_addr) = peer_addr {
            info!(fd, %peer_addr, ?mode, "Accepted connection");
        }
        Ok(())
    }

    fn close(&mut self, fd: RawFd, reason: CloseReason, closed: &mut Vec<RawFd>) {
        let Some(block) = self.registry.remove(fd) else {
            return;
        };
        block
            .strategy()
            .close(block, reason, &mut self.readiness);
        self.closed_count += 1;
        closed.push(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::INBOUND_CAPACITY;
    use crate::http::{Reply, Request, Response, StatusCode};
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr, TcpStream};
    use std::time::Instant;
    use tempfile::{NamedTempFile, TempDir};

    const SMALLEST_REQUEST: &str = "GET / HTTP/1.1\r\n\r\n";

    struct Site {
        config: ServerConfig,
        _root: TempDir,
        _cert: NamedTempFile,
        _key: NamedTempFile,
    }

    fn site() -> Site {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let mut cert = NamedTempFile::new().unwrap();
        let mut key = NamedTempFile::new().unwrap();
        cert.write_all(certified.cert.pem().as_bytes()).unwrap();
        key.write_all(certified.key_pair.serialize_pem().as_bytes()).unwrap();
        let root = TempDir::new().unwrap();
        let config = ServerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            http_port: 0,
            https_port: 0,
            tls_server_cert: cert.path().to_path_buf(),
            tls_server_key: key.path().to_path_buf(),
            document_root: root.path().to_path_buf(),
            poll_timeout: Duration::from_millis(20),
            poll_capacity: 64,
        };
        Site {
            config,
            _root: root,
            _cert: cert,
            _key: key,
        }
    }

    fn tick_until(server: &mut Server, mut done: impl FnMut(&Server) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(server) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            server.tick().unwrap();
        }
    }

    #[test]
    fn ready_descriptor_without_a_block_is_a_desync() {
        let site = site();
        let mut server = Server::bind(&site.config).unwrap();
        let _client = TcpStream::connect(server.local_addr(SecurityMode::Plain)).unwrap();
        tick_until(&mut server, |s| s.connection_count() == 1);
        let fd = server.connections()[0];

        // Kept alive so the descriptor stays open while it is missing.
        let orphan = server.registry.remove(fd).unwrap();
        server.readiness.arm(fd, Interest::READABLE);

        match server.tick() {
            Err(err @ Error::RegistryDesync { .. }) => {
                assert!(matches!(err, Error::RegistryDesync { fd: missing } if missing == fd));
                assert!(err.is_fatal());
            }
            other => panic!("expected RegistryDesync, got {other:?}"),
        }

        server.readiness.deregister(fd);
        drop(orphan);
        server.shutdown();
    }

    #[test]
    fn non_reading_client_cannot_grow_the_queue_without_bound() {
        let site = site();
        // Large enough that a client which never reads stalls the send.
        let body = vec![b'x'; 4 << 20];
        let mut server = Server::with_handler(&site.config, move |request: &Request| {
            Ok::<_, Error>(Reply::Respond(
                Response::new(request.version, StatusCode::Ok).with_body(body.clone()),
            ))
        })
        .unwrap();

        let client = TcpStream::connect(server.local_addr(SecurityMode::Plain)).unwrap();
        let mut writer = client.try_clone().unwrap();
        let sent = 2000;
        let flood = std::thread::spawn(move || {
            let _ = writer.write_all(SMALLEST_REQUEST.repeat(sent).as_bytes());
        });
        tick_until(&mut server, |s| s.connection_count() == 1);
        let fd = server.connections()[0];

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut idle_ticks = 0;
        while idle_ticks < 10 && Instant::now() < deadline {
            match server.tick().unwrap() {
                Tick::Timeout => idle_ticks += 1,
                _ => idle_ticks = 0,
            }
        }

        // One receive may land on top of a queue one short of the cap.
        let bound = QUEUE_CAPACITY + INBOUND_CAPACITY / SMALLEST_REQUEST.len();
        let queued = server.registry.get_mut(fd).map(|block| block.queue.len()).unwrap();
        assert!(queued <= bound, "{queued} requests queued, bound is {bound}");
        assert!(queued < sent);

        server.shutdown();
        drop(client);
        flood.join().unwrap();
    }
}
