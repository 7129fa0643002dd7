//! Readiness set manager.
//!
//! Owns the read and write interest sets, the ceiling (one past the highest
//! descriptor of interest) and the `mio` poller that waits on them. `mio` is
//! edge-triggered, so readiness reported by the poller is latched per
//! descriptor until the event loop says the descriptor has nothing more to give
//! (`settle`). This gives the loop the level-triggered view it is written
//! against: a descriptor stays ready across ticks until an operation on it
//! would block.

use crate::error::Error;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Compile-time bound on descriptor numbers the interest sets may hold.
pub const MAX_DESCRIPTORS: usize = 1024;

// Descriptors are used as tokens directly, so the waker sits above the bound.
const WAKE_TOKEN: Token = Token(usize::MAX);

// ============================================================================
// Interest Sets
// ============================================================================

/// The two bounded interest sets and their ceiling.
///
/// Pure bookkeeping: nothing here touches the OS.
#[derive(Debug, Default, Clone)]
pub struct InterestSet {
    read: BTreeSet<RawFd>,
    write: BTreeSet<RawFd>,
    ceiling: RawFd,
}

impl InterestSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `fd` to the sets selected by `interest` and raises the ceiling.
    pub fn insert(&mut self, fd: RawFd, interest: Interest) -> Result<(), Error> {
        if fd < 0 || fd as usize >= MAX_DESCRIPTORS {
            return Err(Error::DescriptorLimit {
                fd,
                limit: MAX_DESCRIPTORS,
            });
        }
        if interest.is_readable() {
            self.read.insert(fd);
        }
        if interest.is_writable() {
            self.write.insert(fd);
        }
        if fd >= self.ceiling {
            self.ceiling = fd + 1;
        }
        Ok(())
    }

    /// Removes `fd` from both sets. Returns false if it was in neither.
    ///
    /// When `fd` was the highest member the ceiling is re-derived by scanning
    /// down to the next member of either set.
    pub fn remove(&mut self, fd: RawFd) -> bool {
        let was_read = self.read.remove(&fd);
        let was_write = self.write.remove(&fd);
        if fd == self.ceiling - 1 {
            let mut candidate = fd - 1;
            while candidate >= 0
                && !self.read.contains(&candidate)
                && !self.write.contains(&candidate)
            {
                candidate -= 1;
            }
            self.ceiling = candidate + 1;
            trace!(fd, ceiling = self.ceiling, "Re-derived ceiling");
        }
        was_read || was_write
    }

    pub fn ceiling(&self) -> RawFd {
        self.ceiling
    }

    pub fn wants_read(&self, fd: RawFd) -> bool {
        self.read.contains(&fd)
    }

    pub fn wants_write(&self, fd: RawFd) -> bool {
        self.write.contains(&fd)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.wants_read(fd) || self.wants_write(fd)
    }

    pub fn len(&self) -> usize {
        self.read.union(&self.write).count()
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }
}

// ============================================================================
// Wait Results
// ============================================================================

/// Snapshot of the descriptors ready at the end of one wait.
///
/// Both lists are in ascending descriptor order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadySets {
    pub readable: Vec<RawFd>,
    pub writable: Vec<RawFd>,
}

impl ReadySets {
    /// Number of (descriptor, direction) pairs that are ready.
    pub fn count(&self) -> usize {
        self.readable.len() + self.writable.len()
    }

    /// Every ready descriptor once, ascending.
    pub fn descriptors(&self) -> Vec<RawFd> {
        let all: BTreeSet<RawFd> = self
            .readable
            .iter()
            .chain(self.writable.iter())
            .copied()
            .collect();
        all.into_iter().collect()
    }

    pub fn is_readable(&self, fd: RawFd) -> bool {
        self.readable.binary_search(&fd).is_ok()
    }

    pub fn is_writable(&self, fd: RawFd) -> bool {
        self.writable.binary_search(&fd).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Nothing became ready before the timeout.
    Timeout,
    Ready(ReadySets),
    /// The wait was cut short by a signal or a shutdown request.
    Interrupted,
}

// ============================================================================
// Shutdown Handle
// ============================================================================

/// Thread-safe handle that interrupts the event loop's wait.
///
/// The next wait after [`ShutdownHandle::request`] is interrupted, and the
/// event loop shuts down.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Err(err) = self.waker.wake() {
            warn!(?err, "Failed to wake event loop for shutdown");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Readiness Manager
// ============================================================================

pub(crate) struct Readiness {
    poll: Poll,
    events: Events,
    interest: InterestSet,
    read_ready: BTreeSet<RawFd>,
    write_ready: BTreeSet<RawFd>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl Readiness {
    pub fn new(poll_capacity: usize) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(poll_capacity),
            interest: InterestSet::new(),
            read_ready: BTreeSet::new(),
            write_ready: BTreeSet::new(),
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: self.waker.clone(),
            requested: self.shutdown.clone(),
        }
    }

    pub fn ceiling(&self) -> RawFd {
        self.interest.ceiling()
    }

    /// Adds `fd` to the interest sets and to the poller.
    pub fn register(&mut self, fd: RawFd, interest: Interest) -> Result<(), Error> {
        if self.interest.contains(fd) {
            return Err(Error::DuplicateDescriptor { fd });
        }
        self.interest.insert(fd, interest)?;
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
        {
            self.interest.remove(fd);
            return Err(err.into());
        }
        debug!(fd, ceiling = self.interest.ceiling(), "Registered descriptor");
        Ok(())
    }

    /// Drops every trace of `fd`: interest, latched readiness and the poller
    /// registration. Must run before the descriptor is closed.
    pub fn deregister(&mut self, fd: RawFd) -> bool {
        self.read_ready.remove(&fd);
        self.write_ready.remove(&fd);
        let known = self.interest.remove(fd);
        if known {
            if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                warn!(fd, ?err, "Failed to deregister descriptor from poller");
            }
            debug!(fd, ceiling = self.interest.ceiling(), "Deregistered descriptor");
        }
        known
    }

    /// Clears the latched readiness of `fd` for the given direction(s).
    pub fn settle(&mut self, fd: RawFd, interest: Interest) {
        if interest.is_readable() {
            self.read_ready.remove(&fd);
        }
        if interest.is_writable() {
            self.write_ready.remove(&fd);
        }
    }

    /// Marks `fd` ready without waiting for the poller, e.g. because new work
    /// was queued on a socket that is already known to be writable.
    pub fn arm(&mut self, fd: RawFd, interest: Interest) {
        if interest.is_readable() && self.interest.wants_read(fd) {
            self.read_ready.insert(fd);
        }
        if interest.is_writable() && self.interest.wants_write(fd) {
            self.write_ready.insert(fd);
        }
    }

    /// Blocks for at most `timeout` and returns the ready descriptors.
    ///
    /// Returns immediately when some descriptor is still latched from an
    /// earlier tick.
    pub fn wait(&mut self, timeout: Duration) -> Result<WaitOutcome, Error> {
        let timeout = if self.read_ready.is_empty() && self.write_ready.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => {
                debug!("Wait interrupted by signal");
                return Ok(WaitOutcome::Interrupted);
            }
            Err(err) => return Err(Error::PollError(err.to_string())),
        }

        let mut interrupted = false;
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                interrupted |= self.shutdown.load(Ordering::SeqCst);
                continue;
            }
            let Token(token) = event.token();
            let fd = token as RawFd;
            // Errors and hang-ups surface through the next read or write.
            if (event.is_readable() || event.is_read_closed() || event.is_error())
                && self.interest.wants_read(fd)
            {
                self.read_ready.insert(fd);
            }
            if (event.is_writable() || event.is_write_closed() || event.is_error())
                && self.interest.wants_write(fd)
            {
                self.write_ready.insert(fd);
            }
        }

        if interrupted || self.shutdown.load(Ordering::SeqCst) {
            return Ok(WaitOutcome::Interrupted);
        }
        if self.read_ready.is_empty() && self.write_ready.is_empty() {
            return Ok(WaitOutcome::Timeout);
        }

        let ready = ReadySets {
            readable: self.read_ready.iter().copied().collect(),
            writable: self.write_ready.iter().copied().collect(),
        };
        trace!(count = ready.count(), "Readiness snapshot");
        Ok(WaitOutcome::Ready(ready))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_tracks_highest_descriptor() {
        let mut set = InterestSet::new();
        set.insert(3, Interest::READABLE).unwrap();
        set.insert(5, Interest::READABLE | Interest::WRITABLE).unwrap();
        set.insert(9, Interest::WRITABLE).unwrap();
        assert_eq!(set.ceiling(), 10);

        assert!(set.remove(9));
        assert_eq!(set.ceiling(), 6);
    }

    #[test]
    fn removing_a_lower_descriptor_keeps_the_ceiling() {
        let mut set = InterestSet::new();
        set.insert(3, Interest::READABLE).unwrap();
        set.insert(9, Interest::READABLE).unwrap();
        set.remove(3);
        assert_eq!(set.ceiling(), 10);
        assert!(!set.contains(3));
    }

    #[test]
    fn removing_the_last_descriptor_resets_the_ceiling() {
        let mut set = InterestSet::new();
        set.insert(4, Interest::READABLE).unwrap();
        set.remove(4);
        assert_eq!(set.ceiling(), 0);
        assert!(set.is_empty());
    }

    #[test]
    fn removing_an_unknown_descriptor_reports_false() {
        let mut set = InterestSet::new();
        set.insert(4, Interest::READABLE).unwrap();
        assert!(!set.remove(7));
        assert_eq!(set.ceiling(), 5);
    }

    #[test]
    fn descriptors_beyond_the_bound_are_refused() {
        let mut set = InterestSet::new();
        let fd = MAX_DESCRIPTORS as RawFd;
        assert!(matches!(
            set.insert(fd, Interest::READABLE),
            Err(Error::DescriptorLimit { .. })
        ));
        assert_eq!(set.ceiling(), 0);
    }

    #[test]
    fn ready_sets_merge_in_ascending_order() {
        let ready = ReadySets {
            readable: vec![3, 8],
            writable: vec![5, 8],
        };
        assert_eq!(ready.descriptors(), vec![3, 5, 8]);
        assert_eq!(ready.count(), 4);
        assert!(ready.is_readable(8) && ready.is_writable(8));
        assert!(!ready.is_writable(3));
    }

    #[test]
    fn wait_times_out_when_nothing_is_registered() {
        let mut readiness = Readiness::new(16).unwrap();
        let outcome = readiness.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(outcome, WaitOutcome::Timeout);
    }

    #[test]
    fn shutdown_request_interrupts_the_wait() {
        let mut readiness = Readiness::new(16).unwrap();
        let handle = readiness.shutdown_handle();
        handle.request();
        assert!(handle.is_requested());
        let outcome = readiness.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, WaitOutcome::Interrupted);
    }

    #[test]
    fn latched_readiness_survives_until_settled() {
        let mut readiness = Readiness::new(16).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&client);

        readiness
            .register(fd, Interest::READABLE | Interest::WRITABLE)
            .unwrap();
        let WaitOutcome::Ready(first) = readiness.wait(Duration::from_secs(1)).unwrap() else {
            panic!("connected socket should be writable");
        };
        assert!(first.is_writable(fd));

        // No new edge, but the latch keeps the descriptor ready.
        let WaitOutcome::Ready(second) = readiness.wait(Duration::from_millis(10)).unwrap() else {
            panic!("latched descriptor should still be ready");
        };
        assert!(second.is_writable(fd));

        readiness.settle(fd, Interest::WRITABLE);
        assert_eq!(
            readiness.wait(Duration::from_millis(10)).unwrap(),
            WaitOutcome::Timeout
        );

        readiness.arm(fd, Interest::WRITABLE);
        let WaitOutcome::Ready(third) = readiness.wait(Duration::from_millis(10)).unwrap() else {
            panic!("armed descriptor should be ready");
        };
        assert!(third.is_writable(fd));

        assert!(readiness.deregister(fd));
        assert_eq!(readiness.ceiling(), 0);
    }
}
