//! Per-connection byte buffers.
//!
//! The inbound buffer holds exactly one read and is either empty or full;
//! nothing is read into it until the parser has drained it. The processing
//! buffer carries bytes across reads so a request split over several reads
//! survives until it is complete. The outbound buffer owns one response at a
//! time and is released once the last byte has been written.

use crate::error::Error;

/// Capacity of a single read.
pub const INBOUND_CAPACITY: usize = 4096;
/// Capacity of the buffer that accumulates pipelined requests.
pub const PROCESSING_CAPACITY: usize = 2 * INBOUND_CAPACITY;

// ============================================================================
// Inbound Buffer
// ============================================================================

#[derive(Debug)]
pub struct InboundBuffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl InboundBuffer {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            data: zeroed(INBOUND_CAPACITY, "inbound buffer")?,
            start: 0,
            end: 0,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// The unread bytes of the last receive.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Lends the whole buffer to a receive. Returns `None` while unread bytes
    /// remain, which is the backpressure point for a connection.
    pub fn spare(&mut self) -> Option<&mut [u8]> {
        if self.is_empty() {
            self.start = 0;
            self.end = 0;
            Some(&mut self.data[..])
        } else {
            None
        }
    }

    /// Records how many bytes the receive placed in the buffer.
    pub fn filled(&mut self, len: usize) {
        debug_assert!(self.is_empty());
        self.start = 0;
        self.end = len.min(self.data.len());
    }

    /// Marks the first `len` unread bytes as consumed.
    pub fn consume(&mut self, len: usize) {
        self.start = (self.start + len).min(self.end);
        if self.is_empty() {
            self.clear();
        }
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}

// ============================================================================
// Processing Buffer
// ============================================================================

#[derive(Debug)]
pub struct ProcessingBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl ProcessingBuffer {
    pub fn new() -> Result<Self, Error> {
        let mut data = Vec::new();
        data.try_reserve_exact(PROCESSING_CAPACITY)
            .map_err(|_| Error::OutOfMemory {
                what: "processing buffer",
            })?;
        Ok(Self {
            data,
            capacity: PROCESSING_CAPACITY,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn room(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Appends as much of `bytes` as fits and returns how much that was.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.room());
        self.data.extend_from_slice(&bytes[..take]);
        take
    }

    /// Drops the first `len` bytes, shifting the rest to the front.
    pub fn discard(&mut self, len: usize) {
        let len = len.min(self.data.len());
        self.data.drain(..len);
    }
}

// ============================================================================
// Outbound Buffer
// ============================================================================

/// A response being written. Its presence on a connection means a send is in
/// progress; the handler may not produce another response until it is gone.
#[derive(Debug)]
pub struct Outbound {
    bytes: Vec<u8>,
    written: usize,
}

impl Outbound {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, written: 0 }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.bytes[self.written..]
    }

    pub fn advance(&mut self, len: usize) {
        self.written = (self.written + len).min(self.bytes.len());
    }

    pub fn is_complete(&self) -> bool {
        self.written == self.bytes.len()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

fn zeroed(len: usize, what: &'static str) -> Result<Box<[u8]>, Error> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory { what })?;
    data.resize(len, 0);
    Ok(data.into_boxed_slice())
}
