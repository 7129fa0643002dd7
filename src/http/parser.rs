//! Pipelined request parser.
//!
//! Received bytes are moved from a connection's inbound buffer into its
//! processing buffer, and every complete request found there is queued in
//! arrival order. A request cut off at the end of the buffer stays put, along
//! with the cursor describing how far it has been scanned, until the next
//! receive completes it.
//!
//! ```text
//!   processing buffer
//!   +-----------------+--------------------------+---------+
//!   | queued requests | header block | body ...  |  free   |
//!   +-----------------+--------------------------+---------+
//!   0              msg_end      body_start   scan_from
//! ```
//!
//! Queued bytes are compacted away after every pass, so `msg_end` is back at
//! zero whenever the parser returns.

use super::request::{Method, Request, Version};
use crate::connection::{InboundBuffer, ProcessingBuffer, PROCESSING_CAPACITY};

use std::collections::VecDeque;
use thiserror::Error;
use tracing::trace;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Input that no amount of further bytes can turn into a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Request does not fit in {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Invalid request line: {0:?}")]
    InvalidRequestLine(String),

    #[error("Unsupported protocol version: {0:?}")]
    UnsupportedVersion(String),

    #[error("Invalid header: {0:?}")]
    InvalidHeader(String),

    #[error("Invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("Transfer-Encoding is not supported")]
    TransferEncoding,

    #[error("Request head is not valid UTF-8")]
    InvalidEncoding,
}

/// Scan state for the request being assembled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseCursor {
    scan_from: usize,
    body_start: Option<usize>,
    msg_end: usize,
}

impl ParseCursor {
    fn rebase(&mut self, consumed: usize) {
        self.scan_from = self.scan_from.saturating_sub(consumed);
        self.body_start = self.body_start.map(|start| start - consumed);
        self.msg_end -= consumed;
    }

    fn complete(&mut self, end: usize) {
        self.msg_end = end;
        self.scan_from = end;
        self.body_start = None;
    }
}

/// Drains `inbound` into `processing` and queues every complete request.
///
/// Returns the number of requests queued. Safe to call with an empty inbound
/// buffer. On error the connection's buffers are left as they were at the
/// point of failure; the connection is expected to be closed.
pub fn parse_into(
    inbound: &mut InboundBuffer,
    processing: &mut ProcessingBuffer,
    cursor: &mut ParseCursor,
    queue: &mut VecDeque<Request>,
) -> Result<usize, ParseError> {
    let mut queued = 0;
    loop {
        let moved = processing.append(inbound.as_slice());
        inbound.consume(moved);

        queued += extract(processing.as_slice(), cursor, queue)?;

        if cursor.msg_end > 0 {
            let consumed = cursor.msg_end;
            processing.discard(consumed);
            cursor.rebase(consumed);
        }

        if inbound.is_empty() {
            break;
        }
        if processing.room() == 0 {
            return Err(ParseError::TooLarge {
                limit: PROCESSING_CAPACITY,
            });
        }
    }
    if queued > 0 {
        trace!(queued, carried = processing.len(), "Parsed requests");
    }
    Ok(queued)
}

// Queues every complete request in `data` past the cursor.
fn extract(
    data: &[u8],
    cursor: &mut ParseCursor,
    queue: &mut VecDeque<Request>,
) -> Result<usize, ParseError> {
    let mut queued = 0;
    loop {
        let body_start = match cursor.body_start {
            Some(start) => start,
            None => {
                // Empty lines between pipelined requests are ignored.
                while data[cursor.msg_end..].starts_with(b"\r\n") {
                    cursor.complete(cursor.msg_end + 2);
                }
                let from = cursor.scan_from.max(cursor.msg_end);
                match find(&data[from..], HEADER_END) {
                    Some(offset) => {
                        let start = from + offset + HEADER_END.len();
                        cursor.body_start = Some(start);
                        start
                    }
                    None => {
                        // The terminator may straddle the end of the data.
                        cursor.scan_from = data
                            .len()
                            .saturating_sub(HEADER_END.len() - 1)
                            .max(cursor.msg_end);
                        if data.len() - cursor.msg_end >= PROCESSING_CAPACITY {
                            return Err(ParseError::TooLarge {
                                limit: PROCESSING_CAPACITY,
                            });
                        }
                        return Ok(queued);
                    }
                }
            }
        };

        let head = &data[cursor.msg_end..body_start - HEADER_END.len()];
        let (mut request, content_length) = parse_head(head)?;

        let too_large = ParseError::TooLarge {
            limit: PROCESSING_CAPACITY,
        };
        let msg_end = body_start.checked_add(content_length).ok_or(too_large.clone())?;
        if msg_end - cursor.msg_end > PROCESSING_CAPACITY {
            return Err(too_large);
        }
        if data.len() < msg_end {
            return Ok(queued);
        }

        request.body = data[body_start..msg_end].to_vec();
        queue.push_back(request);
        cursor.complete(msg_end);
        queued += 1;
    }
}

fn parse_head(head: &[u8]) -> Result<(Request, usize), ParseError> {
    let head = std::str::from_utf8(head).map_err(|_| ParseError::InvalidEncoding)?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::InvalidRequestLine(request_line.to_string()));
    };
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(ParseError::InvalidRequestLine(request_line.to_string()));
    }
    if !(target.starts_with('/') || target == "*") {
        return Err(ParseError::InvalidRequestLine(request_line.to_string()));
    }
    let version = Version::from_token(version)
        .ok_or_else(|| ParseError::UnsupportedVersion(version.to_string()))?;

    let mut headers = Vec::new();
    let mut content_length: Option<usize> = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(ParseError::InvalidHeader(line.to_string()));
        };
        if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
            return Err(ParseError::InvalidHeader(line.to_string()));
        }
        let value = value.trim();

        if name.eq_ignore_ascii_case("transfer-encoding") {
            return Err(ParseError::TransferEncoding);
        }
        if name.eq_ignore_ascii_case("content-length") {
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::InvalidContentLength(value.to_string()));
            }
            // Digits only, so a parse failure is an overflow.
            let length = value.parse::<usize>().map_err(|_| ParseError::TooLarge {
                limit: PROCESSING_CAPACITY,
            })?;
            if length > PROCESSING_CAPACITY {
                return Err(ParseError::TooLarge {
                    limit: PROCESSING_CAPACITY,
                });
            }
            if content_length.is_some_and(|previous| previous != length) {
                return Err(ParseError::InvalidContentLength(value.to_string()));
            }
            content_length = Some(length);
        }
        headers.push((name.to_string(), value.to_string()));
    }

    let request = Request {
        method: Method::from_token(method),
        target: target.to_string(),
        version,
        headers,
        body: Vec::new(),
    };
    Ok((request, content_length.unwrap_or(0)))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
