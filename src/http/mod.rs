//! HTTP request parsing and handling.
//!
//! The event loop only sees this module through [`parse_into`], which turns
//! received bytes into queued [`Request`]s, and the [`RequestHandler`] trait,
//! which turns one request into at most one [`Response`].

mod parser;
mod request;
mod response;
mod static_files;

pub use parser::{parse_into, ParseCursor, ParseError};
pub use request::{Method, Request, Version};
pub use response::{Response, StatusCode};
pub use static_files::{content_type, StaticFiles};

use crate::error::Error;

/// What a handler wants done with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Send this response.
    Respond(Response),
    /// Send nothing and move on to the next request.
    Ignore,
}

/// Answers one request at a time, in the order they arrived on a connection.
///
/// An `Err` closes the connection the request came from. The request is
/// dropped either way.
pub trait RequestHandler: Send {
    fn handle(&mut self, request: &Request) -> Result<Reply, Error>;
}

impl<F> RequestHandler for F
where
    F: FnMut(&Request) -> Result<Reply, Error> + Send,
{
    fn handle(&mut self, request: &Request) -> Result<Reply, Error> {
        self(request)
    }
}
