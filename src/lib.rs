//! liso - A single-threaded, readiness-driven HTTP and HTTPS static file server
//!
//! One thread multiplexes a plaintext and a TLS listening endpoint plus every
//! connection accepted on them. Each connection carries its own control block
//! with fixed-size buffers, a parser cursor that survives partial reads, and a
//! queue of pipelined requests that are answered strictly in arrival order.
//!
//! See [`Server`] for the entry point and [`ServerConfig`] for the
//! configuration keys.

// Internal-only modules
pub(crate) mod config;
pub(crate) mod connection;
pub(crate) mod error;
pub(crate) mod http;
pub(crate) mod readiness;
pub(crate) mod registry;
pub(crate) mod server;
pub(crate) mod transport;

// These are the intended public API
pub use config::ServerConfig;
pub use error::Error;
pub use http::{
    content_type, Method, ParseError, Reply, Request, RequestHandler, Response, StaticFiles,
    StatusCode, Version,
};
pub use readiness::{InterestSet, ShutdownHandle, MAX_DESCRIPTORS};
pub use server::{Server, ShutdownReport, Tick};
pub use transport::{CloseReason, CloseReport, Role, SecurityMode, Teardown};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::ServerConfig;
    pub use crate::error::Error;
    pub use crate::http::{
        Method, Reply, Request, RequestHandler, Response, StaticFiles, StatusCode, Version,
    };
    pub use crate::readiness::ShutdownHandle;
    pub use crate::server::{Server, ShutdownReport, Tick};
    pub use crate::transport::{CloseReason, SecurityMode};
}
