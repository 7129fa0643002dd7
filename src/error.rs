use std::os::fd::RawFd;
use thiserror::Error;

/// The error type for liso operations.
///
/// Errors fall into four groups. Startup faults (bind failures, bad TLS
/// material, invalid configuration) abort before the event loop is entered.
/// Invariant violations (registry and readiness sets out of sync, a descriptor
/// registered twice) abort the running loop. Resource exhaustion abandons the
/// one operation that hit it. Per-connection faults such as a peer reset or a
/// malformed request never show up here at all: they are reported as a
/// [`CloseReason`](crate::CloseReason) and resolved by closing that
/// connection.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Readiness Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address '{0}'")]
    InvalidAddress(String),

    /// The readiness primitive failed for a reason other than interruption.
    #[error("Poll error: {0}")]
    PollError(String),

    /// The descriptor is outside the compile-time bound of the interest sets.
    #[error("Descriptor {fd} exceeds the descriptor limit of {limit}")]
    DescriptorLimit { fd: RawFd, limit: usize },

    /// Allocating a control block or one of its buffers failed.
    #[error("Out of memory allocating {what}")]
    OutOfMemory { what: &'static str },

    // ============================================================================
    // Invariant Violations
    // ============================================================================

    /// A descriptor reported ready has no control block in the registry.
    #[error("Descriptor {fd} is ready but has no connection control block")]
    RegistryDesync { fd: RawFd },

    /// A control block was inserted for a descriptor that already has one.
    #[error("Descriptor {fd} already has a connection control block")]
    DuplicateDescriptor { fd: RawFd },

    /// A close or lookup was requested for a descriptor that is not registered.
    #[error("Descriptor {fd} has no connection control block")]
    UnknownDescriptor { fd: RawFd },

    /// A transport operation was invoked on a control block of the wrong role.
    #[error("Operation '{operation}' is not valid for descriptor {fd}")]
    RoleMismatch { fd: RawFd, operation: &'static str },

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// The private key does not belong to the leaf certificate.
    #[error("Certificate and private key do not match: {0}")]
    TlsKeyMismatch(String),

    /// Failed to build TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// The encrypted endpoint needs both `tls_server_cert` and
    /// `tls_server_key`.
    #[error("TLS server configuration not provided - tls_server_cert and tls_server_key are required")]
    TlsServerConfigMissing,

    /// Creating a TLS session for an accepted connection failed.
    #[error("TLS session setup failed: {0}")]
    TlsSession(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A configuration value is out of range or inconsistent.
    #[error("Invalid configuration value for '{key}': {reason}")]
    InvalidConfig { key: &'static str, reason: String },
}

impl Error {
    /// Returns true for errors that must stop the event loop.
    ///
    /// Startup faults and invariant violations are fatal. Resource exhaustion
    /// only abandons the operation that ran into it.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::DescriptorLimit { .. } | Error::OutOfMemory { .. } | Error::TlsSession(_)
        )
    }

    /// Returns true for errors that only cost the connection being accepted.
    ///
    /// Covers everything [`is_fatal`](Self::is_fatal) lets through, plus OS
    /// failures while the new descriptor is set up (`epoll_ctl` running out of
    /// memory, `getsockname` failing). A duplicate descriptor is still fatal.
    pub fn abandons_admission(&self) -> bool {
        !self.is_fatal() || matches!(self, Error::Io(_))
    }
}
