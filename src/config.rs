//! Server configuration.
//!
//! Values are read from a [`config::Config`] with namespaced lookup: for a
//! server named `edge`, the key `edge.http_port` wins over `http_port`, which
//! wins over the built-in default.
//!
//! ```toml
//! http_port = 8080
//! https_port = 8443
//! tls_server_cert = "pki/server.crt"
//! tls_server_key = "pki/server.key"
//! document_root = "static_site"
//! poll_timeout_ms = 1000
//! ```

use crate::error::Error;
use ::config::Config;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_HTTP_PORT: u16 = 9999;
pub const DEFAULT_HTTPS_PORT: u16 = 9998;
pub const DEFAULT_DOCUMENT_ROOT: &str = "static_site";
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_POLL_CAPACITY: usize = 256;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_u16(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u16, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u16>(key))
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

// Missing keys fall back to the default, anything else (wrong type, bad
// value) is reported.
fn or_default<T>(result: Result<T, config::ConfigError>, default: T) -> Result<T, Error> {
    match result {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => Ok(default),
        Err(err) => Err(err.into()),
    }
}

/// Settings for one [`Server`](crate::Server) instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address both listening endpoints bind to.
    pub bind_address: IpAddr,
    /// Plaintext endpoint port. `0` asks the OS for a free port.
    pub http_port: u16,
    /// Encrypted endpoint port. `0` asks the OS for a free port.
    pub https_port: u16,
    /// PEM certificate chain for the encrypted endpoint.
    pub tls_server_cert: PathBuf,
    /// PEM private key matching the first certificate of the chain.
    pub tls_server_key: PathBuf,
    /// Directory served by the static file handler.
    pub document_root: PathBuf,
    /// Upper bound on a single readiness wait.
    pub poll_timeout: Duration,
    /// Number of readiness events fetched per wait.
    pub poll_capacity: usize,
}

impl ServerConfig {
    /// Reads the configuration without a namespace.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads the configuration, preferring keys under `name.`.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let bind_address = or_default(
            get_namespaced_string(config, name, "bind_address"),
            DEFAULT_BIND_ADDRESS.to_string(),
        )?;
        let bind_address = bind_address
            .parse::<IpAddr>()
            .map_err(|_| Error::InvalidAddress(bind_address.clone()))?;

        let (tls_server_cert, tls_server_key) = match (
            get_namespaced_string(config, name, "tls_server_cert"),
            get_namespaced_string(config, name, "tls_server_key"),
        ) {
            (Ok(cert), Ok(key)) => (PathBuf::from(cert), PathBuf::from(key)),
            (Err(config::ConfigError::NotFound(_)), _)
            | (_, Err(config::ConfigError::NotFound(_))) => {
                return Err(Error::TlsServerConfigMissing)
            }
            (Err(err), _) | (_, Err(err)) => return Err(err.into()),
        };

        let server_config = Self {
            bind_address,
            http_port: or_default(
                get_namespaced_u16(config, name, "http_port"),
                DEFAULT_HTTP_PORT,
            )?,
            https_port: or_default(
                get_namespaced_u16(config, name, "https_port"),
                DEFAULT_HTTPS_PORT,
            )?,
            tls_server_cert,
            tls_server_key,
            document_root: PathBuf::from(or_default(
                get_namespaced_string(config, name, "document_root"),
                DEFAULT_DOCUMENT_ROOT.to_string(),
            )?),
            poll_timeout: Duration::from_millis(or_default(
                get_namespaced_u64(config, name, "poll_timeout_ms"),
                DEFAULT_POLL_TIMEOUT_MS,
            )?),
            poll_capacity: or_default(
                get_namespaced_usize(config, name, "poll_capacity"),
                DEFAULT_POLL_CAPACITY,
            )?,
        };
        server_config.validate()?;
        Ok(server_config)
    }

    /// Checks values that would make the event loop misbehave.
    pub fn validate(&self) -> Result<(), Error> {
        if self.poll_timeout.is_zero() {
            return Err(Error::InvalidConfig {
                key: "poll_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.poll_capacity == 0 {
            return Err(Error::InvalidConfig {
                key: "poll_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.http_port != 0 && self.http_port == self.https_port {
            return Err(Error::InvalidConfig {
                key: "https_port",
                reason: format!("collides with http_port {}", self.http_port),
            });
        }
        Ok(())
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.http_port)
    }

    pub fn https_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.https_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> config::builder::ConfigBuilder<config::builder::DefaultState> {
        Config::builder()
            .set_default("tls_server_cert", "cert.pem")
            .unwrap()
            .set_default("tls_server_key", "key.pem")
            .unwrap()
    }

    #[test]
    fn defaults_apply_when_keys_are_missing() {
        let config = base().build().unwrap();
        let server = ServerConfig::from_config(&config).unwrap();
        assert_eq!(server.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(server.https_port, DEFAULT_HTTPS_PORT);
        assert_eq!(server.document_root, PathBuf::from(DEFAULT_DOCUMENT_ROOT));
        assert_eq!(server.poll_timeout, Duration::from_millis(1000));
        assert_eq!(server.http_addr().to_string(), "0.0.0.0:9999");
    }

    #[test]
    fn namespaced_keys_take_priority() {
        let config = base()
            .set_default("http_port", 8080)
            .unwrap()
            .set_default("edge.http_port", 8081)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(ServerConfig::from_config_named(&config, "edge").unwrap().http_port, 8081);
        assert_eq!(ServerConfig::from_config_named(&config, "core").unwrap().http_port, 8080);
    }

    #[test]
    fn missing_tls_material_is_a_startup_fault() {
        let config = Config::builder().build().unwrap();
        assert!(matches!(
            ServerConfig::from_config(&config),
            Err(Error::TlsServerConfigMissing)
        ));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = base().set_default("poll_timeout_ms", 0).unwrap().build().unwrap();
        assert!(matches!(
            ServerConfig::from_config(&config),
            Err(Error::InvalidConfig { key: "poll_timeout_ms", .. })
        ));
    }

    #[test]
    fn equal_ports_are_rejected_unless_ephemeral() {
        let clash = base()
            .set_default("http_port", 7000)
            .unwrap()
            .set_default("https_port", 7000)
            .unwrap()
            .build()
            .unwrap();
        assert!(ServerConfig::from_config(&clash).is_err());

        let ephemeral = base()
            .set_default("http_port", 0)
            .unwrap()
            .set_default("https_port", 0)
            .unwrap()
            .build()
            .unwrap();
        assert!(ServerConfig::from_config(&ephemeral).is_ok());
    }

    #[test]
    fn bad_bind_address_is_reported() {
        let config = base()
            .set_default("bind_address", "not-an-ip")
            .unwrap()
            .build()
            .unwrap();
        assert!(matches!(
            ServerConfig::from_config(&config),
            Err(Error::InvalidAddress(_))
        ));
    }
}
