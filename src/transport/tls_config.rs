use crate::error::Error;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::{InconsistentKeys, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Loads the process-wide TLS context.
///
/// The private key must belong to the first certificate of the chain. A
/// mismatch is a startup fault, reported before any listener is bound.
pub(crate) fn load_tls_server_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<ServerConfig>, Error> {
    let cert_chain = load_certificates(cert_path)?;
    let key = load_private_key(key_path)?;

    check_key_matches(&cert_chain, &key)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;

    info!(cert = %cert_path.display(), "Loaded TLS server context");
    Ok(Arc::new(config))
}

fn load_certificates(cert_path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let cert_file = File::open(cert_path).map_err(|e| Error::TlsCertificateLoad {
        path: cert_path.display().to_string(),
        source: e,
    })?;
    let cert_chain: Vec<CertificateDer> = certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse certificates: {e}")))?;

    if cert_chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(
            "No certificates found in file".to_string(),
        ));
    }
    Ok(cert_chain)
}

fn load_private_key(key_path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let key_file = File::open(key_path).map_err(|e| Error::TlsKeyLoad {
        path: key_path.display().to_string(),
        source: e,
    })?;
    private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey("No private key found in file".to_string()))
}

fn check_key_matches(
    cert_chain: &[CertificateDer<'static>],
    key: &PrivateKeyDer<'static>,
) -> Result<(), Error> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)
        .map_err(|e| Error::TlsInvalidKey(e.to_string()))?;
    match CertifiedKey::new(cert_chain.to_vec(), signing_key).keys_match() {
        Ok(()) => Ok(()),
        // The key type cannot report its public half, so there is nothing to
        // compare against.
        Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {
            debug!("Private key cannot be checked against the certificate");
            Ok(())
        }
        Err(e) => Err(Error::TlsKeyMismatch(e.to_string())),
    }
}
