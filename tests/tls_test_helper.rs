use liso::ServerConfig;
use rustls::pki_types::{CertificateDer, ServerName};
use std::io::{BufRead, Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

pub const INDEX_HTML: &str = "<html><body><h1>liso</h1></body></html>\n";
pub const STYLE_CSS: &str = "body { margin: 0; }\n";

/// Holds the document root and the temporary certificate files; everything
/// is removed on drop.
pub struct TestSite {
    root: TempDir,
    cert_file: NamedTempFile,
    key_file: NamedTempFile,
    cert_der: CertificateDer<'static>,
}

impl TestSite {
    /// Document root with `index.html` and `style.css`, plus a matching
    /// self-signed certificate and key for "localhost".
    pub fn new() -> Self {
        let certified_key = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let key_pem = certified_key.key_pair.serialize_pem();
        Self::with_material(certified_key.cert, &key_pem)
    }

    /// Same site, but the key file belongs to a different certificate.
    pub fn with_mismatched_key() -> Self {
        let certified_key = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let other = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        Self::with_material(certified_key.cert, &other.key_pair.serialize_pem())
    }

    fn with_material(cert: rcgen::Certificate, key_pem: &str) -> Self {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("index.html"), INDEX_HTML).unwrap();
        std::fs::write(root.path().join("style.css"), STYLE_CSS).unwrap();

        let mut cert_file = NamedTempFile::new().unwrap();
        let mut key_file = NamedTempFile::new().unwrap();
        cert_file.write_all(cert.pem().as_bytes()).unwrap();
        key_file.write_all(key_pem.as_bytes()).unwrap();
        cert_file.flush().unwrap();
        key_file.flush().unwrap();

        Self {
            root,
            cert_file,
            key_file,
            cert_der: cert.der().clone(),
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Loopback config with ephemeral ports and a short poll timeout.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            http_port: 0,
            https_port: 0,
            tls_server_cert: self.cert_file.path().to_path_buf(),
            tls_server_key: self.key_file.path().to_path_buf(),
            document_root: self.root.path().to_path_buf(),
            poll_timeout: Duration::from_millis(50),
            poll_capacity: 64,
        }
    }

    /// Client config that trusts only this site's certificate.
    pub fn client_config(&self) -> Arc<rustls::ClientConfig> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.cert_der.clone()).unwrap();
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    pub fn server_name() -> ServerName<'static> {
        ServerName::try_from("localhost").unwrap()
    }
}

/// A response as seen on the wire.
#[derive(Debug)]
pub struct WireResponse {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WireResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> usize {
        self.header("Content-Length").unwrap().parse().unwrap()
    }
}

/// Reads one response. The body is read only when `with_body` is set, so HEAD
/// responses can be checked for trailing bytes by the next read.
pub fn read_response<R: BufRead>(reader: &mut R, with_body: bool) -> WireResponse {
    let mut status_line = String::new();
    reader.read_line(&mut status_line).unwrap();
    assert!(!status_line.is_empty(), "connection closed before a response");
    let status_line = status_line.trim_end().to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').unwrap();
        headers.push((name.to_string(), value.trim().to_string()));
    }

    let mut response = WireResponse {
        status_line,
        headers,
        body: Vec::new(),
    };
    if with_body {
        let mut body = vec![0u8; response.content_length()];
        reader.read_exact(&mut body).unwrap();
        response.body = body;
    }
    response
}

/// True once the peer has closed or reset the connection.
pub fn reads_eof<R: Read>(reader: &mut R) -> bool {
    let mut byte = [0u8; 1];
    match reader.read(&mut byte) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) => matches!(
            err.kind(),
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
        ),
    }
}
