use super::request::{Method, Request};
use super::response::{Response, StatusCode};
use super::{Reply, RequestHandler};
use crate::error::Error;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

const INDEX_DOCUMENT: &str = "index.html";

/// Serves files below a document root.
///
/// GET answers with the file, HEAD with its headers only. Every other method
/// is passed through without a response.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a request path onto the document root. `None` for paths that try
    /// to leave it.
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        let mut resolved = self.root.clone();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => return None,
                segment => resolved.push(segment),
            }
        }
        if path.is_empty() || path.ends_with('/') {
            resolved.push(INDEX_DOCUMENT);
        }
        Some(resolved)
    }

    fn serve(&self, request: &Request) -> Result<Response, Error> {
        let not_found = || Response::new(request.version, StatusCode::NotFound).with_body(Vec::new());

        let Some(path) = self.resolve(request.path()) else {
            debug!(uri = %request.target, "Rejected path outside the document root");
            return Ok(not_found());
        };
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "File not found");
                return Ok(not_found());
            }
            Err(err) => return Err(err.into()),
        };
        if !metadata.is_file() {
            debug!(path = %path.display(), "Not a regular file");
            return Ok(not_found());
        }

        let body = fs::read(&path)?;
        trace!(path = %path.display(), len = body.len(), "Read file");
        Ok(Response::new(request.version, StatusCode::Ok)
            .with_header("Content-Type", content_type(&path))
            .with_body(body))
    }
}

impl RequestHandler for StaticFiles {
    fn handle(&mut self, request: &Request) -> Result<Reply, Error> {
        match request.method {
            Method::Get => self.serve(request).map(Reply::Respond),
            Method::Head => self
                .serve(request)
                .map(|response| Reply::Respond(response.without_body())),
            Method::Post | Method::Other(_) => Ok(Reply::Ignore),
        }
    }
}

/// Content type inferred from the file extension.
pub fn content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}
