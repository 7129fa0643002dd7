//! Response construction.
//!
//! ```
//! use liso::{Response, StatusCode, Version};
//!
//! let bytes = Response::new(Version::Http11, StatusCode::Ok)
//!     .with_header("Content-Type", "text/plain")
//!     .with_body(b"hi".to_vec())
//!     .into_bytes();
//! assert_eq!(
//!     bytes,
//!     b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nhi"
//! );
//! ```

use super::request::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok = 200,
    BadRequest = 400,
    NotFound = 404,
    InternalServerError = 500,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }
}

/// A complete response, serialized in one piece into a connection's outbound
/// buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    version: Version,
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    pub fn new(version: Version, status: StatusCode) -> Self {
        Self {
            version,
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Adds a header, replacing an earlier one with the same name.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    /// Sets the body and its `Content-Length`.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.set_header("Content-Length", &body.len().to_string());
        self.body = body;
        self
    }

    /// Drops the body but keeps every header, `Content-Length` included, as a
    /// HEAD response must.
    pub fn without_body(mut self) -> Self {
        if self.header("Content-Length").is_none() {
            self.set_header("Content-Length", &self.body.len().to_string());
        }
        self.body.clear();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut head = format!(
            "{} {} {}\r\n",
            self.version,
            self.status.code(),
            self.status.reason_phrase()
        );
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_has_an_empty_body() {
        let bytes = Response::new(Version::Http10, StatusCode::NotFound)
            .with_body(Vec::new())
            .into_bytes();
        assert_eq!(bytes, b"HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\n\r\n");
    }

    #[test]
    fn head_response_keeps_the_length_of_the_body_it_drops() {
        let response = Response::new(Version::Http11, StatusCode::Ok)
            .with_body(b"<html></html>".to_vec())
            .without_body();
        assert_eq!(response.header("content-length"), Some("13"));
        assert!(response.body().is_empty());
        assert!(response.into_bytes().ends_with(b"Content-Length: 13\r\n\r\n"));
    }

    #[test]
    fn headers_are_replaced_not_duplicated() {
        let response = Response::new(Version::Http11, StatusCode::Ok)
            .with_header("Content-Type", "text/plain")
            .with_header("content-type", "text/html");
        assert_eq!(response.header("Content-Type"), Some("text/html"));
        let text = String::from_utf8(response.into_bytes()).unwrap();
        assert_eq!(text.matches("ontent-").count(), 1);
    }
}
