//! WebSocket opening handshake (RFC 6455 Section 4).
//!
//! Server side: parse and validate the HTTP Upgrade request, compute the
//! accept key, give the application a chance to veto, and build either a
//! 101 response or an HTTP error response. Client side: build the request
//! and check the server's accept key. No I/O happens here.

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::mask::MaskGenerator;

/// The WebSocket GUID used in the Sec-WebSocket-Accept calculation (RFC 6455).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Headers that must not appear twice in an upgrade request.
const SECURITY_HEADERS: [&str; 5] = [
    "host",
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
];

/// Parse HTTP headers into a map keyed by lowercase name.
///
/// Stops at the first empty line. When `security_headers` is given, a
/// repeated header from that list is rejected.
///
/// # Errors
/// Returns `Error::InvalidHandshake` if a security-critical header is duplicated.
fn parse_headers<'a, I>(
    lines: I,
    security_headers: Option<&[&str]>,
) -> Result<HashMap<String, String>>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers: HashMap<String, String> = HashMap::new();

    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name_lower = name.trim().to_ascii_lowercase();

            if let Some(sec_headers) = security_headers {
                if sec_headers.contains(&name_lower.as_str()) && headers.contains_key(&name_lower) {
                    return Err(Error::InvalidHandshake(format!(
                        "Duplicate header: {}",
                        name.trim()
                    )));
                }
            }

            headers.insert(name_lower, value.trim().to_string());
        }
    }

    Ok(headers)
}

/// Validate that a header value does not contain CR or LF characters.
///
/// # Errors
/// Returns `Error::InvalidHeaderValue` if the value contains `\r` or `\n`.
fn validate_header_value(header_name: &str, value: &str) -> Result<()> {
    if value.contains('\r') || value.contains('\n') {
        return Err(Error::InvalidHeaderValue {
            header: header_name.to_string(),
            reason: "contains CR or LF characters".to_string(),
        });
    }
    Ok(())
}

fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Computes the Sec-WebSocket-Accept value from the client's Sec-WebSocket-Key.
///
/// The key is trimmed, then: Base64(SHA-1(key + GUID)).
///
/// # Example
///
/// ```
/// use wsd::protocol::handshake::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Validate the Origin header against a list of allowed origins.
///
/// An empty list accepts any origin, including none.
///
/// # Errors
/// Returns `Error::OriginNotAllowed` if the list is non-empty and `origin`
/// is missing or not in it.
pub fn validate_origin(origin: Option<&str>, allowed: &[String]) -> Result<()> {
    if allowed.is_empty() {
        return Ok(());
    }

    match origin {
        Some(o) if allowed.iter().any(|a| a == o) => Ok(()),
        Some(o) => Err(Error::OriginNotAllowed {
            origin: o.to_string(),
        }),
        None => Err(Error::OriginNotAllowed {
            origin: "(none)".to_string(),
        }),
    }
}

/// Offset just past the blank line ending an HTTP head, if present.
pub fn find_request_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Parsed WebSocket handshake request from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// The request path (e.g., "/chat").
    pub path: String,
    /// The Host header value.
    pub host: String,
    /// The Sec-WebSocket-Key header value.
    pub key: String,
    /// The Sec-WebSocket-Version (should be 13).
    pub version: u16,
    /// The Origin header value (optional).
    pub origin: Option<String>,
    /// The Sec-WebSocket-Protocol values, in the client's order.
    pub protocols: Vec<String>,
    /// The Sec-WebSocket-Extensions values. None are ever accepted.
    pub extensions: Vec<String>,
    headers: HashMap<String, String>,
}

impl HandshakeRequest {
    /// Parse the head of an upgrade request (everything up to the blank
    /// line). Structural problems come back as [`Error::InvalidHandshake`];
    /// the semantic checks live in [`validate`](Self::validate).
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::InvalidHandshake("Invalid UTF-8".into()))?;

        let mut lines = text.lines();

        // "GET /path HTTP/1.1"
        let request_line = lines
            .next()
            .ok_or_else(|| Error::InvalidHandshake("Empty request".into()))?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(Error::InvalidHandshake("Invalid request line".into()));
        }

        if parts[0] != "GET" {
            return Err(Error::InvalidHandshake(format!(
                "Expected GET method, got {}",
                parts[0]
            )));
        }

        if !parts[2].starts_with("HTTP/1.1") {
            return Err(Error::InvalidHandshake(format!(
                "Expected HTTP/1.1, got {}",
                parts[2]
            )));
        }

        let path = parts[1].to_string();
        let headers = parse_headers(lines, Some(&SECURITY_HEADERS))?;

        let upgrade = headers
            .get("upgrade")
            .ok_or_else(|| Error::InvalidHandshake("Missing Upgrade header".into()))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(Error::InvalidHandshake(format!(
                "Invalid Upgrade header: {}",
                upgrade
            )));
        }

        let connection = headers
            .get("connection")
            .ok_or_else(|| Error::InvalidHandshake("Missing Connection header".into()))?;
        if !connection.to_ascii_lowercase().contains("upgrade") {
            return Err(Error::InvalidHandshake(format!(
                "Invalid Connection header: {}",
                connection
            )));
        }

        let host = headers
            .get("host")
            .ok_or_else(|| Error::InvalidHandshake("Missing Host header".into()))?
            .clone();

        let key = headers
            .get("sec-websocket-key")
            .ok_or_else(|| Error::InvalidHandshake("Missing Sec-WebSocket-Key header".into()))?
            .clone();

        let version_str = headers.get("sec-websocket-version").ok_or_else(|| {
            Error::InvalidHandshake("Missing Sec-WebSocket-Version header".into())
        })?;
        let version: u16 = version_str
            .parse()
            .map_err(|_| Error::InvalidHandshake(format!("Invalid version: {}", version_str)))?;

        let origin = headers.get("origin").cloned();
        let protocols = split_list(headers.get("sec-websocket-protocol"));
        let extensions = split_list(headers.get("sec-websocket-extensions"));

        Ok(Self {
            path,
            host,
            key,
            version,
            origin,
            protocols,
            extensions,
            headers,
        })
    }

    /// RFC 6455 Section 4.2.1: version 13, a key that decodes to 16 bytes,
    /// a non-empty host.
    pub fn validate(&self) -> Result<()> {
        if self.version != 13 {
            return Err(Error::UnsupportedVersion(self.version));
        }

        match BASE64.decode(self.key.trim()) {
            Ok(decoded) if decoded.len() == 16 => {}
            Ok(decoded) => {
                return Err(Error::InvalidHandshake(format!(
                    "Sec-WebSocket-Key must be 16 bytes, got {}",
                    decoded.len()
                )));
            }
            Err(_) => {
                return Err(Error::InvalidHandshake(
                    "Invalid Sec-WebSocket-Key: not valid Base64".into(),
                ));
            }
        }

        if self.host.is_empty() {
            return Err(Error::InvalidHandshake(
                "Host header cannot be empty".into(),
            ));
        }

        Ok(())
    }

    /// [`parse`](Self::parse), refusing heads longer than `max_size` first.
    pub fn parse_with_limit(data: &[u8], max_size: usize) -> Result<Self> {
        if data.len() > max_size {
            return Err(Error::HandshakeTooLarge {
                size: data.len(),
                max: max_size,
            });
        }
        Self::parse(data)
    }

    /// Look up any request header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// HTTP response to an upgrade request.
///
/// Starts out either as a 101 built from a validated request or as an error
/// response. The handshake hook may rewrite status, headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HandshakeResponse {
    /// 101 response for a validated request.
    ///
    /// Echoes the first offered sub-protocol, if any.
    pub fn switching_protocols(req: &HandshakeRequest) -> Self {
        let mut response = Self {
            status: 101,
            headers: vec![
                ("Upgrade".into(), "websocket".into()),
                ("Connection".into(), "Upgrade".into()),
                ("Sec-WebSocket-Accept".into(), compute_accept_key(&req.key)),
                ("Sec-WebSocket-Version".into(), "13".into()),
            ],
            body: Vec::new(),
        };
        if let Some(proto) = req.protocols.first() {
            response.set_header("Sec-WebSocket-Protocol", proto.clone());
        }
        response
    }

    /// Plain-text HTTP error response.
    pub fn error(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: body.into(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// Set a header, replacing any existing value under the same name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Select a sub-protocol, or drop the header with `None`.
    pub fn set_protocol(&mut self, protocol: Option<&str>) {
        match protocol {
            Some(p) => self.set_header("Sec-WebSocket-Protocol", p),
            None => self
                .headers
                .retain(|(n, _)| !n.eq_ignore_ascii_case("Sec-WebSocket-Protocol")),
        }
    }

    pub fn protocol(&self) -> Option<&str> {
        self.header("Sec-WebSocket-Protocol")
    }

    pub fn accept(&self) -> Option<&str> {
        self.header("Sec-WebSocket-Accept")
    }

    pub fn is_switching(&self) -> bool {
        self.status == 101
    }

    /// Write the HTTP response to a buffer.
    ///
    /// Error responses get `Content-Length` and `Connection: close`.
    ///
    /// # Errors
    /// Returns `Error::InvalidHeaderValue` if a header contains CR/LF.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status)).as_bytes(),
        );

        for (name, value) in &self.headers {
            validate_header_value(name, name)?;
            validate_header_value(name, value)?;
            buf.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }

        if !self.is_switching() {
            buf.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
            buf.extend_from_slice(b"Connection: close\r\n");
        }

        buf.extend_from_slice(b"\r\n");
        if !self.is_switching() {
            buf.extend_from_slice(&self.body);
        }
        Ok(())
    }

    /// Parse the head of the server's answer on the client side. Anything
    /// other than a well-formed `101` with the upgrade headers is
    /// [`Error::InvalidHandshake`].
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::InvalidHandshake("Invalid UTF-8".into()))?;

        let mut lines = text.lines();

        let status_line = lines
            .next()
            .ok_or_else(|| Error::InvalidHandshake("Empty response".into()))?;

        if !status_line.starts_with("HTTP/1.1 101") {
            return Err(Error::InvalidHandshake(format!(
                "Expected 101 status, got: {}",
                status_line
            )));
        }

        let headers = parse_headers(lines, None)?;

        let upgrade = headers
            .get("upgrade")
            .ok_or_else(|| Error::InvalidHandshake("Missing Upgrade header in response".into()))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(Error::InvalidHandshake(format!(
                "Invalid Upgrade header: {}",
                upgrade
            )));
        }

        let connection = headers.get("connection").ok_or_else(|| {
            Error::InvalidHandshake("Missing Connection header in response".into())
        })?;
        if !connection.to_ascii_lowercase().contains("upgrade") {
            return Err(Error::InvalidHandshake(format!(
                "Invalid Connection header: {}",
                connection
            )));
        }

        if !headers.contains_key("sec-websocket-accept") {
            return Err(Error::InvalidHandshake(
                "Missing Sec-WebSocket-Accept header".into(),
            ));
        }

        let mut headers: Vec<(String, String)> = headers.into_iter().collect();
        headers.sort();

        Ok(Self {
            status: 101,
            headers,
            body: Vec::new(),
        })
    }
}

/// Outcome of a server-side negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// Send `response` and switch the connection to framing mode.
    Accepted {
        request: HandshakeRequest,
        response: HandshakeResponse,
    },
    /// Send `response` and close the connection.
    Rejected {
        response: HandshakeResponse,
        reason: Error,
    },
}

impl Negotiation {
    pub fn response(&self) -> &HandshakeResponse {
        match self {
            Negotiation::Accepted { response, .. } | Negotiation::Rejected { response, .. } => {
                response
            }
        }
    }
}

/// Run the server side of the opening handshake over a complete request.
///
/// Malformed requests get 400, oversized ones 431, an unsupported version
/// 426 advertising version 13, and disallowed origins 403. Otherwise `on_handshake` sees the request and the prepared 101
/// response; returning `false` sends whatever it left in the response,
/// forced to 403 if it still says 101.
pub fn negotiate<F>(data: &[u8], config: &Config, on_handshake: F) -> Negotiation
where
    F: FnOnce(&HandshakeRequest, &mut HandshakeResponse) -> bool,
{
    let request = match HandshakeRequest::parse_with_limit(data, config.limits.max_handshake_size)
        .and_then(|req| req.validate().map(|()| req))
    {
        Ok(req) => req,
        Err(err) => {
            let status = match err {
                Error::HandshakeTooLarge { .. } => 431,
                Error::UnsupportedVersion(_) => 426,
                _ => 400,
            };
            let mut response = HandshakeResponse::error(status, err.to_string());
            if status == 426 {
                response.set_header("Sec-WebSocket-Version", "13");
            }
            return Negotiation::Rejected { response, reason: err };
        }
    };

    if let Some(allowed) = &config.allowed_origins {
        if let Err(err) = validate_origin(request.origin.as_deref(), allowed) {
            return Negotiation::Rejected {
                response: HandshakeResponse::error(403, "Origin not allowed"),
                reason: err,
            };
        }
    }

    let mut response = HandshakeResponse::switching_protocols(&request);
    let accepted = on_handshake(&request, &mut response);

    if accepted && response.is_switching() {
        return Negotiation::Accepted { request, response };
    }

    if response.is_switching() {
        response = HandshakeResponse::error(403, "Forbidden");
    }
    Negotiation::Rejected {
        reason: Error::HandshakeRejected {
            status: response.status(),
        },
        response,
    }
}

/// Client side of the opening handshake.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    host: String,
    path: String,
    key: String,
    protocols: Vec<String>,
}

impl ClientHandshake {
    /// Prepare a request with a fresh random 16-byte key.
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        let mut nonce = [0u8; 16];
        if getrandom::getrandom(&mut nonce).is_err() {
            let mut generator = MaskGenerator::new();
            for chunk in nonce.chunks_mut(4) {
                chunk.copy_from_slice(&generator.next_key());
            }
        }
        Self {
            host: host.into(),
            path: path.into(),
            key: BASE64.encode(nonce),
            protocols: Vec::new(),
        }
    }

    /// Offer sub-protocols, in preference order.
    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serialize the upgrade request.
    ///
    /// # Errors
    /// Returns `Error::InvalidHeaderValue` if host, path or a protocol contain CR/LF.
    pub fn request(&self) -> Result<Vec<u8>> {
        validate_header_value("Host", &self.host)?;
        validate_header_value("Request-Target", &self.path)?;

        let mut buf = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n",
            self.path, self.host, self.key
        );
        if !self.protocols.is_empty() {
            let joined = self.protocols.join(", ");
            validate_header_value("Sec-WebSocket-Protocol", &joined)?;
            buf.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", joined));
        }
        buf.push_str("\r\n");
        Ok(buf.into_bytes())
    }

    /// Check the server's response against our key.
    ///
    /// # Errors
    ///
    /// - Any error from [`HandshakeResponse::parse`]
    /// - `Error::AcceptKeyMismatch` if the accept value is wrong
    pub fn verify(&self, data: &[u8]) -> Result<HandshakeResponse> {
        let response = HandshakeResponse::parse(data)?;
        let expected = compute_accept_key(&self.key);
        let actual = response.accept().unwrap_or_default();
        if actual != expected {
            return Err(Error::AcceptKeyMismatch {
                expected,
                actual: actual.to_string(),
            });
        }
        Ok(response)
    }
}
