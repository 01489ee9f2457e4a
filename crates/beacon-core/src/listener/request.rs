//! Minimal HTTP/1.x request parsing for the inbound command listener.

use serde::Serialize;
use std::collections::HashMap;

/// A parsed inbound request, handed to the controller for dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    /// Header names are lower-cased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl InboundRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parse the body as JSON, if it is JSON.
    pub fn json_body(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Offset of the `\r\n\r\n` that ends the header block.
pub(crate) fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// Declared `Content-Length` of a header block, if present and numeric.
pub(crate) fn content_length(head: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(head).lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Whether `buf` holds a complete request: headers plus the declared body.
pub(crate) fn is_complete(buf: &[u8]) -> bool {
    match header_end(buf) {
        Some(end) => {
            let body_start = end + HEADER_TERMINATOR.len();
            let needed = content_length(&buf[..end]).unwrap_or(0);
            match body_start.checked_add(needed) {
                Some(total) => buf.len() >= total,
                None => false,
            }
        }
        None => false,
    }
}

/// Whether the request in `buf` is, or has declared it will be, larger than
/// `limit` bytes in total.
pub(crate) fn exceeds_limit(buf: &[u8], limit: usize) -> bool {
    if buf.len() > limit {
        return true;
    }
    let Some(end) = header_end(buf) else {
        return false;
    };
    let declared = content_length(&buf[..end]).unwrap_or(0);
    match (end + HEADER_TERMINATOR.len()).checked_add(declared) {
        Some(total) => total > limit,
        None => true,
    }
}

/// Parse a raw request.
///
/// Returns `None` when the request line is not `METHOD PATH HTTP/x.y` or the
/// header block is not terminated. Header lines without a colon are ignored.
pub fn parse_request(raw: &[u8]) -> Option<InboundRequest> {
    let end = header_end(raw)?;
    let head = std::str::from_utf8(&raw[..end]).ok()?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;
    let version = parts.next()?;
    if parts.next().is_some() || !version.starts_with("HTTP/") {
        return None;
    }

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let body_start = end + HEADER_TERMINATOR.len();
    let body = match content_length(&raw[..end]) {
        Some(len) => raw[body_start..].iter().take(len).copied().collect(),
        None => Vec::new(),
    };

    Some(InboundRequest {
        method: method.to_string(),
        path: path.to_string(),
        version: version.to_string(),
        headers,
        body,
    })
}
