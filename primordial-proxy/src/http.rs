//! Minimal HTTP/1.1 head parsing and response writing.
//!
//! Just enough HTTP for a loopback reverse proxy: request and response
//! heads with hard limits, and fixed-body error responses. Bodies are the
//! relay's concern.

use std::io::{BufRead, Write};

/// Longest accepted head line (request line or one header).
const MAX_LINE_BYTES: usize = 16 * 1024;
/// Most headers accepted in one head.
const MAX_HEADERS: usize = 128;

/// Head parsing failures.
#[derive(Debug)]
pub enum ParseError {
    /// The head is not valid HTTP/1.1. The `&str` is a fixed description
    /// safe to log; it never echoes input bytes.
    Malformed(&'static str),
    /// Socket error or deadline expiry mid-head.
    Io(std::io::Error),
}

impl From<std::io::Error> for ParseError {
    fn from(e: std::io::Error) -> Self {
        ParseError::Io(e)
    }
}

/// A parsed request head. Header names are lowercased; order preserved.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method, verbatim.
    pub method: String,
    /// Request target, verbatim (origin-form expected).
    pub target: String,
    /// Protocol version token (e.g. `HTTP/1.1`).
    pub version: String,
    /// Headers as (lowercase-name, value) pairs.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First value of the given header (name lowercase).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether any header with this name exists.
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n == name)
    }
}

/// A parsed response head.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Protocol version token.
    pub version: String,
    /// Status code.
    pub code: u16,
    /// Reason phrase, possibly empty.
    pub reason: String,
    /// Headers as (lowercase-name, value) pairs.
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// First value of the given header (name lowercase).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) fn read_line<R: BufRead>(reader: &mut R) -> Result<String, ParseError> {
    let mut buf = Vec::with_capacity(128);
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            if buf.is_empty() {
                return Err(ParseError::Malformed("unexpected end of stream"));
            }
            break;
        }
        let newline = available.iter().position(|&b| b == b'\n');
        let take = newline.map(|i| i + 1).unwrap_or(available.len());
        if buf.len() + take > MAX_LINE_BYTES {
            return Err(ParseError::Malformed("head line too long"));
        }
        buf.extend_from_slice(&available[..take]);
        reader.consume(take);
        if newline.is_some() {
            break;
        }
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    String::from_utf8(buf).map_err(|_| ParseError::Malformed("head is not utf-8"))
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<Vec<(String, String)>, ParseError> {
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader)?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(ParseError::Malformed("too many headers"));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(ParseError::Malformed("header without colon"))?;
        let name = name.trim();
        if name.is_empty() || name.contains(' ') || name.contains('\t') {
            return Err(ParseError::Malformed("invalid header name"));
        }
        headers.push((name.to_ascii_lowercase(), value.trim().to_string()));
    }
}

/// Read a request head up to and including the blank line.
pub fn read_request_head<R: BufRead>(reader: &mut R) -> Result<RequestHead, ParseError> {
    let line = read_line(reader)?;
    let mut parts = line.splitn(3, ' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) if !m.is_empty() && !t.is_empty() && !v.is_empty() => {
            (m.to_string(), t.to_string(), v.to_string())
        }
        _ => return Err(ParseError::Malformed("malformed request line")),
    };
    let headers = read_headers(reader)?;
    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

/// Read a response head up to and including the blank line.
pub fn read_response_head<R: BufRead>(reader: &mut R) -> Result<ResponseHead, ParseError> {
    let line = read_line(reader)?;
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|v| v.starts_with("HTTP/"))
        .ok_or(ParseError::Malformed("malformed status line"))?
        .to_string();
    let code: u16 = parts
        .next()
        .and_then(|c| c.parse().ok())
        .ok_or(ParseError::Malformed("malformed status code"))?;
    let reason = parts.next().unwrap_or("").to_string();
    let headers = read_headers(reader)?;
    Ok(ResponseHead {
        version,
        code,
        reason,
        headers,
    })
}

/// Write a fixed-body error response with `Connection: close`.
pub fn write_simple_response<W: Write>(
    writer: &mut W,
    code: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()> {
    write!(
        writer,
        "HTTP/1.1 {code} {reason}\r\n\
         content-type: text/plain\r\n\
         content-length: {}\r\n\
         connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )?;
    writer.flush()
}
