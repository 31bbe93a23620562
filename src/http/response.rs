//! Responses and their wire framing.
//!
//! A response picks exactly one framing before its head is written: a known
//! `Content-Length`, chunked transfer coding, or delimiting by connection
//! close. Framing headers supplied by handlers are dropped and regenerated
//! from that decision so the two can never disagree.

use crate::http::request::Version;
use chrono::{DateTime, Utc};
use std::time::SystemTime;

pub const SERVER_SOFTWARE: &str = "webserv/0.1";

/// Terminator of a chunked body (zero-size chunk, no trailers).
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[derive(Debug)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    /// Produced incrementally after the head is written. `length` is set when
    /// the producer declared its size up front.
    Stream { length: Option<u64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Length(u64),
    Chunked,
    Close,
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: None,
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Replaces any existing header of the same name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn bytes(status: u16, content_type: &str, body: Vec<u8>) -> Self {
        let mut r = Response::new(status).with_header("Content-Type", content_type);
        r.body = Body::Bytes(body);
        r
    }

    pub fn html(status: u16, body: String) -> Self {
        Response::bytes(status, "text/html; charset=utf-8", body.into_bytes())
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Response::bytes(status, "text/plain; charset=utf-8", body.into().into_bytes())
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        let body = format!(
            "<html><head><title>{0} {1}</title></head><body><h1>{0} {1}</h1>\
             <p><a href=\"{2}\">{2}</a></p></body></html>",
            status,
            reason_phrase(status),
            location
        );
        Response::html(status, body).with_header("Location", location)
    }

    /// Built-in error page used when the virtual host has no custom one.
    pub fn error_page(status: u16) -> Self {
        let msg = reason_phrase(status);
        let body = format!(
            "<html><head><title>{0} {1}</title></head>\
             <body style='font-family:sans-serif; text-align:center; padding-top:50px;'>\
             <h1>{0} {1}</h1><hr><p>{2}</p></body></html>",
            status, msg, SERVER_SOFTWARE
        );
        Response::html(status, body)
    }

    /// Chooses the body framing for a client speaking `version`.
    pub fn framing(&self, version: Version) -> Framing {
        match &self.body {
            Body::Empty => Framing::Length(0),
            Body::Bytes(b) => Framing::Length(b.len() as u64),
            Body::Stream { length: Some(n) } => Framing::Length(*n),
            Body::Stream { length: None } if version == Version::Http11 => Framing::Chunked,
            Body::Stream { length: None } => Framing::Close,
        }
    }

    /// Serializes the status line and headers. `keep_alive` is ignored when
    /// the framing needs the connection closed.
    pub fn write_head(&self, framing: Framing, keep_alive: bool, out: &mut Vec<u8>) {
        let reason = self.reason.as_deref().unwrap_or_else(|| reason_phrase(self.status));
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, reason).as_bytes());

        for (name, value) in &self.headers {
            if is_framing_header(name) {
                continue;
            }
            push_header(out, name, value);
        }
        if self.header("server").is_none() {
            push_header(out, "Server", SERVER_SOFTWARE);
        }
        if self.header("date").is_none() {
            push_header(out, "Date", &http_date(SystemTime::now()));
        }

        match framing {
            Framing::Length(n) => push_header(out, "Content-Length", &n.to_string()),
            Framing::Chunked => push_header(out, "Transfer-Encoding", "chunked"),
            Framing::Close => {}
        }
        let keep_alive = keep_alive && framing != Framing::Close;
        push_header(out, "Connection", if keep_alive { "keep-alive" } else { "close" });
        out.extend_from_slice(b"\r\n");
    }

    /// Head plus body for a response whose body is already in memory.
    pub fn serialize(&self, version: Version, keep_alive: bool, out: &mut Vec<u8>) -> Framing {
        let framing = self.framing(version);
        self.write_head(framing, keep_alive, out);
        if let Body::Bytes(b) = &self.body {
            out.extend_from_slice(b);
        }
        framing
    }
}

fn is_framing_header(name: &str) -> bool {
    ["content-length", "transfer-encoding", "connection"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Appends `data` as one chunk of a chunked body. Empty input writes nothing,
/// since a zero-size chunk would end the body.
pub fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(at: SystemTime) -> String {
    DateTime::<Utc>::from(at)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}
