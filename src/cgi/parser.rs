//! Parser for the header block a CGI script writes before its body.
//!
//! The block ends at the first empty line; lines may end in CRLF or a bare
//! LF. A script may also answer with a full `HTTP/1.x` status line.

use crate::error::GatewayFailure;

/// Largest header block accepted from a script.
pub const MAX_HEADER_BLOCK: usize = 8192;

#[derive(Debug, PartialEq, Eq)]
pub struct CgiHeaders {
    pub status: u16,
    pub reason: Option<String>,
    /// Headers to forward, with framing headers removed.
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

/// Accumulates script output until the header block is complete.
#[derive(Debug, Default)]
pub struct HeaderReader {
    buf: Vec<u8>,
}

impl HeaderReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Feeds output bytes. Once the block is complete, returns the parsed
    /// headers and whatever body bytes followed them.
    pub fn push(&mut self, data: &[u8]) -> Result<Option<(CgiHeaders, Vec<u8>)>, GatewayFailure> {
        self.buf.extend_from_slice(data);
        match find_block_end(&self.buf) {
            Some((end, _)) if end > MAX_HEADER_BLOCK => {
                Err(GatewayFailure::BadHeaders("header block too large"))
            }
            Some((end, body_start)) => {
                let headers = parse_block(&self.buf[..end])?;
                let rest = self.buf.split_off(body_start);
                self.buf.clear();
                Ok(Some((headers, rest)))
            }
            None if self.buf.len() > MAX_HEADER_BLOCK => {
                Err(GatewayFailure::BadHeaders("header block too large"))
            }
            None => Ok(None),
        }
    }
}

/// Locates the empty line ending the header block. Returns the length of the
/// block and the offset where the body starts.
pub fn find_block_end(buf: &[u8]) -> Option<(usize, usize)> {
    // Output that starts with an empty line has no headers at all.
    if buf.starts_with(b"\n") {
        return Some((0, 1));
    }
    if buf.starts_with(b"\r\n") {
        return Some((0, 2));
    }

    let mut i = 0;
    while let Some(offset) = buf[i..].iter().position(|&b| b == b'\n') {
        let nl = i + offset;
        match &buf[nl + 1..] {
            [b'\n', ..] => return Some((nl, nl + 2)),
            [b'\r', b'\n', ..] => return Some((nl, nl + 3)),
            _ => i = nl + 1,
        }
    }
    None
}

pub fn parse_block(block: &[u8]) -> Result<CgiHeaders, GatewayFailure> {
    let text = std::str::from_utf8(block)
        .map_err(|_| GatewayFailure::BadHeaders("header block is not UTF-8"))?;

    let mut parsed = CgiHeaders {
        status: 200,
        reason: None,
        headers: Vec::new(),
        content_length: None,
        chunked: false,
    };
    let mut explicit_status = false;

    for (n, line) in text.split('\n').enumerate() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }

        if n == 0 && line.starts_with("HTTP/") {
            let status = line
                .split_once(' ')
                .map(|(_, s)| s)
                .ok_or(GatewayFailure::BadHeaders("malformed status line"))?;
            (parsed.status, parsed.reason) = parse_status(status)?;
            explicit_status = true;
            continue;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or(GatewayFailure::BadHeaders("header line without a colon"))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return Err(GatewayFailure::BadHeaders("empty header name"));
        }

        match name.to_ascii_lowercase().as_str() {
            "status" => {
                (parsed.status, parsed.reason) = parse_status(value)?;
                explicit_status = true;
            }
            "content-length" => {
                let len = value
                    .parse::<u64>()
                    .map_err(|_| GatewayFailure::BadHeaders("invalid Content-Length"))?;
                parsed.content_length = Some(len);
            }
            "transfer-encoding" => {
                parsed.chunked = value
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("chunked"));
            }
            "connection" | "keep-alive" => {}
            _ => parsed.headers.push((name.to_string(), value.to_string())),
        }
    }

    let has = |h: &str| parsed.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(h));
    if !explicit_status && has("location") {
        parsed.status = 302;
    }
    if !has("content-type") {
        parsed.headers.push(("Content-Type".to_string(), "text/html".to_string()));
    }
    Ok(parsed)
}

fn parse_status(value: &str) -> Result<(u16, Option<String>), GatewayFailure> {
    let value = value.trim();
    let (code, reason) = value.split_once(' ').unwrap_or((value, ""));
    let code = code
        .parse::<u16>()
        .ok()
        .filter(|c| (100..=599).contains(c))
        .ok_or(GatewayFailure::BadHeaders("invalid Status"))?;
    let reason = Some(reason.trim()).filter(|r| !r.is_empty()).map(str::to_string);
    Ok((code, reason))
}
