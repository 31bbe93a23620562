//! Request-target handling: query splitting, percent-decoding and lexical
//! dot-segment resolution.

use crate::error::{Error, Result};

/// Splits a request target into path and query string (without the `?`).
/// Absolute-form targets (`http://host/path`) are reduced to their path.
pub fn split_target(target: &str) -> (&str, &str) {
    let target = match target.find("://") {
        Some(scheme_end) if !target[..scheme_end].contains('/') => {
            let rest = &target[scheme_end + 3..];
            match rest.find(['/', '?']) {
                Some(i) => &rest[i..],
                None => "/",
            }
        }
        _ => target,
    };
    let target = target.split('#').next().unwrap_or("");
    match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    }
}

/// Decodes URL percent-escaping. Malformed escapes and NUL bytes fail.
pub fn percent_decode(path: &str) -> Result<String> {
    fn fromhex(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'A'..=b'F' => Some(b - b'A' + 10),
            b'a'..=b'f' => Some(b - b'a' + 10),
            _ => None,
        }
    }

    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        i += 1;
        if c != b'%' {
            out.push(c);
            continue;
        }
        match (bytes.get(i).copied().and_then(fromhex), bytes.get(i + 1).copied().and_then(fromhex)) {
            (Some(a), Some(b)) => {
                out.push(a * 16 + b);
                i += 2;
            }
            _ => return Err(Error::BadRequest("malformed percent-encoding")),
        }
    }

    if out.contains(&0) {
        return Err(Error::BadRequest("NUL in path"));
    }
    String::from_utf8(out).map_err(|_| Error::BadRequest("path is not UTF-8"))
}

/// Resolves `.` and `..` segments without touching the filesystem. The
/// result always starts with `/` and never climbs above it. A trailing slash
/// (or a trailing dot segment) is kept as a trailing slash.
pub fn resolve_dots(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }

    let last = path.rsplit('/').next().unwrap_or("");
    let trailing = path.ends_with('/') || last == "." || last == "..";

    let mut out = String::with_capacity(path.len() + 1);
    for p in &parts {
        out.push('/');
        out.push_str(p);
    }
    if trailing || out.is_empty() {
        out.push('/');
    }
    out
}

/// Turns the path part of a request target into the canonical form used for
/// routing and filesystem lookup.
pub fn canonicalize(raw_path: &str) -> Result<String> {
    if raw_path.is_empty() {
        return Ok("/".to_string());
    }
    if !raw_path.starts_with('/') {
        return Err(Error::BadRequest("request target is not in origin form"));
    }
    let decoded = percent_decode(raw_path)?;
    Ok(resolve_dots(&decoded))
}

/// Percent-encodes everything except unreserved characters and `/`.
pub fn percent_encode(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for &b in path.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
