//! Minimal `multipart/form-data` reader: enough to pull file parts out of a
//! browser upload.

use crate::http::headers::Headers;

#[derive(Debug)]
pub struct FilePart {
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Returns the boundary if the request carries a multipart body.
pub fn boundary(headers: &Headers) -> Option<String> {
    let content_type = headers.get("content-type")?;
    let mut params = content_type.split(';');
    if !params.next()?.trim().eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
}

/// Splits `body` on `boundary` and returns every part that names a file.
pub fn file_parts(body: &[u8], boundary: &str) -> Vec<FilePart> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut files = Vec::new();
    let mut current = match find_bytes(body, &delimiter, 0) {
        Some(pos) => pos,
        None => return files,
    };

    loop {
        let part_start = current + delimiter.len();
        if body[part_start..].starts_with(b"--") {
            break; // closing delimiter
        }
        let Some(next) = find_bytes(body, &delimiter, part_start) else {
            break;
        };
        if let Some(file) = parse_part(&body[part_start..next]) {
            files.push(file);
        }
        current = next;
    }
    files
}

fn parse_part(part: &[u8]) -> Option<FilePart> {
    let part = part.strip_prefix(b"\r\n").or_else(|| part.strip_prefix(b"\n")).unwrap_or(part);

    let (header_end, sep_len) = match find_bytes(part, b"\r\n\r\n", 0) {
        Some(pos) => (pos, 4),
        None => (find_bytes(part, b"\n\n", 0)?, 2),
    };
    let head = std::str::from_utf8(&part[..header_end]).ok()?;
    let content = &part[header_end + sep_len..];
    let content = content
        .strip_suffix(b"\r\n")
        .or_else(|| content.strip_suffix(b"\n"))
        .unwrap_or(content);

    let file_name = head
        .lines()
        .filter(|l| l.to_ascii_lowercase().starts_with("content-disposition:"))
        .find_map(|l| l.split("filename=\"").nth(1).and_then(|s| s.split('"').next()))?;

    if file_name.is_empty() {
        return None;
    }
    Some(FilePart {
        file_name: file_name.to_string(),
        data: content.to_vec(),
    })
}

fn find_bytes(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    haystack
        .get(start..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + start)
}
