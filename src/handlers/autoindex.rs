//! Generated directory listings.

use crate::error::{Error, Result};
use crate::http::response::Response;
use crate::http::uri::percent_encode;
use log::warn;
use std::fs;
use std::path::Path;

struct Entry {
    name: String,
    size: Option<u64>,
}

pub fn listing(request_path: &str, dir: &Path) -> Result<Response> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(Error::from_fs)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("[Autoindex] skipping entry in {:?}: {}", dir, e);
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        match fs::metadata(entry.path()) {
            Ok(meta) if meta.is_dir() => entries.push(Entry {
                name: format!("{}/", name),
                size: None,
            }),
            Ok(meta) => entries.push(Entry {
                name,
                size: Some(meta.len()),
            }),
            Err(e) => warn!("[Autoindex] failed to stat {:?}: {}", entry.path(), e),
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Response::html(200, render(request_path, &entries)))
}

fn render(request_path: &str, entries: &[Entry]) -> String {
    let title = escape_html(request_path);
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Index of {0}</title></head>\n\
         <body>\n<h1>Index of {0}</h1>\n<table>\n",
        title
    );

    if request_path != "/" {
        html.push_str("<tr><td><a href=\"../\">../</a></td><td>-</td></tr>\n");
    }
    for entry in entries {
        let href = percent_encode(&format!("{}{}", request_path, entry.name));
        let size = entry.size.map(format_size).unwrap_or_else(|| "-".to_string());
        html.push_str(&format!(
            "<tr><td><a href=\"{}\">{}</a></td><td>{}</td></tr>\n",
            href,
            escape_html(&entry.name),
            size
        ));
    }
    html.push_str("</table>\n</body>\n</html>\n");
    html
}

fn format_size(size: u64) -> String {
    const KB: f64 = 1024.0;
    let s = size as f64;
    if size < 1024 {
        format!("{} B", size)
    } else if s < KB * KB {
        format!("{:.2} KB", s / KB)
    } else if s < KB * KB * KB {
        format!("{:.2} MB", s / (KB * KB))
    } else {
        format!("{:.2} GB", s / (KB * KB * KB))
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
