//! Uploads (`POST`/`PUT`) and deletes.
//!
//! A write answers 201 when it created at least one new file and 200 when it
//! only replaced existing ones. Files are written beside their destination
//! and renamed into place, so a concurrent reader never sees a half-written
//! file.

use crate::config::Location;
use crate::error::{Error, Result};
use crate::http::multipart;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::router::resolve_disk_path;
use log::info;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn store(location: &Location, request: &Request) -> Result<Response> {
    let dir = location.upload_path().ok_or(Error::Forbidden)?;
    fs::create_dir_all(&dir).map_err(Error::from_fs)?;

    let mut saved = Vec::new();
    let mut created = false;

    if let Some(boundary) = multipart::boundary(&request.headers) {
        let parts = multipart::file_parts(&request.body, &boundary);
        if parts.is_empty() {
            return Err(Error::BadRequest("multipart body without a file part"));
        }
        for part in parts {
            let name = sanitize_file_name(&part.file_name)
                .ok_or(Error::BadRequest("invalid upload file name"))?;
            created |= write_file(&dir.join(&name), &part.data)?;
            saved.push(name);
        }
    } else {
        let name = target_name(location, request);
        created |= write_file(&dir.join(&name), &request.body)?;
        saved.push(name);
    }

    info!("[Upload] saved {:?} under {:?}", saved, dir);
    let status = if created { 201 } else { 200 };
    Ok(Response::text(status, format!("Successfully uploaded {}\n", saved.join(", "))))
}

pub fn delete(location: &Location, request: &Request) -> Result<Response> {
    let disk_path = resolve_disk_path(location, &request.path)?;
    let meta = fs::symlink_metadata(&disk_path).map_err(Error::from_fs)?;
    // Directories and write-protected files stay.
    if meta.is_dir() || meta.permissions().readonly() {
        return Err(Error::Forbidden);
    }
    fs::remove_file(&disk_path).map_err(Error::from_fs)?;

    info!("[Delete] removed {:?}", disk_path);
    Ok(Response::text(200, format!("Successfully deleted {}\n", request.path)))
}

/// File name for a raw (non-multipart) upload: the last path segment below
/// the location prefix, or a generated name.
fn target_name(location: &Location, request: &Request) -> String {
    let below = request
        .path
        .strip_prefix(location.prefix.as_str())
        .unwrap_or(&request.path);
    below
        .rsplit('/')
        .next()
        .and_then(sanitize_file_name)
        .unwrap_or_else(|| {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            format!("upload_{}_{}", secs, UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed))
        })
}

/// Keeps only the final component of a client-supplied name.
fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?;
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

/// Returns whether the file did not exist before.
fn write_file(dest: &Path, data: &[u8]) -> Result<bool> {
    if dest.is_dir() {
        return Err(Error::Forbidden);
    }
    let existed = dest.exists();

    let file_name = dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let tmp = dest.with_file_name(format!(".{}.part-{}", file_name, std::process::id()));
    fs::write(&tmp, data).map_err(Error::from_fs)?;
    if let Err(e) = fs::rename(&tmp, dest) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::from_fs(e));
    }
    Ok(!existed)
}
