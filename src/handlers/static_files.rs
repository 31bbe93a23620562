use crate::config::Location;
use crate::error::{Error, Result};
use crate::handlers::autoindex;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::uri::percent_encode;
use crate::router::resolve_disk_path;
use log::debug;
use std::fs;
use std::path::Path;

pub fn serve(location: &Location, request: &Request) -> Result<Response> {
    let disk_path = resolve_disk_path(location, &request.path)?;
    let meta = fs::metadata(&disk_path).map_err(Error::from_fs)?;

    if meta.is_dir() {
        if !request.path.ends_with('/') {
            let mut target = format!("{}/", percent_encode(&request.path));
            if !request.query.is_empty() {
                target.push('?');
                target.push_str(&request.query);
            }
            return Ok(Response::redirect(301, &target));
        }

        for index in &location.index {
            let candidate = disk_path.join(index);
            if candidate.is_file() {
                debug!("[Static] index {:?} for {}", candidate, request.path);
                return file_response(&candidate);
            }
        }

        if location.autoindex {
            return autoindex::listing(&request.path, &disk_path);
        }
        return Err(Error::Forbidden);
    }

    if !meta.is_file() {
        return Err(Error::NotFound);
    }
    file_response(&disk_path)
}

fn file_response(path: &Path) -> Result<Response> {
    let content = fs::read(path).map_err(Error::from_fs)?;
    Ok(Response::bytes(200, &mime_type(path), content))
}

pub fn mime_type(path: &Path) -> String {
    mime_guess::from_path(path).first_or_octet_stream().to_string()
}
