//! Per-location request policy, evaluated on the request head before any body
//! byte is buffered or any handler runs.

use crate::config::Location;
use crate::error::{Error, Result};
use crate::http::request::{BodyFraming, Request};
use crate::http::response::Response;

#[derive(Debug)]
pub enum Verdict {
    /// Read the body (if any) and dispatch.
    Proceed(BodyFraming),
    /// Answer without dispatching.
    Respond(Response),
}

/// Method check, then body ceiling, then redirect.
pub fn check(location: &Location, request: &Request) -> Result<Verdict> {
    if !location.allows(&request.method) {
        return Err(Error::MethodNotAllowed);
    }

    let framing = request.body_framing()?;
    if let BodyFraming::Length(n) = framing {
        if n > location.client_max_body_size as u64 {
            return Err(Error::PayloadTooLarge);
        }
    }

    if let Some(redirect) = &location.redirect {
        return Ok(Verdict::Respond(Response::redirect(redirect.code, &redirect.target)));
    }

    Ok(Verdict::Proceed(framing))
}

/// Value for the `Allow` header of a 405 response.
pub fn allow_header(location: &Location) -> String {
    match &location.methods {
        Some(list) => list.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", "),
        None => "GET, POST, PUT, DELETE".to_string(),
    }
}
