//! Request dispatch: picks the handler for a routed, policy-checked request.

pub mod autoindex;
pub mod static_files;
pub mod upload;

use crate::cgi::{self, CgiLaunch};
use crate::config::{Location, VirtualHost};
use crate::error::{Error, Result};
use crate::http::method::Method;
use crate::http::request::Request;
use crate::http::response::Response;
use std::net::SocketAddr;

/// What the routing step resolved for one request, plus the socket pair it
/// arrived on.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub host: &'a VirtualHost,
    pub location: &'a Location,
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

#[derive(Debug)]
pub enum Outcome {
    Respond(Response),
    /// The response will be streamed from a script.
    Cgi(CgiLaunch),
}

/// CGI first, then `DELETE`, uploads, and static `GET`.
pub fn dispatch(ctx: &Context<'_>, request: &mut Request) -> Result<Outcome> {
    if let Some(launch) = cgi::resolve(ctx, request)? {
        return Ok(Outcome::Cgi(launch));
    }

    let response = match request.method {
        Method::Delete => upload::delete(ctx.location, request)?,
        Method::Post | Method::Put => upload::store(ctx.location, request)?,
        Method::Get => static_files::serve(ctx.location, request)?,
        Method::Other(_) => return Err(Error::MethodNotAllowed),
    };
    Ok(Outcome::Respond(response))
}
