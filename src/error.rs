//! Error handling for the server.
//!
//! Every failure that can end a request maps onto exactly one HTTP status via
//! [`Error::status`]. Infrastructure failures (binding, polling) use the `Io`
//! variant and never reach a client.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Config { line: usize, message: String },
    BadRequest(&'static str),
    MethodNotAllowed,
    NotFound,
    Forbidden,
    PayloadTooLarge,
    Gateway(GatewayFailure),
}

/// Ways a CGI exchange can fail once the gateway has been selected.
#[derive(Debug)]
pub enum GatewayFailure {
    Spawn(io::Error),
    Io(io::Error),
    BadHeaders(&'static str),
    NoOutput,
    Timeout,
}

impl Error {
    pub fn status(&self) -> u16 {
        match self {
            Error::BadRequest(_) => 400,
            Error::Forbidden => 403,
            Error::NotFound => 404,
            Error::MethodNotAllowed => 405,
            Error::PayloadTooLarge => 413,
            Error::Gateway(GatewayFailure::Timeout) => 504,
            Error::Gateway(_) | Error::Io(_) | Error::Config { .. } => 500,
        }
    }

    /// Classifies a filesystem error the way a client should see it.
    pub fn from_fs(e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => Error::NotFound,
            io::ErrorKind::PermissionDenied => Error::Forbidden,
            _ => Error::Io(e),
        }
    }

    pub fn config(line: usize, message: impl Into<String>) -> Error {
        Error::Config { line, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io: {}", e),
            Error::Config { line, message } => write!(f, "config line {}: {}", line, message),
            Error::BadRequest(why) => write!(f, "bad request: {}", why),
            Error::MethodNotAllowed => f.write_str("method not allowed"),
            Error::NotFound => f.write_str("not found"),
            Error::Forbidden => f.write_str("forbidden"),
            Error::PayloadTooLarge => f.write_str("payload too large"),
            Error::Gateway(g) => write!(f, "cgi: {}", g),
        }
    }
}

impl fmt::Display for GatewayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayFailure::Spawn(e) => write!(f, "spawn failed: {}", e),
            GatewayFailure::Io(e) => write!(f, "pipe error: {}", e),
            GatewayFailure::BadHeaders(why) => write!(f, "bad header block: {}", why),
            GatewayFailure::NoOutput => f.write_str("script produced no header block"),
            GatewayFailure::Timeout => f.write_str("script timed out"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Gateway(GatewayFailure::Spawn(e)) | Error::Gateway(GatewayFailure::Io(e)) => {
                Some(e)
            }
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<GatewayFailure> for Error {
    fn from(g: GatewayFailure) -> Error {
        Error::Gateway(g)
    }
}

impl From<httparse::Error> for Error {
    fn from(_: httparse::Error) -> Error {
        Error::BadRequest("malformed request head")
    }
}
