//! An event-driven HTTP/1.1 server: virtual hosts, longest-prefix locations,
//! static files, directory listings, uploads, and streaming CGI.

pub mod cgi;
pub mod config;
pub mod error;
pub mod handlers;
pub mod http;
pub mod policy;
pub mod router;
pub mod server;

pub use error::{Error, Result};
