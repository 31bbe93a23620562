//! Server configuration: the immutable virtual-host and location tree built
//! once at startup.

pub mod models;
pub mod parser;

pub use models::{CgiMapping, Config, Location, Redirect, VirtualHost};
pub use parser::{load, parse};
