//! Maps a request onto a virtual host and the longest-prefix location in it.
//!
//! Prefixes match literally: `/foo` and `/foo/` are different locations, and a
//! request for `/foo` never reaches a `/foo/` block.

use crate::config::{Location, VirtualHost};
use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Indices of the matched host and location inside the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMatch {
    pub host: usize,
    pub location: usize,
}

/// Picks the host among `candidates` (the hosts sharing the listening socket)
/// whose alias equals `host_header`. Falls back to the first candidate.
pub fn select_host(hosts: &[VirtualHost], candidates: &[usize], host_header: Option<&str>) -> usize {
    let fallback = candidates.first().copied().unwrap_or(0);
    let Some(name) = host_header else {
        return fallback;
    };
    candidates
        .iter()
        .copied()
        .find(|&i| hosts.get(i).is_some_and(|h| h.answers_to(name)))
        .unwrap_or(fallback)
}

/// Longest literal prefix match within one host.
pub fn match_location(host: &VirtualHost, path: &str) -> Result<usize> {
    host.locations
        .iter()
        .enumerate()
        .filter(|(_, l)| path.starts_with(l.prefix.as_str()))
        .max_by_key(|(_, l)| l.prefix.len())
        .map(|(i, _)| i)
        .ok_or(Error::NotFound)
}

/// Filesystem path for a canonical request path under the location's root.
///
/// The whole request path is appended to the root. Anything that would climb
/// out of the root is refused.
pub fn resolve_disk_path(location: &Location, path: &str) -> Result<PathBuf> {
    let relative = Path::new(path.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Error::Forbidden);
    }
    Ok(location.root.join(relative))
}
