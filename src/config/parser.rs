use crate::config::models::{
    CgiMapping, Config, DEFAULT_MAX_BODY_SIZE, Location, Redirect, VirtualHost,
};
use crate::error::{Error, Result};
use crate::http::method::Method;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(PartialEq)]
enum ParseMode {
    General,
    ErrorPages,
    Routes,
}

struct ServerDraft {
    line: usize,
    host: String,
    port: Option<u16>,
    server_names: Vec<String>,
    max_body_size: usize,
    error_pages: HashMap<u16, PathBuf>,
    routes: Vec<RouteDraft>,
}

struct RouteDraft {
    line: usize,
    location: Location,
    max_body_size: Option<usize>,
}

pub fn load(path: impl AsRef<Path>) -> Result<Config> {
    let content = fs::read_to_string(path)?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config> {
    let mut config = Config {
        servers: Vec::new(),
        timeout_seconds: 30,
        cgi_timeout_seconds: 10,
    };

    let mut current_server: Option<ServerDraft> = None;
    let mut mode = ParseMode::General;

    for (idx, raw_line) in content.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw_line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let indent = raw_line.chars().take_while(|c| c.is_whitespace()).count();
        let (key, value) = split_kv(trimmed);

        match indent {
            0 => {
                if let Some(s) = current_server.take() {
                    config.servers.push(finish_server(s)?);
                }
                match key {
                    "servers" => {}
                    "timeout_seconds" => config.timeout_seconds = parse_seconds(line, value)?,
                    "cgi_timeout_seconds" => {
                        config.cgi_timeout_seconds = parse_seconds(line, value)?
                    }
                    _ => return Err(Error::config(line, format!("unknown key `{}`", key))),
                }
            }
            2 => {
                // "- host: ..." starts a new server block
                let Some(after_dash) = trimmed.strip_prefix("- ").or(trimmed.strip_prefix('-'))
                else {
                    return Err(Error::config(line, "expected `- ` starting a server block"));
                };
                if let Some(s) = current_server.take() {
                    config.servers.push(finish_server(s)?);
                }
                let mut server = default_server(line);
                mode = ParseMode::General;

                let after_dash = after_dash.trim();
                if !after_dash.is_empty() {
                    let (k, v) = split_kv(after_dash);
                    apply_server_field(&mut server, line, k, v)?;
                }
                current_server = Some(server);
            }
            _ => {
                let Some(server) = current_server.as_mut() else {
                    return Err(Error::config(line, "setting outside of a server block"));
                };

                if indent == 4 && !(mode == ParseMode::Routes && trimmed.starts_with("- ")) {
                    mode = match key {
                        "error_pages" => ParseMode::ErrorPages,
                        "routes" => ParseMode::Routes,
                        _ => {
                            apply_server_field(server, line, key, value)?;
                            ParseMode::General
                        }
                    };
                    continue;
                }

                match mode {
                    ParseMode::ErrorPages => {
                        let code = key
                            .parse::<u16>()
                            .ok()
                            .filter(|c| (300..600).contains(c))
                            .ok_or_else(|| Error::config(line, "error page key must be a status code"))?;
                        server.error_pages.insert(code, PathBuf::from(value));
                    }
                    ParseMode::Routes => {
                        if let Some(after_dash) = trimmed.strip_prefix("- ") {
                            server.routes.push(default_route(line));
                            let (k, v) = split_kv(after_dash.trim());
                            if let Some(route) = server.routes.last_mut() {
                                apply_route_field(route, line, k, v)?;
                            }
                        } else if let Some(route) = server.routes.last_mut() {
                            apply_route_field(route, line, key, value)?;
                        } else {
                            return Err(Error::config(line, "route setting before `- path:`"));
                        }
                    }
                    ParseMode::General => {
                        return Err(Error::config(line, "unexpected indentation"));
                    }
                }
            }
        }
    }

    if let Some(s) = current_server {
        config.servers.push(finish_server(s)?);
    }

    if config.servers.is_empty() {
        return Err(Error::config(0, "no servers configured"));
    }
    Ok(config)
}

fn finish_server(draft: ServerDraft) -> Result<VirtualHost> {
    let port = draft
        .port
        .ok_or_else(|| Error::config(draft.line, "server block has no port"))?;

    let mut locations: Vec<Location> = Vec::with_capacity(draft.routes.len());
    for route in draft.routes {
        if locations.iter().any(|l| l.prefix == route.location.prefix) {
            return Err(Error::config(
                route.line,
                format!("duplicate route `{}`", route.location.prefix),
            ));
        }
        let mut location = route.location;
        location.client_max_body_size = route.max_body_size.unwrap_or(draft.max_body_size);
        locations.push(location);
    }

    Ok(VirtualHost {
        host: draft.host,
        port,
        server_names: draft.server_names,
        client_max_body_size: draft.max_body_size,
        error_pages: draft.error_pages,
        locations,
    })
}

fn apply_server_field(server: &mut ServerDraft, line: usize, key: &str, value: &str) -> Result<()> {
    match key {
        "host" => {
            server.host = value.to_string();
        }
        "port" => {
            let port = value
                .parse::<u16>()
                .map_err(|_| Error::config(line, format!("invalid port `{}`", value)))?;
            server.port = Some(port);
        }
        "server_name" => {
            server.server_names.push(value.to_string());
        }
        "server_names" => {
            server.server_names.extend(parse_list(value));
        }
        "client_max_body_size" | "max_body_size" => {
            server.max_body_size = parse_size(line, value)?;
        }
        _ => return Err(Error::config(line, format!("unknown server key `{}`", key))),
    }
    Ok(())
}

fn apply_route_field(route: &mut RouteDraft, line: usize, key: &str, value: &str) -> Result<()> {
    let location = &mut route.location;
    match key {
        "path" => {
            if !value.starts_with('/') {
                return Err(Error::config(line, "route path must start with `/`"));
            }
            location.prefix = value.to_string();
        }
        "root" => {
            location.root = PathBuf::from(value);
        }
        "index" => {
            location.index = parse_list(value);
        }
        "autoindex" => {
            location.autoindex = parse_bool(line, value)?;
        }
        "methods" => {
            let mut methods = Vec::new();
            for name in parse_list(value) {
                let m = Method::from_config(&name)
                    .ok_or_else(|| Error::config(line, format!("unknown method `{}`", name)))?;
                methods.push(m);
            }
            location.methods = Some(methods);
        }
        "client_max_body_size" => {
            route.max_body_size = Some(parse_size(line, value)?);
        }
        "redirect" => {
            location.redirect = Some(parse_redirect(line, value)?);
        }
        "upload_dir" => {
            location.upload_dir = Some(PathBuf::from(value));
        }
        "cgi" => {
            location.cgi = parse_cgi_map(line, value)?;
        }
        "cgi_extension" => {
            location.cgi.push(CgiMapping {
                extension: parse_extension(line, value)?,
                interpreter: None,
            });
        }
        "cgi_interpreter" => {
            let mapping = location
                .cgi
                .last_mut()
                .ok_or_else(|| Error::config(line, "cgi_interpreter without cgi_extension"))?;
            mapping.interpreter = Some(PathBuf::from(value));
        }
        _ => return Err(Error::config(line, format!("unknown route key `{}`", key))),
    }
    Ok(())
}

fn split_kv(line: &str) -> (&str, &str) {
    if let Some((k, v)) = line.split_once(':') {
        (k.trim(), v.trim().trim_matches('"').trim_matches('\''))
    } else {
        (line.trim(), "")
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .trim_matches(|c| c == '[' || c == ']' || c == ' ')
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(line: usize, value: &str) -> Result<bool> {
    match value {
        "true" | "on" | "yes" => Ok(true),
        "false" | "off" | "no" => Ok(false),
        _ => Err(Error::config(line, format!("expected a boolean, got `{}`", value))),
    }
}

fn parse_seconds(line: usize, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .ok()
        .filter(|&s| s > 0)
        .ok_or_else(|| Error::config(line, format!("invalid number of seconds `{}`", value)))
}

/// Parses `1000`, `10k`, `1m` or `1g` into bytes.
pub fn parse_size(line: usize, value: &str) -> Result<usize> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&value[..value.len() - 1], 1024),
        Some('m') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| Error::config(line, format!("invalid size `{}`", value)))
}

fn parse_redirect(line: usize, value: &str) -> Result<Redirect> {
    let mut parts = value.split_whitespace();
    let first = parts
        .next()
        .ok_or_else(|| Error::config(line, "redirect needs a target"))?;

    let (code, target) = match first.parse::<u16>() {
        Ok(code) => {
            let target = parts
                .next()
                .ok_or_else(|| Error::config(line, "redirect needs a target"))?;
            (code, target)
        }
        Err(_) => (301, first),
    };
    if ![301, 302, 303, 307, 308].contains(&code) {
        return Err(Error::config(line, format!("`{}` is not a redirect status", code)));
    }
    Ok(Redirect {
        code,
        target: target.to_string(),
    })
}

fn parse_extension(line: usize, value: &str) -> Result<String> {
    if value.len() < 2 || !value.starts_with('.') {
        return Err(Error::config(line, format!("invalid cgi extension `{}`", value)));
    }
    Ok(value.to_string())
}

/// Parses an inline map such as `{ .py: /usr/bin/python3, .cgi: }`.
fn parse_cgi_map(line: usize, value: &str) -> Result<Vec<CgiMapping>> {
    let inner = value
        .trim()
        .strip_prefix('{')
        .and_then(|v| v.strip_suffix('}'))
        .ok_or_else(|| Error::config(line, "cgi expects an inline map `{ .ext: interpreter }`"))?;

    let mut mappings = Vec::new();
    for entry in inner.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (ext, interpreter) = entry.split_once(':').unwrap_or((entry, ""));
        let interpreter = interpreter.trim().trim_matches('"');
        mappings.push(CgiMapping {
            extension: parse_extension(line, ext.trim())?,
            interpreter: match interpreter {
                "" | "~" => None,
                path => Some(PathBuf::from(path)),
            },
        });
    }
    Ok(mappings)
}

fn default_server(line: usize) -> ServerDraft {
    ServerDraft {
        line,
        host: "0.0.0.0".to_string(),
        port: None,
        server_names: Vec::new(),
        max_body_size: DEFAULT_MAX_BODY_SIZE,
        error_pages: HashMap::new(),
        routes: Vec::new(),
    }
}

fn default_route(line: usize) -> RouteDraft {
    RouteDraft {
        line,
        location: Location {
            prefix: "/".to_string(),
            methods: None,
            root: PathBuf::from("./www"),
            index: Vec::new(),
            autoindex: false,
            client_max_body_size: DEFAULT_MAX_BODY_SIZE,
            redirect: None,
            cgi: Vec::new(),
            upload_dir: None,
        },
        max_body_size: None,
    }
}
