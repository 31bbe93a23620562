//! CGI/1.1 meta-variables.

use crate::handlers::Context;
use crate::http::request::Request;
use crate::http::response::SERVER_SOFTWARE;
use std::path::Path;

/// Where the script name ends inside a request path.
#[derive(Debug, PartialEq, Eq)]
pub struct ScriptPath<'a> {
    pub script_name: &'a str,
    pub path_info: &'a str,
}

/// Builds the complete environment for one script invocation. The child
/// starts from an empty environment, so everything it sees comes from here.
pub fn build(
    ctx: &Context<'_>,
    request: &Request,
    script: &ScriptPath<'_>,
    script_filename: &Path,
) -> Vec<(String, String)> {
    let server_name = request
        .host()
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .or_else(|| ctx.host.server_names.first().cloned())
        .unwrap_or_else(|| ctx.host.host.clone());

    let mut env: Vec<(String, String)> = vec![
        ("GATEWAY_INTERFACE".into(), "CGI/1.1".into()),
        ("SERVER_PROTOCOL".into(), request.version.as_str().into()),
        ("SERVER_SOFTWARE".into(), SERVER_SOFTWARE.into()),
        ("SERVER_NAME".into(), server_name),
        ("SERVER_PORT".into(), ctx.local.port().to_string()),
        ("REQUEST_METHOD".into(), request.method.as_str().into()),
        ("REQUEST_URI".into(), request.target.clone()),
        ("SCRIPT_NAME".into(), script.script_name.into()),
        ("SCRIPT_FILENAME".into(), script_filename.display().to_string()),
        ("PATH_INFO".into(), script.path_info.into()),
        ("QUERY_STRING".into(), request.query.clone()),
        ("REMOTE_ADDR".into(), ctx.peer.ip().to_string()),
        ("REMOTE_PORT".into(), ctx.peer.port().to_string()),
        ("REDIRECT_STATUS".into(), "200".into()),
    ];

    if !script.path_info.is_empty() {
        let translated = ctx.location.root.join(script.path_info.trim_start_matches('/'));
        env.push(("PATH_TRANSLATED".into(), translated.display().to_string()));
    }
    if !request.body.is_empty() || request.method.expects_body() {
        env.push(("CONTENT_LENGTH".into(), request.body.len().to_string()));
    }
    if let Some(ct) = request.headers.get("content-type") {
        env.push(("CONTENT_TYPE".into(), ct.to_string()));
    }
    if let Ok(path) = std::env::var("PATH") {
        env.push(("PATH".into(), path));
    }

    for (name, value) in request.headers.iter() {
        let lower = name.to_ascii_lowercase();
        // Already exposed above, or framing that no longer applies.
        if matches!(
            lower.as_str(),
            "content-type" | "content-length" | "transfer-encoding" | "proxy"
        ) {
            continue;
        }
        let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        env.push((key, value.to_string()));
    }
    env
}

/// Splits `path` after the first segment whose name has a CGI mapping in
/// `is_script`. Returns `None` when no segment qualifies.
pub fn split_script<'a>(path: &'a str, is_script: impl Fn(&str) -> bool) -> Option<ScriptPath<'a>> {
    let mut end = 0;
    for segment in path.strip_prefix('/')?.split('/') {
        end += 1 + segment.len();
        if is_script(segment) {
            return Some(ScriptPath {
                script_name: &path[..end],
                path_info: &path[end..],
            });
        }
    }
    None
}
