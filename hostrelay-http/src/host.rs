//! Request host and path normalisation

use hyper::header::HOST;
use hyper::Request;

/// Host and port a public request targets.
///
/// The host is lowercased with any trailing dot removed; the port is the
/// text after the last colon, or empty when the request named none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHost {
    pub host: String,
    pub port: String,
}

/// Extract the target host from the `Host` header, falling back to the
/// request URI's authority. `None` when neither names a host.
pub fn request_host<B>(req: &Request<B>) -> Option<RequestHost> {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .or_else(|| req.uri().authority().map(hyper::http::uri::Authority::as_str))?;
    parse_host(raw)
}

/// Split `host[:port]`, handling bracketed IPv6 literals.
pub fn parse_host(raw: &str) -> Option<RequestHost> {
    let raw = raw.trim();
    let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
        let end = rest.find(']')?;
        let port = rest[end + 1..].strip_prefix(':').unwrap_or_default();
        (&rest[..end], port)
    } else if raw.matches(':').count() > 1 {
        // Bare IPv6 literal, no port
        (raw, "")
    } else {
        match raw.split_once(':') {
            Some((host, port)) => (host, port),
            None => (raw, ""),
        }
    };

    let host = host.to_ascii_lowercase();
    let host = host.strip_suffix('.').unwrap_or(&host);
    if host.is_empty() {
        return None;
    }
    Some(RequestHost {
        host: host.to_string(),
        port: port.to_string(),
    })
}

/// Lexically clean a URL path: collapse repeated slashes, resolve `.` and
/// `..`, drop any trailing slash. Always returns an absolute path.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            segment => parts.push(segment),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Whether `path` addresses the tunnel control endpoint
pub fn is_control_path(path: &str) -> bool {
    let mut cleaned = clean_path(path);
    cleaned.push('/');
    cleaned == hostrelay_protocol::constants::CONTROL_PATH
}
