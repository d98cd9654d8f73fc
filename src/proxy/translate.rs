use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::Method;
use thiserror::Error;

use super::http::codec::{HeaderList, RequestHead};

pub const DEFAULT_NAMESPACE: &str = "default";

/// Headers that must never reach the origin: compressed bodies cannot be
/// rewritten, conditional requests can come back as bodiless 304s, and range
/// responses would poison the store with partial representations.
const STRIPPED_REQUEST_HEADERS: [&str; 4] = [
    "accept-encoding",
    "if-modified-since",
    "if-none-match",
    "range",
];

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error(
        "The URL provided was not absolute, and relative paths cannot be resolved ({path})"
    )]
    RelativePath { path: String },
    #[error("malformed origin URL in request path ({path})")]
    MalformedUrl { path: String },
}

/// Everything needed to forward one request to its origin, derived from the
/// inbound proxy path.
#[derive(Debug)]
pub struct TranslatedRequest {
    pub namespace: String,
    pub full_url: String,
    pub https: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub method: Method,
    pub headers: HeaderList,
}

impl TranslatedRequest {
    pub fn from_head(head: &RequestHead) -> Result<Self, TranslateError> {
        translate(&head.method, &head.target, &head.headers)
    }
}

/// Parses `/<namespace>?/http(s)/<url>` into origin request options. The
/// namespace segment is optional; its absence selects [`DEFAULT_NAMESPACE`].
pub fn translate(
    method: &Method,
    target: &str,
    inbound_headers: &HeaderList,
) -> Result<TranslatedRequest, TranslateError> {
    let (namespace, url_path) = split_namespace(target);
    let full_url = absolute_url(&url_path).ok_or_else(|| TranslateError::RelativePath {
        path: target.to_string(),
    })?;

    let https = full_url.starts_with("https://");
    let after_scheme = full_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(&full_url);
    let (authority, path) = match after_scheme.find('/') {
        Some(idx) => (&after_scheme[..idx], &after_scheme[idx..]),
        None => (after_scheme, "/"),
    };
    let (userinfo, host_port) = match authority.rsplit_once('@') {
        Some((userinfo, host_port)) => (Some(userinfo), host_port),
        None => (None, authority),
    };
    let default_port = if https { 443 } else { 80 };
    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| TranslateError::MalformedUrl {
                path: target.to_string(),
            })?;
            (host, port)
        }
        None => (host_port, default_port),
    };
    if host.is_empty() {
        return Err(TranslateError::MalformedUrl {
            path: target.to_string(),
        });
    }
    let host = host.to_string();
    let path = path.to_string();

    let mut headers: HeaderList = inbound_headers
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    for name in STRIPPED_REQUEST_HEADERS {
        headers.remove(name);
    }
    // Virtual hosts behind nonstandard ports route on host:port.
    if port == default_port {
        headers.set("host", host.as_str());
    } else {
        headers.set("host", format!("{host}:{port}"));
    }
    if let Some(userinfo) = userinfo {
        headers.set(
            "authorization",
            format!("Basic {}", BASE64.encode(userinfo)),
        );
    }

    Ok(TranslatedRequest {
        namespace,
        full_url,
        https,
        host,
        port,
        path,
        method: method.clone(),
        headers,
    })
}

/// Lops an optional leading namespace segment off the request path. Anything
/// before the first `/http/` or `/https/` marker is the namespace, sanitized
/// to lowercase `[a-z0-9_-]`.
fn split_namespace(target: &str) -> (String, String) {
    let mut parts = target.splitn(3, '/');
    let _leading = parts.next();
    let first = parts.next().unwrap_or("");
    if first.starts_with("http") {
        return (DEFAULT_NAMESPACE.to_string(), target.to_string());
    }
    let rest = parts.next().unwrap_or("");
    let namespace = sanitize_namespace(first);
    let namespace = if namespace.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        namespace
    };
    (namespace, format!("/{rest}"))
}

fn sanitize_namespace(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_')
        .collect()
}

/// Turns `/http/host/path` into `http://host/path`; `None` when the path has
/// no absolute-URL marker.
fn absolute_url(url_path: &str) -> Option<String> {
    if let Some(rest) = url_path.strip_prefix("/https/") {
        Some(format!("https://{rest}"))
    } else {
        url_path
            .strip_prefix("/http/")
            .map(|rest| format!("http://{rest}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderList {
        let mut list = HeaderList::new();
        for (name, value) in pairs {
            list.push(*name, *value);
        }
        list
    }

    #[test]
    fn default_namespace_without_segment() {
        let translated = translate(
            &Method::GET,
            "/http/example.com/a?x=1",
            &headers(&[("Host", "localhost:8092")]),
        )
        .unwrap();
        assert_eq!(translated.namespace, "default");
        assert_eq!(translated.full_url, "http://example.com/a?x=1");
        assert_eq!(translated.host, "example.com");
        assert_eq!(translated.port, 80);
        assert_eq!(translated.path, "/a?x=1");
        assert!(!translated.https);
    }

    #[test]
    fn explicit_namespace_is_sanitized() {
        let translated = translate(
            &Method::GET,
            "/My_Run.01/https/example.com:8443/a",
            &HeaderList::new(),
        )
        .unwrap();
        assert_eq!(translated.namespace, "my_run01");
        assert_eq!(translated.full_url, "https://example.com:8443/a");
        assert_eq!(translated.port, 8443);
        assert!(translated.https);
    }

    #[test]
    fn relative_paths_are_rejected() {
        let err = translate(&Method::GET, "/styles/site.css", &HeaderList::new()).unwrap_err();
        assert!(matches!(err, TranslateError::RelativePath { .. }));
    }

    #[test]
    fn host_header_points_at_the_origin() {
        let translated = translate(
            &Method::GET,
            "/http/api.example.com/v1",
            &headers(&[("Host", "localhost:8092"), ("Accept", "*/*")]),
        )
        .unwrap();
        assert_eq!(translated.headers.get("host"), Some("api.example.com"));
        assert_eq!(translated.headers.get("accept"), Some("*/*"));
    }

    #[test]
    fn nonstandard_port_is_kept_in_the_host_header() {
        let translated = translate(
            &Method::GET,
            "/http/example.com:8081/a",
            &headers(&[("Host", "localhost:8092")]),
        )
        .unwrap();
        assert_eq!(translated.host, "example.com");
        assert_eq!(translated.port, 8081);
        assert_eq!(translated.headers.get("host"), Some("example.com:8081"));
    }

    #[test]
    fn default_port_host_header_omits_the_port() {
        let translated = translate(
            &Method::GET,
            "/https/example.com:443/a",
            &HeaderList::new(),
        )
        .unwrap();
        assert_eq!(translated.headers.get("host"), Some("example.com"));
    }

    #[test]
    fn conditional_and_encoding_headers_are_stripped() {
        let translated = translate(
            &Method::GET,
            "/http/example.com/a",
            &headers(&[
                ("Accept-Encoding", "gzip"),
                ("If-Modified-Since", "Mon, 01 Jan 2024 00:00:00 GMT"),
                ("If-None-Match", "\"abc\""),
                ("Range", "bytes=0-100"),
            ]),
        )
        .unwrap();
        assert!(!translated.headers.contains("accept-encoding"));
        assert!(!translated.headers.contains("if-modified-since"));
        assert!(!translated.headers.contains("if-none-match"));
        assert!(!translated.headers.contains("range"));
    }

    #[test]
    fn url_userinfo_becomes_basic_auth() {
        let translated = translate(
            &Method::GET,
            "/http/user:secret@example.com/private",
            &HeaderList::new(),
        )
        .unwrap();
        assert_eq!(translated.host, "example.com");
        assert_eq!(
            translated.headers.get("authorization"),
            Some("Basic dXNlcjpzZWNyZXQ=")
        );
    }

    #[test]
    fn bare_host_gets_root_path() {
        let translated = translate(&Method::GET, "/http/example.com", &HeaderList::new()).unwrap();
        assert_eq!(translated.path, "/");
    }
}
