use once_cell::sync::Lazy;
use regex::Regex;

// Escaped-slash protocol separators as they appear in serialized JSON,
// e.g. `http:\/\/` or `http:\\/\\/`.
static ESCAPED_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":(?:\\+/\\*/|\\+//)").unwrap());

/// Rewrites absolute URLs in a text body so that follow-up fetches loop back
/// through the proxy. `proxy_base` is the externally visible base path,
/// e.g. `http://host:port/<namespace>/`.
///
/// Not idempotent: must run exactly once per serve, always from the pristine
/// stored bytes.
pub fn rewrite_body(body: &str, proxy_base: &str) -> String {
    let body = ESCAPED_SEPARATOR.replace_all(body, "/");
    let body = body.replace("http://", &format!("{proxy_base}http/"));
    let body = body.replace("https://", &format!("{proxy_base}https/"));
    let body = body.replace("\"https\"", &format!("\"{proxy_base}https\""));
    let body = body.replace("\"http\"", &format!("\"{proxy_base}http\""));
    rewrite_leftover_separators(&body)
}

/// Catch-all for schemes other than http(s): any remaining `://` keeps its
/// scheme but loses the separator, `ws://host` becomes `ws/host`.
fn rewrite_leftover_separators(body: &str) -> String {
    let bytes = body.as_bytes();
    let mut out = String::with_capacity(body.len());
    let mut pos = 0;
    while let Some(found) = body[pos..].find("://") {
        let idx = pos + found;
        let preceding = &bytes[idx.saturating_sub(4)..idx];
        if preceding == b"http" || preceding == b"ttps" {
            out.push_str(&body[pos..idx + 3]);
        } else {
            out.push_str(&body[pos..idx]);
            out.push('/');
        }
        pos = idx + 3;
    }
    out.push_str(&body[pos..]);
    out
}
