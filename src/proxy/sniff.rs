use once_cell::sync::Lazy;
use regex::Regex;

static TEXT_LIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(text|json|xml|javascript)").unwrap());

/// Whether a declared content-type should take the buffer-and-rewrite path.
pub fn is_text_like(content_type: &str) -> bool {
    TEXT_LIKE.is_match(content_type)
}

/// Magic-byte MIME detection for buffered bodies. Returns `None` when the
/// leading bytes match no known binary signature, in which case the declared
/// content-type stands.
pub fn sniff_mime(body: &[u8]) -> Option<&'static str> {
    if body.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if body.starts_with(b"\xff\xd8\xff") {
        Some("image/jpeg")
    } else if body.starts_with(b"GIF87a") || body.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if body.starts_with(b"RIFF") && body.get(8..12) == Some(b"WEBP") {
        Some("image/webp")
    } else if body.starts_with(b"%PDF-") {
        Some("application/pdf")
    } else if body.starts_with(b"PK\x03\x04") {
        Some("application/zip")
    } else if body.starts_with(b"\x1f\x8b") {
        Some("application/gzip")
    } else if body.starts_with(b"OggS") {
        Some("application/ogg")
    } else if body.get(4..8) == Some(b"ftyp") {
        Some("video/mp4")
    } else if body.starts_with(b"wOFF") {
        Some("font/woff")
    } else if body.starts_with(b"wOF2") {
        Some("font/woff2")
    } else if body.starts_with(b"\x00\x00\x01\x00") {
        Some("image/x-icon")
    } else if body.starts_with(b"BM") && body.len() > 14 {
        Some("image/bmp")
    } else {
        None
    }
}

/// Resolves the content-type to persist for a buffered body: a sniffed binary
/// signature overrides a mislabeled text-like declaration.
pub fn corrected_content_type<'a>(declared: &'a str, body: &[u8]) -> &'a str {
    match sniff_mime(body) {
        Some(sniffed) if sniffed != declared => sniffed,
        _ => declared,
    }
}
