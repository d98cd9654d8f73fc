use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use tokio::io::AsyncWrite;

use crate::io_util::write_all_with_timeout;

use super::codec::HeaderList;

/// Serializes and sends a response head. Body bytes follow separately on the
/// streaming paths.
pub async fn write_head<S>(
    stream: &mut S,
    status: StatusCode,
    headers: &HeaderList,
    write_timeout: Duration,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let mut out = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason).into_bytes();
    for (name, value) in headers.iter() {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    write_all_with_timeout(stream, &out, write_timeout, "writing response head").await
}

/// Complete response with a recomputed content-length and `Connection:
/// close`, the framing every proxied exchange uses.
pub async fn write_response<S>(
    stream: &mut S,
    status: StatusCode,
    headers: &HeaderList,
    body: &[u8],
    write_timeout: Duration,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut headers = headers.clone();
    headers.set("content-length", body.len().to_string());
    headers.set("connection", "close");
    headers.remove("transfer-encoding");
    write_head(stream, status, &headers, write_timeout).await?;
    write_all_with_timeout(stream, body, write_timeout, "writing response body").await
}

pub async fn plain_text<S>(
    stream: &mut S,
    status: StatusCode,
    body: &str,
    write_timeout: Duration,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut headers = HeaderList::new();
    headers.push("content-type", "text/plain");
    write_response(stream, status, &headers, body.as_bytes(), write_timeout).await
}

pub async fn json<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    write_timeout: Duration,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut headers = HeaderList::new();
    headers.push("content-type", "application/json");
    write_response(stream, status, &headers, body, write_timeout).await
}
