use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use http::StatusCode;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::proxy::AppContext;
use crate::proxy::fingerprint::Fingerprint;
use crate::proxy::translate::TranslatedRequest;

use super::codec::{BodyReader, ChunkState, RequestHead, read_request_head};
use super::{pipeline, respond};

/// One connection, one proxied exchange. Every response goes out with
/// `Connection: close`, so the request loop is a single pass.
pub async fn handle_http(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;
    let write_timeout = app.settings.client_write_timeout();

    let head = match read_request_head(&mut reader, app.settings.max_header_size).await? {
        Some(head) => head,
        None => return Ok(()),
    };

    if head.target == "/ping" || head.target.starts_with("/ping?") {
        debug!(peer = %peer, "serving liveness check");
        respond::plain_text(&mut writer, StatusCode::OK, "pong", write_timeout).await?;
        return shutdown(writer).await;
    }
    if head.target == "/status" || head.target.starts_with("/status?") {
        serve_status(&app, &mut writer).await?;
        return shutdown(writer).await;
    }

    let body = read_request_body(&mut reader, &head, app.settings.max_request_body_size).await?;

    let translated = match TranslatedRequest::from_head(&head) {
        Ok(translated) => translated,
        Err(err) => {
            info!(peer = %peer, target = %head.target, "rejecting untranslatable path");
            respond::plain_text(
                &mut writer,
                StatusCode::NOT_FOUND,
                &format!("{err}\n"),
                write_timeout,
            )
            .await?;
            return shutdown(writer).await;
        }
    };

    let key = Fingerprint::compute(
        &translated.method,
        &translated.full_url,
        body.as_deref(),
        &app.settings.exclusions(),
    );
    let proxy_base = proxy_base(&head, &translated.namespace, peer);

    pipeline::handle(
        &app,
        &mut writer,
        &translated,
        &key,
        body.as_deref(),
        &proxy_base,
    )
    .await?;
    shutdown(writer).await
}

async fn shutdown<W: AsyncWriteExt + Unpin>(mut writer: W) -> Result<()> {
    let _ = writer.shutdown().await;
    Ok(())
}

async fn serve_status<W>(app: &AppContext, writer: &mut W) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let write_timeout = app.settings.client_write_timeout();
    if !app.settings.expose_status {
        let body = serde_json::to_vec_pretty(&serde_json::json!({
            "error": "The status service is disabled; start the proxy with expose_status enabled to turn it on."
        }))?;
        return respond::json(writer, StatusCode::FORBIDDEN, &body, write_timeout).await;
    }
    let body = serde_json::to_vec_pretty(&app.registry.snapshot())?;
    respond::json(writer, StatusCode::OK, &body, write_timeout).await
}

/// Buffers the inbound request body, either length-framed or chunked. Bodies
/// are forwarded whole and folded into the fingerprint, so streaming them is
/// not an option.
async fn read_request_body<R>(
    reader: &mut R,
    head: &RequestHead,
    max_size: usize,
) -> Result<Option<Vec<u8>>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut body_reader = if head.headers.is_chunked() {
        BodyReader::Chunked {
            state: ChunkState::AwaitingSize,
        }
    } else {
        match head.headers.content_length()? {
            Some(0) | None => return Ok(None),
            Some(length) => {
                if length > max_size as u64 {
                    bail!("request body of {length} bytes exceeds the configured limit");
                }
                BodyReader::Length { remaining: length }
            }
        }
    };

    let mut body = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = body_reader
            .next_chunk(reader, &mut buf)
            .await
            .context("failed to read request body")?;
        if read == 0 {
            break;
        }
        if body.len() + read > max_size {
            bail!("request body exceeds the configured limit of {max_size} bytes");
        }
        body.extend_from_slice(&buf[..read]);
    }
    if body.is_empty() {
        return Ok(None);
    }
    Ok(Some(body))
}

/// The externally visible base URL that rewritten links must route through,
/// derived from the client's own Host header so links work from wherever the
/// client reached us.
fn proxy_base(head: &RequestHead, namespace: &str, peer: SocketAddr) -> String {
    let host = head
        .headers
        .get("host")
        .map(|host| host.to_string())
        .unwrap_or_else(|| {
            warn!(peer = %peer, "request without Host header; falling back to peer-facing address");
            peer.to_string()
        });
    format!("http://{host}/{namespace}/")
}
