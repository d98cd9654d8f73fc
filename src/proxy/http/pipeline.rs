use anyhow::{Context, Result};
use http::StatusCode;
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use crate::io_util::{copy_with_write_timeout, write_all_with_timeout};
use crate::proxy::AppContext;
use crate::proxy::failure;
use crate::proxy::fingerprint::Fingerprint;
use crate::proxy::rewrite::rewrite_body;
use crate::proxy::sniff;
use crate::proxy::store::EntryMetadata;
use crate::proxy::translate::TranslatedRequest;
use crate::proxy::upstream;

use super::codec::HeaderList;
use super::respond;

const SERVED_FROM_CACHE: &str = "Cache";
const SERVED_FROM_ORIGIN: &str = "Fresh/Internet";

/// Serves one translated request: from the store when the entry is published,
/// otherwise by capturing from the origin. Passthrough mode forces the
/// capture path and purges whatever it published once the client is served.
pub async fn handle<W>(
    app: &AppContext,
    writer: &mut W,
    request: &TranslatedRequest,
    key: &Fingerprint,
    body: Option<&[u8]>,
    proxy_base: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let hit = !app.settings.passthrough
        && app
            .store
            .exists(&request.namespace, key)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, key = %key, "existence check failed; treating as miss");
                false
            });

    if hit {
        let mut head_sent = false;
        match serve_from_store(app, writer, request, key, proxy_base, &mut head_sent).await {
            Ok(()) => Ok(()),
            Err(err) if head_sent => {
                // The status line is already on the wire; appending a
                // diagnostic body would corrupt the partial response.
                warn!(url = %request.full_url, error = %format!("{err:#}"), "failed mid-response; closing connection");
                Err(err)
            }
            Err(err) => storage_failure(app, writer, request, err).await,
        }
    } else {
        capture_then_serve(app, writer, request, key, body, proxy_base).await
    }
}

async fn serve_from_store<W>(
    app: &AppContext,
    writer: &mut W,
    request: &TranslatedRequest,
    key: &Fingerprint,
    proxy_base: &str,
    head_sent: &mut bool,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let metadata = app.store.read_metadata(&request.namespace, key).await?;
    let status = metadata.status_code();
    let mut headers = metadata.header_list();
    attach_proxy_headers(&mut headers, key, &request.namespace, SERVED_FROM_CACHE);
    headers.set("access-control-allow-origin", "*");
    info!(url = %request.full_url, key = %key, status = %status, "serving from cache");

    let content_type = headers.get("content-type").unwrap_or("").to_string();
    let write_timeout = app.settings.client_write_timeout();
    if sniff::is_text_like(&content_type) {
        let stored = app.store.read_body(&request.namespace, key).await?;
        let rewritten = rewrite_body(&String::from_utf8_lossy(&stored), proxy_base);
        *head_sent = true;
        respond::write_response(writer, status, &headers, rewritten.as_bytes(), write_timeout)
            .await
    } else {
        let mut file = app.store.open_body(&request.namespace, key).await?;
        let length = file
            .metadata()
            .await
            .context("failed to stat cached body")?
            .len();
        headers.set("content-length", length.to_string());
        headers.set("connection", "close");
        headers.remove("transfer-encoding");
        *head_sent = true;
        respond::write_head(writer, status, &headers, write_timeout).await?;
        copy_with_write_timeout(&mut file, writer, write_timeout, "streaming cached body").await?;
        Ok(())
    }
}

async fn capture_then_serve<W>(
    app: &AppContext,
    writer: &mut W,
    request: &TranslatedRequest,
    key: &Fingerprint,
    body: Option<&[u8]>,
    proxy_base: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let _in_flight = app.registry.begin(&request.full_url);
    info!(url = %request.full_url, key = %key, method = %request.method, "capturing from origin");

    let mut exchange = match upstream::fetch(&app.settings, &app.tls, request, body).await {
        Ok(exchange) => exchange,
        Err(err) => return origin_failure(app, writer, request, err).await,
    };

    let status = exchange.head.status;
    let cacheable = status == StatusCode::OK
        || app.settings.allowed_error_statuses().contains(&status);
    let content_type = exchange
        .head
        .headers
        .get("content-type")
        .unwrap_or("")
        .to_string();

    if sniff::is_text_like(&content_type) {
        let captured = match read_to_end(&mut exchange).await {
            Ok(captured) => captured,
            Err(err) => return origin_failure(app, writer, request, err).await,
        };
        serve_buffered(app, writer, request, key, exchange.head.headers, status, cacheable, &captured, proxy_base)
            .await
    } else {
        stream_through(app, writer, request, key, exchange, cacheable).await
    }
}

async fn read_to_end(exchange: &mut upstream::OriginExchange) -> Result<Vec<u8>> {
    let mut captured = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = exchange
            .body
            .next_chunk(&mut exchange.reader, &mut buf)
            .await
            .context("failed to read origin response body")?;
        if read == 0 {
            return Ok(captured);
        }
        captured.extend_from_slice(&buf[..read]);
    }
}

/// Buffered path for text-declared bodies: sniff-correct the content type,
/// persist the pristine bytes, then serve through the same rewrite path cache
/// hits use.
#[allow(clippy::too_many_arguments)]
async fn serve_buffered<W>(
    app: &AppContext,
    writer: &mut W,
    request: &TranslatedRequest,
    key: &Fingerprint,
    origin_headers: HeaderList,
    status: StatusCode,
    cacheable: bool,
    captured: &[u8],
    proxy_base: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut headers = origin_headers;
    let declared = headers.get("content-type").unwrap_or("").to_string();
    let corrected = sniff::corrected_content_type(&declared, captured);
    if corrected != declared {
        debug!(declared = %declared, corrected = %corrected, url = %request.full_url, "content sniffing overrode declared type");
        headers.set("content-type", corrected);
    }
    let still_text = sniff::is_text_like(corrected);

    if cacheable {
        let metadata = EntryMetadata::new(status, &request.full_url, &headers);
        let outcome = async {
            let mut staged = app.store.stage(&request.namespace, key, &metadata).await?;
            staged.write_chunk(captured).await?;
            staged.publish().await
        }
        .await;
        if let Err(err) = outcome {
            return storage_failure(app, writer, request, err).await;
        }
    }

    attach_proxy_headers(&mut headers, key, &request.namespace, SERVED_FROM_ORIGIN);
    let write_timeout = app.settings.client_write_timeout();
    let result = if still_text {
        let rewritten = rewrite_body(&String::from_utf8_lossy(captured), proxy_base);
        respond::write_response(writer, status, &headers, rewritten.as_bytes(), write_timeout)
            .await
    } else {
        respond::write_response(writer, status, &headers, captured, write_timeout).await
    };

    finish_passthrough(app, request, key).await;
    result
}

/// Streaming path for binary bodies: each origin chunk goes to the staged
/// body file and then to the client. A client-side write failure aborts the
/// capture and discards the staged artifacts; nothing is published.
async fn stream_through<W>(
    app: &AppContext,
    writer: &mut W,
    request: &TranslatedRequest,
    key: &Fingerprint,
    mut exchange: upstream::OriginExchange,
    cacheable: bool,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let status = exchange.head.status;
    let origin_headers = exchange.head.headers.clone();

    let mut staged = if cacheable {
        let metadata = EntryMetadata::new(status, &request.full_url, &origin_headers);
        match app.store.stage(&request.namespace, key, &metadata).await {
            Ok(staged) => Some(staged),
            Err(err) => return storage_failure(app, writer, request, err).await,
        }
    } else {
        None
    };

    let mut headers = origin_headers;
    attach_proxy_headers(&mut headers, key, &request.namespace, SERVED_FROM_ORIGIN);
    headers.set("connection", "close");
    headers.remove("transfer-encoding");

    let write_timeout = app.settings.client_write_timeout();
    respond::write_head(writer, status, &headers, write_timeout).await?;

    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = match exchange.body.next_chunk(&mut exchange.reader, &mut buf).await {
            Ok(read) => read,
            Err(err) => {
                // Mid-stream origin failure: the head is already on the wire,
                // so all that is left is to drop the partial capture.
                warn!(url = %request.full_url, error = %err, "origin failed mid-body; discarding capture");
                if let Some(staged) = staged.take() {
                    staged.discard().await;
                }
                return Err(err);
            }
        };
        if read == 0 {
            break;
        }
        let mut staged_failed = false;
        if let Some(staged) = staged.as_mut() {
            if let Err(err) = staged.write_chunk(&buf[..read]).await {
                warn!(url = %request.full_url, error = %err, "staged write failed; continuing uncached");
                staged_failed = true;
            }
        }
        if staged_failed {
            if let Some(staged) = staged.take() {
                staged.discard().await;
            }
        }
        if let Err(err) = write_all_with_timeout(writer, &buf[..read], write_timeout, "streaming body to client").await {
            debug!(url = %request.full_url, error = %err, "client went away mid-stream; aborting capture");
            if let Some(staged) = staged.take() {
                staged.discard().await;
            }
            return Err(err);
        }
    }

    if let Some(staged) = staged.take() {
        staged.publish().await?;
    }
    finish_passthrough(app, request, key).await;
    Ok(())
}

/// Passthrough mode treats the store as scratch space: whatever this request
/// published is removed as soon as the client has been served.
async fn finish_passthrough(app: &AppContext, request: &TranslatedRequest, key: &Fingerprint) {
    if app.settings.passthrough {
        app.store.purge(&request.namespace, key).await;
    }
}

async fn origin_failure<W>(
    app: &AppContext,
    writer: &mut W,
    request: &TranslatedRequest,
    err: anyhow::Error,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    warn!(url = %request.full_url, error = %format!("{err:#}"), "origin request failed");
    let status = failure::classify(&err);
    let body = failure::diagnostic_body(&err, request);
    respond::json(writer, status, &body, app.settings.client_write_timeout()).await
}

async fn storage_failure<W>(
    app: &AppContext,
    writer: &mut W,
    request: &TranslatedRequest,
    err: anyhow::Error,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    warn!(url = %request.full_url, error = %format!("{err:#}"), "cache storage failure");
    let body = failure::diagnostic_body(&err, request);
    respond::json(
        writer,
        StatusCode::INTERNAL_SERVER_ERROR,
        &body,
        app.settings.client_write_timeout(),
    )
    .await
}

/// Synthetic diagnostic headers present on every proxied response.
fn attach_proxy_headers(
    headers: &mut HeaderList,
    key: &Fingerprint,
    namespace: &str,
    served_from: &str,
) {
    headers.set("x-served-from", served_from);
    headers.set("x-cache-key", key.id());
    headers.set("x-cache-folder", namespace);
    if headers.contains("accept-ranges") {
        headers.set("accept-ranges", "none");
    }
}
