use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail, ensure};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::settings::Settings;
use crate::util::timeout_with_context;

use super::TlsContext;
use super::http::codec::{BodyReader, ResponseHead, read_response_head};
use super::translate::TranslatedRequest;

pub trait OriginIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> OriginIo for T {}

/// An origin response ready to be consumed: parsed head plus a positioned
/// body decoder over the connection.
pub struct OriginExchange {
    pub head: ResponseHead,
    pub body: BodyReader,
    pub reader: BufReader<Box<dyn OriginIo>>,
}

/// Connects to the origin (directly or through the configured forwarding
/// proxy), sends the translated request with `Connection: close`, and reads
/// the response head. Only the connection phase is bounded by a timeout; the
/// response itself is allowed to take as long as the origin needs.
pub async fn fetch(
    settings: &Settings,
    tls: &Arc<TlsContext>,
    request: &TranslatedRequest,
    body: Option<&[u8]>,
) -> Result<OriginExchange> {
    let connect_timeout = settings.origin_connect_timeout();
    let via_proxy = settings.forward_proxy();
    let (connect_host, connect_port) = match via_proxy {
        Some((host, port)) => (host, port),
        None => (request.host.as_str(), request.port),
    };

    let mut stream: Box<dyn OriginIo> = {
        let tcp = timeout_with_context(
            connect_timeout,
            TcpStream::connect((connect_host, connect_port)),
            format!("connecting to {connect_host}:{connect_port}"),
        )
        .await?;
        if let Err(err) = tcp.set_nodelay(true) {
            debug!(error = %err, "failed to set TCP_NODELAY on origin connection");
        }
        Box::new(tcp)
    };

    if request.https {
        if via_proxy.is_some() {
            establish_tunnel(&mut stream, &request.host, request.port, connect_timeout).await?;
        }
        let connector = TlsConnector::from(tls.client.clone());
        let server_name = ServerName::try_from(request.host.as_str())
            .map_err(|_| anyhow!("invalid origin host for TLS '{}'", request.host))?
            .to_owned();
        let tls_stream = timeout_with_context(
            connect_timeout,
            connector.connect(server_name, stream),
            format!("performing the TLS handshake with {}", request.host),
        )
        .await?;
        stream = Box::new(tls_stream);
    }

    let head_bytes = encode_request_head(request, body, via_proxy.is_some());
    stream
        .write_all(&head_bytes)
        .await
        .context("failed to send request to origin")?;
    if let Some(body) = body {
        stream
            .write_all(body)
            .await
            .context("failed to forward request body to origin")?;
    }
    stream.flush().await.context("failed to flush origin request")?;

    let mut reader = BufReader::new(stream);
    let head = read_response_head(&mut reader, 64 * 1024)
        .await
        .context("failed to read origin response head")?;
    let body = BodyReader::for_response(
        head.status,
        &head.headers,
        request.method == http::Method::HEAD,
    )?;

    Ok(OriginExchange { head, body, reader })
}

/// `CONNECT` handshake through the forwarding proxy for TLS origins. The
/// proxy's reply is read unbuffered so no TLS bytes are swallowed.
async fn establish_tunnel(
    stream: &mut Box<dyn OriginIo>,
    host: &str,
    port: u16,
    connect_timeout: std::time::Duration,
) -> Result<()> {
    let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream
        .write_all(connect.as_bytes())
        .await
        .context("failed to send CONNECT to forwarding proxy")?;
    stream.flush().await?;

    let reply = tokio::time::timeout(connect_timeout, read_until_blank_line(stream))
        .await
        .map_err(|elapsed| {
            anyhow::Error::new(elapsed).context("timed out waiting for forwarding proxy CONNECT reply")
        })??;
    let status_line = reply.lines().next().unwrap_or("");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| anyhow!("malformed CONNECT reply: {status_line:?}"))?;
    ensure!(
        (200..300).contains(&status),
        "forwarding proxy refused CONNECT with status {status}"
    );
    Ok(())
}

async fn read_until_blank_line(stream: &mut Box<dyn OriginIo>) -> Result<String> {
    let mut reply = Vec::new();
    let mut byte = [0u8; 1];
    while !reply.ends_with(b"\r\n\r\n") {
        if reply.len() > 16 * 1024 {
            bail!("forwarding proxy CONNECT reply too large");
        }
        let read = stream.read(&mut byte).await?;
        if read == 0 {
            bail!("forwarding proxy closed during CONNECT");
        }
        reply.push(byte[0]);
    }
    String::from_utf8(reply).context("non-UTF-8 CONNECT reply")
}

/// Serializes the outgoing request head. Plain-http requests routed through
/// a forwarding proxy use the absolute-form target; everything else uses
/// origin-form.
fn encode_request_head(
    request: &TranslatedRequest,
    body: Option<&[u8]>,
    via_proxy: bool,
) -> Vec<u8> {
    let target = if via_proxy && !request.https {
        request.full_url.clone()
    } else {
        request.path.clone()
    };

    let mut out = format!("{} {} HTTP/1.1\r\n", request.method, target).into_bytes();
    for (name, value) in request.headers.iter() {
        if name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("proxy-connection")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if let Some(body) = body {
        out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"connection: close\r\n\r\n");
    out
}
