pub mod origin;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use recache::cli::LogFormat;
use recache::{build_app, proxy, settings::Settings};

pub fn test_settings(data_dir: &Path) -> Settings {
    Settings {
        listen: "127.0.0.1:0".parse().unwrap(),
        data_dir: data_dir.to_path_buf(),
        exclude: String::new(),
        allowed_errors: "404".to_string(),
        passthrough: false,
        expose_status: false,
        proxy_host: None,
        proxy_port: None,
        log: LogFormat::Text,
        origin_connect_timeout: 5,
        client_write_timeout: 5,
        max_header_size: 32 * 1024,
        max_request_body_size: 1024 * 1024,
    }
}

/// A proxy bound to an ephemeral port with its own scratch cache directory.
pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub data_dir: TempDir,
    server: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn start() -> Result<Self> {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(customize: impl FnOnce(&mut Settings)) -> Result<Self> {
        let data_dir = TempDir::new()?;
        let mut settings = test_settings(data_dir.path());
        customize(&mut settings);
        let app = build_app(Arc::new(settings))?;
        let bound = proxy::listener::bind(app).await?;
        let addr = bound.local_addr;
        let server = tokio::spawn(async move {
            let _ = bound.serve().await;
        });
        Ok(Self {
            addr,
            data_dir,
            server,
        })
    }

    /// Sends a GET through the proxy for `path` and reads the full response.
    pub async fn get(&self, path: &str) -> Result<RawResponse> {
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\n\r\n",
            self.addr
        );
        self.send(request.as_bytes()).await
    }

    pub async fn send(&self, request: &[u8]) -> Result<RawResponse> {
        let mut stream = TcpStream::connect(self.addr).await?;
        stream.write_all(request).await?;
        stream.flush().await?;
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        RawResponse::parse(&raw)
    }

    /// The base path rewritten links should route through, matching the Host
    /// header [`ProxyHarness::get`] sends.
    pub fn proxy_base(&self, namespace: &str) -> String {
        format!("http://{}/{namespace}/", self.addr)
    }

    pub fn namespace_dir(&self, namespace: &str) -> std::path::PathBuf {
        self.data_dir.path().join(namespace)
    }

    /// Published artifacts for a namespace, staging directory excluded.
    pub fn published_entries(&self, namespace: &str) -> Vec<String> {
        let dir = self.namespace_dir(namespace);
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    pub fn staged_entries(&self, namespace: &str) -> Vec<String> {
        let dir = self.namespace_dir(namespace).join("tmp");
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect()
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..100 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("condition not reached within the deadline")
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let separator = raw
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .ok_or_else(|| anyhow!("response has no header/body separator"))?;
        let head = std::str::from_utf8(&raw[..separator]).context("non-UTF-8 response head")?;
        let body = raw[separator + 4..].to_vec();

        let mut lines = head.lines();
        let status_line = lines.next().ok_or_else(|| anyhow!("empty response"))?;
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| anyhow!("malformed status line {status_line:?}"))?;

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();

        Ok(Self {
            status,
            headers,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == lower)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
