use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone)]
enum OriginBehavior {
    Fixed(Arc<Vec<u8>>),
    SlowBody {
        head: Arc<String>,
        chunk: Arc<Vec<u8>>,
        chunks: usize,
        delay: Duration,
    },
}

/// Mock origin that counts how many requests actually reached it, which is
/// how the tests tell a cache hit from a re-capture.
pub struct TestOrigin {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    server: JoinHandle<()>,
}

impl TestOrigin {
    pub async fn respond_with(response: impl Into<Vec<u8>>) -> Result<Self> {
        Self::spawn(OriginBehavior::Fixed(Arc::new(response.into()))).await
    }

    pub async fn ok_with(content_type: &str, body: impl AsRef<[u8]>) -> Result<Self> {
        Self::status_with(200, "OK", content_type, body).await
    }

    pub async fn status_with(
        status: u16,
        reason: &str,
        content_type: &str,
        body: impl AsRef<[u8]>,
    ) -> Result<Self> {
        let body = body.as_ref();
        let mut response = format!(
            "HTTP/1.1 {status} {reason}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        Self::respond_with(response).await
    }

    /// Dribbles out a large binary body so a test can hang up mid-stream.
    pub async fn slow_binary(chunk: Vec<u8>, chunks: usize, delay: Duration) -> Result<Self> {
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/octet-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            chunk.len() * chunks
        );
        Self::spawn(OriginBehavior::SlowBody {
            head: Arc::new(head),
            chunk: Arc::new(chunk),
            chunks,
            delay,
        })
        .await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    async fn spawn(behavior: OriginBehavior) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_counter = hits.clone();
        let server = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                hits_counter.fetch_add(1, Ordering::SeqCst);
                let behavior = behavior.clone();
                tokio::spawn(async move {
                    let _ = serve_one(stream, behavior).await;
                });
            }
        });
        Ok(Self { addr, hits, server })
    }
}

/// Mock forwarding proxy that records every request head it receives and
/// answers each with the same canned response.
pub struct ForwardProxy {
    addr: SocketAddr,
    heads: Arc<Mutex<Vec<String>>>,
    server: JoinHandle<()>,
}

impl ForwardProxy {
    pub async fn respond_with(response: impl Into<Vec<u8>>) -> Result<Self> {
        let response: Arc<Vec<u8>> = Arc::new(response.into());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let heads = Arc::new(Mutex::new(Vec::new()));
        let recorded = heads.clone();
        let server = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let response = response.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let Ok(head) = read_request_head(&mut stream).await else {
                        return;
                    };
                    recorded
                        .lock()
                        .unwrap()
                        .push(String::from_utf8_lossy(&head).into_owned());
                    let _ = stream.write_all(&response).await;
                    let _ = stream.flush().await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        Ok(Self {
            addr,
            heads,
            server,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// First line of each recorded request head, in arrival order.
    pub fn request_lines(&self) -> Vec<String> {
        self.heads
            .lock()
            .unwrap()
            .iter()
            .filter_map(|head| head.lines().next().map(str::to_string))
            .collect()
    }
}

impl Drop for ForwardProxy {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve_one(mut stream: TcpStream, behavior: OriginBehavior) -> Result<()> {
    read_request_head(&mut stream).await?;
    match behavior {
        OriginBehavior::Fixed(response) => {
            stream.write_all(&response).await?;
        }
        OriginBehavior::SlowBody {
            head,
            chunk,
            chunks,
            delay,
        } => {
            stream.write_all(head.as_bytes()).await?;
            stream.flush().await?;
            for _ in 0..chunks {
                tokio::time::sleep(delay).await;
                stream.write_all(&chunk).await?;
                stream.flush().await?;
            }
        }
    }
    stream.flush().await?;
    let _ = stream.shutdown().await;
    Ok(())
}

async fn read_request_head(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let read = stream.read(&mut byte).await?;
        if read == 0 {
            break;
        }
        head.push(byte[0]);
    }
    Ok(head)
}

impl Drop for TestOrigin {
    fn drop(&mut self) {
        self.server.abort();
    }
}
