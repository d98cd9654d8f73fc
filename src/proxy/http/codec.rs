use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, StatusCode};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Ordered, case-insensitive header collection. Insertion order is preserved
/// so responses replay headers the way the origin sent them; synthetic proxy
/// headers replace same-named origin headers instead of duplicating them.
#[derive(Debug, Clone, Default)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces the first same-named header in place, or appends.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn content_length(&self) -> Result<Option<u64>> {
        match self.get("content-length") {
            Some(value) => {
                let length = value
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("invalid content-length {value:?}"))?;
                Ok(Some(length))
            }
            None => Ok(None),
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.get("transfer-encoding")
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    }
}

impl FromIterator<(String, String)> for HeaderList {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderList,
}

#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderList,
}

/// Reads one request head off the wire. Returns `Ok(None)` on a clean EOF
/// before any bytes, which is how keep-alive clients hang up between
/// requests.
pub async fn read_request_head<R>(reader: &mut R, max_bytes: usize) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = HeaderBudget::new(max_bytes);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    budget.consume(line.len())?;
    let request_line = line.trim_end_matches(['\r', '\n']);
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("empty request line"))?
        .parse::<Method>()
        .map_err(|_| anyhow!("unsupported method in request line {request_line:?}"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("request line missing target: {request_line:?}"))?
        .to_string();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("request line missing version: {request_line:?}"))?;
    ensure!(
        version.starts_with("HTTP/1."),
        "unsupported protocol version {version}"
    );

    let headers = read_header_lines(reader, &mut budget).await?;
    Ok(Some(RequestHead {
        method,
        target,
        headers,
    }))
}

pub async fn read_response_head<R>(reader: &mut R, max_bytes: usize) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = HeaderBudget::new(max_bytes);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        bail!("origin closed the connection before sending a status line");
    }
    budget.consume(line.len())?;
    let status_line = line.trim_end_matches(['\r', '\n']);
    let mut parts = status_line.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("empty status line"))?;
    ensure!(
        version.starts_with("HTTP/1."),
        "unsupported origin protocol {version}"
    );
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("status line missing code: {status_line:?}"))?
        .parse::<u16>()
        .map_err(|_| anyhow!("non-numeric status code in {status_line:?}"))?;
    let status = StatusCode::from_u16(status)
        .with_context(|| format!("status code {status} out of range"))?;

    let headers = read_header_lines(reader, &mut budget).await?;
    Ok(ResponseHead { status, headers })
}

async fn read_header_lines<R>(reader: &mut R, budget: &mut HeaderBudget) -> Result<HeaderList>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderList::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            bail!("connection closed mid-headers");
        }
        budget.consume(line.len())?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(headers);
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header line missing ':' separator"))?;
        let name = name.trim();
        ensure!(!name.is_empty(), "header name must not be empty");
        headers.push(name, value.trim());
    }
}

struct HeaderBudget {
    remaining: usize,
}

impl HeaderBudget {
    fn new(max_bytes: usize) -> Self {
        Self {
            remaining: max_bytes,
        }
    }

    fn consume(&mut self, bytes: usize) -> Result<()> {
        ensure!(
            bytes <= self.remaining,
            "header section exceeds the configured size limit"
        );
        self.remaining -= bytes;
        Ok(())
    }
}

/// Incremental body decoder shared by the client-request and origin-response
/// read paths.
pub enum BodyReader {
    Empty,
    Length { remaining: u64 },
    Chunked { state: ChunkState },
    UntilClose,
}

pub enum ChunkState {
    AwaitingSize,
    InChunk { remaining: u64 },
    Done,
}

impl BodyReader {
    /// Framing for an origin response per RFC 7230 §3.3.3: chunked wins over
    /// content-length, and absent both the body runs to connection close.
    pub fn for_response(status: StatusCode, headers: &HeaderList, is_head: bool) -> Result<Self> {
        if is_head
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(Self::Empty);
        }
        if headers.is_chunked() {
            return Ok(Self::Chunked {
                state: ChunkState::AwaitingSize,
            });
        }
        match headers.content_length()? {
            Some(0) => Ok(Self::Empty),
            Some(length) => Ok(Self::Length { remaining: length }),
            None => Ok(Self::UntilClose),
        }
    }

    /// Reads the next body chunk into `buf`, returning 0 at end of body.
    pub async fn next_chunk<R>(&mut self, reader: &mut R, buf: &mut [u8]) -> Result<usize>
    where
        R: AsyncBufRead + Unpin,
    {
        match self {
            Self::Empty => Ok(0),
            Self::Length { remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let want = (*remaining).min(buf.len() as u64) as usize;
                let read = reader.read(&mut buf[..want]).await?;
                ensure!(read > 0, "origin closed before the declared body length");
                *remaining -= read as u64;
                Ok(read)
            }
            Self::Chunked { state } => read_chunked(state, reader, buf).await,
            Self::UntilClose => Ok(reader.read(buf).await?),
        }
    }
}

async fn read_chunked<R>(state: &mut ChunkState, reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match state {
            ChunkState::Done => return Ok(0),
            ChunkState::AwaitingSize => {
                let mut line = String::new();
                ensure!(
                    reader.read_line(&mut line).await? > 0,
                    "origin closed mid-chunked-body"
                );
                let size_field = line.trim().split(';').next().unwrap_or("").trim();
                if size_field.is_empty() {
                    continue;
                }
                let size = u64::from_str_radix(size_field, 16)
                    .with_context(|| format!("invalid chunk size {size_field:?}"))?;
                if size == 0 {
                    drain_trailers(reader).await?;
                    *state = ChunkState::Done;
                    return Ok(0);
                }
                *state = ChunkState::InChunk { remaining: size };
            }
            ChunkState::InChunk { remaining } => {
                if *remaining == 0 {
                    *state = ChunkState::AwaitingSize;
                    continue;
                }
                let want = (*remaining).min(buf.len() as u64) as usize;
                let read = reader.read(&mut buf[..want]).await?;
                ensure!(read > 0, "origin closed mid-chunk");
                *remaining -= read as u64;
                return Ok(read);
            }
        }
    }
}

async fn drain_trailers<R>(reader: &mut R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        if line.trim_end_matches(['\r', '\n']).is_empty() {
            return Ok(());
        }
    }
}
