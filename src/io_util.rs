use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

/// Write the full buffer to the stream, bounding each write by `timeout_dur`.
pub async fn write_all_with_timeout<S>(
    stream: &mut S,
    data: &[u8],
    timeout_dur: Duration,
    context: &str,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(timeout_dur, stream.write_all(data), context).await
}

/// Copy `reader` to `writer` until EOF, bounding each write by `timeout_dur`.
/// Returns the number of bytes copied.
pub async fn copy_with_write_timeout<R, W>(
    reader: &mut R,
    writer: &mut W,
    timeout_dur: Duration,
    context: &str,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 16 * 1024];
    let mut copied = 0u64;
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        write_all_with_timeout(writer, &buf[..read], timeout_dur, context).await?;
        copied += read as u64;
    }
    Ok(copied)
}
