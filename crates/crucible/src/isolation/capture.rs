//! Bounded output capture

use std::io;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::types::CapturedOutput;

const CHUNK: usize = 8 * 1024;

/// Read a stream to its end, keeping at most `cap` bytes.
///
/// Bytes past the cap are drained and dropped so the writer never blocks on
/// a full pipe.
pub async fn read_capped<R>(mut reader: R, cap: usize) -> io::Result<CapturedOutput>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::with_capacity(cap.min(CHUNK));
    let mut truncated = false;
    let mut buf = [0u8; CHUNK];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(bytes.len());
        if n > room {
            truncated = true;
        }
        bytes.extend_from_slice(&buf[..n.min(room)]);
    }

    Ok(CapturedOutput { bytes, truncated })
}

/// Read at most `cap` bytes of a file. A missing file reads as empty.
pub async fn read_file_capped(path: &Path, cap: usize) -> io::Result<CapturedOutput> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CapturedOutput::default()),
        Err(e) => return Err(e),
    };
    let len = file.metadata().await?.len();

    let limit = u64::try_from(cap).unwrap_or(u64::MAX);
    let mut bytes = Vec::with_capacity(cap.min(CHUNK));
    file.take(limit).read_to_end(&mut bytes).await?;

    Ok(CapturedOutput {
        bytes,
        truncated: len > limit,
    })
}
