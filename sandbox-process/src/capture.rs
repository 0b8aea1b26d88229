use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Output buffer that keeps at most `limit` bytes and remembers whether
/// anything was dropped.
#[derive(Debug)]
pub(crate) struct BoundedBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl BoundedBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data
            .extend_from_slice(chunk.get(..room.min(chunk.len())).unwrap_or_default());
    }

    pub(crate) fn take(&mut self) -> (Vec<u8>, bool) {
        (std::mem::take(&mut self.data), self.truncated)
    }
}

pub(crate) type SharedBuffer = Arc<Mutex<BoundedBuffer>>;

/// Start reading `reader` into a bounded buffer.
///
/// The reader keeps draining after the limit is hit so the writer never
/// blocks on a full pipe.
pub(crate) fn spawn_capture<R>(
    reader: Option<R>,
    limit: usize,
) -> (SharedBuffer, Option<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Arc::new(Mutex::new(BoundedBuffer::new(limit)));
    let handle = reader.map(|mut reader| {
        let buffer = Arc::clone(&buffer);
        tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buffer.lock().await.push(chunk.get(..n).unwrap_or_default()),
                }
            }
        })
    });
    (buffer, handle)
}

/// Wait up to `grace` for the reader to hit EOF, then take what it got.
///
/// A grandchild that escaped the kill can hold the pipe open; the reader
/// is aborted rather than waited on forever.
pub(crate) async fn collect(
    buffer: SharedBuffer,
    handle: Option<JoinHandle<()>>,
    grace: Duration,
) -> (Vec<u8>, bool) {
    if let Some(mut handle) = handle
        && tokio::time::timeout(grace, &mut handle).await.is_err()
    {
        handle.abort();
    }
    buffer.lock().await.take()
}
