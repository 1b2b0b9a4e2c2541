use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Destination of a streamed download
///
/// Sinks only ever see bytes appended in order; nothing rewinds them.
#[async_trait]
pub trait DownloadSink: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> std::io::Result<()>;

    /// Called once after the last chunk
    async fn finish(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DownloadSink for Vec<u8> {
    async fn write_chunk(&mut self, chunk: Bytes) -> std::io::Result<()> {
        self.extend_from_slice(&chunk);
        Ok(())
    }
}

/// Adapts any `AsyncWrite` into a download sink
pub struct WriterSink<W> {
    writer: W,
    written: u64,
}

impl<W> WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> DownloadSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_chunk(&mut self, chunk: Bytes) -> std::io::Result<()> {
        self.writer.write_all(&chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        self.writer.flush().await
    }
}
