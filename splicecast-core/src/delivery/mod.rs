pub mod hls;
pub mod tcp;

use std::io;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub use hls::{HlsError, HlsRepackager, HlsSettings, SegmentEntry};
pub use tcp::{BroadcastSink, TcpBroadcaster, TcpSettings};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("downstream consumer closed")]
    Closed,
    #[error("sink io error: {0}")]
    Io(io::Error),
}

impl SinkError {
    /// Disconnect-style failures become [`SinkError::Closed`].
    pub fn from_io(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero => SinkError::Closed,
            _ => SinkError::Io(error),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SinkError::Closed)
    }
}

/// Terminal byte consumer of a pipeline.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SinkError>;

    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Adapts any async writer (named pipe, stdout, file) into a [`ChunkSink`].
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> ChunkSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        self.writer
            .write_all(chunk)
            .await
            .map_err(SinkError::from_io)?;
        self.writer.flush().await.map_err(SinkError::from_io)
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush().await.map_err(SinkError::from_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_pipe_is_a_clean_close() {
        let err = SinkError::from_io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(err.is_closed());
        let err = SinkError::from_io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!err.is_closed());
    }

    #[tokio::test]
    async fn writer_sink_reports_closed_reader() {
        let (writer, reader) = tokio::io::duplex(16);
        drop(reader);
        let mut sink = WriterSink::new(writer);
        let err = sink.write_chunk(b"payload").await.unwrap_err();
        assert!(err.is_closed());
    }
}
