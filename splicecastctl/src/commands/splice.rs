use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use clap::Args;
use splicecast_core::splice::TS_PACKET_SIZE;
use splicecast_core::{ReaderFeed, SplicingSink, Switch, SwitchOutcome, SwitchSettings, WriterSink};
use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::info;

use crate::Result;

#[derive(Args, Debug)]
pub struct SpliceArgs {
    /// Live MPEG-TS source, a file or FIFO
    #[arg(long, value_name = "PATH")]
    pub live: PathBuf,
    /// Bytes per read
    #[arg(long, default_value_t = 188 * 256)]
    pub chunk_size: usize,
}

type OpenFuture = Pin<Box<dyn Future<Output = io::Result<File>> + Send>>;

/// Live input whose open runs in the background. Reads stay pending until
/// the path is open, so a FIFO without a writer yet does not stall the
/// placeholder.
enum LiveInput {
    Opening(OpenFuture),
    Open(File),
}

impl LiveInput {
    fn open(path: PathBuf) -> Self {
        LiveInput::Opening(Box::pin(async move { File::open(path).await }))
    }
}

impl AsyncRead for LiveInput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            match &mut *self {
                LiveInput::Opening(open) => {
                    let file = ready!(open.as_mut().poll(cx))?;
                    *self = LiveInput::Open(file);
                }
                LiveInput::Open(file) => return Pin::new(file).poll_read(cx, buf),
            }
        }
    }
}

pub async fn run(args: &SpliceArgs) -> Result<()> {
    let settings = SwitchSettings {
        chunk_size: args.chunk_size.max(TS_PACKET_SIZE),
        ..SwitchSettings::default()
    };
    let mut placeholder = ReaderFeed::new(tokio::io::stdin());
    let mut live = ReaderFeed::new(LiveInput::open(args.live.clone()));
    let mut sink = SplicingSink::new(WriterSink::new(tokio::io::stdout()));

    let outcome = Switch::new(settings)
        .run(&mut placeholder, &mut live, &mut sink)
        .await?;
    let state = sink.splicer().state();
    let stats = sink.splicer().stats();
    match outcome {
        SwitchOutcome::Completed {
            placeholder_bytes,
            live_bytes,
        } => info!(
            placeholder_bytes,
            live_bytes,
            offset = ?state.pts_offset,
            rewritten = stats.rewritten,
            malformed = stats.passthrough_malformed,
            "splice finished"
        ),
        SwitchOutcome::SinkClosed => info!("stdout closed, splice stopped"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn live_input_reads_after_opening() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("live.ts");
        std::fs::write(&path, b"live bytes").unwrap();

        let mut input = LiveInput::open(path);
        let mut received = Vec::new();
        input.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"live bytes");
    }

    #[tokio::test]
    async fn missing_live_path_surfaces_on_read() {
        let temp = TempDir::new().unwrap();
        let mut input = LiveInput::open(temp.path().join("absent.ts"));
        let mut buf = [0u8; 8];
        let err = input.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
