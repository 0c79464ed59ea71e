use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::SwitchSection;
use crate::delivery::{ChunkSink, SinkError};
use crate::process::ProcessChain;

/// Which feed a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Placeholder,
    Live,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Placeholder => "placeholder",
            Source::Live => "live",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination of a switch that may treat each feed differently.
#[async_trait]
pub trait HandoverSink: Send {
    async fn write(&mut self, source: Source, chunk: &[u8]) -> Result<(), SinkError>;

    async fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Forwards both feeds to a [`ChunkSink`] untouched.
#[derive(Debug)]
pub struct Passthrough<S>(pub S);

#[async_trait]
impl<S: ChunkSink> HandoverSink for Passthrough<S> {
    async fn write(&mut self, _source: Source, chunk: &[u8]) -> Result<(), SinkError> {
        self.0.write_chunk(chunk).await
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        self.0.flush().await
    }
}

/// A readable feed that can be asked to stop.
#[async_trait]
pub trait Feed: AsyncRead + Unpin + Send {
    async fn shutdown(&mut self, grace: Duration);
}

#[async_trait]
impl Feed for ProcessChain {
    async fn shutdown(&mut self, grace: Duration) {
        if let Err(err) = self.terminate(grace).await {
            warn!(chain = %self.label(), error = %err, "failed to terminate feed");
        }
    }
}

/// Wraps a plain reader (pipe, file, socket) as a [`Feed`].
#[derive(Debug)]
pub struct ReaderFeed<R> {
    reader: Option<R>,
}

impl<R> ReaderFeed<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReaderFeed<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.reader.as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Feed for ReaderFeed<R> {
    async fn shutdown(&mut self, _grace: Duration) {
        self.reader = None;
    }
}

#[derive(Debug, Error)]
pub enum HandoverError {
    #[error("live feed ended before producing any data")]
    LiveEndedEarly,
    #[error("placeholder feed ended before the live feed started")]
    PlaceholderEndedEarly,
}

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error(transparent)]
    Handover(#[from] HandoverError),
    #[error("failed to read {which} feed: {error}")]
    Read { which: Source, error: io::Error },
    #[error("sink failed: {0}")]
    Sink(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The live feed ran to EOF after the handover.
    Completed { placeholder_bytes: u64, live_bytes: u64 },
    /// The downstream consumer went away.
    SinkClosed,
}

#[derive(Debug, Clone)]
pub struct SwitchSettings {
    pub chunk_size: usize,
    pub switch_grace: Duration,
    pub watchdog: Duration,
    pub terminate_grace: Duration,
}

impl From<&SwitchSection> for SwitchSettings {
    fn from(section: &SwitchSection) -> Self {
        Self {
            chunk_size: section.chunk_size.max(188),
            switch_grace: Duration::from_millis(section.switch_grace_ms),
            watchdog: Duration::from_millis(section.watchdog_ms.max(1)),
            terminate_grace: Duration::from_millis(section.terminate_grace_ms),
        }
    }
}

impl Default for SwitchSettings {
    fn default() -> Self {
        Self::from(&SwitchSection::default())
    }
}

/// Progress of a single switch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchSession {
    pub live_seen: bool,
    pub handover_complete: bool,
    pub placeholder_bytes: u64,
    pub live_bytes: u64,
}

/// Relays a placeholder feed until the live feed produces its first bytes,
/// then terminates the placeholder and relays live until EOF.
///
/// Placeholder bytes never follow a live byte in the output.
#[derive(Debug, Clone, Default)]
pub struct Switch {
    settings: SwitchSettings,
}

impl Switch {
    pub fn new(settings: SwitchSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SwitchSettings {
        &self.settings
    }

    pub async fn run<P, L, S>(
        &self,
        placeholder: &mut P,
        live: &mut L,
        sink: &mut S,
    ) -> Result<SwitchOutcome, SwitchError>
    where
        P: Feed,
        L: Feed,
        S: HandoverSink,
    {
        let mut session = SwitchSession::default();
        let result = self.relay(placeholder, live, sink, &mut session).await;
        let grace = self.settings.terminate_grace;
        match result {
            Ok(()) => Ok(SwitchOutcome::Completed {
                placeholder_bytes: session.placeholder_bytes,
                live_bytes: session.live_bytes,
            }),
            Err(failure) => {
                if !session.handover_complete {
                    placeholder.shutdown(grace).await;
                }
                live.shutdown(grace).await;
                match failure {
                    Failure::Sink(SinkError::Closed) => {
                        info!("downstream closed, switch stopped");
                        Ok(SwitchOutcome::SinkClosed)
                    }
                    Failure::Sink(SinkError::Io(err)) => Err(SwitchError::Sink(err)),
                    Failure::Switch(err) => Err(err),
                }
            }
        }
    }

    async fn relay<P, L, S>(
        &self,
        placeholder: &mut P,
        live: &mut L,
        sink: &mut S,
        session: &mut SwitchSession,
    ) -> Result<(), Failure>
    where
        P: Feed,
        L: Feed,
        S: HandoverSink,
    {
        let mut live_buf = vec![0u8; self.settings.chunk_size];
        let mut placeholder_buf = vec![0u8; self.settings.chunk_size];
        let mut last_placeholder = Instant::now();

        let first = loop {
            tokio::select! {
                biased;
                read = live.read(&mut live_buf) => match read {
                    Ok(0) => return Err(HandoverError::LiveEndedEarly.into()),
                    Ok(read) => break read,
                    Err(error) => return Err(read_failure(Source::Live, error)),
                },
                read = placeholder.read(&mut placeholder_buf) => match read {
                    Ok(0) => return Err(HandoverError::PlaceholderEndedEarly.into()),
                    Ok(read) => {
                        sink.write(Source::Placeholder, &placeholder_buf[..read]).await?;
                        session.placeholder_bytes += read as u64;
                        last_placeholder = Instant::now();
                    }
                    Err(error) => return Err(read_failure(Source::Placeholder, error)),
                },
                _ = sleep_until(last_placeholder + self.settings.watchdog) => {
                    warn!(idle = ?self.settings.watchdog, "no placeholder data, still waiting for live feed");
                    last_placeholder = Instant::now();
                }
            }
        };

        session.live_seen = true;
        info!(
            placeholder_bytes = session.placeholder_bytes,
            "live feed started, switching over"
        );
        if !self.settings.switch_grace.is_zero() {
            sleep(self.settings.switch_grace).await;
        }
        placeholder.shutdown(self.settings.terminate_grace).await;
        session.handover_complete = true;

        sink.write(Source::Live, &live_buf[..first]).await?;
        session.live_bytes += first as u64;
        loop {
            let read = live
                .read(&mut live_buf)
                .await
                .map_err(|error| read_failure(Source::Live, error))?;
            if read == 0 {
                break;
            }
            sink.write(Source::Live, &live_buf[..read]).await?;
            session.live_bytes += read as u64;
        }
        sink.finish().await?;
        debug!(live_bytes = session.live_bytes, "live feed reached EOF");
        Ok(())
    }
}

enum Failure {
    Sink(SinkError),
    Switch(SwitchError),
}

impl From<SinkError> for Failure {
    fn from(err: SinkError) -> Self {
        Failure::Sink(err)
    }
}

impl From<HandoverError> for Failure {
    fn from(err: HandoverError) -> Self {
        Failure::Switch(SwitchError::Handover(err))
    }
}

fn read_failure(which: Source, error: io::Error) -> Failure {
    Failure::Switch(SwitchError::Read { which, error })
}
