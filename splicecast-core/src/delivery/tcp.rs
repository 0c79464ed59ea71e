use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChunkSink, SinkError};
use crate::config::TcpSection;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub backlog: u32,
    pub write_timeout: Duration,
    pub client_buffer_chunks: usize,
    pub chunk_size: usize,
    pub wait_for_client: bool,
    pub stop_on_disconnect: bool,
    pub stats_file: Option<PathBuf>,
    pub stats_interval: Duration,
}

impl From<&TcpSection> for TcpSettings {
    fn from(section: &TcpSection) -> Self {
        Self {
            backlog: section.backlog.max(1),
            write_timeout: Duration::from_millis(section.write_timeout_ms),
            client_buffer_chunks: section.client_buffer_chunks.max(1),
            chunk_size: section.chunk_size.max(1),
            wait_for_client: section.wait_for_client,
            stop_on_disconnect: section.stop_on_disconnect,
            stats_file: None,
            stats_interval: Duration::from_millis(section.stats_interval_ms.max(50)),
        }
    }
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self::from(&TcpSection::default())
    }
}

#[derive(Debug)]
struct Shared {
    settings: TcpSettings,
    clients: watch::Sender<usize>,
    total_bytes: AtomicU64,
    shutdown: CancellationToken,
}

/// Fans one byte stream out to every connected TCP client.
///
/// Each client owns a bounded queue of chunks. A client that lags behind
/// the queue or whose writes stall past the write timeout is dropped
/// without holding up the others.
#[derive(Debug)]
pub struct TcpBroadcaster {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    tx: broadcast::Sender<Bytes>,
    accept_task: JoinHandle<()>,
    stats_task: Option<JoinHandle<()>>,
}

impl TcpBroadcaster {
    pub async fn bind(host: &str, port: u16, settings: TcpSettings) -> io::Result<Self> {
        let addr = lookup_host((host, port)).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address for {host}:{port}"),
            )
        })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(settings.backlog)?;
        let local_addr = listener.local_addr()?;

        let (tx, _) = broadcast::channel(settings.client_buffer_chunks);
        let (clients, _) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            settings,
            clients,
            total_bytes: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        let accept_task = tokio::spawn(accept_loop(listener, tx.clone(), Arc::clone(&shared)));
        let stats_task = shared
            .settings
            .stats_file
            .clone()
            .map(|path| tokio::spawn(stats_loop(path, Arc::clone(&shared))));
        info!(addr = %local_addr, "tcp delivery listening");

        Ok(Self {
            shared,
            local_addr,
            tx,
            accept_task,
            stats_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn settings(&self) -> &TcpSettings {
        &self.shared.settings
    }

    pub fn client_count(&self) -> usize {
        *self.shared.clients.borrow()
    }

    pub fn bytes_total(&self) -> u64 {
        self.shared.total_bytes.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Resolves once at least one client is connected. `false` if the
    /// broadcaster shut down first.
    pub async fn wait_for_client(&self) -> bool {
        let mut clients = self.shared.clients.subscribe();
        tokio::select! {
            ready = clients.wait_for(|count| *count > 0) => ready.is_ok(),
            _ = self.shared.shutdown.cancelled() => false,
        }
    }

    /// Queues a chunk for every connected client. Chunks sent while no one
    /// is connected are counted and discarded.
    pub fn send(&self, chunk: Bytes) -> Result<(), SinkError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(SinkError::Closed);
        }
        self.shared
            .total_bytes
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        // an error only means no receiver is subscribed right now
        let _ = self.tx.send(chunk);
        Ok(())
    }

    /// Relays `input` until EOF or until delivery is stopped.
    pub async fn run<R>(&self, mut input: R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        if self.shared.settings.wait_for_client {
            info!(addr = %self.local_addr, "waiting for first client");
            if !self.wait_for_client().await {
                return Ok(0);
            }
        }
        let mut buf = vec![0u8; self.shared.settings.chunk_size];
        let mut relayed = 0u64;
        loop {
            let read = tokio::select! {
                read = input.read(&mut buf) => read?,
                _ = self.shared.shutdown.cancelled() => break,
            };
            if read == 0 {
                debug!("tcp delivery input reached EOF");
                break;
            }
            if self.send(Bytes::copy_from_slice(&buf[..read])).is_err() {
                break;
            }
            relayed += read as u64;
        }
        Ok(relayed)
    }

    /// Stops accepting, lets clients drain what is queued, then closes them.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.accept_task.abort();
        if let Some(path) = &self.shared.settings.stats_file {
            if let Err(err) = write_stats(path, self.bytes_total()).await {
                warn!(path = %path.display(), error = %err, "failed to write final stats");
            }
        }
    }

    /// Resolves once every client connection has been released.
    pub async fn drained(&self) {
        let mut clients = self.shared.clients.subscribe();
        let _ = clients.wait_for(|count| *count == 0).await;
    }
}

impl Drop for TcpBroadcaster {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        self.accept_task.abort();
        if let Some(task) = &self.stats_task {
            task.abort();
        }
    }
}

/// Pause after the `failures`-th consecutive accept error, doubling from
/// 10ms up to one second.
fn accept_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(7);
    (ACCEPT_BACKOFF_MIN * 2u32.pow(exponent)).min(ACCEPT_BACKOFF_MAX)
}

async fn accept_loop(listener: TcpListener, tx: broadcast::Sender<Bytes>, shared: Arc<Shared>) {
    let mut failures = 0u32;
    loop {
        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                failures = 0;
                let rx = tx.subscribe();
                shared.clients.send_modify(|count| *count += 1);
                info!(%peer, clients = *shared.clients.borrow(), "client connected");
                tokio::spawn(serve_client(stream, peer, rx, Arc::clone(&shared)));
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                let delay = accept_backoff(failures);
                warn!(error = %err, failures, delay = ?delay, "failed to accept client");
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<Bytes>,
    shared: Arc<Shared>,
) {
    let _ = stream.set_nodelay(true);
    let write_timeout = shared.settings.write_timeout;
    let (mut reader, mut writer) = stream.into_split();
    let mut scratch = [0u8; 512];
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                drain(&mut rx, &mut writer, write_timeout).await;
                break;
            }
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => {
                    info!(%peer, "client disconnected");
                    break;
                }
                Ok(_) => continue,
            },
            message = rx.recv() => match message {
                Ok(chunk) => match timeout(write_timeout, writer.write_all(&chunk)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        info!(%peer, error = %err, "client write failed, dropping");
                        break;
                    }
                    Err(_) => {
                        warn!(%peer, timeout = ?write_timeout, "client stalled, dropping");
                        break;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(%peer, missed, "client fell behind, dropping");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    let _ = writer.shutdown().await;

    let mut remaining = 0;
    shared.clients.send_modify(|count| {
        *count = count.saturating_sub(1);
        remaining = *count;
    });
    debug!(%peer, clients = remaining, "client released");
    if remaining == 0 && shared.settings.stop_on_disconnect && !shared.shutdown.is_cancelled() {
        info!("last client disconnected, stopping delivery");
        shared.shutdown.cancel();
    }
}

async fn drain(
    rx: &mut broadcast::Receiver<Bytes>,
    writer: &mut OwnedWriteHalf,
    write_timeout: Duration,
) {
    while let Ok(chunk) = rx.try_recv() {
        match timeout(write_timeout, writer.write_all(&chunk)).await {
            Ok(Ok(())) => {}
            _ => return,
        }
    }
}

async fn stats_loop(path: PathBuf, shared: Arc<Shared>) {
    let mut ticker = interval(shared.settings.stats_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let total = shared.total_bytes.load(Ordering::Relaxed);
                if let Err(err) = write_stats(&path, total).await {
                    warn!(path = %path.display(), error = %err, "failed to write stats");
                }
            }
        }
    }
}

/// Replaces the stats file atomically with the running byte total.
async fn write_stats(path: &Path, total: u64) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, format!("{total}\n")).await?;
    tokio::fs::rename(&tmp, path).await
}

/// [`ChunkSink`] over a shared broadcaster. Honors `wait_for_client` on the
/// first chunk.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    broadcaster: Arc<TcpBroadcaster>,
    waited: bool,
}

impl BroadcastSink {
    pub fn new(broadcaster: Arc<TcpBroadcaster>) -> Self {
        Self {
            broadcaster,
            waited: false,
        }
    }
}

#[async_trait]
impl ChunkSink for BroadcastSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        if !self.waited {
            self.waited = true;
            if self.broadcaster.settings().wait_for_client
                && !self.broadcaster.wait_for_client().await
            {
                return Err(SinkError::Closed);
            }
        }
        self.broadcaster.send(Bytes::copy_from_slice(chunk))
    }
}
