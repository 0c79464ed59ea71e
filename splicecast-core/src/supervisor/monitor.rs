use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::operation::{Operation, OperationState, PipelineMetrics};
use super::strategy::RestartStrategy;
use crate::delivery::{BroadcastSink, ChunkSink, SinkError, TcpBroadcaster};
use crate::process::{describe_status, CommandDescriptor, ProcessChain, ProcessError};
use crate::splice::SplicingSink;
use crate::switch::{Switch, SwitchError, SwitchOutcome};

pub(crate) type StrategySlot = RwLock<Arc<dyn RestartStrategy>>;

/// Resolved commands for one operation, respawnable on every attempt.
#[derive(Debug, Clone)]
pub(crate) struct ChainPlan {
    pub live: Vec<CommandDescriptor>,
    pub placeholder: Option<Vec<CommandDescriptor>>,
    pub log_path: PathBuf,
}

impl ChainPlan {
    pub(crate) fn spawn(&self) -> Result<Attempt, ProcessError> {
        let placeholder = match &self.placeholder {
            Some(stages) => Some(ProcessChain::spawn(
                "placeholder",
                stages,
                Some(&self.log_path),
            )?),
            None => None,
        };
        let live = ProcessChain::spawn("live", &self.live, Some(&self.log_path))?;
        Ok(Attempt { live, placeholder })
    }
}

/// Process chains of one spawn attempt.
#[derive(Debug)]
pub(crate) struct Attempt {
    live: ProcessChain,
    placeholder: Option<ProcessChain>,
}

impl Attempt {
    pub(crate) fn pgid(&self) -> Option<i32> {
        self.live.pgid()
    }

    async fn terminate(&mut self, grace: Duration) {
        if let Some(placeholder) = self.placeholder.as_mut() {
            if let Err(err) = placeholder.terminate(grace).await {
                warn!(error = %err, "failed to terminate placeholder chain");
            }
        }
        if let Err(err) = self.live.terminate(grace).await {
            warn!(error = %err, "failed to terminate live chain");
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct RelayCounters {
    bytes: AtomicU64,
    first_byte_at: Mutex<Option<Instant>>,
}

impl RelayCounters {
    fn record(&self, len: usize) {
        if self.bytes.fetch_add(len as u64, Ordering::Relaxed) == 0 && len > 0 {
            let mut first = self.first_byte_at.lock();
            first.get_or_insert_with(Instant::now);
        }
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn first_byte_at(&self) -> Option<Instant> {
        *self.first_byte_at.lock()
    }
}

/// Final stage of every attempt: counts, optionally records, then broadcasts.
struct OutputSink {
    broadcast: BroadcastSink,
    counters: Arc<RelayCounters>,
    recording: Option<(PathBuf, File)>,
}

#[async_trait]
impl ChunkSink for OutputSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        if let Some((path, file)) = self.recording.as_mut() {
            if let Err(err) = file.write_all(chunk).await {
                warn!(path = %path.display(), error = %err, "recording failed, disabling");
                self.recording = None;
            }
        }
        self.broadcast.write_chunk(chunk).await?;
        self.counters.record(chunk.len());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if let Some((_, file)) = self.recording.as_mut() {
            let _ = file.flush().await;
        }
        Ok(())
    }
}

enum AttemptOutcome {
    Completed,
    DeliveryClosed,
    Failed(String),
    Fatal(String),
}

/// Owns the processes of one operation and drives its state machine.
pub(crate) struct Monitor {
    pub op_id: String,
    pub plan: ChainPlan,
    pub switch: Switch,
    pub chunk_size: usize,
    pub stop_grace: Duration,
    pub metrics_interval: Duration,
    pub strategy: Arc<StrategySlot>,
    pub broadcaster: Arc<TcpBroadcaster>,
    pub output_path: Option<PathBuf>,
    pub status: watch::Sender<Operation>,
    pub cancel: CancellationToken,
    pub counters: Arc<RelayCounters>,
}

impl Monitor {
    pub(crate) async fn run(self, first: Attempt, metrics: watch::Sender<PipelineMetrics>) {
        let ticker_stop = CancellationToken::new();
        let ticker = tokio::spawn(metrics_loop(
            Arc::clone(&self.counters),
            metrics,
            self.metrics_interval,
            ticker_stop.clone(),
        ));
        self.supervise(first).await;
        ticker_stop.cancel();
        if let Err(err) = ticker.await {
            warn!(op_id = %self.op_id, error = %err, "metrics task failed");
        }
        self.broadcaster.shutdown().await;
    }

    async fn supervise(&self, first: Attempt) {
        let mut attempt = first;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                outcome = self.drive(&mut attempt) => Some(outcome),
            };
            let Some(outcome) = outcome else {
                self.publish(|op| op.state = OperationState::Stopping);
                info!(op_id = %self.op_id, "stopping operation");
                attempt.terminate(self.stop_grace).await;
                self.finish(OperationState::Stopped, None);
                return;
            };

            match outcome {
                AttemptOutcome::Completed => {
                    attempt.terminate(self.stop_grace).await;
                    self.finish(OperationState::Completed, None);
                    return;
                }
                AttemptOutcome::DeliveryClosed => {
                    info!(op_id = %self.op_id, "delivery closed, tearing down chain");
                    attempt.terminate(self.stop_grace).await;
                    self.finish(OperationState::Completed, None);
                    return;
                }
                AttemptOutcome::Fatal(reason) => {
                    error!(op_id = %self.op_id, error = %reason, "handover failed");
                    attempt.terminate(self.stop_grace).await;
                    self.finish(OperationState::Error, Some(reason));
                    return;
                }
                AttemptOutcome::Failed(reason) => {
                    warn!(op_id = %self.op_id, error = %reason, "chain exited unexpectedly");
                    attempt.terminate(self.stop_grace).await;
                    match self.respawn(reason).await {
                        Some(next) => attempt = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Applies the restart strategy until a new attempt is running, the
    /// strategy gives up, or a stop request arrives.
    async fn respawn(&self, mut reason: String) -> Option<Attempt> {
        loop {
            if self.cancel.is_cancelled() {
                self.finish(OperationState::Stopped, Some(reason));
                return None;
            }
            let attempt_no = self.status.borrow().restart_count + 1;
            let strategy = Arc::clone(&*self.strategy.read());
            let Some(delay) = strategy.next_delay(attempt_no) else {
                warn!(
                    op_id = %self.op_id,
                    strategy = strategy.name(),
                    restarts = attempt_no - 1,
                    "restart limit reached"
                );
                self.finish(OperationState::Error, Some(reason));
                return None;
            };

            self.publish(|op| {
                op.restart_count = attempt_no;
                op.last_error = Some(reason.clone());
                op.state = OperationState::Restarting;
                op.pgid = None;
            });
            info!(op_id = %self.op_id, attempt = attempt_no, delay = ?delay, "restarting chain");

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.publish(|op| op.state = OperationState::Stopping);
                    self.finish(OperationState::Stopped, None);
                    return None;
                }
                _ = sleep(delay) => {}
            }

            match self.plan.spawn() {
                Ok(attempt) => {
                    self.publish(|op| {
                        op.state = OperationState::Running;
                        op.pgid = attempt.pgid();
                    });
                    return Some(attempt);
                }
                Err(err) => {
                    warn!(op_id = %self.op_id, error = %err, "respawn failed");
                    reason = err.to_string();
                }
            }
        }
    }

    async fn drive(&self, attempt: &mut Attempt) -> AttemptOutcome {
        let mut output = self.open_output().await;
        let relayed = match attempt.placeholder.as_mut() {
            Some(placeholder) => {
                let mut sink = SplicingSink::new(output);
                match self.switch.run(placeholder, &mut attempt.live, &mut sink).await {
                    Ok(SwitchOutcome::Completed { live_bytes, .. }) => {
                        debug!(op_id = %self.op_id, live_bytes, "live feed finished");
                        Ok(())
                    }
                    Ok(SwitchOutcome::SinkClosed) => return AttemptOutcome::DeliveryClosed,
                    Err(SwitchError::Handover(err)) => return AttemptOutcome::Fatal(err.to_string()),
                    Err(err) => Err(err.to_string()),
                }
            }
            None => match relay(&mut attempt.live, &mut output, self.chunk_size).await {
                Ok(()) => Ok(()),
                Err(SinkError::Closed) => return AttemptOutcome::DeliveryClosed,
                Err(err) => Err(err.to_string()),
            },
        };
        if let Err(reason) = relayed {
            return AttemptOutcome::Failed(reason);
        }

        match attempt.live.wait().await {
            Ok(status) if status.success() => AttemptOutcome::Completed,
            Ok(status) => AttemptOutcome::Failed(
                ProcessError::Exited {
                    command: attempt.live.command_line(),
                    status: describe_status(&status),
                }
                .to_string(),
            ),
            Err(err) => AttemptOutcome::Failed(err.to_string()),
        }
    }

    async fn open_output(&self) -> OutputSink {
        let recording = match &self.output_path {
            Some(path) => match OpenOptions::new().create(true).append(true).open(path).await {
                Ok(file) => Some((path.clone(), file)),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cannot open recording file");
                    None
                }
            },
            None => None,
        };
        OutputSink {
            broadcast: BroadcastSink::new(Arc::clone(&self.broadcaster)),
            counters: Arc::clone(&self.counters),
            recording,
        }
    }

    fn publish(&self, update: impl FnOnce(&mut Operation)) {
        self.status.send_modify(update);
    }

    fn finish(&self, state: OperationState, last_error: Option<String>) {
        self.publish(|op| {
            op.state = state;
            op.ended_at = Some(Utc::now());
            op.pgid = None;
            if last_error.is_some() {
                op.last_error = last_error;
            }
        });
        let op = self.status.borrow();
        info!(
            op_id = %self.op_id,
            state = %op.state,
            restarts = op.restart_count,
            bytes = self.counters.bytes(),
            "operation finished"
        );
    }
}

/// Plain copy of the live chain into the sink, used without a placeholder.
async fn relay(
    live: &mut ProcessChain,
    sink: &mut OutputSink,
    chunk_size: usize,
) -> Result<(), SinkError> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let read = live.read(&mut buf).await.map_err(SinkError::Io)?;
        if read == 0 {
            return sink.flush().await;
        }
        sink.write_chunk(&buf[..read]).await?;
    }
}

async fn metrics_loop(
    counters: Arc<RelayCounters>,
    metrics: watch::Sender<PipelineMetrics>,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_tick = Instant::now();
    let mut last_bytes = 0u64;
    loop {
        let stopping = tokio::select! {
            _ = stop.cancelled() => true,
            _ = ticker.tick() => false,
        };
        let now = Instant::now();
        let bytes = counters.bytes();
        let elapsed_ms = now.saturating_duration_since(last_tick).as_millis() as u64;
        let bitrate_kbps = if stopping || elapsed_ms == 0 {
            0
        } else {
            bytes.saturating_sub(last_bytes) * 8 / elapsed_ms
        };
        let out_time_ms = counters
            .first_byte_at()
            .map(|first| now.saturating_duration_since(first).as_millis() as u64)
            .unwrap_or(0);
        metrics.send_modify(|snapshot| {
            snapshot.bytes_total = bytes;
            snapshot.out_time_ms = out_time_ms;
            snapshot.bitrate_kbps = bitrate_kbps;
            snapshot.updated_at = Utc::now();
        });
        last_tick = now;
        last_bytes = bytes;
        if stopping {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_mark_first_byte_once() {
        let counters = RelayCounters::default();
        assert!(counters.first_byte_at().is_none());
        counters.record(10);
        let first = counters.first_byte_at().unwrap();
        counters.record(5);
        assert_eq!(counters.first_byte_at(), Some(first));
        assert_eq!(counters.bytes(), 15);
    }

    #[tokio::test]
    async fn metrics_freeze_on_stop() {
        let counters = Arc::new(RelayCounters::default());
        let (tx, rx) = watch::channel(PipelineMetrics::new("op"));
        let stop = CancellationToken::new();
        let task = tokio::spawn(metrics_loop(
            Arc::clone(&counters),
            tx,
            Duration::from_millis(20),
            stop.clone(),
        ));
        counters.record(4_000);
        tokio::time::sleep(Duration::from_millis(60)).await;
        stop.cancel();
        task.await.unwrap();

        let frozen = rx.borrow().clone();
        assert_eq!(frozen.bytes_total, 4_000);
        assert_eq!(frozen.bitrate_kbps, 0);
        counters.record(1_000);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(rx.borrow().bytes_total, 4_000);
    }
}
