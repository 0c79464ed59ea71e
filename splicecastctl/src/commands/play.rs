use std::path::Path;

use clap::Args;
use serde::Serialize;
use splicecast_core::{load_splicecast_config, Operation, OperationState, PipelineMetrics, Supervisor};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{render, seconds, AppError, DisplayFallback, OutputFormat, Result};

#[derive(Args, Debug)]
pub struct PlayArgs {
    /// Channel handed to the fetcher command
    #[arg(long)]
    pub channel: String,
    /// Transcode profile name
    #[arg(long, default_value = "aga_low")]
    pub profile: String,
    /// Restart strategy overriding the configured one (immediate, backoff, never)
    #[arg(long)]
    pub strategy: Option<String>,
    /// Operation id; a random one is generated when omitted
    #[arg(long, value_name = "ID")]
    pub op_id: Option<String>,
    /// Seconds between progress reports
    #[arg(long, default_value_t = 5.0)]
    pub report_interval: f64,
}

#[derive(Debug, Serialize)]
struct PlayReport {
    operation: Operation,
    metrics: Option<PipelineMetrics>,
}

impl PlayReport {
    fn collect(supervisor: &Supervisor, op_id: &str) -> Result<Self> {
        let operation = supervisor
            .get_status(op_id)
            .ok_or_else(|| AppError::MissingOperation(op_id.to_string()))?;
        Ok(Self {
            operation,
            metrics: supervisor.get_metrics(op_id),
        })
    }
}

impl DisplayFallback for PlayReport {
    fn display(&self) -> String {
        let op = &self.operation;
        let mut line = format!(
            "[{state}] {op_id} channel={channel} profile={profile} tcp://{host}:{port} restarts={restarts}",
            state = op.state,
            op_id = op.op_id,
            channel = op.channel,
            profile = op.profile,
            host = op.listen_host,
            port = op.listen_port,
            restarts = op.restart_count,
        );
        if let Some(metrics) = &self.metrics {
            line.push_str(&format!(
                " bytes={} out_time={:.1}s bitrate={}kbps",
                metrics.bytes_total,
                metrics.out_time_ms as f64 / 1000.0,
                metrics.bitrate_kbps
            ));
        }
        if let Some(error) = &op.last_error {
            line.push_str(&format!(" last_error=\"{error}\""));
        }
        line
    }
}

pub async fn run(config_path: &Path, args: &PlayArgs, format: OutputFormat) -> Result<()> {
    let config = load_splicecast_config(config_path)?;
    let supervisor = Supervisor::from_config(config)?;
    if let Some(name) = &args.strategy {
        supervisor.set_strategy(name)?;
    }
    let op_id = args
        .op_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    supervisor.start(&op_id, &args.channel, &args.profile).await?;
    render(&PlayReport::collect(&supervisor, &op_id)?, format)?;

    let mut status = supervisor
        .subscribe(&op_id)
        .ok_or_else(|| AppError::MissingOperation(op_id.clone()))?;
    let mut ticker = interval(seconds(args.report_interval).max(seconds(0.1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(err) = signal {
                    warn!(error = %err, "failed to listen for interrupt");
                }
                info!(op_id = %op_id, "interrupt received, stopping operation");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = status.borrow_and_update().state;
                if state.is_terminal() {
                    break;
                }
                if state == OperationState::Restarting {
                    render(&PlayReport::collect(&supervisor, &op_id)?, format)?;
                }
            }
            _ = ticker.tick() => {
                render(&PlayReport::collect(&supervisor, &op_id)?, format)?;
            }
        }
    }

    supervisor.stop(&op_id).await;
    let report = PlayReport::collect(&supervisor, &op_id)?;
    render(&report, format)?;
    if report.operation.state == OperationState::Error {
        return Err(AppError::OperationFailed {
            op_id,
            reason: report
                .operation
                .last_error
                .unwrap_or_else(|| "unknown failure".to_string()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn operation() -> Operation {
        Operation {
            op_id: "abc".into(),
            channel: "somechannel".into(),
            profile: "aga_low".into(),
            state: OperationState::Restarting,
            started_at: Utc::now(),
            ended_at: None,
            listen_host: "0.0.0.0".into(),
            listen_port: 5001,
            output_path: None,
            log_path: PathBuf::from("runs/abc.log"),
            pgid: None,
            restart_count: 2,
            last_error: Some("exit code 1".into()),
        }
    }

    #[test]
    fn report_line_carries_state_and_metrics() {
        let mut metrics = PipelineMetrics::new("abc");
        metrics.bytes_total = 4096;
        metrics.out_time_ms = 2500;
        metrics.bitrate_kbps = 13;
        let report = PlayReport {
            operation: operation(),
            metrics: Some(metrics),
        };
        let line = report.display();
        assert!(line.starts_with("[restarting] abc"));
        assert!(line.contains("tcp://0.0.0.0:5001"));
        assert!(line.contains("restarts=2"));
        assert!(line.contains("bytes=4096 out_time=2.5s bitrate=13kbps"));
        assert!(line.ends_with("last_error=\"exit code 1\""));
    }

    #[test]
    fn report_serializes_lowercase_state() {
        let report = PlayReport {
            operation: operation(),
            metrics: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["operation"]["state"], "restarting");
        assert!(json["metrics"].is_null());
    }
}
