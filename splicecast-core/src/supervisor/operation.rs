use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
    Completed,
    Error,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Starting => "starting",
            OperationState::Running => "running",
            OperationState::Restarting => "restarting",
            OperationState::Stopping => "stopping",
            OperationState::Stopped => "stopped",
            OperationState::Completed => "completed",
            OperationState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Stopped | OperationState::Completed | OperationState::Error
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "restarting" => Ok(Self::Restarting),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown operation state: {other}")),
        }
    }
}

/// Snapshot of one supervised playback session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    pub op_id: String,
    pub channel: String,
    pub profile: String,
    pub state: OperationState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub listen_host: String,
    pub listen_port: u16,
    pub output_path: Option<PathBuf>,
    pub log_path: PathBuf,
    pub pgid: Option<i32>,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub op_id: String,
    pub bytes_total: u64,
    pub out_time_ms: u64,
    pub bitrate_kbps: u64,
    pub updated_at: DateTime<Utc>,
}

impl PipelineMetrics {
    pub fn new(op_id: impl Into<String>) -> Self {
        Self {
            op_id: op_id.into(),
            bytes_total: 0,
            out_time_ms: 0,
            bitrate_kbps: 0,
            updated_at: Utc::now(),
        }
    }
}
