//! Lifecycle management for supervised playback operations.

mod error;
mod monitor;
mod operation;
mod strategy;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use error::{SupervisorError, SupervisorResult};
pub use operation::{Operation, OperationState, PipelineMetrics};
pub use strategy::{
    strategy_from_name, Backoff, Immediate, Never, RestartStrategy, STRATEGY_NAMES,
};

use self::monitor::{ChainPlan, Monitor, StrategySlot};
use crate::config::SplicecastConfig;
use crate::delivery::{TcpBroadcaster, TcpSettings};
use crate::error::ConfigError;
use crate::process::{CommandDescriptor, TemplateVars};
use crate::profile::{ProfileRegistry, TranscodeProfile};
use crate::switch::{Switch, SwitchSettings};

struct OperationHandle {
    status: watch::Receiver<Operation>,
    metrics: watch::Receiver<PipelineMetrics>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct OperationTable {
    active: HashMap<String, Arc<OperationHandle>>,
    reserved: HashSet<String>,
}

/// Holds an op id while `start` is in flight so a concurrent start with the
/// same id is rejected.
struct Reservation<'a> {
    table: &'a RwLock<OperationTable>,
    op_id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.table.write().reserved.remove(&self.op_id);
    }
}

/// Runs playback operations, one monitor task per operation id.
pub struct Supervisor {
    config: Arc<SplicecastConfig>,
    registry: ProfileRegistry,
    strategy: Arc<StrategySlot>,
    table: RwLock<OperationTable>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("strategy", &self.strategy())
            .field("profiles", &self.registry.len())
            .field("operations", &self.table.read().active.len())
            .finish()
    }
}

impl Supervisor {
    pub fn new(config: SplicecastConfig, registry: ProfileRegistry) -> Result<Self, ConfigError> {
        let strategy = strategy_from_name(&config.supervisor.strategy, &config.supervisor)?;
        Ok(Self {
            config: Arc::new(config),
            registry,
            strategy: Arc::new(RwLock::new(strategy)),
            table: RwLock::new(OperationTable::default()),
        })
    }

    /// Builds a supervisor with profiles loaded from the configured directory.
    pub fn from_config(config: SplicecastConfig) -> Result<Self, ConfigError> {
        let registry = ProfileRegistry::load_dir(config.profiles_dir())?;
        Self::new(config, registry)
    }

    pub fn config(&self) -> &SplicecastConfig {
        &self.config
    }

    pub fn available_profiles(&self) -> Vec<TranscodeProfile> {
        self.registry.list()
    }

    pub fn strategy(&self) -> String {
        self.strategy.read().name().to_string()
    }

    /// Switches the restart policy for every operation, including running ones.
    pub fn set_strategy(&self, name: &str) -> Result<(), ConfigError> {
        let next = strategy_from_name(name, &self.config.supervisor)?;
        info!(strategy = next.name(), "restart strategy changed");
        *self.strategy.write() = next;
        Ok(())
    }

    pub async fn start(
        &self,
        op_id: &str,
        channel: &str,
        profile_name: &str,
    ) -> SupervisorResult<Operation> {
        let profile = self.registry.resolve(profile_name)?.clone();
        let _reservation = self.reserve(op_id)?;
        let work_dir = self.config.work_dir();
        tokio::fs::create_dir_all(&work_dir).await?;
        let log_path = work_dir.join(format!("{op_id}.log"));
        let output_path = self
            .config
            .supervisor
            .record_output
            .then(|| work_dir.join(format!("{op_id}.ts")));
        let plan = self.plan(channel, &profile, log_path.clone())?;

        let host = self.config.supervisor.listen_host.clone();
        let port = profile
            .listen_port
            .unwrap_or(self.config.supervisor.default_port);
        let (status_tx, metrics_tx, handle) = self.register(Operation {
            op_id: op_id.to_string(),
            channel: channel.to_string(),
            profile: profile.name.clone(),
            state: OperationState::Starting,
            started_at: Utc::now(),
            ended_at: None,
            listen_host: host.clone(),
            listen_port: port,
            output_path: output_path.clone(),
            log_path,
            pgid: None,
            restart_count: 0,
            last_error: None,
        });

        let launched = async {
            let broadcaster =
                TcpBroadcaster::bind(&host, port, TcpSettings::from(&self.config.tcp))
                    .await
                    .map_err(|source| SupervisorError::Bind {
                        addr: format!("{host}:{port}"),
                        source,
                    })?;
            let attempt = plan.spawn()?;
            Ok::<_, SupervisorError>((broadcaster, attempt))
        };
        let (broadcaster, attempt) = match launched.await {
            Ok(launched) => launched,
            Err(err) => {
                warn!(op_id = %op_id, error = %err, "operation failed to start");
                status_tx.send_modify(|op| {
                    op.state = OperationState::Error;
                    op.ended_at = Some(Utc::now());
                    op.last_error = Some(err.to_string());
                });
                self.table.write().active.remove(op_id);
                return Err(err);
            }
        };
        let listen_port = broadcaster.local_addr().port();
        status_tx.send_modify(|op| {
            op.state = OperationState::Running;
            op.listen_port = listen_port;
            op.pgid = attempt.pgid();
        });
        let operation = status_tx.borrow().clone();

        let monitor = Monitor {
            op_id: op_id.to_string(),
            plan,
            switch: Switch::new(SwitchSettings::from(&self.config.switch)),
            chunk_size: self.config.switch.chunk_size,
            stop_grace: self.config.supervisor.stop_grace(),
            metrics_interval: self.config.supervisor.metrics_interval(),
            strategy: Arc::clone(&self.strategy),
            broadcaster: Arc::new(broadcaster),
            output_path,
            status: status_tx,
            cancel: handle.cancel.clone(),
            counters: Arc::default(),
        };
        let task = tokio::spawn(monitor.run(attempt, metrics_tx));
        *handle.task.lock().await = Some(task);
        info!(
            op_id = %op_id,
            channel = %channel,
            profile = %profile.name,
            port = listen_port,
            pgid = ?operation.pgid,
            "operation started"
        );
        Ok(operation)
    }

    /// Requests a stop and waits until the operation's processes are gone.
    /// Returns `false` for an unknown op id.
    pub async fn stop(&self, op_id: &str) -> bool {
        let Some(handle) = self.handle(op_id) else {
            return false;
        };
        handle.cancel.cancel();
        let task = handle.task.lock().await.take();
        match task {
            Some(task) => {
                if let Err(err) = task.await {
                    warn!(op_id = %op_id, error = %err, "monitor task failed");
                }
            }
            None => {
                let mut status = handle.status.clone();
                let _ = status.wait_for(|op| op.state.is_terminal()).await;
            }
        }
        true
    }

    /// Forgets a finished operation. `Ok(false)` when the id is unknown.
    pub fn remove(&self, op_id: &str) -> SupervisorResult<bool> {
        let mut table = self.table.write();
        let Some(handle) = table.active.get(op_id) else {
            return Ok(false);
        };
        let state = handle.status.borrow().state;
        if !state.is_terminal() {
            return Err(SupervisorError::NotTerminal {
                op_id: op_id.to_string(),
                state,
            });
        }
        table.active.remove(op_id);
        Ok(true)
    }

    pub fn get_status(&self, op_id: &str) -> Option<Operation> {
        self.handle(op_id)
            .map(|handle| handle.status.borrow().clone())
    }

    pub fn get_metrics(&self, op_id: &str) -> Option<PipelineMetrics> {
        self.handle(op_id)
            .map(|handle| handle.metrics.borrow().clone())
    }

    /// Watch channel for status changes of one operation.
    pub fn subscribe(&self, op_id: &str) -> Option<watch::Receiver<Operation>> {
        self.handle(op_id).map(|handle| handle.status.clone())
    }

    pub fn operation_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.table.read().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stops every operation concurrently and waits for all of them.
    pub async fn shutdown(&self) {
        let ids = self.operation_ids();
        info!(operations = ids.len(), "supervisor shutting down");
        join_all(ids.iter().map(|op_id| self.stop(op_id))).await;
    }

    fn handle(&self, op_id: &str) -> Option<Arc<OperationHandle>> {
        self.table.read().active.get(op_id).cloned()
    }

    /// Publishes `operation` in the table before its processes exist.
    fn register(
        &self,
        operation: Operation,
    ) -> (
        watch::Sender<Operation>,
        watch::Sender<PipelineMetrics>,
        Arc<OperationHandle>,
    ) {
        let op_id = operation.op_id.clone();
        let (status_tx, status_rx) = watch::channel(operation);
        let (metrics_tx, metrics_rx) = watch::channel(PipelineMetrics::new(&op_id));
        let handle = Arc::new(OperationHandle {
            status: status_rx,
            metrics: metrics_rx,
            cancel: CancellationToken::new(),
            task: tokio::sync::Mutex::new(None),
        });
        self.table
            .write()
            .active
            .insert(op_id, Arc::clone(&handle));
        (status_tx, metrics_tx, handle)
    }

    fn reserve(&self, op_id: &str) -> SupervisorResult<Reservation<'_>> {
        let mut table = self.table.write();
        if table.active.contains_key(op_id) || !table.reserved.insert(op_id.to_string()) {
            return Err(SupervisorError::AlreadyExists(op_id.to_string()));
        }
        Ok(Reservation {
            table: &self.table,
            op_id: op_id.to_string(),
        })
    }

    fn plan(
        &self,
        channel: &str,
        profile: &TranscodeProfile,
        log_path: PathBuf,
    ) -> Result<ChainPlan, ConfigError> {
        let placeholder_file = self.config.placeholder_file(&profile.name);
        let vars = TemplateVars {
            channel,
            profile,
            placeholder: Some(&placeholder_file),
        };
        let commands = &self.config.commands;
        let live = vec![
            CommandDescriptor::from_template(&commands.fetcher, &vars)?,
            CommandDescriptor::from_template(&commands.encoder, &vars)?,
        ];
        let placeholder = commands
            .placeholder
            .as_ref()
            .map(|template| CommandDescriptor::from_template(template, &vars).map(|stage| vec![stage]))
            .transpose()?;
        Ok(ChainPlan {
            live,
            placeholder,
            log_path,
        })
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for handle in self.table.get_mut().active.values() {
            handle.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> Supervisor {
        let config: SplicecastConfig = toml::from_str(
            r#"
            [paths]
            work_dir = "runs"
            profiles_dir = "profiles"

            [commands.fetcher]
            program = "true"

            [commands.encoder]
            program = "cat"
            "#,
        )
        .unwrap();
        Supervisor::new(config, ProfileRegistry::default()).unwrap()
    }

    fn pending(op_id: &str) -> Operation {
        Operation {
            op_id: op_id.to_string(),
            channel: "chan".into(),
            profile: "aga_low".into(),
            state: OperationState::Starting,
            started_at: Utc::now(),
            ended_at: None,
            listen_host: "127.0.0.1".into(),
            listen_port: 5001,
            output_path: None,
            log_path: PathBuf::from("runs/op.log"),
            pgid: None,
            restart_count: 0,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn registered_operation_is_visible_as_starting() {
        let supervisor = supervisor();
        let (status, _metrics, handle) = supervisor.register(pending("op-s"));

        let snapshot = supervisor.get_status("op-s").unwrap();
        assert_eq!(snapshot.state, OperationState::Starting);
        assert!(snapshot.pgid.is_none());
        assert!(matches!(
            supervisor.remove("op-s"),
            Err(SupervisorError::NotTerminal {
                state: OperationState::Starting,
                ..
            })
        ));
        assert!(matches!(
            supervisor.reserve("op-s"),
            Err(SupervisorError::AlreadyExists(_))
        ));

        let (stopped, ()) = tokio::join!(supervisor.stop("op-s"), async {
            status.send_modify(|op| op.state = OperationState::Error);
        });
        assert!(stopped);
        assert!(handle.cancel.is_cancelled());
        assert!(supervisor.remove("op-s").unwrap());
    }
}
