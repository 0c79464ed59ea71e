use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::CommandTemplate;
use crate::error::ConfigError;
use crate::profile::TranscodeProfile;

const UPSTREAM_REAP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("{label} chain has no stages")]
    EmptyChain { label: String },
    #[error("stdout of {program} was not captured")]
    MissingStdout { program: String },
    #[error("failed to open log file {path}: {source}")]
    Log { path: PathBuf, source: io::Error },
    #[error("failed to signal process group {pgid}: {source}")]
    Signal { pgid: i32, source: io::Error },
    #[error("{command} exited unexpectedly ({status})")]
    Exited { command: String, status: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Fully resolved program invocation, validated before spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Values substituted into a [`CommandTemplate`].
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub channel: &'a str,
    pub profile: &'a TranscodeProfile,
    pub placeholder: Option<&'a Path>,
}

impl CommandDescriptor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
        }
    }

    /// Runs `script` through `sh -c`, for ad-hoc command strings.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh", vec!["-c".to_string(), script.into()])
    }

    pub fn from_template(
        template: &CommandTemplate,
        vars: &TemplateVars<'_>,
    ) -> Result<Self, ConfigError> {
        let mut args = Vec::with_capacity(template.args.len());
        for arg in &template.args {
            if arg == "{output_args}" {
                args.extend(vars.profile.output_args.iter().cloned());
                continue;
            }
            args.push(substitute(arg, vars));
        }
        let env = template
            .env
            .iter()
            .map(|(key, value)| (key.clone(), substitute(value, vars)))
            .collect();
        let descriptor = Self {
            program: substitute(&template.program, vars),
            args,
            env,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(ConfigError::InvalidCommand(
                "program must not be empty".to_string(),
            ));
        }
        if let Some(arg) = self.args.iter().find(|arg| arg.contains('\0')) {
            return Err(ConfigError::InvalidCommand(format!(
                "argument contains a NUL byte: {arg:?}"
            )));
        }
        Ok(())
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env).kill_on_drop(true);
        command
    }
}

impl fmt::Display for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn substitute(value: &str, vars: &TemplateVars<'_>) -> String {
    let placeholder = vars
        .placeholder
        .map(|path| path.to_string_lossy().to_string())
        .unwrap_or_default();
    value
        .replace("{channel}", vars.channel)
        .replace("{profile}", &vars.profile.name)
        .replace("{placeholder}", &placeholder)
}

/// A pipeline of processes (`a | b | c`) sharing one process group.
///
/// The group is killed outright if the chain is dropped before it was reaped.
pub struct ProcessChain {
    label: String,
    stages: Vec<CommandDescriptor>,
    children: Vec<Child>,
    pgid: Option<i32>,
    stdout: Option<ChildStdout>,
    reaped: bool,
}

impl fmt::Debug for ProcessChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessChain")
            .field("label", &self.label)
            .field("pgid", &self.pgid)
            .field("stages", &self.stages.len())
            .field("reaped", &self.reaped)
            .finish()
    }
}

impl ProcessChain {
    pub fn spawn(
        label: impl Into<String>,
        stages: &[CommandDescriptor],
        log_path: Option<&Path>,
    ) -> Result<Self, ProcessError> {
        let label = label.into();
        if stages.is_empty() {
            return Err(ProcessError::EmptyChain { label });
        }
        let log = match log_path {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| ProcessError::Log {
                        path: path.to_path_buf(),
                        source,
                    })?,
            ),
            None => None,
        };

        let mut chain = Self {
            label,
            stages: stages.to_vec(),
            children: Vec::with_capacity(stages.len()),
            pgid: None,
            stdout: None,
            reaped: false,
        };
        let mut upstream: Option<ChildStdout> = None;
        for stage in stages {
            stage
                .validate()
                .map_err(|err| ProcessError::Spawn {
                    program: stage.program.clone(),
                    source: io::Error::new(io::ErrorKind::InvalidInput, err.to_string()),
                })?;
            let mut command = stage.to_command();
            let stdin: Stdio = match upstream.take() {
                Some(stdout) => stdout.try_into()?,
                None => Stdio::null(),
            };
            let stderr = match &log {
                Some(file) => Stdio::from(file.try_clone()?),
                None => Stdio::inherit(),
            };
            command.stdin(stdin).stdout(Stdio::piped()).stderr(stderr);
            #[cfg(unix)]
            command.process_group(chain.pgid.unwrap_or(0));

            let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
                program: stage.program.clone(),
                source,
            })?;
            if chain.pgid.is_none() {
                chain.pgid = child.id().map(|pid| pid as i32);
            }
            upstream = child.stdout.take();
            if upstream.is_none() {
                return Err(ProcessError::MissingStdout {
                    program: stage.program.clone(),
                });
            }
            chain.children.push(child);
        }
        chain.stdout = upstream;
        debug!(chain = %chain.label, pgid = ?chain.pgid, stages = chain.children.len(), "process chain spawned");
        Ok(chain)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pgid(&self) -> Option<i32> {
        self.pgid
    }

    pub fn command_line(&self) -> String {
        self.stages
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" | ")
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Waits for the chain to finish on its own.
    ///
    /// Returns the first non-successful stage status, or the last stage's
    /// status when every stage succeeded.
    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        let Some(last) = self.children.len().checked_sub(1) else {
            return Err(ProcessError::EmptyChain {
                label: self.label.clone(),
            });
        };
        let last_status = self.children[last].wait().await?;
        let mut statuses = vec![None; self.children.len()];
        statuses[last] = Some(last_status);

        let upstream = async {
            for (index, child) in self.children.iter_mut().enumerate().take(last) {
                statuses[index] = child.wait().await.ok();
            }
        };
        if timeout(UPSTREAM_REAP_GRACE, upstream).await.is_err() {
            warn!(chain = %self.label, "upstream stages still running after last stage exited");
            self.kill_group();
            for (index, child) in self.children.iter_mut().enumerate().take(last) {
                if statuses[index].is_none() {
                    statuses[index] = child.wait().await.ok();
                }
            }
        }
        self.sweep_group();
        self.reaped = true;

        Ok(statuses
            .into_iter()
            .flatten()
            .find(|status| !status.success())
            .unwrap_or(last_status))
    }

    /// Graceful termination: SIGTERM to the group, bounded wait, then SIGKILL.
    pub async fn terminate(&mut self, grace: Duration) -> Result<(), ProcessError> {
        if self.reaped {
            return Ok(());
        }
        self.stdout = None;
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            signal_group(pgid, libc::SIGTERM)
                .map_err(|source| ProcessError::Signal { pgid, source })?;
        }
        #[cfg(not(unix))]
        for child in &mut self.children {
            let _ = child.start_kill();
        }

        if timeout(grace, self.reap_all()).await.is_err() {
            warn!(chain = %self.label, pgid = ?self.pgid, grace = ?grace, "process group ignored SIGTERM, killing");
            self.kill_group();
            self.reap_all().await;
        }
        self.sweep_group();
        self.reaped = true;
        debug!(chain = %self.label, pgid = ?self.pgid, "process chain terminated");
        Ok(())
    }

    async fn reap_all(&mut self) {
        for child in &mut self.children {
            if let Err(err) = child.wait().await {
                debug!(chain = %self.label, error = %err, "failed to reap child");
            }
        }
    }

    fn kill_group(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            if let Err(err) = signal_group(pgid, libc::SIGKILL) {
                warn!(pgid, error = %err, "failed to kill process group");
            }
        }
        for child in &mut self.children {
            let _ = child.start_kill();
        }
    }

    /// Kills grandchildren left behind in the group. A group with no members
    /// is skipped, since its id may already belong to someone else.
    fn sweep_group(&self) -> bool {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            if group_alive(pgid) {
                debug!(chain = %self.label, pgid, "killing leftover group members");
                return signal_group(pgid, libc::SIGKILL).unwrap_or(false);
            }
        }
        false
    }
}

impl AsyncRead for ProcessChain {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.stdout.as_mut() {
            Some(stdout) => Pin::new(stdout).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for ProcessChain {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill_group();
        }
    }
}

/// Delivers `signal` to every process in the group. `Ok(false)` when the group is gone.
#[cfg(unix)]
pub fn signal_group(pgid: i32, signal: libc::c_int) -> io::Result<bool> {
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(unix)]
pub fn group_alive(pgid: i32) -> bool {
    signal_group(pgid, 0).unwrap_or(false)
}

pub fn describe_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {signal}");
        }
    }
    "unknown exit status".to_string()
}
