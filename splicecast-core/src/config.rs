use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SplicecastConfig {
    pub paths: PathsSection,
    pub commands: CommandsSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub switch: SwitchSection,
    #[serde(default)]
    pub tcp: TcpSection,
    #[serde(default)]
    pub hls: HlsSection,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl SplicecastConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn work_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.work_dir)
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.profiles_dir)
    }

    pub fn placeholder_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.placeholder_dir)
    }

    /// Pre-encoded placeholder clip for `profile`.
    pub fn placeholder_file(&self, profile: &str) -> PathBuf {
        self.placeholder_dir().join(format!("{profile}.ts"))
    }

    /// Still image the placeholder clips are encoded from.
    pub fn placeholder_image(&self) -> PathBuf {
        self.resolve_path(&self.paths.placeholder_image)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub work_dir: String,
    pub profiles_dir: String,
    #[serde(default = "default_placeholder_dir")]
    pub placeholder_dir: String,
    #[serde(default = "default_placeholder_image")]
    pub placeholder_image: String,
}

/// External programs making up a playback chain.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandsSection {
    pub fetcher: CommandTemplate,
    pub encoder: CommandTemplate,
    #[serde(default)]
    pub placeholder: Option<CommandTemplate>,
}

/// A program plus argument template, rendered per operation.
///
/// Arguments may contain `{channel}`, `{profile}` and `{placeholder}`; an
/// argument that is exactly `{output_args}` expands into the profile's
/// ordered output arguments.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default)]
    pub backoff_jitter_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default)]
    pub default_port: u16,
    #[serde(default)]
    pub record_output: bool,
}

impl SupervisorSection {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms.clamp(50, 1000))
    }
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_restarts: default_max_restarts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter_ms: 0,
            stop_grace_ms: default_stop_grace_ms(),
            metrics_interval_ms: default_metrics_interval_ms(),
            listen_host: default_listen_host(),
            default_port: 0,
            record_output: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchSection {
    #[serde(default = "default_switch_chunk")]
    pub chunk_size: usize,
    #[serde(default)]
    pub switch_grace_ms: u64,
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
}

impl Default for SwitchSection {
    fn default() -> Self {
        Self {
            chunk_size: default_switch_chunk(),
            switch_grace_ms: 0,
            watchdog_ms: default_watchdog_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TcpSection {
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_client_buffer_chunks")]
    pub client_buffer_chunks: usize,
    #[serde(default = "default_tcp_chunk")]
    pub chunk_size: usize,
    #[serde(default)]
    pub wait_for_client: bool,
    #[serde(default)]
    pub stop_on_disconnect: bool,
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            write_timeout_ms: default_write_timeout_ms(),
            client_buffer_chunks: default_client_buffer_chunks(),
            chunk_size: default_tcp_chunk(),
            wait_for_client: false,
            stop_on_disconnect: false,
            stats_interval_ms: default_stats_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HlsSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_segment_timeout_ms")]
    pub segment_timeout_ms: u64,
    #[serde(default = "default_segment_duration")]
    pub segment_duration: f64,
    #[serde(default = "default_target_duration")]
    pub target_duration: u32,
    #[serde(default = "default_keep_segments")]
    pub keep_segments: usize,
    #[serde(default = "default_gap_timeout_ms")]
    pub gap_timeout_ms: u64,
}

impl Default for HlsSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            segment_timeout_ms: default_segment_timeout_ms(),
            segment_duration: default_segment_duration(),
            target_duration: default_target_duration(),
            keep_segments: default_keep_segments(),
            gap_timeout_ms: default_gap_timeout_ms(),
        }
    }
}

fn default_placeholder_dir() -> String {
    "assets/placeholders".to_string()
}

fn default_placeholder_image() -> String {
    "assets/placeholder.jpg".to_string()
}

fn default_strategy() -> String {
    "backoff".to_string()
}

fn default_max_restarts() -> u32 {
    5
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_metrics_interval_ms() -> u64 {
    1_000
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_switch_chunk() -> usize {
    188 * 256
}

fn default_watchdog_ms() -> u64 {
    5_000
}

fn default_terminate_grace_ms() -> u64 {
    2_000
}

fn default_backlog() -> u32 {
    8
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_client_buffer_chunks() -> usize {
    256
}

fn default_tcp_chunk() -> usize {
    64 * 1024
}

fn default_stats_interval_ms() -> u64 {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_segment_timeout_ms() -> u64 {
    15_000
}

fn default_segment_duration() -> f64 {
    4.0
}

fn default_target_duration() -> u32 {
    6
}

fn default_keep_segments() -> usize {
    8
}

fn default_gap_timeout_ms() -> u64 {
    20_000
}

pub fn load_splicecast_config<P: AsRef<Path>>(path: P) -> Result<SplicecastConfig> {
    let path = path.as_ref();
    let mut config: SplicecastConfig = load_toml(path)?;
    config.base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/splicecast.toml");
        let config = load_splicecast_config(&path).expect("config should parse");
        assert_eq!(config.commands.fetcher.program, "streamlink");
        assert!(config
            .commands
            .encoder
            .args
            .iter()
            .any(|arg| arg == "{output_args}"));
        assert!(config.commands.placeholder.is_some());
        assert_eq!(config.supervisor.strategy, "backoff");
        assert_eq!(config.switch.chunk_size, 188 * 256);
        assert_eq!(config.hls.keep_segments, 8);
        assert!(config.profiles_dir().ends_with("profiles"));
        assert!(config
            .placeholder_file("aga_low")
            .ends_with("placeholders/aga_low.ts"));
        assert!(config.placeholder_image().ends_with("assets/placeholder.jpg"));
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: SplicecastConfig = toml::from_str(
            r#"
            [paths]
            work_dir = "runs"
            profiles_dir = "profiles"

            [commands.fetcher]
            program = "streamlink"

            [commands.encoder]
            program = "ffmpeg"
            "#,
        )
        .unwrap();
        assert_eq!(config.tcp.chunk_size, 64 * 1024);
        assert_eq!(config.hls.gap_timeout_ms, 20_000);
        assert_eq!(config.switch.terminate_grace_ms, 2_000);
        assert!(config.commands.placeholder.is_none());
        assert!(config.commands.fetcher.args.is_empty());
        assert_eq!(config.paths.placeholder_image, "assets/placeholder.jpg");
    }

    #[test]
    fn parse_error_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[paths\nwork_dir = 1").unwrap();
        let err = load_splicecast_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }
}
