mod commands;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use splicecast_core::{
    load_splicecast_config, ConfigError, HlsError, ProcessError, ProfileRegistry, SupervisorError,
    SwitchError, TranscodeProfile,
};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub use commands::hls_repack::HlsRepackArgs;
pub use commands::placeholders::PlaceholdersArgs;
pub use commands::play::PlayArgs;
pub use commands::splice::SpliceArgs;
pub use commands::switch::SwitchArgs;
pub use commands::tcp_sink::TcpSinkArgs;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error("process error: {0}")]
    Process(#[from] ProcessError),
    #[error("switch failed: {0}")]
    Switch(#[from] SwitchError),
    #[error("hls error: {0}")]
    Hls(#[from] HlsError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("operation {op_id} failed: {reason}")]
    OperationFailed { op_id: String, reason: String },
    #[error("operation {0} is no longer tracked")]
    MissingOperation(String),
    #[error("{chain} chain ended with {status}")]
    ChainFailed { chain: String, status: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no profiles found in {}", .0.display())]
    NoProfiles(PathBuf),
    #[error("required file {} is missing", .0.display())]
    MissingFile(PathBuf),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Splicecast pipeline control interface", long_about = None)]
pub struct Cli {
    /// Path to splicecast.toml
    #[arg(long, default_value = "configs/splicecast.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Lists the transcode profiles found in the profiles directory
    Profiles,
    /// Runs one supervised playback until it ends or Ctrl-C
    Play(PlayArgs),
    /// Relays a placeholder command into a FIFO until the live command produces data
    Switch(SwitchArgs),
    /// Splices placeholder TS from stdin with live TS from a path onto stdout
    Splice(SpliceArgs),
    /// Broadcasts stdin to every connected TCP client
    TcpSink(TcpSinkArgs),
    /// Republishes a local HLS playlist with gap filling
    HlsRepack(HlsRepackArgs),
    /// Encodes one placeholder clip per profile from a still image
    Placeholders(PlaceholdersArgs),
    /// Prints shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Installs the stderr subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Profiles => {
            let list = load_profiles(&cli.config)?;
            render(&list, cli.format)
        }
        Commands::Play(args) => commands::play::run(&cli.config, args, cli.format).await,
        Commands::Switch(args) => commands::switch::run(args, cli.format).await,
        Commands::Splice(args) => commands::splice::run(args).await,
        Commands::TcpSink(args) => commands::tcp_sink::run(args, cli.format).await,
        Commands::HlsRepack(args) => commands::hls_repack::run(args, cli.format).await,
        Commands::Placeholders(args) => {
            commands::placeholders::run(&cli.config, args, cli.format).await
        }
        Commands::Completions(args) => {
            clap_complete::generate(
                args.shell,
                &mut Cli::command(),
                "splicecastctl",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

fn load_profiles(config_path: &Path) -> Result<ProfileList> {
    let config = load_splicecast_config(config_path)?;
    let registry = ProfileRegistry::load_dir(config.profiles_dir())?;
    Ok(ProfileList {
        profiles: registry.list(),
    })
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

/// Seconds from the command line, clamped at zero.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

#[derive(Debug, Serialize)]
struct ProfileList {
    profiles: Vec<TranscodeProfile>,
}

impl DisplayFallback for ProfileList {
    fn display(&self) -> String {
        if self.profiles.is_empty() {
            return "No profiles found".to_string();
        }
        self.profiles
            .iter()
            .map(|profile| {
                let port = profile
                    .listen_port
                    .map(|port| port.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let description = profile.description.as_deref().unwrap_or("");
                format!("{:<16} port {:<6} {}", profile.name, port, description)
                    .trim_end()
                    .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
