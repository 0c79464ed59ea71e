use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("failed to parse profile {path}: {source}")]
    Profile {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("profile {path} is invalid: {reason}")]
    InvalidProfile { path: PathBuf, reason: String },
    #[error("unknown profile: {0}")]
    UnknownProfile(String),
    #[error("unknown restart strategy: {0}")]
    UnknownStrategy(String),
    #[error("invalid command descriptor: {0}")]
    InvalidCommand(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
