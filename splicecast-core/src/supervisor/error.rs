use std::io;

use thiserror::Error;

use super::operation::OperationState;
use crate::error::ConfigError;
use crate::process::ProcessError;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("operation {0} already exists")]
    AlreadyExists(String),
    #[error("operation {op_id} is still {state}")]
    NotTerminal {
        op_id: String,
        state: OperationState,
    },
    #[error("failed to bind delivery listener on {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("failed to prepare work directory: {0}")]
    Io(#[from] io::Error),
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
