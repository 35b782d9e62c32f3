use std::path::PathBuf;

use thiserror::Error;

use crate::{local::ChannelError, manager::ManagerError, runner::RunnerError};

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("local channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("sequence file {path}: {source}")]
    Sequence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registration abandoned: {0}")]
    RegistrationAbandoned(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
