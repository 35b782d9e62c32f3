use dlg_core::RunnerError;
use thiserror::Error;

pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("unsupported task type for this runner")]
    UnsupportedKind,
    #[error("invalid task parameters: {0}")]
    InvalidParameters(String),
    #[error("empty script")]
    MissingScript,
    #[error("no function registered for task type: {0}")]
    FunctionNotFound(String),
    #[error("non-zero exit code: {code}")]
    NonZeroExit { code: i32 },
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("killed by signal")]
    KilledBySignal,
    #[error("io error: {0}")]
    Io(String),
    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Io(e.to_string())
    }
}

impl From<ExecError> for RunnerError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Cancelled => RunnerError::Cancelled,
            ExecError::UnsupportedKind
            | ExecError::InvalidParameters(_)
            | ExecError::MissingScript
            | ExecError::FunctionNotFound(_) => RunnerError::InvalidTask(e.to_string()),
            other => RunnerError::Failed(other.to_string()),
        }
    }
}
