use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("sequence token is missing the {0} marker")]
    MissingMarker(&'static str),
    #[error("sequence token is blank")]
    BlankToken,
    #[error("unknown local command: {0}")]
    UnknownCommand(String),
}
