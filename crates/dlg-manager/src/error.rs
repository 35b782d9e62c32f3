use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientBuildError {
    #[error("invalid manager url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid proxy: {0}")]
    Proxy(String),

    #[error("failed to build http client: {0}")]
    Client(String),
}
