//! Network side of the delegate: the manager's REST API and its push channel.

mod config;
pub use config::{ManagerConfig, ProxyConfig};

mod error;
pub use error::ClientBuildError;

mod http;
pub use http::HttpManagerClient;

mod push;
pub use push::{WsPushTransport, stream_url};
