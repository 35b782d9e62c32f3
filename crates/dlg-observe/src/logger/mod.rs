mod config;
mod error;
mod format;
mod level;
mod log;

pub use config::LoggerConfig;
pub use error::LoggerError;
pub use format::LoggerFormat;
pub use level::LoggerLevel;

/// Install the global subscriber described by `cfg`.
///
/// Fails with [`LoggerError::AlreadyInitialized`] when called twice.
pub fn init_logger(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    log::install(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_rejected() {
        let cfg = LoggerConfig {
            format: LoggerFormat::Json,
            ..LoggerConfig::default()
        };
        init_logger(&cfg).unwrap();
        tracing::info!(task = "t1", "logger installed");
        assert!(matches!(init_logger(&cfg), Err(LoggerError::AlreadyInitialized)));
    }
}
