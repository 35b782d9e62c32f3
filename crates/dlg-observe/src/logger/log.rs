use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing_subscriber::{
    Layer, Registry, fmt, fmt::time::OffsetTime, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::logger::{config::LoggerConfig, error::LoggerError, format::LoggerFormat};

type Output = Box<dyn Layer<Registry> + Send + Sync>;

/// Build the output layer for `cfg.format`, filter it by `cfg.level` and install it globally.
pub(crate) fn install(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    if tracing::dispatcher::has_been_set() {
        return Err(LoggerError::AlreadyInitialized);
    }
    let filter = cfg.level.filter()?;
    let output = match cfg.format {
        LoggerFormat::Text => text(cfg),
        LoggerFormat::Json => json(cfg),
        LoggerFormat::Journald => journald()?,
    };

    tracing_subscriber::registry()
        .with(output.with_filter(filter))
        .try_init()
        .map_err(|e| LoggerError::InitializationFailed(e.to_string()))
}

fn text(cfg: &LoggerConfig) -> Output {
    fmt::layer()
        .with_ansi(cfg.use_color)
        .with_target(cfg.with_targets)
        .with_thread_names(cfg.with_thread_names)
        .with_timer(local_rfc3339())
        .boxed()
}

/// One object per line; the innermost span rides along so `task` fields survive.
fn json(cfg: &LoggerConfig) -> Output {
    fmt::layer()
        .json()
        .with_ansi(false)
        .with_target(cfg.with_targets)
        .with_thread_names(cfg.with_thread_names)
        .with_current_span(true)
        .with_span_list(false)
        .with_timer(local_rfc3339())
        .boxed()
}

fn local_rfc3339() -> OffsetTime<Rfc3339> {
    // the local offset is unavailable once other threads exist on some platforms
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetTime::new(offset, Rfc3339)
}

#[cfg(all(target_os = "linux", feature = "journald"))]
fn journald() -> Result<Output, LoggerError> {
    tracing_journald::layer()
        .map(|layer| layer.boxed())
        .map_err(|e| LoggerError::InitializationFailed(format!("journald: {e}")))
}

#[cfg(not(all(target_os = "linux", feature = "journald")))]
fn journald() -> Result<Output, LoggerError> {
    Err(LoggerError::JournaldNotSupported)
}
