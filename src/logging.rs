use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Registry, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

pub type LogHandle = reload::Handle<EnvFilter, Registry>;

pub const LOG_FILE: &str = "migro.log";

pub fn init(logs_dir: &Path) -> Result<(WorkerGuard, LogHandle)> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("create logs dir {:?}", logs_dir))?;
    let file_appender = tracing_appender::rolling::never(logs_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let (filter_layer, reload_handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;

    Ok((guard, reload_handle))
}

/// Switches the active filter, e.g. to the `log_level` from the loaded config.
/// `RUST_LOG` wins when it is set.
pub fn set_level(handle: &LogHandle, level: &str) -> Result<()> {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return Ok(());
    }
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level {:?}", level))?;
    handle.reload(filter).context("reload log filter")?;
    Ok(())
}
