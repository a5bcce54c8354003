use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

pub const LOG_FILE: &str = "janus-signal.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub(crate) log_level: String,
    pub(crate) log_dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>) -> Self {
        Self {
            log_level: log_level.into(),
            log_dir,
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info", None)
    }
}

/// `RUST_LOG` when set, otherwise `level`; HTTP internals stay at warn.
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| level.to_string());
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid log filter `{directives}`"))?
        .add_directive("hyper=warn".parse()?)
        .add_directive("hyper_util=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);
    Ok(filter)
}

/// Install the global subscriber: stdout, plus a daily rolling file when
/// `log_dir` is set. Only the first call installs anything.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let file_layer = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log dir {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE);
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(appender)
                    .with_filter(build_filter(&config.log_level)?),
            )
        }
        None => None,
    };

    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_filter(build_filter(&config.log_level)?);

    if Registry::default()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        debug!("tracing subscriber already installed");
    }
    Ok(())
}
