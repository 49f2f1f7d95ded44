//! Subscriber setup. Logs go to stderr so stdout carries only the summary.

use anyhow::{bail, Context, Result};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => bail!("invalid log format: {s}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Explicit global level. When unset, `RUST_LOG` decides, then `info`.
    pub level: Option<Level>,
    pub format: LogFormat,
    /// Extra directives such as `sqlx=warn`.
    pub filter_directives: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: LogFormat::Text,
            filter_directives: Some("sqlx=warn".to_string()),
        }
    }
}

impl LogConfig {
    /// Reads `LOG_LEVEL`, `LOG_FORMAT` and `LOG_FILTER`; `verbose` forces debug.
    pub fn from_env(verbose: bool) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.level = Some(
                level
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid log level: {level}"))?,
            );
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.format = format.parse()?;
        }
        if let Ok(filter) = std::env::var("LOG_FILTER") {
            config.filter_directives = Some(filter);
        }
        if verbose {
            config.level = Some(Level::DEBUG);
        }
        Ok(config)
    }
}

/// Combines `RUST_LOG` with the configured level and extra directives. An
/// explicit level overrides the global level of `RUST_LOG`, per-target
/// directives of `RUST_LOG` stay in effect.
pub fn build_filter(config: &LogConfig, rust_log: Option<&str>) -> Result<EnvFilter> {
    let mut filter = match rust_log.map(str::trim).filter(|v| !v.is_empty()) {
        Some(spec) => EnvFilter::try_new(spec).with_context(|| format!("parsing RUST_LOG {spec:?}"))?,
        None => EnvFilter::default().add_directive(Level::INFO.into()),
    };
    if let Some(level) = config.level {
        filter = filter.add_directive(level.into());
    }
    if let Some(directives) = &config.filter_directives {
        for directive in directives.split(',').filter(|d| !d.trim().is_empty()) {
            filter = filter.add_directive(
                directive
                    .trim()
                    .parse()
                    .with_context(|| format!("parsing log filter directive {directive:?}"))?,
            );
        }
    }
    Ok(filter)
}

pub fn init_logging(config: &LogConfig) -> Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(config, rust_log.as_deref())?;

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()?,
    }
    Ok(())
}
