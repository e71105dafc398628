//! Global tracing subscriber setup.

use crate::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!(
                "DEALSYNC_LOG_FORMAT must be json or pretty, got '{other}'"
            ))),
        }
    }

    pub fn from_env() -> Result<Self> {
        match std::env::var("DEALSYNC_LOG_FORMAT") {
            Ok(v) => Self::parse(&v),
            Err(_) => Ok(Self::default()),
        }
    }
}

/// Install the process-wide subscriber. `RUST_LOG` controls the filter
/// (default `info`). Fails with `Conflict` if a subscriber already exists.
#[tracing::instrument(level = "info", skip_all)]
pub fn init_from_env() -> Result<()> {
    init(LogFormat::from_env()?)
}

pub fn init(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let res = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init(),
    };
    res.map_err(|e| Error::Conflict(format!("tracing already initialized: {e}")))
}
