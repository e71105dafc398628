use std::error::Error as StdError;

/// Common error type for `dealsync_core`.
///
/// Backends (HTTP record sources, document stores, lock servers) should keep
/// the underlying error chain via `Error::backend`. Lock contention is not an
/// error; see `crate::lock::LockOutcome`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Missing credential, missing directory entry, malformed config file.
    #[error("configuration error: {0}")]
    Config(String),

    /// Non-success response from the record source. Terminal for the call.
    #[error("remote returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "dealsync.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Convenience: wrap any error into `Backend` with "reqwest" context.
    pub fn backend_reqwest(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend {
            context: "reqwest".into(),
            source: Box::new(source),
        }
    }

    /// Stable short label used in cycle reports and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Unauthorized(_) => "unauthorized",
            Self::Config(_) => "config",
            Self::Remote { .. } => "remote",
            Self::Timeout(_) => "timeout",
            Self::Backend { .. } | Self::BackendMessage(_) => "backend",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
