//! Error types for research-core.
//!
//! Every error carries a [`kind()`](Error::kind) used by the step executor's
//! retry policy: `Transient`, `RateLimited` and `Timeout` are retried with
//! backoff; `Config`, `Input` and `Permanent` are not.

use thiserror::Error;

/// Result type alias using research-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used to decide whether an error is retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed strategy/params, missing required variable, unresolved template reference.
    Config,
    /// Invalid request from the caller.
    Input,
    /// Network blip, 5xx, or an adapter-signalled retryable failure.
    Transient,
    /// Provider signalled rate limiting (429 or equivalent).
    RateLimited,
    /// Operation exceeded its deadline.
    Timeout,
    /// 4xx other than 429, or adapter misuse. Never retried.
    Permanent,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorKind {
    /// Whether the step executor should retry an error of this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Input => "input",
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Permanent => "permanent",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during research-agent operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed strategy, missing required variable, or unresolved template reference.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid request from the caller (e.g. unknown strategy slug, empty topic).
    #[error("invalid input: {0}")]
    Input(String),

    /// Network blip, 5xx, or an adapter-signalled retryable failure.
    #[error("transient error: {0}")]
    Transient(String),

    /// Provider signalled rate limiting.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// 4xx other than 429, or adapter misuse.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Adapter-reported error carrying the adapter key for context.
    #[error("adapter {adapter} error: {message}")]
    Adapter {
        adapter: String,
        message: String,
        kind: AdapterErrorKind,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// The retry-relevant classification carried by [`Error::Adapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    Transient,
    RateLimited,
    Timeout,
    Permanent,
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited(message.into())
    }

    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn adapter(
        adapter: impl Into<String>,
        message: impl Into<String>,
        kind: AdapterErrorKind,
    ) -> Self {
        Self::Adapter {
            adapter: adapter.into(),
            message: message.into(),
            kind,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The retry-classification kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Input(_) => ErrorKind::Input,
            Self::Transient(_) => ErrorKind::Transient,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::Adapter { kind, .. } => match kind {
                AdapterErrorKind::Transient => ErrorKind::Transient,
                AdapterErrorKind::RateLimited => ErrorKind::RateLimited,
                AdapterErrorKind::Timeout => ErrorKind::Timeout,
                AdapterErrorKind::Permanent => ErrorKind::Permanent,
            },
            Self::Serialization(_) => ErrorKind::Internal,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the step executor should retry this error.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
