//! Structured error handling for the engine.
//!
//! The taxonomy distinguishes hard failures (storage, media, configuration)
//! from mode signals (`Degraded`) and from sentinels that mean "this input is
//! an expected no-op" (`SkipEvent`, `NotFound`). Inbound event handling leans
//! on the sentinels heavily to avoid noisy logging of routine skips.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Namespace, key, source or record is absent. Usually handled locally,
    /// not propagated.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate registration (source poller, change channel, subscriber).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The secondary cache is unusable. A mode signal, not a caller failure:
    /// callers fall back to the source of truth and carry on.
    #[error("secondary cache degraded")]
    Degraded,

    /// Bounded wait elapsed (heartbeat pong, underlying I/O).
    #[error("timed out: {0}")]
    Timeout(String),

    /// Propagated cancellation from underlying I/O.
    #[error("canceled: {0}")]
    Canceled(String),

    /// The fan-out stage received a notification on an unmapped channel tag.
    #[error("unrecognized notification channel: {0}")]
    UnrecognizedChannel(String),

    /// Sentinel: silently ignore this input. Never logged as an error.
    #[error("skip event")]
    SkipEvent,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether this error is the distinguished "absent, not broken" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }

    /// Whether this error should be swallowed without logging.
    pub fn is_skip(&self) -> bool {
        matches!(self, EngineError::SkipEvent)
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => EngineError::NotFound("row".to_string()),
            other => EngineError::Storage(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
