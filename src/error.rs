//! Crate-wide error type.

/// Errors produced by the fabric subscriber.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transient broker failure (publish or queue push). Callers on the
    /// dispatch path log and swallow this; a stuck broker must never block
    /// event ingestion.
    #[error("bus error: {0}")]
    Bus(String),

    /// Controller query failure inside a build phase. Aborts the bootstrap.
    #[error("controller error: {0}")]
    Controller(String),

    /// Document store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Semantic mismatch discovered during validation (unsupported version,
    /// missing role). The fabric is marked `auto_start = false` and the
    /// subscriber terminates.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A build phase failed; carries the user-visible reason recorded as a
    /// fabric event.
    #[error("build phase failed: {0}")]
    BuildPhase(String),

    /// The subscription layer died. Unwinds the main loop cleanly.
    #[error("subscriber exit: {0}")]
    SubscriberExit(String),

    /// Malformed event or controller object. Logged and skipped at the
    /// call site, never fatal on the steady-state path.
    #[error("schema violation: {0}")]
    Schema(String),

    /// Wire codec failure.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
