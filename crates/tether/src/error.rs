//! Error taxonomy for the bridge core.
//!
//! The variants map onto distinct handling strategies: validation and
//! security errors are rejected before any subprocess runs and never
//! retried; rate limiting retries with backoff inside the turn; an expired
//! session triggers one cleanup-and-restart-fresh cycle; process-level
//! failures surface as turn failure and mark the session dead.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TetherError {
    // -- Validation (rejected synchronously, never retried) --
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),

    #[error("invalid working directory {path:?}: {reason}")]
    InvalidWorkingDirectory { path: PathBuf, reason: String },

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("security violation: {0}")]
    SecurityViolation(String),

    #[error("attachment '{name}' exceeds the {limit} byte limit")]
    AttachmentTooLarge { name: String, limit: u64 },

    #[error("attachment '{name}' is not valid base64: {source}")]
    AttachmentDecode {
        name: String,
        #[source]
        source: base64::DecodeError,
    },

    // -- Session lifecycle --
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("session '{0}' has a turn in flight or a permission decision outstanding")]
    SessionBusy(String),

    #[error("session '{0}' expired on the agent side")]
    SessionExpired(String),

    // -- Process execution --
    #[error("failed to spawn agent process: {0}")]
    ProcessSpawn(#[source] std::io::Error),

    #[error("agent process failed (exit code {code:?}): {stderr}")]
    ProcessFailed { code: Option<i32>, stderr: String },

    #[error("rate limited by the agent: {0}")]
    RateLimited(String),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    // -- Plumbing --
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TetherError {
    /// Validation-class errors are reported as security events when they
    /// indicate an unsafe input rather than a mere mistake.
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::SecurityViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;
