//! Error types for job dispatch

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for job operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while dispatching a job or retrieving its result
#[derive(Debug, Error)]
pub enum Error {
    /// Asset root was unusable at construction time
    #[error("asset root {path} is not usable: {reason}")]
    AssetRoot {
        /// The offending root directory
        path: PathBuf,
        /// Why construction was refused
        reason: String,
    },

    /// The listener (or scheduler) rejected a submission
    ///
    /// Carries the rendered script so the failure can be diagnosed
    /// without the asset directory surviving.
    #[error("submission rejected with id {code}")]
    Submission {
        /// Id reported back through the inbox (0 or negative)
        code: i64,
        /// The rendered job script
        script: String,
    },

    /// The result did not appear within the configured timeout
    #[error("job {name} timed out after {limit:?}")]
    Timeout {
        /// Job name
        name: String,
        /// Configured timeout
        limit: Duration,
    },

    /// The job ran remotely and the callable itself failed
    ///
    /// `kind` and `message` are the remote error's type tag and message,
    /// carried across the process boundary through the result blob.
    #[error("job {name} (id {id:?}) failed remotely: {kind}: {message}")]
    JobFailed {
        /// Job name
        name: String,
        /// Backend-assigned id, if submission got that far
        id: Option<i64>,
        /// Remote error type tag
        kind: String,
        /// Remote error message
        message: String,
    },

    /// The wait was aborted through the job's cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// No function registered under the requested key
    #[error("no job function registered under key '{0}'")]
    UnknownJob(String),

    /// The scheduler submit command itself failed or produced unparseable output
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Blob encoding or decoding failed
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A text-encoded blob was malformed
    #[error("decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error originated inside the remote callable
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, Self::JobFailed { .. })
    }
}
