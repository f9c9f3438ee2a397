//! Error type shared by every stage of the render bus.
//!
//! Invariant violations are kept apart from everything else: they indicate a
//! bug in the scheduler or a collaborator and must never be retried.

use std::io::Error as IoError;

use thiserror::Error;

use crate::worker::JobId;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    /// Internal state no longer satisfies a required invariant. Report as a bug.
    #[error("invariant violated ({name}): {detail}")]
    Invariant {
        name: &'static str,
        detail: String,
    },

    /// A job that was already re-dispatched with its rotation hint failed again.
    #[error("render job {job} still needs a rotation hint after retry")]
    RetryExhausted { job: JobId },

    /// The worker transform reported a hard failure.
    #[error("transform error: {0}")]
    Transform(String),

    #[error("seek to {ts_us}us failed: {reason}")]
    Seek { ts_us: i64, reason: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("mux error: {0}")]
    Mux(String),

    #[error("no video stream found in input")]
    NoVideoStream,

    /// The decoder never produced a frame for the requested range.
    #[error("no frames decoded")]
    NoFrames,

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The scheduler actor is gone (shut down or aborted).
    #[error("render scheduler closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] IoError),
}

impl BusError {
    pub fn invariant(name: &'static str, detail: impl Into<String>) -> Self {
        BusError::Invariant {
            name,
            detail: detail.into(),
        }
    }

    /// Fatal errors abort the whole operation; everything else is scoped to a
    /// single job or collaborator call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BusError::Invariant { .. } | BusError::Io(_) | BusError::Closed
        )
    }

    /// Rebuilds an equivalent error for fanning one failure out to many
    /// waiters. `Io` loses its source and keeps only kind and message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            BusError::Invariant { name, detail } => BusError::Invariant {
                name,
                detail: detail.clone(),
            },
            BusError::RetryExhausted { job } => BusError::RetryExhausted { job: *job },
            BusError::Transform(s) => BusError::Transform(s.clone()),
            BusError::Seek { ts_us, reason } => BusError::Seek {
                ts_us: *ts_us,
                reason: reason.clone(),
            },
            BusError::Decode(s) => BusError::Decode(s.clone()),
            BusError::Encode(s) => BusError::Encode(s.clone()),
            BusError::Mux(s) => BusError::Mux(s.clone()),
            BusError::NoVideoStream => BusError::NoVideoStream,
            BusError::NoFrames => BusError::NoFrames,
            BusError::Config(s) => BusError::Config(s.clone()),
            BusError::Closed => BusError::Closed,
            BusError::Cancelled => BusError::Cancelled,
            BusError::Io(e) => BusError::Io(IoError::new(e.kind(), e.to_string())),
        }
    }
}
