use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Failure taxonomy for scheduling, export and profiling.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Malformed frame index or range, rejected at registration time.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Filesystem failure while writing a capture.
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Video codec or container failure.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// Profiler or harness misuse (double start, end without start, query before close).
    #[error("invalid state: {0}")]
    State(String),

    /// Bench manifest failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A profiling lookup named an event that was never recorded.
    #[error("no samples recorded for event '{0}'")]
    UnknownEvent(String),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

impl CaptureError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable machine-readable code for the `--json` error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSchedule(_) => "invalid_schedule",
            Self::Io { .. } => "io",
            Self::Encoding(_) => "encoding",
            Self::State(_) => "state",
            Self::Config(_) => "config",
            Self::UnknownEvent(_) => "unknown_event",
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            ok: false,
            error: ErrorEnvelopeBody {
                code: self.code().to_owned(),
                message: self.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: ErrorEnvelopeBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelopeBody {
    pub code: String,
    pub message: String,
}

pub fn find_capture_error(error: &anyhow::Error) -> Option<&CaptureError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<CaptureError>())
}
