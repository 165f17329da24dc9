use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for the pipeline
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error types for the pipeline.
///
/// Only `ValidationFailed`, `Cancelled` and failures touching the output
/// artifact end a run. Everything else is isolated to one file or one
/// endpoint and lands in the run summary as a [`SoftFailure`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported language: {}", .0.display())]
    UnsupportedLanguage(PathBuf),

    #[error("parse error in {}: {message}", file.display())]
    ParseError { file: PathBuf, message: String },

    #[error("framework detection ambiguous: {0}")]
    DetectionAmbiguous(String),

    #[error("malformed model output: {0}")]
    ExtractionMalformed(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(#[from] ServiceError),

    #[error("document validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    #[error("run cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// The soft-failure category this error is recorded under, if it is a
    /// per-item failure rather than a fatal one.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            PipelineError::UnsupportedLanguage(_) => Some(FailureKind::UnsupportedLanguage),
            PipelineError::ParseError { .. } => Some(FailureKind::Parse),
            PipelineError::DetectionAmbiguous(_) => Some(FailureKind::DetectionAmbiguous),
            PipelineError::ExtractionMalformed(_) => Some(FailureKind::ExtractionMalformed),
            PipelineError::ServiceUnavailable(_) => Some(FailureKind::ServiceUnavailable),
            _ => None,
        }
    }
}

/// Failure of a single call to the completion or embedding service.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("service disabled")]
    Disabled,

    #[error("call cancelled")]
    Cancelled,
}

impl ServiceError {
    /// Whether the failure may succeed on retry (rate limiting, timeouts,
    /// 5xx responses and network errors).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::RateLimited(_)
                | ServiceError::Timeout(_)
                | ServiceError::Server { .. }
                | ServiceError::Transport(_)
        )
    }
}

/// Category of a non-fatal failure recorded in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Parse,
    UnsupportedLanguage,
    DetectionAmbiguous,
    ExtractionMalformed,
    ServiceUnavailable,
    Conflict,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Parse => "parse",
            FailureKind::UnsupportedLanguage => "unsupported-language",
            FailureKind::DetectionAmbiguous => "detection-ambiguous",
            FailureKind::ExtractionMalformed => "extraction-malformed",
            FailureKind::ServiceUnavailable => "service-unavailable",
            FailureKind::Conflict => "conflict",
        };
        f.write_str(label)
    }
}

/// One isolated failure: which file or endpoint it concerns, and why.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SoftFailure {
    pub subject: String,
    pub kind: FailureKind,
    pub message: String,
}

impl SoftFailure {
    pub fn new(subject: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            kind,
            message: message.into(),
        }
    }

    /// Build a soft failure from a per-item pipeline error. Fatal errors are
    /// recorded under `ExtractionMalformed` only if they somehow reach here.
    pub fn from_error(subject: impl Into<String>, error: &PipelineError) -> Self {
        let kind = error
            .failure_kind()
            .unwrap_or(FailureKind::ExtractionMalformed);
        Self::new(subject, kind, error.to_string())
    }
}

impl fmt::Display for SoftFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.subject, self.message)
    }
}
