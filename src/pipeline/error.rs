//! Closed error taxonomy shared across the pipeline. Kinds are wire
//! names; the typed errors of each adapter are coarsened into these before
//! anything is persisted or surfaced.

use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidPrompt,
    LlmUnavailable,
    LlmMalformed,
    LlmRefused,
    LlmExhausted,
    UnknownVocabulary,
    BannedSymbol,
    Schema,
    Shape,
    TooLarge,
    RenderTimeout,
    RenderFailed,
    NoOutputArtifact,
    UploadFailed,
    DbFailed,
    DeadlineExceeded,
    Cancelled,
    Exhausted,
    Busy,
    Auth,
    NotFound,
    Forbidden,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidPrompt => "invalid_prompt",
            Self::LlmUnavailable => "llm_unavailable",
            Self::LlmMalformed => "llm_malformed",
            Self::LlmRefused => "llm_refused",
            Self::LlmExhausted => "llm_exhausted",
            Self::UnknownVocabulary => "unknown_vocabulary",
            Self::BannedSymbol => "banned_symbol",
            Self::Schema => "schema",
            Self::Shape => "shape",
            Self::TooLarge => "too_large",
            Self::RenderTimeout => "render_timeout",
            Self::RenderFailed => "render_failed",
            Self::NoOutputArtifact => "no_output_artifact",
            Self::UploadFailed => "upload_failed",
            Self::DbFailed => "db_failed",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::Exhausted => "exhausted",
            Self::Busy => "busy",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
        }
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coarsened, user-presentable failure.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
