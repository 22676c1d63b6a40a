//! Error taxonomy for the knowledge core.
//!
//! Every public fallible operation returns [`Result`]. Typed domain errors are
//! recovered locally and handed back to the caller — they never panic through
//! the public API. Fence-block rejections are *not* errors (see `fences.rs`);
//! they travel alongside accepted proposals as structured records.

use std::fmt;
use thiserror::Error;

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Input shape or semantic rule violation (field-level message).
    Validation,
    /// Missing by id.
    NotFound,
    /// Underlying storage failure.
    Db,
    /// Filesystem failure.
    Io,
    /// Provider failure (network, rate, shape).
    Llm,
    /// Unrecognized or corrupt data at a trust boundary.
    Parse,
    /// Brainstorm-engine namespaced code.
    Brainstorm(BrainstormErrorCode),
}

/// Codes specific to the brainstorm session engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrainstormErrorCode {
    NoSession,
    IllegalTransition,
    InsufficientIdeas,
    CapReached,
    UnknownTechniqueId,
    DbConstraint,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Db => "DB_ERROR",
            ErrorCode::Io => "IO_ERROR",
            ErrorCode::Llm => "LLM_ERROR",
            ErrorCode::Parse => "PARSE_ERROR",
            ErrorCode::Brainstorm(code) => match code {
                BrainstormErrorCode::NoSession => "BRAINSTORM:NO_SESSION",
                BrainstormErrorCode::IllegalTransition => "BRAINSTORM:ILLEGAL_TRANSITION",
                BrainstormErrorCode::InsufficientIdeas => "BRAINSTORM:INSUFFICIENT_IDEAS",
                BrainstormErrorCode::CapReached => "BRAINSTORM:CAP_REACHED",
                BrainstormErrorCode::UnknownTechniqueId => "BRAINSTORM:UNKNOWN_TECHNIQUE_ID",
                BrainstormErrorCode::DbConstraint => "BRAINSTORM:DB_CONSTRAINT",
            },
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Core error: a code plus a human-readable message.
#[derive(Debug, Clone, Error)]
#[error("[{code}] {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::new(ErrorCode::NotFound, format!("{entity} not found: {id}"))
    }

    pub fn db(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Db, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Io, message)
    }

    pub fn llm(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Llm, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Parse, message)
    }

    pub fn brainstorm(code: BrainstormErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Brainstorm(code), message)
    }

    /// True when the underlying failure was a uniqueness/constraint violation.
    /// Callers with idempotent semantics (advisory fingerprints, brainstorm
    /// unique-active) branch on this instead of string-matching messages.
    pub fn is_constraint(&self) -> bool {
        matches!(self.code, ErrorCode::Db) && self.message.contains("UNIQUE constraint")
            || matches!(self.code, ErrorCode::Brainstorm(BrainstormErrorCode::DbConstraint))
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => {
                CoreError::new(ErrorCode::NotFound, "row not found")
            }
            other => CoreError::db(other.to_string()),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::io(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
