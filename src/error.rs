//! Error types for rillet.
//!
//! All failures within the engine are represented by [`RilletError`] and
//! propagated via `Result<T, RilletError>`. Planning errors carry enough
//! context to be surfaced to the caller that registered the query; runtime
//! errors inside operators are fatal and unwind the scheduler.
//!
//! Queue-full and empty-input conditions are normal control signals — they
//! are communicated through `bool` / `Option` returns and never appear here.
//!
//! # Error Classification
//!
//! Errors are classified into four classes used by front-ends and logging:
//! - **User** — bad registrations or malformed plans submitted by a client.
//! - **Plan** — the plan is internally inconsistent (typing, wiring).
//! - **Runtime** — resource exhaustion or a collaborator connection failing.
//! - **Internal** — bugs.

use std::fmt;

/// Primary error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum RilletError {
    // ── User errors — bad input from the client ──────────────────────────
    /// A query or schema string could not be parsed by the front-end.
    #[error("parse error: {0}")]
    ParseError(String),

    /// A table with this name is already registered.
    #[error("duplicate table: {0}")]
    DuplicateTable(String),

    /// Two attributes of one table share a name.
    #[error("duplicate attribute: {0}")]
    DuplicateAttr(String),

    /// The named table is not registered.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A variable in the query does not resolve to any table.
    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    /// An attribute name resolves to more than one table.
    #[error("ambiguous attribute: {0}")]
    AmbiguousAttr(String),

    /// The named attribute does not exist on the referenced table.
    #[error("unknown attribute: {0}")]
    UnknownAttr(String),

    /// A table name resolves to more than one registration.
    #[error("ambiguous table: {0}")]
    AmbiguousTable(String),

    /// A window operator was applied to a relation-valued input.
    #[error("window over relation: {0}")]
    WindowOverRelation(String),

    /// A method was called in the wrong server state.
    #[error("invalid use: {0}")]
    InvalidUse(String),

    /// An invalid parameter value (configuration or API argument).
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    // ── Plan errors — inconsistent physical plan ─────────────────────────
    /// Expression or operator typing is inconsistent.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Operator input/output schemas do not line up.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    // ── Runtime errors ───────────────────────────────────────────────────
    /// The page pool is exhausted.
    #[error("out of memory: page pool exhausted")]
    OutOfMemory,

    /// A table source or query output terminated the connection.
    #[error("connection ended: {0}")]
    ConnectionEnded(String),

    // ── Internal errors — should not happen ──────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    InternalError(String),
}

/// Classification of an error for logging and front-end handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    User,
    Plan,
    Runtime,
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::User => write!(f, "USER"),
            ErrorClass::Plan => write!(f, "PLAN"),
            ErrorClass::Runtime => write!(f, "RUNTIME"),
            ErrorClass::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl RilletError {
    /// Classify the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            RilletError::ParseError(_)
            | RilletError::DuplicateTable(_)
            | RilletError::DuplicateAttr(_)
            | RilletError::UnknownTable(_)
            | RilletError::UnknownVariable(_)
            | RilletError::AmbiguousAttr(_)
            | RilletError::UnknownAttr(_)
            | RilletError::AmbiguousTable(_)
            | RilletError::WindowOverRelation(_)
            | RilletError::InvalidUse(_)
            | RilletError::InvalidParam(_) => ErrorClass::User,

            RilletError::TypeMismatch(_) | RilletError::SchemaMismatch(_) => ErrorClass::Plan,

            RilletError::OutOfMemory | RilletError::ConnectionEnded(_) => ErrorClass::Runtime,

            RilletError::InternalError(_) => ErrorClass::Internal,
        }
    }

    /// Whether this error is attributable to the registering client.
    ///
    /// User and plan errors are reported back on the registration call;
    /// runtime and internal errors terminate execution.
    pub fn is_registration_error(&self) -> bool {
        matches!(self.class(), ErrorClass::User | ErrorClass::Plan)
    }

    /// Whether this error terminates the scheduler when raised from an
    /// operator's `run`.
    pub fn is_fatal_at_runtime(&self) -> bool {
        matches!(self.class(), ErrorClass::Runtime | ErrorClass::Internal)
    }
}
