use std::{fmt, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error category for taxonomic classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// A queryable could not be constructed for a runtime element type
    Construction,
    /// A terminal operation failed after it started running
    Execution,
    /// Errors raised by the database driver
    Database,
    /// Errors while turning records into typed values
    Serialization,
    /// Expressions a backend cannot evaluate or that break tree invariants
    Expression,
    /// The caller cancelled the operation
    Cancellation,
    /// Errors related to configuration
    Configuration,
    /// Errors that don't fit into other categories
    Other,
}

/// The phase of a terminal operation in which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionPhase {
    /// Opening the ephemeral context
    Acquire,
    /// Swapping the placeholder for the native source
    Rewrite,
    /// Running the rewritten expression on the native engine
    Delegate,
    /// Pulling rows out of a lazy enumeration
    Enumerate,
    /// Decoding a record into the element type
    Materialize,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Acquire => "acquiring the query context",
            Self::Rewrite => "binding the query to its source",
            Self::Delegate => "executing on the native provider",
            Self::Enumerate => "enumerating results",
            Self::Materialize => "materializing results",
        };
        f.write_str(phase)
    }
}

/// Standardized query error type
///
/// Every failure surfaced by a queryable or provider is either a
/// [`QueryError::Construction`] or a [`QueryError::Execution`] wrapping the
/// original cause; the remaining variants only ever appear as that cause.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Failed to construct a queryable for element type `{element_type}`: {source}")]
    Construction {
        element_type: String,
        #[source]
        source: Box<QueryError>,
    },
    #[error("Query execution failed while {phase}: {source}")]
    Execution {
        phase: ExecutionPhase,
        #[source]
        source: Box<QueryError>,
    },

    // Underlying causes
    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),
    #[error("Invalid JSON payload: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Element type `{0}` is not registered for untyped query construction")]
    UnregisteredElementType(String),
    #[error("Expression does not produce a sequence: {0}")]
    NotASequence(String),
    #[error("Expected exactly one source placeholder in the expression, found {0}")]
    PlaceholderCount(usize),
    #[error("Expression belongs to provider {found}, not {expected}")]
    ForeignExpression { expected: Uuid, found: Uuid },
    #[error("Unsupported expression: {0}")]
    Unsupported(String),
    #[error("Sequence contains no elements")]
    NoElements,
    #[error("Sequence contains more than one element")]
    MoreThanOneElement,
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl QueryError {
    /// Wrap `source` as a construction failure for `element_type`
    pub fn construction(element_type: impl Into<String>, source: QueryError) -> Self {
        Self::Construction {
            element_type: element_type.into(),
            source: Box::new(source),
        }
    }

    /// Wrap `source` as an execution failure in `phase`
    ///
    /// Errors that are already standardized pass through untouched so a
    /// failure is never reported as an execution error twice.
    pub fn execution(phase: ExecutionPhase, source: impl Into<QueryError>) -> Self {
        match source.into() {
            err @ (Self::Execution { .. } | Self::Construction { .. }) => err,
            err => Self::Execution {
                phase,
                source: Box::new(err),
            },
        }
    }

    /// Create a new unsupported expression error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// Create a new configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError(message.into())
    }

    /// The original failure, with standardized wrappers peeled off
    pub fn root_cause(&self) -> &QueryError {
        match self {
            Self::Construction { source, .. } | Self::Execution { source, .. } => source.root_cause(),
            err => err,
        }
    }

    /// The phase an execution error was raised in
    pub fn phase(&self) -> Option<ExecutionPhase> {
        match self {
            Self::Execution { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Check if this error was caused by cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Self::Cancelled)
    }

    /// Get the error category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Construction { .. } => ErrorCategory::Construction,
            Self::Execution { .. } => ErrorCategory::Execution,
            Self::SqlxError(_) | Self::IoError(_) | Self::Timeout(_) => ErrorCategory::Database,
            Self::JsonError(_) => ErrorCategory::Serialization,
            Self::UnregisteredElementType(_)
            | Self::NotASequence(_)
            | Self::PlaceholderCount(_)
            | Self::ForeignExpression { .. }
            | Self::Unsupported(_) => ErrorCategory::Expression,
            Self::Cancelled => ErrorCategory::Cancellation,
            Self::ConfigurationError(_) => ErrorCategory::Configuration,
            _ => ErrorCategory::Other,
        }
    }

    /// Check if this error is retriable
    ///
    /// Nothing inside this crate retries; this only informs callers.
    pub fn is_retriable(&self) -> bool {
        match self.root_cause() {
            Self::SqlxError(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed) => true,
            Self::IoError(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Log this error with structured logging
    pub fn log(&self) {
        tracing::error!(
            category = ?self.category(),
            phase = ?self.phase(),
            cause_category = ?self.root_cause().category(),
            retriable = %self.is_retriable(),
            "{}", self
        );
    }
}

pub type Result<T, E = QueryError> = core::result::Result<T, E>;
