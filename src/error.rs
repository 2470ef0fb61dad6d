//! Consumer error abstractions.

use thiserror::Error;

/// Consumer error variants.
///
/// Configuration errors (`InvalidFilterExpression`, `InvalidArgument` & `IllegalState`) are
/// always surfaced synchronously at the call site. Transport errors are recovered locally by the
/// pull loops and offset committer, and only surface from direct calls into a collaborator.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The given subscription expression could not be compiled.
    #[error("invalid filter expression {expression:?}: {reason}")]
    InvalidFilterExpression { expression: String, reason: String },
    /// The given argument was invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The requested operation is not valid in the consumer's current state.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// An error from the transport or offset persistence layer.
    #[error("transport error: {0}")]
    Transport(anyhow::Error),
}

impl ConsumerError {
    /// Build a new `InvalidFilterExpression` error.
    pub(crate) fn invalid_filter(expression: &str, reason: impl ToString) -> Self {
        Self::InvalidFilterExpression {
            expression: expression.to_string(),
            reason: reason.to_string(),
        }
    }

    /// A bool indicating if this error is a configuration error, which is fatal at the call site.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::InvalidFilterExpression { .. } | Self::InvalidArgument(_) | Self::IllegalState(_))
    }
}

/// A result type where the error is a `ConsumerError`.
pub type Result<T> = ::std::result::Result<T, ConsumerError>;
