//! Structured error types for controlflow.
//!
//! `FlowError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//!
//! # The Error Boundary Rule
//!
//! > **Transient sub-stream failures never reach the consumer of a
//! > [`ResumableSource`](crate::ResumableSource).**
//!
//! - `anyhow` is internal transport (ergonomic for resumption functions)
//! - `FlowError::RestartBudgetExhausted` is the only externalized stream failure,
//!   and it carries the triggering cause
//! - Cancellation is not an error: a cancelled source simply ends
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use controlflow::FlowError;
//!
//! while let Some(item) = source.next().await {
//!     match item {
//!         Ok(element) => handle(element),
//!         Err(FlowError::RestartBudgetExhausted { restarts, source }) => {
//!             eprintln!("gave up after {} restarts: {:#}", restarts, source);
//!         }
//!         Err(other) => eprintln!("unexpected: {}", other),
//!     }
//! }
//! ```

use thiserror::Error;

/// Structured error type for controlflow operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A construction parameter was rejected.
    ///
    /// Always raised synchronously by a constructor or builder, before any
    /// resumption attempt or routing happens.
    #[error("invalid configuration for `{field}`: {reason}")]
    InvalidConfig {
        /// The offending parameter.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// More sub-streams failed than the restart budget tolerates.
    ///
    /// Terminal: the source yields this once and then ends.
    #[error("restart budget exhausted after {restarts} restarts")]
    RestartBudgetExhausted {
        /// Lifetime restart count when the budget ran out.
        restarts: u32,
        /// The failure that exceeded the budget.
        #[source]
        source: anyhow::Error,
    },

    /// A logical path already has a destination in the directory.
    #[error("destination already registered at path: {path}")]
    DestinationAlreadyRegistered {
        /// The contested path.
        path: String,
    },
}

impl FlowError {
    /// Shorthand for [`FlowError::InvalidConfig`].
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        FlowError::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }

    /// Returns true if this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, FlowError::InvalidConfig { .. })
    }

    /// Returns true if this is the terminal failure of a resumable source.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, FlowError::RestartBudgetExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_invalid_config_display() {
        let err = FlowError::invalid("look_behind", "must not be negative, got -1");
        assert_eq!(
            err.to_string(),
            "invalid configuration for `look_behind`: must not be negative, got -1"
        );
        assert!(err.is_config());
        assert!(!err.is_exhausted());
    }

    #[test]
    fn test_exhausted_carries_cause() {
        let err = FlowError::RestartBudgetExhausted {
            restarts: 3,
            source: anyhow::anyhow!("connection reset"),
        };

        assert!(err.is_exhausted());
        assert_eq!(err.to_string(), "restart budget exhausted after 3 restarts");
        let cause = err.source().expect("cause should be attached");
        assert_eq!(cause.to_string(), "connection reset");
    }

    #[test]
    fn test_duplicate_destination_display() {
        let err = FlowError::DestinationAlreadyRegistered {
            path: "/user/dispatcher".into(),
        };
        assert!(err.to_string().contains("/user/dispatcher"));
    }
}
