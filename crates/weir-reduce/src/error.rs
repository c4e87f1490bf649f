//! Error types for the reducer domain.
//!
//! Two error families matter here and must never be confused:
//!
//! - **Non-retryable rejections**: a member event with no derivable reduction
//!   key ([`Error::MissingCorrelation`]) can never succeed; the transport must
//!   drop it rather than redeliver.
//! - **Transient failures**: storage and emission errors are surfaced so the
//!   at-least-once transport redelivers; every reducer operation is idempotent
//!   under that retry.
//!
//! Lost CAS races are *not* errors of either kind — they are ordinary values
//! ([`crate::store::TransitionOutcome::Lost`]) and never appear in this enum.

use weir_core::{EventId, ReductionKey};

/// The result type used throughout weir-reduce.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in reducer operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The event carries no chain identifier, so no reduction key can be
    /// derived. Non-retryable: redelivery cannot fix a missing field.
    #[error("missing correlation: event {event_id} has no chain id")]
    MissingCorrelation {
        /// The offending event.
        event_id: EventId,
    },

    /// An invalid aggregation state transition was attempted.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// The current status.
        from: String,
        /// The attempted target status.
        to: String,
    },

    /// A conditional strategy names a predicate that is not registered.
    #[error("unknown predicate: {name}")]
    UnknownPredicate {
        /// The predicate name from the strategy configuration.
        name: String,
    },

    /// Probing for an open generation of a reduction key gave up.
    #[error("no open generation found for key {key} within probe limit")]
    GenerationsExhausted {
        /// The reduction key being probed.
        key: ReductionKey,
    },

    /// The output channel rejected the composite event. Retryable: emission
    /// is idempotent under the deduplication token.
    #[error("emission failed: {message}")]
    Emission {
        /// Description of the emission failure.
        message: String,
    },

    /// The reducer configuration is invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A storage operation failed. Retryable via transport redelivery.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from weir-core.
    #[error("core error: {0}")]
    Core(#[from] weir_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new emission error.
    #[must_use]
    pub fn emission(message: impl Into<String>) -> Self {
        Self::Emission {
            message: message.into(),
        }
    }

    /// Returns true if redelivering the triggering event cannot succeed.
    ///
    /// The transport uses this to decide between dropping an event (with an
    /// error log) and reporting it as a batch item failure for redelivery.
    #[must_use]
    pub const fn is_non_retryable(&self) -> bool {
        matches!(
            self,
            Self::MissingCorrelation { .. } | Self::Configuration { .. }
        )
    }
}
