//! Centralized error types for the chronopipe core library.
//!
//! This module provides a unified error handling system that defines
//! structured error types using `thiserror` and maps them to stable,
//! machine-readable codes suitable for logging and CLI exit reasons.

use thiserror::Error;

use crate::time::Instant;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths (log fields, CLI exit reasons).
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the chronopipe runtime.
#[derive(Debug, Error)]
pub enum ChronopipeError {
    /// An emitter was posted to with a non-increasing originating time.
    #[error("out-of-order emission on emitter {emitter}: new={new:?} last={last:?}")]
    OutOfOrderEmission {
        /// Name of the offending emitter.
        emitter: String,
        /// The rejected originating time.
        new: Instant,
        /// The previously accepted originating time.
        last: Instant,
    },

    /// Operation forbidden in the pipeline's current lifecycle state.
    #[error("operation `{operation}` is not valid in state `{state}`")]
    InactiveState {
        /// The operation that was attempted.
        operation: String,
        /// The current pipeline/element state.
        state: String,
    },

    /// A `lossless_or_throw` receiver could not enqueue a message.
    #[error("delivery overflow on receiver {receiver}")]
    DeliveryOverflow {
        /// Name of the receiver that overflowed.
        receiver: String,
    },

    /// Stream type incompatible with requested deserialization type.
    #[error("receiver type mismatch for stream {stream}: expected {expected}, found {found}")]
    ReceiverTypeMismatch {
        /// Stream name.
        stream: String,
        /// Type name the reader requested.
        expected: String,
        /// Type name recorded in the catalog.
        found: String,
    },

    /// Catalog extent contains a record that could not be parsed.
    #[error("catalog corrupt: {0}")]
    CatalogCorrupt(String),

    /// Page-index extent contains a malformed record.
    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    /// The named store does not exist at the given path.
    #[error("store not found: {0}")]
    StoreNotFound(String),

    /// A referenced extent file is missing from disk.
    #[error("extent missing: {0}")]
    ExtentMissing(String),

    /// The type schema recorded in the catalog is incompatible with the
    /// reader's view of the type.
    #[error("serialization mismatch for type {0}")]
    SerializationMismatch(String),

    /// A live-follow read found the writer's marker gone before producing
    /// more data.
    #[error("writer gone for store {0}")]
    WriterGone(String),

    /// Interpolator construction rejected (e.g. unbounded-left `first`).
    #[error("invalid interpolator configuration: {0}")]
    InvalidInterpolator(String),

    /// Wrapped filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped configuration deserialization error.
    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),

    /// One or more unhandled component errors were aggregated at pipeline
    /// completion.
    #[error("{} unhandled error(s) during pipeline run", .0.len())]
    Aggregated(Vec<String>),
}

impl ErrorCode for ChronopipeError {
    fn code(&self) -> &'static str {
        match self {
            Self::OutOfOrderEmission { .. } => "out_of_order_emission",
            Self::InactiveState { .. } => "inactive_state",
            Self::DeliveryOverflow { .. } => "delivery_overflow",
            Self::ReceiverTypeMismatch { .. } => "receiver_type_mismatch",
            Self::CatalogCorrupt(_) => "catalog_corrupt",
            Self::IndexCorrupt(_) => "index_corrupt",
            Self::StoreNotFound(_) => "store_not_found",
            Self::ExtentMissing(_) => "extent_missing",
            Self::SerializationMismatch(_) => "serialization_mismatch",
            Self::WriterGone(_) => "writer_gone",
            Self::InvalidInterpolator(_) => "invalid_interpolator",
            Self::Io(_) => "io_error",
            Self::Config(_) => "config_error",
            Self::Aggregated(_) => "aggregated_errors",
        }
    }
}

/// Convenient Result alias for chronopipe operations.
pub type ChronopipeResult<T> = Result<T, ChronopipeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_emission_has_stable_code() {
        let err = ChronopipeError::OutOfOrderEmission {
            emitter: "e".into(),
            new: Instant::from_ticks(1),
            last: Instant::from_ticks(2),
        };
        assert_eq!(err.code(), "out_of_order_emission");
    }

    #[test]
    fn aggregated_display_counts_errors() {
        let err = ChronopipeError::Aggregated(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "2 unhandled error(s) during pipeline run");
    }
}
