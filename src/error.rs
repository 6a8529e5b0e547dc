//! Domain error types for the shard router
//!
//! Structured thiserror types for navigable diagnostics and compile-time
//! exhaustive handling.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, ShardError>.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Where the router looked for a distribution key value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Payload,
    Filter,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Payload => f.write_str("payload"),
            KeySource::Filter => f.write_str("filter"),
        }
    }
}

/// Errors raised by a single-shard backend
///
/// These come from the underlying data layer and are never reinterpreted
/// by the router; they travel to the caller with their original variant.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Unique or foreign key constraint violated
    #[error("constraint violation on {table}: {detail}")]
    ConstraintViolation { table: String, detail: String },

    /// A record the operation required does not exist
    #[error("record not found in {table}")]
    NotFound { table: String },

    /// Connection to the shard could not be used
    #[error("connection to {shard} failed: {reason}")]
    Connection { shard: String, reason: String },

    /// Backend answered with an outcome that does not fit the operation
    #[error("backend returned {got} for {operation}")]
    UnexpectedOutcome {
        operation: &'static str,
        got: &'static str,
    },

    /// Any other driver failure
    #[error("driver error: {0}")]
    Driver(String),
}

/// Shard router domain errors
///
/// Every variant carries structured context fields for diagnostics.
///
/// Example log output:
/// ```text
/// ShardError::MissingDistributionValue { model: "inventory", attempted: Filter }
/// → "model inventory: no distribution key value in filter"
/// ```
#[derive(Error, Debug)]
pub enum ShardError {
    /// A mutation needs exactly one shard but no key value was resolvable
    #[error("model {model}: no distribution key value in {attempted}")]
    MissingDistributionValue { model: String, attempted: KeySource },

    /// Topology constructed (or routed against) with zero shards
    #[error("model {model}: shard topology is empty")]
    EmptyTopology { model: String },

    /// First failure among the shard calls of a fan-out
    #[error("model {model}: {operation} failed on shard {shard}")]
    AggregateFailure {
        model: String,
        operation: &'static str,
        shard: usize,
        #[source]
        source: Box<ShardError>,
    },

    /// Pass-through error from a single shard's data layer
    #[error("shard {shard}: {source}")]
    Backend {
        shard: usize,
        #[source]
        source: BackendError,
    },

    /// Update would move rows to a different shard than the one holding them
    #[error("model {model}: updating distribution key {key} is not allowed")]
    DistributionKeyUpdate { model: String, key: String },

    /// Caller cancelled while the shard call was outstanding
    #[error("shard {shard}: call cancelled")]
    Cancelled { shard: usize },

    /// Shard call exceeded the configured per-shard deadline
    #[error("shard {shard}: call exceeded {timeout:?}")]
    Timeout { shard: usize, timeout: Duration },

    /// Model was never registered
    #[error("unknown model {0}")]
    UnknownModel(String),

    /// Model is registered but its shard group was never connected
    #[error("model {0} is not bound to any shards")]
    ModelNotBound(String),

    /// Declaration references a shard group that does not exist
    #[error("model {model} references unknown shard group {group}")]
    UnknownShardGroup { model: String, group: String },

    /// Configuration error (file or environment value missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),
}

impl ShardError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `shard_router_errors_total`.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::MissingDistributionValue { .. } => "missing_distribution_value",
            Self::EmptyTopology { .. } => "empty_topology",
            Self::AggregateFailure { .. } => "aggregate_failure",
            Self::Backend { .. } => "backend",
            Self::DistributionKeyUpdate { .. } => "distribution_key_update",
            Self::Cancelled { .. } => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::UnknownModel(_) => "unknown_model",
            Self::ModelNotBound(_) => "model_not_bound",
            Self::UnknownShardGroup { .. } => "unknown_shard_group",
            Self::Config(_) => "config",
        }
    }

    /// Unwraps fan-out wrappers down to the error the failing shard raised.
    pub fn root_cause(&self) -> &ShardError {
        match self {
            Self::AggregateFailure { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// The pass-through backend error, if this failure came from a shard's data layer.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self.root_cause() {
            Self::Backend { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Index of the shard that failed, when one is known.
    pub fn failed_shard(&self) -> Option<usize> {
        match self {
            Self::AggregateFailure { shard, .. }
            | Self::Backend { shard, .. }
            | Self::Cancelled { shard }
            | Self::Timeout { shard, .. } => Some(*shard),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_err() -> BackendError {
        BackendError::ConstraintViolation {
            table: "inventory".to_string(),
            detail: "duplicate id 7".to_string(),
        }
    }

    #[test]
    fn every_variant_has_distinct_error_type_label() {
        let labels = [
            ShardError::MissingDistributionValue {
                model: "m".to_string(),
                attempted: KeySource::Payload,
            }
            .error_type_label(),
            ShardError::EmptyTopology { model: "m".to_string() }.error_type_label(),
            ShardError::AggregateFailure {
                model: "m".to_string(),
                operation: "count",
                shard: 0,
                source: Box::new(ShardError::Cancelled { shard: 0 }),
            }
            .error_type_label(),
            ShardError::Backend { shard: 0, source: backend_err() }.error_type_label(),
            ShardError::DistributionKeyUpdate {
                model: "m".to_string(),
                key: "k".to_string(),
            }
            .error_type_label(),
            ShardError::Cancelled { shard: 0 }.error_type_label(),
            ShardError::Timeout { shard: 0, timeout: Duration::from_millis(5) }
                .error_type_label(),
            ShardError::UnknownModel("m".to_string()).error_type_label(),
            ShardError::ModelNotBound("m".to_string()).error_type_label(),
            ShardError::UnknownShardGroup {
                model: "m".to_string(),
                group: "g".to_string(),
            }
            .error_type_label(),
            ShardError::Config("test".to_string()).error_type_label(),
        ];

        let mut unique = labels.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(labels.len(), unique.len(), "Duplicate error_type_label found");
    }

    #[test]
    fn missing_value_message_names_model_and_source() {
        let err = ShardError::MissingDistributionValue {
            model: "inventory".to_string(),
            attempted: KeySource::Filter,
        };
        assert_eq!(
            err.to_string(),
            "model inventory: no distribution key value in filter"
        );
    }

    #[test]
    fn aggregate_failure_keeps_shard_and_root_cause() {
        let err = ShardError::AggregateFailure {
            model: "inventory".to_string(),
            operation: "find_all",
            shard: 2,
            source: Box::new(ShardError::Backend { shard: 2, source: backend_err() }),
        };

        assert_eq!(err.failed_shard(), Some(2));
        assert!(err.to_string().contains("shard 2"));
        assert_eq!(err.backend_error(), Some(&backend_err()));
        assert!(matches!(err.root_cause(), ShardError::Backend { shard: 2, .. }));
    }

    #[test]
    fn config_error_preserves_message() {
        let err = ShardError::Config("groups must not be empty".to_string());
        assert_eq!(err.to_string(), "configuration error: groups must not be empty");
        assert!(err.backend_error().is_none());
    }
}
