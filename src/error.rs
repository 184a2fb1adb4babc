//! Error types for the CCE cluster controller
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the cluster it concerns plus whatever context
//! identifies the failing step (task name, field path, phase).

use thiserror::Error;

use crate::crd::{ClusterPhase, FieldViolation};

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for cluster controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// The spec violates one or more schema invariants
    #[error("validation error for {cluster}: {}", join_violations(.violations))]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Every violation found by the validation pass
        violations: Vec<FieldViolation>,
    },

    /// IaaS provisioning error
    #[error("provision error [{task}] for {cluster}: {message}")]
    Provision {
        /// Name of the cluster being provisioned
        cluster: String,
        /// Provisioning task that failed (e.g. "create-masters")
        task: String,
        /// Description of what failed
        message: String,
        /// Whether the provisioner may succeed if the call is repeated
        retryable: bool,
    },

    /// Request rejected by cluster policy (e.g. delete protection)
    #[error("policy error for {cluster}: {message}")]
    Policy {
        /// Name of the cluster the request targeted
        cluster: String,
        /// Why the request was rejected
        message: String,
    },

    /// The status record was mutated outside the reconciler
    #[error("consistency error for {cluster}: {message}")]
    Consistency {
        /// Name of the cluster whose record is inconsistent
        cluster: String,
        /// What was observed
        message: String,
        /// Phase found in the record, if known
        phase: Option<ClusterPhase>,
    },

    /// Cluster record does not exist
    #[error("cluster {cluster} not found")]
    NotFound {
        /// Name that was looked up
        cluster: String,
    },

    /// Cluster record already exists
    #[error("cluster {cluster} already exists")]
    AlreadyExists {
        /// Name that collided
        cluster: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being processed (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "reconciler", "scheduler")
        context: String,
    },
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a validation error with a single violation
    pub fn validation(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            violations: vec![FieldViolation::new(field, msg)],
        }
    }

    /// Create a validation error from a list of violations
    pub fn invalid_spec(cluster: impl Into<String>, violations: Vec<FieldViolation>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            violations,
        }
    }

    /// Create a transient provisioning error
    pub fn provision_retryable(
        cluster: impl Into<String>,
        task: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provision {
            cluster: cluster.into(),
            task: task.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provisioning error (IaaS rejected the request)
    pub fn provision_fatal(
        cluster: impl Into<String>,
        task: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provision {
            cluster: cluster.into(),
            task: task.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a policy error
    pub fn policy(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Policy {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a consistency error
    pub fn consistency(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Consistency {
            cluster: cluster.into(),
            message: msg.into(),
            phase: None,
        }
    }

    /// Create a consistency error naming the phase found in the record
    pub fn consistency_in_phase(
        cluster: impl Into<String>,
        phase: ClusterPhase,
        msg: impl Into<String>,
    ) -> Self {
        Self::Consistency {
            cluster: cluster.into(),
            message: msg.into(),
            phase: Some(phase),
        }
    }

    /// Create a not-found error
    pub fn not_found(cluster: impl Into<String>) -> Self {
        Self::NotFound {
            cluster: cluster.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(cluster: impl Into<String>) -> Self {
        Self::AlreadyExists {
            cluster: cluster.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, policy and consistency errors need a human to change
    /// something. Provision errors carry their own classification.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Validation { .. } => false,
            Error::Provision { retryable, .. } => *retryable,
            Error::Policy { .. } => false,
            Error::Consistency { .. } => false,
            Error::NotFound { .. } => false,
            Error::AlreadyExists { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Short label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::Provision {
                retryable: true, ..
            } => "retryable_provision",
            Error::Provision {
                retryable: false, ..
            } => "fatal_provision",
            Error::Policy { .. } => "policy",
            Error::Consistency { .. } => "consistency",
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::Serialization { .. } => "serialization",
            Error::Internal { .. } => "internal",
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Provision { cluster, .. } => Some(cluster),
            Error::Policy { cluster, .. } => Some(cluster),
            Error::Consistency { cluster, .. } => Some(cluster),
            Error::NotFound { cluster } => Some(cluster),
            Error::AlreadyExists { cluster } => Some(cluster),
            Error::Serialization { .. } => None,
            Error::Internal { .. } => None,
        }
    }

    /// Field violations carried by a validation error
    pub fn violations(&self) -> &[FieldViolation] {
        match self {
            Error::Validation { violations, .. } => violations,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization_for_kind("json", e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization_for_kind("yaml", e.to_string())
    }
}
