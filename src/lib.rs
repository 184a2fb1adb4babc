//! CCE cluster controller - reconciler for managed-Kubernetes cluster lifecycle
//!
//! A cluster is submitted as a desired-state `ClusterSpec`. The controller
//! validates it, assigns a cluster ID, provisions IaaS resources task by task
//! and walks the cluster through its lifecycle phases until it is running, or
//! tears everything down again when deletion is requested.
//!
//! # Architecture
//!
//! - The Spec Store holds one `Cluster` record per cluster; the API layer
//!   writes specs, the reconciler alone writes status.
//! - The reconciler reads a record, decides the single next transition,
//!   executes it against the IaaS provisioner and persists the result.
//! - A keyed scheduler guarantees one reconcile at a time per record while
//!   distinct clusters reconcile in parallel.
//!
//! # Modules
//!
//! - [`crd`] - Cluster resource schema, enums and validation
//! - [`controller`] - Reconciler, phase handlers, transition table, scheduler
//! - [`orchestrator`] - Provisioning plan and checkpointed task execution
//! - [`status`] - Status aggregation and phase-change sinks
//! - [`provisioner`] - IaaS provisioner and health probe seams
//! - [`store`] - Spec/status store seams and the in-memory store
//! - [`service`] - Validated entry point for mutating requests
//! - [`retry`] - Exponential backoff with jitter
//! - [`config`] - Controller configuration
//! - [`telemetry`] - Tracing subscriber setup
//! - [`metrics`] - OpenTelemetry instruments
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod provisioner;
pub mod retry;
pub mod service;
pub mod status;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Platform Constants
// =============================================================================

/// Prefix of every system-assigned cluster ID
pub const CCE_PREFIX: &str = "cce-";

/// Number of random characters following [`CCE_PREFIX`] in a cluster ID
pub const CLUSTER_ID_SUFFIX_LEN: usize = 8;

/// Docker version installed when the spec does not pin one
pub const LATEST_SUPPORTED_DOCKER_VERSION: &str = "18.09.2";

/// containerd version installed when the spec does not pin one
pub const LATEST_SUPPORTED_CONTAINERD_VERSION: &str = "1.6.20";

/// Label carrying the cluster ID on every IaaS resource
pub const CLUSTER_ID_LABEL_KEY: &str = "cluster-id";

/// Label carrying the node role (master or node) on every IaaS resource
pub const CLUSTER_ROLE_LABEL_KEY: &str = "cluster-role";

/// Annotation key marking a record the controller must leave alone
pub const DO_NOT_HANDLE: &str = "not-handler-by-cce";

/// Annotation counting operator retry requests
///
/// Only retry and repeated delete requests bump it; spec edits leave it
/// alone, so a failed phase is never resumed by an ordinary update.
pub const RETRY_ANNOTATION: &str = "cce.baidubce.com/retry-generation";
