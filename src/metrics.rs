//! Metrics registry for controller observability
//!
//! Provides OpenTelemetry metrics for:
//! - Reconciles (duration, errors by kind)
//! - Phase transitions and clusters by phase
//! - Provisioning task attempts by outcome
//!
//! Instruments record against the global meter provider. Without an exporter
//! installed they are no-ops.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::crd::{ClusterPhase, TaskKind};
use crate::orchestrator::TaskOutcome;

/// Global meter for controller metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("cce_controller"));

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Histogram of reconcile duration
///
/// Labels:
/// - `phase`: phase the reconcile started in
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("cce_cluster_reconcile_duration_seconds")
        .with_description("Duration of cluster reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconcile errors
///
/// Labels:
/// - `kind`: validation, retryable_provision, fatal_provision, policy, consistency, ...
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cce_cluster_reconcile_errors_total")
        .with_description("Total number of cluster reconciliation errors")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Lifecycle Metrics
// ============================================================================

/// Counter of persisted phase transitions
///
/// Labels:
/// - `from`, `to`: phase names
pub static PHASE_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cce_cluster_phase_transitions_total")
        .with_description("Total number of persisted cluster phase transitions")
        .with_unit("{transitions}")
        .build()
});

/// Gauge tracking clusters by phase
///
/// Labels:
/// - `phase`: phase name
pub static CLUSTERS_TOTAL: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("cce_clusters_total")
        .with_description("Number of clusters by phase")
        .with_unit("{clusters}")
        .build()
});

// ============================================================================
// Provisioning Metrics
// ============================================================================

/// Counter of provisioner calls
///
/// Labels:
/// - `task`: task name
/// - `result`: completed, retryable_error, fatal_error
pub static TASK_ATTEMPTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("cce_provision_task_attempts_total")
        .with_description("Total number of provisioning task attempts")
        .with_unit("{attempts}")
        .build()
});

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a cluster reconcile with timing
pub struct ReconcileTimer {
    phase: ClusterPhase,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconcile of a cluster in `phase`
    pub fn start(phase: ClusterPhase) -> Self {
        Self {
            phase,
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("phase", self.phase.as_str()),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    pub fn error(self, kind: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("phase", self.phase.as_str()),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(1, &[KeyValue::new("kind", kind)]);
    }
}

/// Label value of a task outcome
pub fn outcome_label(outcome: &TaskOutcome) -> &'static str {
    match outcome {
        TaskOutcome::Completed(_) => "completed",
        TaskOutcome::RetryableError(_) => "retryable_error",
        TaskOutcome::FatalError(_) => "fatal_error",
    }
}

/// Record one provisioner call
pub fn record_task_attempt(task: TaskKind, outcome: &TaskOutcome) {
    TASK_ATTEMPTS.add(
        1,
        &[
            KeyValue::new("task", task.name()),
            KeyValue::new("result", outcome_label(outcome)),
        ],
    );
}

/// Record a persisted phase transition
pub fn record_phase_transition(from: ClusterPhase, to: ClusterPhase) {
    PHASE_TRANSITIONS.add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

/// Update the clusters-by-phase gauge
pub fn set_cluster_phase_count(phase: ClusterPhase, count: i64) {
    CLUSTERS_TOTAL.record(count, &[KeyValue::new("phase", phase.as_str())]);
}
