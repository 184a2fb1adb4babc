//! Validated entry point for mutating requests
//!
//! Validation and policy errors are returned to the caller synchronously and
//! nothing is written. Accepted requests change the spec or an intent marker
//! and enqueue the record; the reconciler picks it up from there.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::controller::Scheduler;
use crate::crd::{
    validate_spec, validate_submission, validate_update, Cluster, ClusterPhase, ClusterSpec,
    PhaseTransition,
};
use crate::metrics;
use crate::store::{ClusterAdmission, SpecStore};
use crate::{Error, Result};

/// Validate a new spec and fill in its defaults
///
/// Returns the snapshot [`ClusterService::submit`] would store. The
/// defaulted spec is validated again, since defaults can combine with user
/// fields into something invalid.
pub fn prepare_submission(name: &str, mut spec: ClusterSpec) -> Result<ClusterSpec> {
    validate_submission(name, &spec)?;
    spec.apply_defaults();
    validate_spec(name, &spec)?;
    Ok(spec)
}

/// Fronts submit, update, delete, retry and repair requests
pub struct ClusterService {
    specs: Arc<dyn SpecStore>,
    admission: Arc<dyn ClusterAdmission>,
    scheduler: Option<Scheduler>,
}

impl ClusterService {
    /// Create a service that only writes to the store
    ///
    /// Without a scheduler, records are picked up by the next resync.
    pub fn new(specs: Arc<dyn SpecStore>, admission: Arc<dyn ClusterAdmission>) -> Self {
        Self {
            specs,
            admission,
            scheduler: None,
        }
    }

    /// Enqueue every accepted request on `scheduler`
    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Accept a new cluster
    ///
    /// The stored spec is the defaulted snapshot that provisioning plans are
    /// derived from.
    #[instrument(skip(self, spec), fields(cluster = %name))]
    pub async fn submit(&self, name: &str, spec: ClusterSpec) -> Result<Cluster> {
        let spec = prepare_submission(name, spec)?;

        let created = self.admission.create_cluster(Cluster::new(name, spec)).await?;
        info!("cluster accepted");
        self.enqueue(name);
        Ok(created)
    }

    /// Replace the spec of an existing cluster
    ///
    /// Only modifiable fields may differ from the stored spec.
    #[instrument(skip(self, spec), fields(cluster = %name))]
    pub async fn update(&self, name: &str, mut spec: ClusterSpec) -> Result<Cluster> {
        let current = self.specs.get_cluster(name).await?;
        spec.apply_defaults();
        validate_update(name, &current.spec, &spec, current.cluster_id())?;
        validate_spec(name, &spec)?;

        let updated = self.admission.replace_spec(name, spec).await?;
        self.enqueue(name);
        Ok(updated)
    }

    /// Request deletion
    ///
    /// Rejected with [`Error::Policy`] while delete protection is on.
    #[instrument(skip(self), fields(cluster = %name))]
    pub async fn delete(&self, name: &str) -> Result<Cluster> {
        let current = self.specs.get_cluster(name).await?;
        if current.spec.forbid_delete {
            warn!("delete rejected, delete protection is on");
            return Err(Error::policy(
                name,
                "forbidDelete is set; disable delete protection first",
            ));
        }

        let updated = self.admission.request_deletion(name).await?;
        info!(phase = %current.phase(), "deletion requested");
        self.enqueue(name);
        Ok(updated)
    }

    /// Retry a failed phase
    ///
    /// Only meaningful in create_failed or delete_failed; elsewhere the
    /// request is refused so the retry counter is not bumped for nothing.
    #[instrument(skip(self), fields(cluster = %name))]
    pub async fn retry(&self, name: &str) -> Result<Cluster> {
        let current = self.specs.get_cluster(name).await?;
        if !current.phase().is_failed() {
            return Err(Error::policy(
                name,
                format!("retry is only allowed in a failed phase, not {}", current.phase()),
            ));
        }

        let updated = self.admission.request_retry(name).await?;
        info!(phase = %current.phase(), "operator retry requested");
        self.enqueue(name);
        Ok(updated)
    }

    /// Clear a consistency error by declaring the phase the record is in
    ///
    /// Checkpoints and conditions are kept; the last transition is rewritten
    /// so it agrees with `phase` again.
    #[instrument(skip(self), fields(cluster = %name))]
    pub async fn repair(&self, name: &str, phase: ClusterPhase) -> Result<Cluster> {
        let current = self.specs.get_cluster(name).await?;
        let mut status = current.status.clone().unwrap_or_default();
        let from = status
            .last_transition
            .as_ref()
            .map(|t| t.to)
            .unwrap_or(status.phase);

        status.phase = phase;
        status.message = Some(format!("repaired by operator, phase set to {phase}"));
        status.last_transition = Some(PhaseTransition {
            from,
            to: phase,
            at: Utc::now(),
        });

        let repaired = self.admission.repair_status(name, status).await?;
        warn!(%from, to = %phase, "status repaired");
        self.enqueue(name);
        Ok(repaired)
    }

    /// Refresh the clusters-per-phase gauge from the store
    pub async fn record_phase_counts(&self) -> Result<()> {
        let clusters = self.specs.list_clusters().await?;
        for phase in ClusterPhase::ALL {
            let count = clusters.iter().filter(|c| c.phase() == phase).count();
            metrics::set_cluster_phase_count(phase, count as i64);
        }
        Ok(())
    }

    fn enqueue(&self, name: &str) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.enqueue(name);
        }
    }
}
