//! Spec and status store seams
//!
//! The record of a cluster has two writers. The API layer writes the spec
//! and intent markers through [`ClusterAdmission`]; the reconciler alone
//! writes status through [`StatusStore`], always as a compare-and-swap
//! against the revision it read.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::crd::{Cluster, ClusterSpec, ClusterStatus};
use crate::Error;

/// Read side of the cluster records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpecStore: Send + Sync {
    /// Fetch one record, or [`Error::NotFound`]
    async fn get_cluster(&self, name: &str) -> Result<Cluster, Error>;

    /// Every record, in name order
    async fn list_clusters(&self) -> Result<Vec<Cluster>, Error>;
}

/// Reconciler-owned writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Replace the status if its revision still equals `expected_revision`
    ///
    /// The stored revision becomes `expected_revision + 1`. A mismatch means
    /// someone else wrote the status and yields [`Error::Consistency`].
    async fn patch_status(
        &self,
        name: &str,
        expected_revision: u64,
        status: &ClusterStatus,
    ) -> Result<Cluster, Error>;

    /// Drop the record once the cluster is deleted
    async fn remove_cluster(&self, name: &str) -> Result<(), Error>;
}

/// API-layer writes
///
/// None of these touch the status except [`ClusterAdmission::repair_status`],
/// the operator's way out of a consistency error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterAdmission: Send + Sync {
    /// Create a record at generation 1 with no status
    async fn create_cluster(&self, cluster: Cluster) -> Result<Cluster, Error>;

    /// Replace the spec, bumping the generation when it changed
    async fn replace_spec(&self, name: &str, spec: ClusterSpec) -> Result<Cluster, Error>;

    /// Mark the record for deletion
    ///
    /// Re-requesting deletion of a record already marked bumps the retry
    /// counter, which re-arms a failed teardown.
    async fn request_deletion(&self, name: &str) -> Result<Cluster, Error>;

    /// Bump the retry counter so a failed phase is retried
    ///
    /// The counter lives in [`RETRY_ANNOTATION`](crate::RETRY_ANNOTATION),
    /// apart from the spec generation.
    async fn request_retry(&self, name: &str) -> Result<Cluster, Error>;

    /// Overwrite the status unconditionally
    async fn repair_status(&self, name: &str, status: ClusterStatus) -> Result<Cluster, Error>;
}
