//! In-memory cluster store

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::debug;

use super::{ClusterAdmission, SpecStore, StatusStore};
use crate::crd::{Cluster, ClusterSpec, ClusterStatus};
use crate::{Error, RETRY_ANNOTATION};

/// Cluster records held in a concurrent map
///
/// Backs the binary's local mode and the integration tests. Every method
/// clones, so callers never hold a lock across an await.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, Cluster>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn update<F>(&self, name: &str, mutate: F) -> Result<Cluster, Error>
    where
        F: FnOnce(&mut Cluster) -> Result<(), Error>,
    {
        let mut record = self
            .records
            .get_mut(name)
            .ok_or_else(|| Error::not_found(name))?;
        mutate(record.value_mut())?;
        Ok(record.value().clone())
    }
}

fn bump_generation(cluster: &mut Cluster) {
    let generation = cluster.metadata.generation.unwrap_or(0);
    cluster.metadata.generation = Some(generation + 1);
}

fn bump_retry(cluster: &mut Cluster) {
    let next = cluster.retry_generation().unwrap_or(0) + 1;
    cluster
        .annotations_mut()
        .insert(RETRY_ANNOTATION.to_string(), next.to_string());
}

#[async_trait]
impl SpecStore for MemoryStore {
    async fn get_cluster(&self, name: &str) -> Result<Cluster, Error> {
        self.records
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::not_found(name))
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, Error> {
        let mut clusters: Vec<Cluster> = self.records.iter().map(|r| r.value().clone()).collect();
        clusters.sort_by_key(|c| c.key());
        Ok(clusters)
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn patch_status(
        &self,
        name: &str,
        expected_revision: u64,
        status: &ClusterStatus,
    ) -> Result<Cluster, Error> {
        self.update(name, |cluster| {
            let current = cluster.revision();
            if current != expected_revision {
                return Err(Error::consistency_in_phase(
                    name,
                    cluster.phase(),
                    format!(
                        "status revision is {current}, expected {expected_revision}; \
                         the status was written outside the reconciler"
                    ),
                ));
            }
            let mut next = status.clone();
            next.revision = expected_revision + 1;
            debug!(cluster = %name, revision = next.revision, phase = %next.phase, "status written");
            cluster.status = Some(next);
            Ok(())
        })
    }

    async fn remove_cluster(&self, name: &str) -> Result<(), Error> {
        self.records.remove(name);
        Ok(())
    }
}

#[async_trait]
impl ClusterAdmission for MemoryStore {
    async fn create_cluster(&self, mut cluster: Cluster) -> Result<Cluster, Error> {
        let name = cluster.key();
        match self.records.entry(name.clone()) {
            Entry::Occupied(_) => Err(Error::already_exists(name)),
            Entry::Vacant(slot) => {
                cluster.metadata.generation = Some(1);
                cluster.metadata.creation_timestamp = Some(Time(Utc::now()));
                cluster.metadata.deletion_timestamp = None;
                cluster.status = None;
                slot.insert(cluster.clone());
                Ok(cluster)
            }
        }
    }

    async fn replace_spec(&self, name: &str, spec: ClusterSpec) -> Result<Cluster, Error> {
        self.update(name, |cluster| {
            if cluster.spec != spec {
                cluster.spec = spec;
                bump_generation(cluster);
            }
            Ok(())
        })
    }

    async fn request_deletion(&self, name: &str) -> Result<Cluster, Error> {
        self.update(name, |cluster| {
            if cluster.metadata.deletion_timestamp.is_some() {
                bump_retry(cluster);
            } else {
                cluster.metadata.deletion_timestamp = Some(Time(Utc::now()));
            }
            Ok(())
        })
    }

    async fn request_retry(&self, name: &str) -> Result<Cluster, Error> {
        self.update(name, |cluster| {
            bump_retry(cluster);
            Ok(())
        })
    }

    async fn repair_status(&self, name: &str, status: ClusterStatus) -> Result<Cluster, Error> {
        self.update(name, |cluster| {
            let mut repaired = status;
            repaired.revision = cluster.revision() + 1;
            cluster.status = Some(repaired);
            Ok(())
        })
    }
}
