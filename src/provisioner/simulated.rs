//! In-process IaaS provisioner
//!
//! Keeps resources in memory, honours idempotency tokens and lets callers
//! queue faults per task. The binary runs against it and the lifecycle tests
//! use it to script transient and fatal failures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use super::{
    HealthProbe, IaasProvisioner, IdempotencyToken, LoadBalancerRequest, MasterRequest,
    NetworkRequest,
};
use crate::crd::{ResourceHandle, TaskKind};
use crate::Error;

/// Failure to inject into the next call of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a retryable provision error
    Retryable,
    /// Fail with a fatal provision error
    Fatal,
}

struct Resource {
    task: TaskKind,
    cluster_id: String,
    handle: ResourceHandle,
}

/// Simulated provisioner with failure injection
#[derive(Default)]
pub struct SimulatedProvisioner {
    resources: DashMap<IdempotencyToken, Resource>,
    create_faults: DashMap<TaskKind, VecDeque<Fault>>,
    teardown_faults: DashMap<TaskKind, VecDeque<Fault>>,
    calls: DashMap<TaskKind, u32>,
    created: DashMap<TaskKind, u32>,
    torn_down: DashMap<TaskKind, u32>,
    unhealthy_probes: AtomicU32,
    sequence: AtomicU64,
    latency: Duration,
}

impl SimulatedProvisioner {
    /// Provisioner that answers immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `times` create calls of `task`
    pub fn inject(&self, task: TaskKind, fault: Fault, times: usize) {
        self.create_faults
            .entry(task)
            .or_default()
            .extend(std::iter::repeat(fault).take(times));
    }

    /// Fail the next `times` teardown calls of `task`
    pub fn inject_teardown(&self, task: TaskKind, fault: Fault, times: usize) {
        self.teardown_faults
            .entry(task)
            .or_default()
            .extend(std::iter::repeat(fault).take(times));
    }

    /// Report the next `times` health probes as unhealthy
    pub fn fail_health_probes(&self, times: u32) {
        self.unhealthy_probes.store(times, Ordering::SeqCst);
    }

    /// Number of create calls made for `task`, including failed ones
    pub fn calls(&self, task: TaskKind) -> u32 {
        self.calls.get(&task).map(|c| *c).unwrap_or(0)
    }

    /// Number of resources actually created for `task`
    pub fn created(&self, task: TaskKind) -> u32 {
        self.created.get(&task).map(|c| *c).unwrap_or(0)
    }

    /// Number of resources of `task` torn down
    pub fn torn_down(&self, task: TaskKind) -> u32 {
        self.torn_down.get(&task).map(|c| *c).unwrap_or(0)
    }

    /// Number of resources that currently exist
    pub fn live_resources(&self) -> usize {
        self.resources.len()
    }

    /// Number of live resources belonging to a cluster
    pub fn live_resources_of(&self, cluster_id: &str) -> usize {
        self.resources
            .iter()
            .filter(|r| r.cluster_id == cluster_id)
            .count()
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn next_fault(faults: &DashMap<TaskKind, VecDeque<Fault>>, task: TaskKind) -> Option<Fault> {
        faults.get_mut(&task).and_then(|mut queue| queue.pop_front())
    }

    fn fault_error(fault: Fault, cluster_id: &str, task: TaskKind, action: &str) -> Error {
        match fault {
            Fault::Retryable => Error::provision_retryable(
                cluster_id,
                task.name(),
                format!("simulated transient failure during {action}"),
            ),
            Fault::Fatal => Error::provision_fatal(
                cluster_id,
                task.name(),
                format!("simulated fatal failure during {action}"),
            ),
        }
    }

    async fn create(
        &self,
        task: TaskKind,
        token: &IdempotencyToken,
        cluster_id: &str,
        build: impl FnOnce(u64) -> ResourceHandle,
    ) -> Result<ResourceHandle, Error> {
        self.simulate_latency().await;
        *self.calls.entry(task).or_insert(0) += 1;

        if let Some(fault) = Self::next_fault(&self.create_faults, task) {
            return Err(Self::fault_error(fault, cluster_id, task, "create"));
        }

        if let Some(existing) = self.resources.get(token) {
            debug!(token = %token, id = %existing.handle.id, "resource already exists for token");
            return Ok(existing.handle.clone());
        }

        let handle = build(self.sequence.fetch_add(1, Ordering::SeqCst) + 1);
        info!(token = %token, id = %handle.id, "simulated resource created");
        self.resources.insert(
            token.clone(),
            Resource {
                task,
                cluster_id: cluster_id.to_string(),
                handle: handle.clone(),
            },
        );
        *self.created.entry(task).or_insert(0) += 1;
        Ok(handle)
    }
}

#[async_trait]
impl IaasProvisioner for SimulatedProvisioner {
    async fn create_network(&self, request: &NetworkRequest) -> Result<ResourceHandle, Error> {
        let mode = request.mode;
        self.create(
            TaskKind::ReserveContainerNetwork,
            &request.token,
            &request.cluster_id,
            |seq| ResourceHandle::new(format!("net-{mode}-{seq:04}")),
        )
        .await
    }

    async fn create_master(&self, request: &MasterRequest) -> Result<ResourceHandle, Error> {
        let replicas = request.ha.replicas();
        let master_type = request.master_type;
        self.create(
            TaskKind::CreateMasters,
            &request.token,
            &request.cluster_id,
            |seq| ResourceHandle::new(format!("masters-{master_type}-{replicas}x-{seq:04}")),
        )
        .await
    }

    async fn create_load_balancer(
        &self,
        request: &LoadBalancerRequest,
    ) -> Result<ResourceHandle, Error> {
        let cluster_id = request.cluster_id.clone();
        let public = request.exposed_public;
        self.create(
            TaskKind::AttachApiserverLb,
            &request.token,
            &request.cluster_id,
            |seq| {
                let endpoint = if public {
                    format!("https://eip-{seq:04}.cce.example:6443")
                } else {
                    format!("https://{cluster_id}.blb.internal:6443")
                };
                ResourceHandle::new(format!("blb-{seq:04}")).with_endpoint(endpoint)
            },
        )
        .await
    }

    async fn teardown(
        &self,
        token: &IdempotencyToken,
        handle: &ResourceHandle,
    ) -> Result<(), Error> {
        self.simulate_latency().await;

        let Some(task) = self.resources.get(token).map(|r| r.task) else {
            debug!(token = %token, id = %handle.id, "resource already gone");
            return Ok(());
        };

        if let Some(fault) = Self::next_fault(&self.teardown_faults, task) {
            let cluster_id = self
                .resources
                .get(token)
                .map(|r| r.cluster_id.clone())
                .unwrap_or_default();
            return Err(Self::fault_error(fault, &cluster_id, task, "teardown"));
        }

        if self.resources.remove(token).is_some() {
            *self.torn_down.entry(task).or_insert(0) += 1;
            info!(token = %token, id = %handle.id, "simulated resource torn down");
        }
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for SimulatedProvisioner {
    async fn control_plane_healthy(
        &self,
        cluster_id: &str,
        endpoint: Option<String>,
    ) -> Result<bool, Error> {
        let injected_failure = self
            .unhealthy_probes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected_failure {
            return Ok(false);
        }
        let lb_live = self
            .resources
            .iter()
            .any(|r| r.cluster_id == cluster_id && r.task == TaskKind::AttachApiserverLb);
        Ok(lb_live && endpoint.is_some())
    }
}
