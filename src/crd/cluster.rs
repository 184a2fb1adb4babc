//! Cluster Custom Resource Definition
//!
//! The Cluster CRD is the persisted record of one CCE cluster: the desired
//! `ClusterSpec` written by the API layer and the `ClusterStatus` owned by
//! the reconciler.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::RETRY_ANNOTATION;

use super::types::{
    AuthenticateMode, AvailableZone, ClusterHa, ClusterPhase, ClusterType, Condition,
    ContainerNetworkMode, IpVersion, K8sVersion, KubeProxyMode, MasterFlavor, MasterType,
    PaymentTiming, RuntimeType,
};

/// Default upper bound of pods scheduled onto one node
pub const DEFAULT_MAX_PODS_PER_NODE: u32 = 128;

/// Default NodePort service range
pub const DEFAULT_NODE_PORT_RANGE: (u16, u16) = (30000, 32767);

/// Desired state of a CCE cluster
///
/// `clusterID` must be empty when a cluster is created; the controller
/// assigns it once and records it in the status.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cce.baidubce.com",
    version = "v2",
    kind = "Cluster",
    plural = "clusters",
    shortname = "cc",
    status = "ClusterStatus",
    namespaced = false,
    printcolumn = r#"{"name":"ClusterID","type":"string","jsonPath":".status.clusterID"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Master","type":"string","jsonPath":".spec.masterConfig.masterType"}"#,
    printcolumn = r#"{"name":"Network","type":"string","jsonPath":".spec.containerNetworkConfig.mode"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// System-assigned identifier; readonly
    #[serde(rename = "clusterID", default, skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,

    /// Display name chosen by the user
    #[serde(default)]
    pub cluster_name: String,

    /// IaaS flavour of the cluster; readonly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_type: Option<ClusterType>,

    /// Free-form description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Kubernetes version
    #[serde(rename = "k8sVersion", default, skip_serializing_if = "Option::is_none")]
    pub k8s_version: Option<K8sVersion>,

    /// Container runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_type: Option<RuntimeType>,

    /// Container runtime version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runtime_version: String,

    /// VPC the cluster lives in; readonly
    #[serde(rename = "vpcID", default)]
    pub vpc_id: String,

    /// VPC UUID, filled in by the system
    #[serde(rename = "vpcUUID", default, skip_serializing_if = "String::is_empty")]
    pub vpc_uuid: String,

    /// VPC IPv4 range, filled in by the system
    #[serde(rename = "vpcCIDR", default, skip_serializing_if = "String::is_empty")]
    pub vpc_cidr: String,

    /// VPC IPv6 range, filled in by the system
    #[serde(rename = "vpcCIDRIPv6", default, skip_serializing_if = "String::is_empty")]
    pub vpc_cidr_ipv6: String,

    /// CCE plugins to install
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<String>,

    /// Helm settings per plugin
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugins_config: BTreeMap<String, PluginHelmConfig>,

    /// Master topology
    #[serde(default)]
    pub master_config: MasterConfig,

    /// Container network
    #[serde(default)]
    pub container_network_config: ContainerNetworkConfig,

    /// Delete protection; when true every delete request is rejected
    #[serde(default)]
    pub forbid_delete: bool,

    /// How IaaS resources are charged
    #[serde(default)]
    pub resource_charging_option: ResourceChargingOption,

    /// Control-plane and kubelet tuning
    #[serde(rename = "k8sCustomConfig", default)]
    pub k8s_custom_config: K8sCustomConfig,

    /// API server authentication mode; readonly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticate_mode: Option<AuthenticateMode>,

    /// Resource tags; readonly
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,

    /// Resource group
    #[serde(rename = "resourceGroupID", default, skip_serializing_if = "String::is_empty")]
    pub resource_group_id: String,
}

impl ClusterSpec {
    /// Kubernetes version, defaulting to the latest supported release
    pub fn k8s_version(&self) -> K8sVersion {
        self.k8s_version.unwrap_or(K8sVersion::LATEST)
    }

    /// Container runtime; docker where the Kubernetes version still ships
    /// dockershim, containerd otherwise
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type.unwrap_or_else(|| {
            if self.k8s_version().supports_docker() {
                RuntimeType::Docker
            } else {
                RuntimeType::Containerd
            }
        })
    }

    /// Fill every field the system defaults when the user leaves it unset
    ///
    /// Applied once when a spec is accepted, so the stored spec is the
    /// normalized snapshot that provisioning plans are derived from.
    pub fn apply_defaults(&mut self) {
        self.k8s_version.get_or_insert(K8sVersion::LATEST);
        let runtime = self.runtime_type();
        self.runtime_type = Some(runtime);
        if self.runtime_version.is_empty() {
            self.runtime_version = runtime.default_version().to_string();
        }
        self.authenticate_mode.get_or_insert_with(Default::default);

        let master = &mut self.master_config;
        if master.master_type == Some(MasterType::Managed) {
            let option = master.managed_cluster_master_option.get_or_insert_with(Default::default);
            option.master_flavor.get_or_insert_with(Default::default);
        }

        let network = &mut self.container_network_config;
        network.mode.get_or_insert_with(Default::default);
        network.ip_version.get_or_insert_with(Default::default);
        network.max_pods_per_node.get_or_insert(DEFAULT_MAX_PODS_PER_NODE);
        network.kube_proxy_mode.get_or_insert_with(Default::default);
        if network.node_port_range_min.is_none() && network.node_port_range_max.is_none() {
            network.node_port_range_min = Some(DEFAULT_NODE_PORT_RANGE.0);
            network.node_port_range_max = Some(DEFAULT_NODE_PORT_RANGE.1);
        }

        let charging = &mut self.resource_charging_option;
        charging.charging_type.get_or_insert_with(Default::default);
        if charging.charging_type == Some(PaymentTiming::Prepaid) {
            if charging.purchase_time_unit.is_empty() {
                charging.purchase_time_unit = "month".to_string();
            }
            if charging.auto_renew && charging.auto_renew_time_unit.is_empty() {
                charging.auto_renew_time_unit = "month".to_string();
            }
        }
    }
}

/// Master configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MasterConfig {
    /// Where master machines come from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_type: Option<MasterType>,

    /// Master replica count
    #[serde(rename = "clusterHA", default, skip_serializing_if = "Option::is_none")]
    pub cluster_ha: Option<ClusterHa>,

    /// Expose the API server through a public EIP
    #[serde(default)]
    pub exposed_public: bool,

    /// Subnet of the API server load balancer
    #[serde(rename = "clusterBLBVPCSubnetID", default, skip_serializing_if = "String::is_empty")]
    pub cluster_blb_vpc_subnet_id: String,

    /// Placement of platform-hosted masters; managed clusters only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_cluster_master_option: Option<ManagedClusterMasterOption>,
}

impl MasterConfig {
    /// Master type, defaulting to managed
    pub fn master_type(&self) -> MasterType {
        self.master_type.unwrap_or_default()
    }

    /// HA replica count, defaulting to the smallest valid count for the master type
    pub fn cluster_ha(&self) -> ClusterHa {
        self.cluster_ha
            .unwrap_or_else(|| self.master_type().allowed_ha()[0])
    }
}

/// Placement options for managed masters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterMasterOption {
    /// Zone of the master subnet
    #[serde(rename = "masterVPCSubnetZone", default, skip_serializing_if = "Option::is_none")]
    pub master_vpc_subnet_zone: Option<AvailableZone>,

    /// Master subnet
    #[serde(rename = "masterVPCSubnetUUID", default, skip_serializing_if = "String::is_empty")]
    pub master_vpc_subnet_uuid: String,

    /// Security group applied to master nodes
    #[serde(rename = "masterSecurityGroupUUID", default, skip_serializing_if = "String::is_empty")]
    pub master_security_group_uuid: String,

    /// Size class of the hosted control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_flavor: Option<MasterFlavor>,
}

/// Container network configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerNetworkConfig {
    /// Network mode; kubenet when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ContainerNetworkMode>,

    /// ENI subnets per zone
    #[serde(rename = "eniVPCSubnetIDs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub eni_vpc_subnet_ids: BTreeMap<AvailableZone, Vec<String>>,

    /// Security group attached to pod ENIs
    #[serde(rename = "eniSecurityGroupID", default, skip_serializing_if = "String::is_empty")]
    pub eni_security_group_id: String,

    /// IP family; ipv4 when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<IpVersion>,

    /// Subnet of LoadBalancer-type service BLBs
    #[serde(rename = "lbServiceVPCSubnetID", default)]
    pub lb_service_vpc_subnet_id: String,

    /// Lowest NodePort
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port_range_min: Option<u16>,

    /// Highest NodePort
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port_range_max: Option<u16>,

    /// Pod IPv4 range
    #[serde(rename = "clusterPodCIDR", default, skip_serializing_if = "String::is_empty")]
    pub cluster_pod_cidr: String,

    /// Pod IPv6 range
    #[serde(rename = "clusterPodCIDRIPv6", default, skip_serializing_if = "String::is_empty")]
    pub cluster_pod_cidr_ipv6: String,

    /// Service ClusterIP IPv4 range
    #[serde(rename = "clusterIPServiceCIDR", default, skip_serializing_if = "String::is_empty")]
    pub cluster_ip_service_cidr: String,

    /// Service ClusterIP IPv6 range
    #[serde(rename = "clusterIPServiceCIDRIPv6", default, skip_serializing_if = "String::is_empty")]
    pub cluster_ip_service_cidr_ipv6: String,

    /// Pods per node; bounds the node CIDR size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pods_per_node: Option<u32>,

    /// kube-proxy mode; ipvs when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_proxy_mode: Option<KubeProxyMode>,
}

impl ContainerNetworkConfig {
    /// Network mode, defaulting to kubenet
    pub fn mode(&self) -> ContainerNetworkMode {
        self.mode.unwrap_or_default()
    }

    /// IP family, defaulting to ipv4
    pub fn ip_version(&self) -> IpVersion {
        self.ip_version.unwrap_or_default()
    }

    /// Pods per node, defaulting to 128
    pub fn max_pods_per_node(&self) -> u32 {
        self.max_pods_per_node.unwrap_or(DEFAULT_MAX_PODS_PER_NODE)
    }

    /// kube-proxy mode, defaulting to ipvs
    pub fn kube_proxy_mode(&self) -> KubeProxyMode {
        self.kube_proxy_mode.unwrap_or_default()
    }

    /// All ENI subnet IDs across zones, in zone order
    pub fn eni_subnets(&self) -> Vec<String> {
        self.eni_vpc_subnet_ids.values().flatten().cloned().collect()
    }
}

/// IaaS charging configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceChargingOption {
    /// Postpaid or prepaid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charging_type: Option<PaymentTiming>,

    /// Prepaid period length
    #[serde(default)]
    pub purchase_time: u32,

    /// Prepaid period unit
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub purchase_time_unit: String,

    /// Renew automatically at the end of the period
    #[serde(default)]
    pub auto_renew: bool,

    /// Renewal period length
    #[serde(default)]
    pub auto_renew_time: u32,

    /// Renewal period unit
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auto_renew_time_unit: String,
}

/// Helm parameters for a plugin
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginHelmConfig {
    /// Plugin type; defaults to the plugin name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plugin_type: String,

    /// Plugin alias, e.g. for several ingress controllers
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plugin_name: String,

    /// Chart name in the platform repository
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chart_name: String,

    /// Chart version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chart_version: String,

    /// Target namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespaces: String,

    /// Description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Values document passed to Helm
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub values: String,
}

/// Kubernetes custom configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct K8sCustomConfig {
    /// Feature gates for control-plane components
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub master_feature_gates: BTreeMap<String, bool>,

    /// Feature gates for kubelet
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_feature_gates: BTreeMap<String, bool>,

    /// Extra admission plugins
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admission_plugins: Vec<String>,

    /// Pause image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pause_image: String,

    /// kubelet kube-api-qps
    #[serde(rename = "kubeAPIQPS", default, skip_serializing_if = "Option::is_none")]
    pub kube_api_qps: Option<u32>,

    /// kubelet kube-api-burst
    #[serde(rename = "kubeAPIBurst", default, skip_serializing_if = "Option::is_none")]
    pub kube_api_burst: Option<u32>,

    /// Scheduler predicates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scheduler_predicates: Vec<String>,

    /// Scheduler priority weights
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scheduler_priorities: BTreeMap<String, i32>,

    /// etcd data directory
    #[serde(rename = "etcdDataPath", default, skip_serializing_if = "String::is_empty")]
    pub etcd_data_path: String,
}

/// Resource tag
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    /// Tag key
    pub tag_key: String,
    /// Tag value
    #[serde(default)]
    pub tag_value: String,
}

// =============================================================================
// Status
// =============================================================================

/// Provisioning step of a cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Reserve pod routes, ENI subnets or secondary IP pools
    ReserveContainerNetwork,
    /// Create master replicas
    CreateMasters,
    /// Create the API server load balancer
    AttachApiserverLb,
}

impl TaskKind {
    /// Task name used in checkpoints, logs and idempotency tokens
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReserveContainerNetwork => "reserve-container-network",
            Self::CreateMasters => "create-masters",
            Self::AttachApiserverLb => "attach-apiserver-lb",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reference to an IaaS resource returned by the provisioner
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHandle {
    /// Provider-side resource ID
    pub id: String,
    /// Reachable address, for resources that expose one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl ResourceHandle {
    /// Handle without an endpoint
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: None,
        }
    }

    /// Attach an endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Lifecycle of a checkpointed resource
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CheckpointState {
    /// Resource exists
    Created,
    /// Resource has been torn down
    TornDown,
}

/// Record of a completed provisioning task
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskCheckpoint {
    /// Task that produced the resource
    pub task: TaskKind,
    /// Resource created by the task
    pub handle: ResourceHandle,
    /// Whether the resource still exists
    pub state: CheckpointState,
    /// When the state last changed
    pub updated_at: DateTime<Utc>,
}

/// Last phase transition written by the reconciler
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTransition {
    /// Phase before the transition
    pub from: ClusterPhase,
    /// Phase after the transition
    pub to: ClusterPhase,
    /// When the transition was written
    pub at: DateTime<Utc>,
}

/// Status of a Cluster, written only by the reconciler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Identifier assigned when provisioning was dispatched
    #[serde(rename = "clusterID", default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    /// Current phase of the cluster lifecycle
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Completed provisioning tasks, in execution order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoints: Vec<TaskCheckpoint>,

    /// Spec generation the phase was last decided against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Operator retry counter the phase was last decided against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_retry: Option<i64>,

    /// Incremented on every status write
    #[serde(default)]
    pub revision: u64,

    /// Last transition written by the reconciler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition: Option<PhaseTransition>,
}

impl ClusterStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ClusterPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        self.set_condition(condition);
        self
    }

    /// Replace the condition of the same type, keeping its timestamp when unchanged
    pub fn set_condition(&mut self, condition: Condition) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            if !existing.same_as(&condition) {
                *existing = condition;
            }
        } else {
            self.conditions.push(condition);
        }
    }

    /// Checkpoint recorded for a task, if any
    pub fn checkpoint(&self, task: TaskKind) -> Option<&TaskCheckpoint> {
        self.checkpoints.iter().find(|c| c.task == task)
    }

    /// Record a completed task
    ///
    /// A task that already has a checkpoint is left alone, which keeps a
    /// replayed task from appearing twice.
    pub fn record_checkpoint(&mut self, task: TaskKind, handle: ResourceHandle) {
        if self.checkpoint(task).is_some() {
            return;
        }
        self.checkpoints.push(TaskCheckpoint {
            task,
            handle,
            state: CheckpointState::Created,
            updated_at: Utc::now(),
        });
    }

    /// Mark a task's resource as torn down
    pub fn mark_torn_down(&mut self, task: TaskKind) {
        if let Some(checkpoint) = self.checkpoints.iter_mut().find(|c| c.task == task) {
            checkpoint.state = CheckpointState::TornDown;
            checkpoint.updated_at = Utc::now();
        }
    }

    /// Checkpoints that still need teardown, newest first
    pub fn live_checkpoints(&self) -> Vec<TaskCheckpoint> {
        self.checkpoints
            .iter()
            .rev()
            .filter(|c| c.state == CheckpointState::Created)
            .cloned()
            .collect()
    }

    /// Endpoint of the API server load balancer, once created
    pub fn apiserver_endpoint(&self) -> Option<&str> {
        self.checkpoint(TaskKind::AttachApiserverLb)
            .and_then(|c| c.handle.endpoint.as_deref())
    }
}

impl Cluster {
    /// Record key (metadata.name)
    pub fn key(&self) -> String {
        self.name_any()
    }

    /// Current phase; a record without status is pending
    pub fn phase(&self) -> ClusterPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Assigned cluster ID, if provisioning has been dispatched
    pub fn cluster_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.cluster_id.as_deref())
            .or_else(|| Some(self.spec.cluster_id.as_str()).filter(|id| !id.is_empty()))
    }

    /// Status revision the next write must be based on
    pub fn revision(&self) -> u64 {
        self.status.as_ref().map(|s| s.revision).unwrap_or(0)
    }

    /// Whether a delete has been requested
    pub fn is_deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Operator retry counter carried in [`RETRY_ANNOTATION`]
    ///
    /// A missing or unparsable annotation counts as no retry.
    pub fn retry_generation(&self) -> Option<i64> {
        self.annotations()
            .get(RETRY_ANNOTATION)
            .and_then(|v| v.parse().ok())
    }

    /// Whether an operator retry was requested that the status has not seen
    pub fn has_pending_retry(&self) -> bool {
        let requested = self.retry_generation().unwrap_or(0);
        let observed = self
            .status
            .as_ref()
            .and_then(|s| s.observed_retry)
            .unwrap_or(0);
        requested > observed
    }
}
