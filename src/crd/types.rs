//! Supporting types for the Cluster CRD

use chrono::{DateTime, Utc};
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster type; selects the IaaS flavour the cluster is built on
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    /// Regular cluster on BCC/BBC infrastructure
    #[default]
    Normal,
}

/// Kubernetes versions accepted for new clusters
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub enum K8sVersion {
    /// 1.18.9
    #[serde(rename = "1.18.9")]
    V1_18_9,
    /// 1.20.8
    #[serde(rename = "1.20.8")]
    V1_20_8,
    /// 1.21.14
    #[serde(rename = "1.21.14")]
    V1_21_14,
    /// 1.22.5
    #[serde(rename = "1.22.5")]
    V1_22_5,
    /// 1.24.4
    #[serde(rename = "1.24.4")]
    V1_24_4,
    /// 1.26.9
    #[serde(rename = "1.26.9")]
    V1_26_9,
}

impl K8sVersion {
    /// Version used when the spec leaves `k8sVersion` unset
    pub const LATEST: K8sVersion = K8sVersion::V1_26_9;

    /// Version string as written on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1_18_9 => "1.18.9",
            Self::V1_20_8 => "1.20.8",
            Self::V1_21_14 => "1.21.14",
            Self::V1_22_5 => "1.22.5",
            Self::V1_24_4 => "1.24.4",
            Self::V1_26_9 => "1.26.9",
        }
    }

    /// dockershim was removed in 1.24, so docker needs an older release
    pub fn supports_docker(&self) -> bool {
        *self < Self::V1_24_4
    }
}

impl std::fmt::Display for K8sVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container runtime installed on each node
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker engine
    #[default]
    Docker,
    /// containerd
    Containerd,
}

impl RuntimeType {
    /// Runtime version installed when `runtimeVersion` is unset
    pub fn default_version(&self) -> &'static str {
        match self {
            Self::Docker => crate::LATEST_SUPPORTED_DOCKER_VERSION,
            Self::Containerd => crate::LATEST_SUPPORTED_CONTAINERD_VERSION,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Containerd => write!(f, "containerd"),
        }
    }
}

/// Where master machines come from
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MasterType {
    /// Control plane hosted and maintained by the platform
    #[default]
    Managed,
    /// Masters on user-supplied machines (new BCC, existing BCC or BBC)
    Custom,
    /// Serverless control plane
    Serverless,
}

impl MasterType {
    /// HA replica counts that are valid for this master type
    pub fn allowed_ha(&self) -> &'static [ClusterHa] {
        match self {
            Self::Managed | Self::Custom => &[ClusterHa::Low, ClusterHa::Medium, ClusterHa::High],
            Self::Serverless => &[ClusterHa::Serverless],
        }
    }
}

impl std::fmt::Display for MasterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Managed => write!(f, "managed"),
            Self::Custom => write!(f, "custom"),
            Self::Serverless => write!(f, "serverless"),
        }
    }
}

/// Number of master replicas
///
/// Serialized as the bare replica count (`1`, `2`, `3`, `5`).
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "u8", into = "u8")]
pub enum ClusterHa {
    /// Single master
    #[default]
    Low,
    /// Serverless control plane replicas
    Serverless,
    /// Three masters
    Medium,
    /// Five masters
    High,
}

impl ClusterHa {
    /// Replica count
    pub fn replicas(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Serverless => 2,
            Self::Medium => 3,
            Self::High => 5,
        }
    }
}

impl TryFrom<u8> for ClusterHa {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Low),
            2 => Ok(Self::Serverless),
            3 => Ok(Self::Medium),
            5 => Ok(Self::High),
            other => Err(format!("invalid clusterHA {other}, expected one of 1, 2, 3, 5")),
        }
    }
}

impl From<ClusterHa> for u8 {
    fn from(ha: ClusterHa) -> u8 {
        ha.replicas()
    }
}

impl std::fmt::Display for ClusterHa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.replicas())
    }
}

impl JsonSchema for ClusterHa {
    fn schema_name() -> String {
        "ClusterHa".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        u8::json_schema(gen)
    }
}

/// Managed master size class
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MasterFlavor {
    /// Up to 50 nodes
    #[default]
    L50,
    /// Up to 200 nodes
    L200,
    /// Up to 500 nodes
    L500,
    /// Up to 1000 nodes
    L1000,
    /// Up to 3000 nodes
    L3000,
    /// Up to 5000 nodes
    L5000,
}

/// Availability zone within a region
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum AvailableZone {
    /// zoneA
    #[serde(rename = "zoneA")]
    ZoneA,
    /// zoneB
    #[serde(rename = "zoneB")]
    ZoneB,
    /// zoneC
    #[serde(rename = "zoneC")]
    ZoneC,
    /// zoneD
    #[serde(rename = "zoneD")]
    ZoneD,
    /// zoneE
    #[serde(rename = "zoneE")]
    ZoneE,
    /// zoneF
    #[serde(rename = "zoneF")]
    ZoneF,
}

/// Container network mode
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerNetworkMode {
    /// kubenet with VPC routes per node CIDR
    #[default]
    Kubenet,
    /// Pods get ENI addresses from dedicated subnets
    VpcCni,
    /// VPC route plus veth
    VpcRouteVeth,
    /// VPC route plus ipvlan
    VpcRouteIpvlan,
    /// VPC route, veth or ipvlan chosen from the node kernel
    VpcRouteAutoDetect,
    /// VPC secondary IP plus veth
    VpcSecondaryIpVeth,
    /// VPC secondary IP plus ipvlan
    VpcSecondaryIpIpvlan,
    /// VPC secondary IP, veth or ipvlan chosen from the node kernel
    VpcSecondaryIpAutoDetect,
}

impl ContainerNetworkMode {
    /// Mode string as written on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kubenet => "kubenet",
            Self::VpcCni => "vpc-cni",
            Self::VpcRouteVeth => "vpc-route-veth",
            Self::VpcRouteIpvlan => "vpc-route-ipvlan",
            Self::VpcRouteAutoDetect => "vpc-route-auto-detect",
            Self::VpcSecondaryIpVeth => "vpc-secondary-ip-veth",
            Self::VpcSecondaryIpIpvlan => "vpc-secondary-ip-ipvlan",
            Self::VpcSecondaryIpAutoDetect => "vpc-secondary-ip-auto-detect",
        }
    }

    /// Pod addresses are carved out of a cluster pod CIDR
    pub fn uses_pod_cidr(&self) -> bool {
        matches!(
            self,
            Self::Kubenet | Self::VpcRouteVeth | Self::VpcRouteIpvlan | Self::VpcRouteAutoDetect
        )
    }

    /// Pod addresses come from VPC subnets through ENIs
    pub fn uses_eni(&self) -> bool {
        matches!(
            self,
            Self::VpcCni
                | Self::VpcSecondaryIpVeth
                | Self::VpcSecondaryIpIpvlan
                | Self::VpcSecondaryIpAutoDetect
        )
    }

    /// IP families this mode can serve
    pub fn supported_ip_versions(&self) -> &'static [IpVersion] {
        match self {
            Self::Kubenet => &[IpVersion::Ipv4, IpVersion::Ipv6, IpVersion::DualStack],
            Self::VpcCni | Self::VpcRouteVeth | Self::VpcRouteIpvlan | Self::VpcRouteAutoDetect => {
                &[IpVersion::Ipv4, IpVersion::DualStack]
            }
            Self::VpcSecondaryIpVeth | Self::VpcSecondaryIpIpvlan | Self::VpcSecondaryIpAutoDetect => {
                &[IpVersion::Ipv4]
            }
        }
    }
}

impl std::fmt::Display for ContainerNetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IP family of the container network
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum IpVersion {
    /// IPv4 only
    #[default]
    #[serde(rename = "ipv4")]
    Ipv4,
    /// IPv6 only
    #[serde(rename = "ipv6")]
    Ipv6,
    /// IPv4 and IPv6
    #[serde(rename = "dualStack")]
    DualStack,
}

impl IpVersion {
    /// Whether IPv4 ranges are needed
    pub fn has_ipv4(&self) -> bool {
        matches!(self, Self::Ipv4 | Self::DualStack)
    }

    /// Whether IPv6 ranges are needed
    pub fn has_ipv6(&self) -> bool {
        matches!(self, Self::Ipv6 | Self::DualStack)
    }
}

impl std::fmt::Display for IpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "ipv4"),
            Self::Ipv6 => write!(f, "ipv6"),
            Self::DualStack => write!(f, "dualStack"),
        }
    }
}

/// kube-proxy `--proxy-mode`
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KubeProxyMode {
    /// --proxy-mode=ipvs
    #[default]
    Ipvs,
    /// --proxy-mode=iptables
    Iptables,
}

/// API server authentication mode
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticateMode {
    /// Client certificates
    #[default]
    X509,
    /// OpenID Connect
    Oidc,
}

/// When IaaS resources are paid for
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PaymentTiming {
    /// Pay as you go
    #[default]
    Postpaid,
    /// Reserved up front for a purchase period
    Prepaid,
}

/// Cluster lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClusterPhase {
    /// Spec accepted, provisioning not yet dispatched
    #[default]
    Pending,
    /// IaaS resources are being created
    Provisioning,
    /// IaaS resources are ready
    Provisioned,
    /// Control plane is healthy
    Running,
    /// Provisioning failed
    CreateFailed,
    /// IaaS resources are being torn down
    Deleting,
    /// Every resource is gone
    Deleted,
    /// Teardown failed
    DeleteFailed,
}

impl ClusterPhase {
    /// Every phase, in lifecycle order
    pub const ALL: [ClusterPhase; 8] = [
        Self::Pending,
        Self::Provisioning,
        Self::Provisioned,
        Self::Running,
        Self::CreateFailed,
        Self::Deleting,
        Self::Deleted,
        Self::DeleteFailed,
    ];

    /// Phase string as written on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Provisioned => "provisioned",
            Self::Running => "running",
            Self::CreateFailed => "create_failed",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::DeleteFailed => "delete_failed",
        }
    }

    /// Phases the reconciler leaves alone until someone intervenes
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::CreateFailed | Self::DeleteFailed)
    }

    /// A provisioning attempt is in flight
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Provisioning | Self::Deleting)
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClusterPhase {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                crate::Error::validation(
                    crate::error::UNKNOWN_CONTEXT,
                    "phase",
                    format!("unknown phase '{s}'"),
                )
            })
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g. InfrastructureReady)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Same type, status, reason and message; timestamps are ignored
    pub fn same_as(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}
