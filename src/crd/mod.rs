//! Custom Resource Definitions for the CCE cluster controller
//!
//! The `Cluster` resource carries the desired `ClusterSpec` and the
//! reconciler-owned `ClusterStatus`; supporting enums live in `types`.

mod cluster;
mod types;
mod validation;

pub use cluster::{
    CheckpointState, Cluster, ClusterSpec, ClusterStatus, ContainerNetworkConfig, K8sCustomConfig,
    ManagedClusterMasterOption, MasterConfig, PhaseTransition, PluginHelmConfig,
    ResourceChargingOption, ResourceHandle, Tag, TaskCheckpoint, TaskKind,
    DEFAULT_MAX_PODS_PER_NODE, DEFAULT_NODE_PORT_RANGE,
};
pub use types::{
    AuthenticateMode, AvailableZone, ClusterHa, ClusterPhase, ClusterType, Condition,
    ConditionStatus, ContainerNetworkMode, IpVersion, K8sVersion, KubeProxyMode, MasterFlavor,
    MasterType, PaymentTiming, RuntimeType,
};
pub use validation::{
    validate_spec, validate_submission, validate_update, FieldViolation,
    ALLOWED_MAX_PODS_PER_NODE, ALLOWED_PREPAID_MONTHS, MAX_CLUSTER_NAME_LEN,
};
