//! Acceptance-time validation of cluster specs
//!
//! A spec is checked once when it is submitted and again on every update.
//! Each check appends to a violation list instead of returning early, so the
//! caller sees every broken field in one response.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::cluster::{ClusterSpec, ContainerNetworkConfig, MasterConfig};
use super::types::{ContainerNetworkMode, MasterType, PaymentTiming, RuntimeType};
use crate::Error;

/// Longest accepted cluster name
pub const MAX_CLUSTER_NAME_LEN: usize = 65;

/// Accepted values of `maxPodsPerNode`
pub const ALLOWED_MAX_PODS_PER_NODE: [u32; 5] = [16, 32, 64, 128, 256];

/// Accepted prepaid purchase periods, in months
pub const ALLOWED_PREPAID_MONTHS: [u32; 12] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 12, 24, 36];

/// One rule broken by a spec
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// JSON path of the offending field, e.g. `masterConfig.clusterHA`
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl FieldViolation {
    /// Create a violation for a field
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Default)]
struct Violations(Vec<FieldViolation>);

impl Violations {
    fn push(&mut self, field: &str, message: impl Into<String>) {
        self.0.push(FieldViolation::new(field, message));
    }

    fn require(&mut self, field: &str, present: bool) {
        if !present {
            self.push(field, "is required");
        }
    }

    fn into_result(self, cluster: &str) -> Result<(), Error> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid_spec(cluster, self.0))
        }
    }
}

/// Validate a spec submitted for a new cluster
///
/// On top of the structural checks in [`validate_spec`], a new spec must
/// leave `clusterID` empty since the system assigns it.
pub fn validate_submission(name: &str, spec: &ClusterSpec) -> Result<(), Error> {
    let mut violations = Violations::default();
    if !spec.cluster_id.is_empty() {
        violations.push("clusterID", "is assigned by the system and must be empty");
    }
    check_spec(spec, &mut violations);
    violations.into_result(name)
}

/// Validate the structural invariants of a spec
pub fn validate_spec(name: &str, spec: &ClusterSpec) -> Result<(), Error> {
    let mut violations = Violations::default();
    check_spec(spec, &mut violations);
    violations.into_result(name)
}

/// Validate a spec update against the currently stored spec
///
/// Only `clusterName`, `description` and `forbidDelete` may change; every
/// other field is frozen once accepted. `clusterID` may be left empty or set
/// to the assigned ID, but never to anything else.
pub fn validate_update(
    name: &str,
    current: &ClusterSpec,
    proposed: &ClusterSpec,
    assigned_id: Option<&str>,
) -> Result<(), Error> {
    let mut violations = Violations::default();

    if !proposed.cluster_id.is_empty() && Some(proposed.cluster_id.as_str()) != assigned_id {
        violations.push("clusterID", "is readonly");
    }

    let readonly: [(&str, bool); 17] = [
        ("clusterType", current.cluster_type == proposed.cluster_type),
        ("vpcID", current.vpc_id == proposed.vpc_id),
        ("vpcUUID", current.vpc_uuid == proposed.vpc_uuid),
        ("vpcCIDR", current.vpc_cidr == proposed.vpc_cidr),
        ("vpcCIDRIPv6", current.vpc_cidr_ipv6 == proposed.vpc_cidr_ipv6),
        ("plugins", current.plugins == proposed.plugins),
        ("pluginsConfig", current.plugins_config == proposed.plugins_config),
        ("authenticateMode", current.authenticate_mode == proposed.authenticate_mode),
        ("tags", current.tags == proposed.tags),
        ("masterConfig", current.master_config == proposed.master_config),
        (
            "containerNetworkConfig",
            current.container_network_config == proposed.container_network_config,
        ),
        ("k8sVersion", current.k8s_version == proposed.k8s_version),
        ("runtimeType", current.runtime_type == proposed.runtime_type),
        ("runtimeVersion", current.runtime_version == proposed.runtime_version),
        (
            "resourceChargingOption",
            current.resource_charging_option == proposed.resource_charging_option,
        ),
        ("k8sCustomConfig", current.k8s_custom_config == proposed.k8s_custom_config),
        ("resourceGroupID", current.resource_group_id == proposed.resource_group_id),
    ];
    let mut frozen_changed = false;
    for (field, unchanged) in readonly {
        if !unchanged {
            frozen_changed = true;
            violations.push(field, "is readonly");
        }
    }

    // Anything left after masking the modifiable fields must be identical
    let mut masked = proposed.clone();
    masked.cluster_id = current.cluster_id.clone();
    masked.cluster_name = current.cluster_name.clone();
    masked.description = current.description.clone();
    masked.forbid_delete = current.forbid_delete;
    if !frozen_changed && masked != *current {
        violations.push("spec", "only clusterName, description and forbidDelete are modifiable");
    }

    check_spec(proposed, &mut violations);
    violations.into_result(name)
}

fn check_spec(spec: &ClusterSpec, v: &mut Violations) {
    if spec.cluster_name.is_empty() {
        v.push("clusterName", "is required");
    } else if spec.cluster_name.chars().count() > MAX_CLUSTER_NAME_LEN {
        v.push(
            "clusterName",
            format!("must be at most {MAX_CLUSTER_NAME_LEN} characters"),
        );
    }
    v.require("clusterType", spec.cluster_type.is_some());
    v.require("vpcID", !spec.vpc_id.is_empty());

    check_runtime(spec, v);
    check_master(&spec.master_config, spec, v);
    check_network(spec, v);
    check_charging(spec, v);
    check_custom_config(spec, v);
    check_plugins(spec, v);
    check_tags(spec, v);
}

fn check_runtime(spec: &ClusterSpec, v: &mut Violations) {
    let version = spec.k8s_version();
    if spec.runtime_type == Some(RuntimeType::Docker) && !version.supports_docker() {
        v.push(
            "runtimeType",
            format!("docker is not supported on Kubernetes {version}, use containerd"),
        );
    }
}

fn check_master(master: &MasterConfig, spec: &ClusterSpec, v: &mut Violations) {
    v.require("masterConfig.masterType", master.master_type.is_some());
    v.require("masterConfig.clusterHA", master.cluster_ha.is_some());

    let master_type = master.master_type();
    if let Some(ha) = master.cluster_ha {
        let allowed = master_type.allowed_ha();
        if !allowed.contains(&ha) {
            let expected: Vec<String> = allowed.iter().map(ToString::to_string).collect();
            v.push(
                "masterConfig.clusterHA",
                format!(
                    "{master_type} masters require HA in [{}], got {ha}",
                    expected.join(", ")
                ),
            );
        }
    }

    match (&master.managed_cluster_master_option, master_type) {
        (Some(_), MasterType::Custom | MasterType::Serverless) => v.push(
            "masterConfig.managedClusterMasterOption",
            format!("is only valid for managed masters, not {master_type}"),
        ),
        (Some(option), MasterType::Managed) => {
            if !option.master_vpc_subnet_uuid.is_empty() && option.master_vpc_subnet_zone.is_none()
            {
                v.push(
                    "masterConfig.managedClusterMasterOption.masterVPCSubnetZone",
                    "is required when masterVPCSubnetUUID is set",
                );
            }
        }
        (None, _) => {}
    }

    if master_type == MasterType::Serverless && !spec.container_network_config.mode().uses_eni() {
        v.push(
            "containerNetworkConfig.mode",
            "serverless masters require an ENI-based network mode",
        );
    }
}

fn check_network(spec: &ClusterSpec, v: &mut Violations) {
    let network = &spec.container_network_config;
    let mode = network.mode();
    let ip_version = network.ip_version();

    v.require(
        "containerNetworkConfig.lbServiceVPCSubnetID",
        !network.lb_service_vpc_subnet_id.is_empty(),
    );

    if !mode.supported_ip_versions().contains(&ip_version) {
        v.push(
            "containerNetworkConfig.ipVersion",
            format!("{ip_version} is not supported by network mode {mode}"),
        );
    }

    if mode.uses_pod_cidr() {
        if ip_version.has_ipv4() && network.cluster_pod_cidr.is_empty() {
            v.push(
                "containerNetworkConfig.clusterPodCIDR",
                format!("is required for network mode {mode}"),
            );
        }
        if ip_version.has_ipv6() && network.cluster_pod_cidr_ipv6.is_empty() {
            v.push(
                "containerNetworkConfig.clusterPodCIDRIPv6",
                format!("is required for network mode {mode} with {ip_version}"),
            );
        }
    }

    if mode.uses_eni() {
        if network.eni_subnets().is_empty() {
            v.push(
                "containerNetworkConfig.eniVPCSubnetIDs",
                format!("at least one subnet is required for network mode {mode}"),
            );
        }
        if network.eni_security_group_id.is_empty() {
            v.push(
                "containerNetworkConfig.eniSecurityGroupID",
                format!("is required for network mode {mode}"),
            );
        }
    }

    check_cidrs(spec, network, mode, v);

    if let Some(max_pods) = network.max_pods_per_node {
        if !ALLOWED_MAX_PODS_PER_NODE.contains(&max_pods) {
            v.push(
                "containerNetworkConfig.maxPodsPerNode",
                format!("must be one of {ALLOWED_MAX_PODS_PER_NODE:?}, got {max_pods}"),
            );
        }
    }

    match (network.node_port_range_min, network.node_port_range_max) {
        (Some(min), Some(max)) if min >= max => v.push(
            "containerNetworkConfig.nodePortRangeMin",
            format!("must be lower than nodePortRangeMax ({min} >= {max})"),
        ),
        (Some(_), None) | (None, Some(_)) => v.push(
            "containerNetworkConfig.nodePortRangeMax",
            "nodePortRangeMin and nodePortRangeMax must be set together",
        ),
        _ => {}
    }
}

fn check_cidrs(
    spec: &ClusterSpec,
    network: &ContainerNetworkConfig,
    mode: ContainerNetworkMode,
    v: &mut Violations,
) {
    let fields = [
        ("vpcCIDR", spec.vpc_cidr.as_str(), Family::V4),
        ("vpcCIDRIPv6", spec.vpc_cidr_ipv6.as_str(), Family::V6),
        (
            "containerNetworkConfig.clusterPodCIDR",
            network.cluster_pod_cidr.as_str(),
            Family::V4,
        ),
        (
            "containerNetworkConfig.clusterPodCIDRIPv6",
            network.cluster_pod_cidr_ipv6.as_str(),
            Family::V6,
        ),
        (
            "containerNetworkConfig.clusterIPServiceCIDR",
            network.cluster_ip_service_cidr.as_str(),
            Family::V4,
        ),
        (
            "containerNetworkConfig.clusterIPServiceCIDRIPv6",
            network.cluster_ip_service_cidr_ipv6.as_str(),
            Family::V6,
        ),
    ];

    let mut parsed: Vec<(&str, Cidr)> = Vec::new();
    for (field, raw, family) in fields {
        if raw.is_empty() {
            continue;
        }
        match Cidr::parse(raw) {
            Ok(cidr) if cidr.family() != family => {
                v.push(field, format!("{raw} is not an {family} range"));
            }
            Ok(cidr) => parsed.push((field, cidr)),
            Err(msg) => v.push(field, msg),
        }
    }

    // Pod ranges only matter for modes that route a dedicated pod CIDR.
    for (i, (field_a, a)) in parsed.iter().enumerate() {
        for (field_b, b) in parsed.iter().skip(i + 1) {
            let involves_pod = field_a.contains("PodCIDR") || field_b.contains("PodCIDR");
            if involves_pod && !mode.uses_pod_cidr() {
                continue;
            }
            if a.overlaps(b) {
                v.push(field_b, format!("{b} overlaps {field_a} {a}"));
            }
        }
    }
}

fn check_charging(spec: &ClusterSpec, v: &mut Violations) {
    let charging = &spec.resource_charging_option;
    match charging.charging_type.unwrap_or_default() {
        PaymentTiming::Prepaid => {
            if !ALLOWED_PREPAID_MONTHS.contains(&charging.purchase_time) {
                v.push(
                    "resourceChargingOption.purchaseTime",
                    format!(
                        "prepaid purchase time must be one of {ALLOWED_PREPAID_MONTHS:?} months, got {}",
                        charging.purchase_time
                    ),
                );
            }
            if charging.auto_renew && !ALLOWED_PREPAID_MONTHS.contains(&charging.auto_renew_time) {
                v.push(
                    "resourceChargingOption.autoRenewTime",
                    format!(
                        "auto renew time must be one of {ALLOWED_PREPAID_MONTHS:?} months, got {}",
                        charging.auto_renew_time
                    ),
                );
            }
        }
        PaymentTiming::Postpaid => {
            if charging.purchase_time != 0 {
                v.push(
                    "resourceChargingOption.purchaseTime",
                    "must be unset for postpaid charging",
                );
            }
            if charging.auto_renew {
                v.push(
                    "resourceChargingOption.autoRenew",
                    "is only valid for prepaid charging",
                );
            }
        }
    }
}

fn check_custom_config(spec: &ClusterSpec, v: &mut Violations) {
    let custom = &spec.k8s_custom_config;
    if let (Some(qps), Some(burst)) = (custom.kube_api_qps, custom.kube_api_burst) {
        if burst < qps {
            v.push(
                "k8sCustomConfig.kubeAPIBurst",
                format!("must be at least kubeAPIQPS ({burst} < {qps})"),
            );
        }
    }
    if !custom.etcd_data_path.is_empty() && !custom.etcd_data_path.starts_with('/') {
        v.push("k8sCustomConfig.etcdDataPath", "must be an absolute path");
    }
    for (name, weight) in &custom.scheduler_priorities {
        if *weight < 0 {
            v.push(
                "k8sCustomConfig.schedulerPriorities",
                format!("weight of {name} must not be negative"),
            );
        }
    }
}

fn check_plugins(spec: &ClusterSpec, v: &mut Violations) {
    let mut seen = HashSet::new();
    for plugin in &spec.plugins {
        if plugin.is_empty() {
            v.push("plugins", "plugin names must not be empty");
        } else if !seen.insert(plugin.as_str()) {
            v.push("plugins", format!("{plugin} is listed more than once"));
        }
    }
    for name in spec.plugins_config.keys() {
        if !seen.contains(name.as_str()) {
            v.push(
                "pluginsConfig",
                format!("{name} is configured but not listed in plugins"),
            );
        }
    }
}

fn check_tags(spec: &ClusterSpec, v: &mut Violations) {
    let mut keys = HashSet::new();
    for tag in &spec.tags {
        if tag.tag_key.is_empty() {
            v.push("tags", "tag keys must not be empty");
        } else if !keys.insert(tag.tag_key.as_str()) {
            v.push("tags", format!("tag key {} is duplicated", tag.tag_key));
        }
    }
}

// =============================================================================
// CIDR parsing
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    fn parse(raw: &str) -> Result<Self, String> {
        let (addr, prefix) = raw
            .split_once('/')
            .ok_or_else(|| format!("{raw} is not in address/prefix form"))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| format!("{raw} has an invalid address"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("{raw} has an invalid prefix length"))?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(format!("{raw} prefix length exceeds {max}"));
        }
        let cidr = Self { addr, prefix };
        if cidr.network_bits() != cidr.address_bits() {
            return Err(format!("{raw} has host bits set"));
        }
        Ok(cidr)
    }

    fn family(&self) -> Family {
        match self.addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    fn width(&self) -> u32 {
        match self.family() {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    fn address_bits(&self) -> u128 {
        match self.addr {
            IpAddr::V4(a) => u32::from(a) as u128,
            IpAddr::V6(a) => u128::from(a),
        }
    }

    fn mask(&self, prefix: u8) -> u128 {
        let width = self.width();
        let host_bits = width - u32::from(prefix);
        let full: u128 = if width == 128 { u128::MAX } else { (1u128 << width) - 1 };
        if host_bits >= 128 {
            0
        } else {
            full & !((1u128 << host_bits) - 1)
        }
    }

    fn network_bits(&self) -> u128 {
        self.address_bits() & self.mask(self.prefix)
    }

    fn overlaps(&self, other: &Cidr) -> bool {
        if self.family() != other.family() {
            return false;
        }
        let shorter = self.prefix.min(other.prefix);
        let mask = self.mask(shorter);
        self.address_bits() & mask == other.address_bits() & mask
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}
