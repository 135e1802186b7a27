//! Place all spec types into a single module so they can be used as a lightweight dependency
use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        Affinity, EmptyDirVolumeSource, HostPathVolumeSource, ResourceRequirements, Toleration,
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Primary CRD for creating and managing a search cluster.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "quarry.io",
    version = "v1alpha1",
    kind = "SearchCluster",
    plural = "searchclusters",
    status = "SearchClusterStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SearchClusterSpec {
    /// Settings that apply to the cluster as a whole.
    pub general: GeneralSpec,
    /// Node pools that make up the cluster.
    /// At least one pool must carry a cluster manager eligible role.
    pub node_pools: Vec<NodePoolSpec>,
    /// Describes if/how the dashboards companion service should be deployed.
    pub dashboards: Option<DashboardsSpec>,
    /// References to security material maintained by external collaborators.
    pub security: Option<SecuritySpec>,
}

/// Cluster wide settings.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GeneralSpec {
    /// Port of the HTTP interface, defaults to 9200.
    pub http_port: Option<i32>,
    /// Search engine vendor.
    pub vendor: Option<String>,
    /// Version of the search engine to run.
    pub version: String,
    /// Name of the cluster wide service, defaults to the cluster name.
    pub service_name: Option<String>,
    /// Image to run, overrides the image derived from vendor and version.
    pub image: Option<String>,
    /// Default snapshot repository.
    pub default_repo: Option<String>,
    /// Extra entries for the cluster configuration, applied to every pool.
    pub additional_config: Option<BTreeMap<String, String>>,
    /// Relocate data off members before restarting them during upgrades.
    pub drain_data_nodes: Option<bool>,
    /// Set the vm.max_map_count sysctl with an init container on every member.
    pub set_vm_max_map_count: Option<bool>,
}

/// A homogeneous set of cluster members sharing roles, resources and placement.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Name of this pool, unique within the cluster.
    pub component: String,
    /// Number of members.
    pub replicas: i32,
    /// Size of the persistent disk of each member.
    pub disk_size: Option<Quantity>,
    /// Compute resources per member, copied verbatim into the workload.
    pub resources: Option<ResourceRequirements>,
    /// JVM options for members of this pool.
    pub jvm: Option<String>,
    /// Roles assigned to members of this pool.
    pub roles: Vec<String>,
    /// Tolerations for member placement.
    pub tolerations: Option<Vec<Toleration>>,
    /// Node selector for member placement.
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Affinity rules for member placement.
    pub affinity: Option<Affinity>,
    /// Persistence source for member data, at most one may be set.
    pub persistence: Option<PersistenceSpec>,
    /// Extra configuration entries for this pool.
    /// CAUTION: Entries specified here override cluster wide entries.
    pub additional_config: Option<BTreeMap<String, String>>,
}

/// Role that makes a member eligible for cluster manager election.
pub const CLUSTER_MANAGER_ROLE: &str = "cluster_manager";
/// Legacy name of the cluster manager role.
pub const MASTER_ROLE: &str = "master";
/// Role of members that hold data.
pub const DATA_ROLE: &str = "data";

impl NodePoolSpec {
    /// True when members of this pool may participate in cluster manager election.
    pub fn is_manager_eligible(&self) -> bool {
        self.roles
            .iter()
            .any(|role| role == CLUSTER_MANAGER_ROLE || role == MASTER_ROLE)
    }
    /// True when members of this pool hold data.
    pub fn is_data(&self) -> bool {
        self.roles.iter().any(|role| role == DATA_ROLE)
    }
}

/// Persistence source for the data of a pool's members.
///
/// Exactly one source may be set. When no source is set an ephemeral
/// emptyDir volume is used.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSpec {
    /// Dedicated persistent volume claim per member.
    pub pvc: Option<PvcSpec>,
    /// Ephemeral storage, lost when a member restarts.
    pub empty_dir: Option<EmptyDirVolumeSource>,
    /// Host path storage.
    pub host_path: Option<HostPathVolumeSource>,
}

impl PersistenceSpec {
    fn source_count(&self) -> usize {
        [
            self.pvc.is_some(),
            self.empty_dir.is_some(),
            self.host_path.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

/// Options for persistent volume claims.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvcSpec {
    /// Name of the storage class to use.
    pub storage_class: Option<String>,
    /// Access modes for the claim, defaults to ReadWriteOnce.
    pub access_modes: Option<Vec<String>>,
}

/// Describes if/how the dashboards companion service should be deployed.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DashboardsSpec {
    /// When true the dashboards deployment is created.
    pub enable: Option<bool>,
    /// Number of dashboards replicas.
    pub replicas: Option<i32>,
    /// Version of the dashboards image, defaults to the cluster version.
    pub version: Option<String>,
    /// Image to run, overrides the image derived from vendor and version.
    pub image: Option<String>,
    /// Compute resources for the dashboards container.
    pub resources: Option<ResourceRequirements>,
    /// Extra configuration entries for dashboards.
    pub additional_config: Option<BTreeMap<String, String>>,
    /// Name of a secret with username/password for dashboards to reach the cluster.
    pub credentials_secret: Option<String>,
}

/// References to security material maintained by external collaborators.
///
/// The operator consumes these secrets, it never creates or rotates them.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySpec {
    /// TLS material for the transport and HTTP interfaces.
    pub tls: Option<TlsSpec>,
    /// Security plugin configuration.
    pub config: Option<SecurityConfigSpec>,
}

/// TLS material for the transport and HTTP interfaces.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// TLS material for the node to node transport interface.
    pub transport: Option<TlsInterfaceSpec>,
    /// TLS material for the HTTP interface.
    pub http: Option<TlsInterfaceSpec>,
}

/// TLS material for one interface.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsInterfaceSpec {
    /// Name of a secret with ca.crt, tls.crt and tls.key entries.
    pub secret: Option<String>,
}

/// Security plugin configuration references.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfigSpec {
    /// Name of a secret with the security plugin configuration files.
    pub security_config_secret: Option<String>,
    /// Name of a secret with username/password entries used by the operator
    /// for administrative calls such as draining.
    pub admin_credentials_secret: Option<String>,
}

/// Current status of the cluster.
///
/// Owned exclusively by the reconciler, never user authored.
#[derive(Default, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchClusterStatus {
    /// Overall lifecycle phase.
    pub phase: ClusterPhase,
    /// Cluster version that has been fully rolled out and confirmed.
    /// Individual workloads may already run a newer image.
    pub version: Option<String>,
    /// Set once the cluster has formed its first quorum, never cleared.
    pub initialized: bool,
    /// Per component lifecycle entries.
    pub components_status: Vec<ComponentStatus>,
}

/// Overall lifecycle phase of the cluster.
#[derive(Default, Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterPhase {
    /// The cluster has not yet formed its first quorum.
    #[default]
    Pending,
    /// The cluster is running.
    Running,
}

/// One entry of the per component status ledger.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Component the entry belongs to.
    pub component: String,
    /// Lifecycle state of the component.
    pub status: ComponentState,
    /// Distinguishes multiple entries of the same component.
    pub description: String,
}

/// Lifecycle states a component moves through.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, JsonSchema)]
pub enum ComponentState {
    /// The component has not started yet.
    Pending,
    /// The component is running.
    Running,
    /// The component is migrating to a new version.
    Upgrading,
    /// The component confirmed it completed a version migration.
    Upgraded,
}

/// Contradictory or malformed desired state. Never retried, the spec must change.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidSpec {
    /// Two node pools share a component name.
    #[error("node pool component names must be unique, {0:?} is declared more than once")]
    DuplicateComponent(String),
    /// A node pool declares more than one persistence source.
    #[error("node pool {0:?} declares more than one persistence source")]
    MultiplePersistenceSources(String),
    /// No pool can hold cluster manager elections.
    #[error("at least one node pool must declare a cluster manager eligible role")]
    NoManagerPool,
    /// The declared vendor is not one this operator can drive.
    #[error("vendor {0:?} is not supported")]
    UnsupportedVendor(String),
}

impl SearchClusterSpec {
    /// Check the spec for contradictions that can never be reconciled.
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        if let Some(vendor) = &self.general.vendor {
            if !matches!(vendor.to_lowercase().as_str(), "opensearch" | "op" | "os") {
                return Err(InvalidSpec::UnsupportedVendor(vendor.clone()));
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for pool in &self.node_pools {
            if !seen.insert(pool.component.as_str()) {
                return Err(InvalidSpec::DuplicateComponent(pool.component.clone()));
            }
            if let Some(persistence) = &pool.persistence {
                if persistence.source_count() > 1 {
                    return Err(InvalidSpec::MultiplePersistenceSources(
                        pool.component.clone(),
                    ));
                }
            }
        }
        if !self.node_pools.iter().any(NodePoolSpec::is_manager_eligible) {
            return Err(InvalidSpec::NoManagerPool);
        }
        Ok(())
    }
}

impl GeneralSpec {
    /// Port of the HTTP interface.
    pub fn http_port(&self) -> i32 {
        self.http_port.unwrap_or(9200)
    }
    /// Container image for cluster members.
    pub fn image(&self) -> String {
        match &self.image {
            Some(image) => image.clone(),
            None => format!(
                "docker.io/opensearchproject/opensearch:{}",
                self.version
            ),
        }
    }
}
