use k8s_openapi::api::apps::v1::StatefulSetSpec;

use crate::cluster::{
    node_set::{self, ClusterConfig, NodeSetConfig},
    NodePoolSpec, CLUSTER_MANAGER_ROLE,
};

/// Name of the transient seed member workload.
pub fn stateful_set_name(cluster: &str) -> String {
    format!("{cluster}-bootstrap")
}

/// Pod identity of the seed member.
///
/// Injected into every pool's `cluster.initial_master_nodes` so all members
/// agree on the bootstrap quorum seed.
pub fn seed_node_name(cluster: &str) -> String {
    format!("{}-0", stateful_set_name(cluster))
}

/// Workload spec of the transient seed member.
///
/// A single manager eligible member on ephemeral storage, living outside the
/// declared node pool set. It seeds the first quorum and becomes inert once
/// the cluster reports the quorum formed.
pub fn stateful_set_spec(cluster: &ClusterConfig) -> StatefulSetSpec {
    let seed = NodeSetConfig::from(&NodePoolSpec {
        component: "bootstrap".to_owned(),
        replicas: 1,
        roles: vec![CLUSTER_MANAGER_ROLE.to_owned()],
        ..Default::default()
    });
    let mut spec = node_set::stateful_set_spec(
        cluster,
        &seed,
        &cluster.image,
        Some(&seed_node_name(&cluster.name)),
    );
    // The seed is not addressed through a dedicated endpoint, peers reach it
    // via the discovery service.
    spec.service_name = crate::cluster::discovery::service_name(&cluster.name);
    spec
}
