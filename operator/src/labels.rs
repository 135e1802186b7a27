use std::collections::BTreeMap;

/// Create labels that can be used as a unique selector for a given app name.
pub fn selector_labels(app: &str) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![(
        "app".to_owned(),
        app.to_owned(),
    )]))
}

/// Managed by label
pub const MANAGED_BY_LABEL_SELECTOR: &str = "managed-by=quarry";

/// Label recording which SearchCluster a resource belongs to.
pub const CLUSTER_LABEL: &str = "quarry.io/cluster";

/// Label recording which node pool a workload backs.
pub const NODE_POOL_LABEL: &str = "quarry.io/node-pool";

/// Labels that indicate the resource is managed by the quarry operator.
pub fn managed_labels() -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![(
        "managed-by".to_owned(),
        "quarry".to_owned(),
    )]))
}

/// Managed labels scoped to a single cluster.
pub fn cluster_labels(cluster: &str) -> Option<BTreeMap<String, String>> {
    let mut labels = managed_labels().expect("managed labels should exist");
    labels.insert(CLUSTER_LABEL.to_owned(), cluster.to_owned());
    Some(labels)
}

/// Selector matching every resource of a single cluster.
pub fn cluster_selector(cluster: &str) -> String {
    format!("{MANAGED_BY_LABEL_SELECTOR},{CLUSTER_LABEL}={cluster}")
}

/// Label carried only by pods that are search cluster members.
///
/// Companion pods such as dashboards share the cluster label but not this
/// one, so services that must route to members only select on it.
pub const MEMBER_LABEL: &str = "quarry.io/member";

/// Selector labels matching the member pods of a cluster.
pub fn member_selector_labels(cluster: &str) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![(
        MEMBER_LABEL.to_owned(),
        cluster.to_owned(),
    )]))
}

/// Extend cluster scoped labels with extra labels.
pub fn cluster_labels_extend(
    cluster: &str,
    extra: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut labels = cluster_labels(cluster).expect("cluster labels should exist");
    if let Some(extra) = extra {
        labels.extend(extra);
    }
    Some(labels)
}
