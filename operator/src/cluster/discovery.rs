use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};

use crate::cluster::node_set::TRANSPORT_PORT;
use crate::labels::member_selector_labels;

/// Name of the cluster scoped discovery endpoint.
///
/// Members locate peers through this fixed address instead of individual pod
/// identities, so rolling replacement of members never breaks peer discovery.
pub fn service_name(cluster: &str) -> String {
    format!("{cluster}-discovery")
}

/// Headless service over every member pod's transport port.
pub fn service_spec(cluster: &str) -> ServiceSpec {
    ServiceSpec {
        ports: Some(vec![ServicePort {
            port: TRANSPORT_PORT,
            name: Some("transport".to_owned()),
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        }]),
        selector: member_selector_labels(cluster),
        cluster_ip: Some("None".to_owned()),
        type_: Some("ClusterIP".to_owned()),
        ..Default::default()
    }
}
