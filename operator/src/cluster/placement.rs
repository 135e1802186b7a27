use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, PodSpec, PodTemplateSpec, Toleration};

use crate::cluster::NodePoolSpec;

/// Placement constraints of a node pool.
///
/// Placement itself is delegated to the scheduler, the operator only wires
/// the declared constraints through to the pod template.
#[derive(Default, Clone)]
pub struct PlacementConfig {
    node_selector: Option<BTreeMap<String, String>>,
    affinity: Option<Affinity>,
    tolerations: Option<Vec<Toleration>>,
}

impl From<&NodePoolSpec> for PlacementConfig {
    fn from(value: &NodePoolSpec) -> Self {
        Self {
            node_selector: value.node_selector.clone(),
            affinity: value.affinity.clone(),
            tolerations: value.tolerations.clone(),
        }
    }
}

impl PlacementConfig {
    pub fn apply_to_pod_template(&self, pod_template: PodTemplateSpec) -> PodTemplateSpec {
        PodTemplateSpec {
            spec: pod_template.spec.map(|spec| PodSpec {
                node_selector: self.node_selector.clone().or(spec.node_selector),
                affinity: self.affinity.clone().or(spec.affinity),
                tolerations: self.tolerations.clone().or(spec.tolerations),
                ..spec
            }),
            ..pod_template
        }
    }
}
