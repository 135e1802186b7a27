use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        EmptyDirVolumeSource, HostPathVolumeSource, PersistentVolumeClaim,
        PersistentVolumeClaimSpec, ResourceRequirements, Volume,
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::core::ObjectMeta;

use crate::cluster::NodePoolSpec;

/// Name of the volume holding cluster data inside member pods.
pub const DATA_VOLUME_NAME: &str = "data";

const DEFAULT_DISK_SIZE: &str = "30Gi";

/// Resolved persistence source for a node pool.
///
/// The spec allows at most one source, `from_spec` assumes the spec has been
/// validated and falls back to an ephemeral emptyDir volume.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceConfig {
    /// Data lives on an ephemeral volume, lost on restart.
    EmptyDir(EmptyDirVolumeSource),
    /// Data lives on a path of the host.
    HostPath(HostPathVolumeSource),
    /// Data lives on a dedicated persistent volume claim per member.
    Pvc(PvcConfig),
}

/// Resolved options for persistent volume claims.
#[derive(Debug, Clone, PartialEq)]
pub struct PvcConfig {
    /// Name of the storage class.
    pub storage_class: Option<String>,
    /// Access modes of the claim.
    pub access_modes: Vec<String>,
    /// Requested disk size.
    pub size: Quantity,
}

impl PersistenceConfig {
    /// Resolve the persistence source of a pool.
    pub fn from_spec(pool: &NodePoolSpec) -> Self {
        let size = pool
            .disk_size
            .clone()
            .unwrap_or_else(|| Quantity(DEFAULT_DISK_SIZE.to_owned()));
        match &pool.persistence {
            Some(persistence) => {
                if let Some(pvc) = &persistence.pvc {
                    Self::Pvc(PvcConfig {
                        storage_class: pvc.storage_class.clone(),
                        access_modes: pvc
                            .access_modes
                            .clone()
                            .unwrap_or_else(|| vec!["ReadWriteOnce".to_owned()]),
                        size,
                    })
                } else if let Some(host_path) = &persistence.host_path {
                    Self::HostPath(host_path.clone())
                } else if let Some(empty_dir) = &persistence.empty_dir {
                    Self::EmptyDir(empty_dir.clone())
                } else {
                    Self::EmptyDir(Default::default())
                }
            }
            None => Self::EmptyDir(Default::default()),
        }
    }

    /// Volume claim templates for the workload, present only for PVC persistence.
    pub fn volume_claim_templates(&self) -> Option<Vec<PersistentVolumeClaim>> {
        match self {
            Self::Pvc(config) => Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(DATA_VOLUME_NAME.to_owned()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(config.access_modes.clone()),
                    storage_class_name: config.storage_class.clone(),
                    resources: Some(ResourceRequirements {
                        requests: Some(BTreeMap::from_iter(vec![(
                            "storage".to_owned(),
                            config.size.clone(),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            _ => None,
        }
    }

    /// Pod volume for the data path, present for non PVC persistence.
    pub fn volume(&self) -> Option<Volume> {
        match self {
            Self::Pvc(_) => None,
            Self::EmptyDir(source) => Some(Volume {
                name: DATA_VOLUME_NAME.to_owned(),
                empty_dir: Some(source.clone()),
                ..Default::default()
            }),
            Self::HostPath(source) => Some(Volume {
                name: DATA_VOLUME_NAME.to_owned(),
                host_path: Some(source.clone()),
                ..Default::default()
            }),
        }
    }
}
