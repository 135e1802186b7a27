use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::StatefulSetSpec,
    core::v1::{
        Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
        SecretVolumeSource, SecurityContext, ServicePort, ServiceSpec, TCPSocketAction, Volume,
        VolumeMount,
    },
};
use k8s_openapi::apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString};
use kube::ResourceExt;

use crate::cluster::{
    discovery,
    placement::PlacementConfig,
    storage::{PersistenceConfig, DATA_VOLUME_NAME},
    NodePoolSpec, SearchCluster, TlsSpec,
};
use crate::labels::{cluster_labels_extend, member_selector_labels, selector_labels};

/// Port members use to talk to each other.
pub const TRANSPORT_PORT: i32 = 9300;

const SEARCH_CONTAINER_NAME: &str = "opensearch";
const DATA_PATH: &str = "/usr/share/opensearch/data";
const TLS_PATH: &str = "/usr/share/opensearch/config/tls";
const DEFAULT_JVM_OPTS: &str = "-Xmx512M -Xms512M";

/// Workload identity of a node pool.
pub fn stateful_set_name(cluster: &str, component: &str) -> String {
    format!("{cluster}-{component}")
}

/// Name of the routable endpoint dedicated to a node pool.
pub fn pool_service_name(cluster_service: &str, component: &str) -> String {
    format!("{cluster_service}-{component}")
}

/// Top level config shared by every node pool of a cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub name: String,
    pub version: String,
    pub image: String,
    pub http_port: i32,
    pub service_name: String,
    pub additional_config: Option<BTreeMap<String, String>>,
    pub drain_data_nodes: bool,
    pub set_vm_max_map_count: bool,
    pub default_repo: Option<String>,
    pub tls: Option<TlsSpec>,
    pub security_config_secret: Option<String>,
}

impl ClusterConfig {
    pub fn from_cluster(cluster: &SearchCluster) -> Self {
        let name = cluster.name_any();
        let general = &cluster.spec.general;
        Self {
            version: general.version.clone(),
            image: general.image(),
            http_port: general.http_port(),
            service_name: general.service_name.clone().unwrap_or_else(|| name.clone()),
            additional_config: general.additional_config.clone(),
            drain_data_nodes: general.drain_data_nodes.unwrap_or_default(),
            set_vm_max_map_count: general.set_vm_max_map_count.unwrap_or_default(),
            default_repo: general.default_repo.clone(),
            tls: cluster.spec.security.as_ref().and_then(|sec| sec.tls.clone()),
            security_config_secret: cluster
                .spec
                .security
                .as_ref()
                .and_then(|sec| sec.config.as_ref())
                .and_then(|config| config.security_config_secret.clone()),
            name,
        }
    }

    /// Address of the cluster admin API inside the cluster network.
    pub fn admin_addr(&self, ns: &str) -> String {
        format!(
            "http://{}.{ns}.svc:{}",
            self.service_name, self.http_port
        )
    }
}

/// Resolved config of one node pool.
#[derive(Clone)]
pub struct NodeSetConfig {
    pub component: String,
    pub replicas: i32,
    pub roles: Vec<String>,
    pub resources: ResourceRequirements,
    pub jvm: String,
    pub persistence: PersistenceConfig,
    pub placement: PlacementConfig,
    pub additional_config: Option<BTreeMap<String, String>>,
    pub manager_eligible: bool,
    pub data: bool,
}

impl From<&NodePoolSpec> for NodeSetConfig {
    fn from(value: &NodePoolSpec) -> Self {
        Self {
            component: value.component.clone(),
            replicas: value.replicas,
            roles: value.roles.clone(),
            resources: value.resources.clone().unwrap_or_default(),
            jvm: value
                .jvm
                .clone()
                .unwrap_or_else(|| DEFAULT_JVM_OPTS.to_owned()),
            persistence: PersistenceConfig::from_spec(value),
            placement: PlacementConfig::from(value),
            additional_config: value.additional_config.clone(),
            manager_eligible: value.is_manager_eligible(),
            data: value.is_data(),
        }
    }
}

/// Apply override env vars to an existing env var list
pub fn override_env_vars(env: &mut Vec<EnvVar>, overrides: &Option<BTreeMap<String, String>>) {
    if let Some(override_env) = &overrides {
        override_env.iter().for_each(|(key, value)| {
            if let Some((pos, _)) = env.iter().enumerate().find(|(_, var)| &var.name == key) {
                env.swap_remove(pos);
            }
            env.push(EnvVar {
                name: key.to_string(),
                value: Some(value.to_string()),
                ..Default::default()
            })
        });
    }
}

/// Environment of one member container.
///
/// Entries derive from the cluster config, the pool's roles, discovery wiring
/// and user supplied additional config, where pool entries override cluster
/// entries. Sorted by name so the compiled spec is deterministic.
pub fn env_vars(
    cluster: &ClusterConfig,
    pool: &NodeSetConfig,
    initial_master_nodes: Option<&str>,
) -> Vec<EnvVar> {
    let mut env = vec![
        EnvVar {
            name: "cluster.name".to_owned(),
            value: Some(cluster.name.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "network.host".to_owned(),
            value: Some("0.0.0.0".to_owned()),
            ..Default::default()
        },
        EnvVar {
            name: "http.port".to_owned(),
            value: Some(cluster.http_port.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "discovery.seed_hosts".to_owned(),
            value: Some(discovery::service_name(&cluster.name)),
            ..Default::default()
        },
        EnvVar {
            name: "node.roles".to_owned(),
            value: Some(pool.roles.join(",")),
            ..Default::default()
        },
        EnvVar {
            name: "OPENSEARCH_JAVA_OPTS".to_owned(),
            value: Some(pool.jvm.clone()),
            ..Default::default()
        },
    ];
    if let Some(initial_master_nodes) = initial_master_nodes {
        env.push(EnvVar {
            name: "cluster.initial_master_nodes".to_owned(),
            value: Some(initial_master_nodes.to_owned()),
            ..Default::default()
        });
    }
    if let Some(default_repo) = &cluster.default_repo {
        env.push(EnvVar {
            name: "cluster.default_repo".to_owned(),
            value: Some(default_repo.clone()),
            ..Default::default()
        });
    }
    override_env_vars(&mut env, &cluster.additional_config);
    override_env_vars(&mut env, &pool.additional_config);
    // Sort env vars so the compiled spec is deterministic
    env.sort_unstable_by(|a, b| a.name.cmp(&b.name));
    env
}

fn tls_volumes(tls: &Option<TlsSpec>) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    let Some(tls) = tls else {
        return (volumes, mounts);
    };
    for (interface, secret) in [
        ("transport", tls.transport.as_ref().and_then(|t| t.secret.as_ref())),
        ("http", tls.http.as_ref().and_then(|t| t.secret.as_ref())),
    ] {
        if let Some(secret) = secret {
            let name = format!("tls-{interface}");
            volumes.push(Volume {
                name: name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name,
                mount_path: format!("{TLS_PATH}-{interface}"),
                read_only: Some(true),
                ..Default::default()
            });
        }
    }
    (volumes, mounts)
}

fn sysctl_init_container() -> Container {
    Container {
        name: "init-sysctl".to_owned(),
        image: Some("docker.io/library/busybox:1.36".to_owned()),
        command: Some(vec![
            "sysctl".to_owned(),
            "-w".to_owned(),
            "vm.max_map_count=262144".to_owned(),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod template shared by node pool and bootstrap workloads.
fn member_pod_template(
    cluster: &ClusterConfig,
    app: &str,
    image: &str,
    env: Vec<EnvVar>,
    resources: ResourceRequirements,
    persistence: &PersistenceConfig,
) -> PodTemplateSpec {
    let (mut volumes, mut mounts) = tls_volumes(&cluster.tls);
    // The security plugin configuration is maintained by an external
    // collaborator, it is only mounted here.
    if let Some(secret) = &cluster.security_config_secret {
        volumes.push(Volume {
            name: "security-config".to_owned(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "security-config".to_owned(),
            mount_path: "/usr/share/opensearch/config/security".to_owned(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    mounts.push(VolumeMount {
        mount_path: DATA_PATH.to_owned(),
        name: DATA_VOLUME_NAME.to_owned(),
        ..Default::default()
    });
    if let Some(volume) = persistence.volume() {
        volumes.push(volume);
    }
    PodTemplateSpec {
        metadata: Some(kube::core::ObjectMeta {
            labels: cluster_labels_extend(&cluster.name, {
                let mut labels = selector_labels(app).expect("selector labels should exist");
                labels.extend(
                    member_selector_labels(&cluster.name).expect("member labels should exist"),
                );
                Some(labels)
            }),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            init_containers: cluster
                .set_vm_max_map_count
                .then(|| vec![sysctl_init_container()]),
            containers: vec![Container {
                name: SEARCH_CONTAINER_NAME.to_owned(),
                image: Some(image.to_owned()),
                env: Some(env),
                ports: Some(vec![
                    ContainerPort {
                        container_port: cluster.http_port,
                        name: Some("http".to_owned()),
                        ..Default::default()
                    },
                    ContainerPort {
                        container_port: TRANSPORT_PORT,
                        name: Some("transport".to_owned()),
                        ..Default::default()
                    },
                ]),
                resources: Some(resources),
                readiness_probe: Some(Probe {
                    tcp_socket: Some(TCPSocketAction {
                        port: IntOrString::Int(cluster.http_port),
                        ..Default::default()
                    }),
                    initial_delay_seconds: Some(10),
                    period_seconds: Some(20),
                    ..Default::default()
                }),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            volumes: (!volumes.is_empty()).then_some(volumes),
            ..Default::default()
        }),
    }
}

/// Compile the workload spec of a node pool.
///
/// The image is passed separately from the cluster config because moving it
/// is the upgrade orchestrator's exclusive decision.
pub fn stateful_set_spec(
    cluster: &ClusterConfig,
    pool: &NodeSetConfig,
    image: &str,
    initial_master_nodes: Option<&str>,
) -> StatefulSetSpec {
    let name = stateful_set_name(&cluster.name, &pool.component);
    let env = env_vars(cluster, pool, initial_master_nodes);
    let template = member_pod_template(
        cluster,
        &name,
        image,
        env,
        pool.resources.clone(),
        &pool.persistence,
    );
    StatefulSetSpec {
        replicas: Some(pool.replicas),
        service_name: pool_service_name(&cluster.service_name, &pool.component),
        selector: LabelSelector {
            match_labels: selector_labels(&name),
            ..Default::default()
        },
        pod_management_policy: Some("Parallel".to_owned()),
        template: pool.placement.apply_to_pod_template(template),
        volume_claim_templates: pool.persistence.volume_claim_templates(),
        ..Default::default()
    }
}

/// Routable endpoint dedicated to one node pool.
pub fn pool_service_spec(cluster: &ClusterConfig, component: &str) -> ServiceSpec {
    let sts_name = stateful_set_name(&cluster.name, component);
    ServiceSpec {
        ports: Some(vec![ServicePort {
            port: cluster.http_port,
            name: Some("http".to_owned()),
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        }]),
        selector: selector_labels(&sts_name),
        type_: Some("ClusterIP".to_owned()),
        ..Default::default()
    }
}

/// Cluster wide routable endpoint selecting every member pod.
pub fn cluster_service_spec(cluster: &ClusterConfig) -> ServiceSpec {
    ServiceSpec {
        ports: Some(vec![
            ServicePort {
                port: cluster.http_port,
                name: Some("http".to_owned()),
                protocol: Some("TCP".to_owned()),
                ..Default::default()
            },
            ServicePort {
                port: TRANSPORT_PORT,
                name: Some("transport".to_owned()),
                protocol: Some("TCP".to_owned()),
                ..Default::default()
            },
        ]),
        selector: member_selector_labels(&cluster.name),
        type_: Some("ClusterIP".to_owned()),
        ..Default::default()
    }
}
