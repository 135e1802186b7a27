use k8s_openapi::api::{
    apps::v1::DeploymentSpec,
    core::v1::{
        Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, Probe,
        ResourceRequirements, SecretKeySelector, ServicePort, ServiceSpec, TCPSocketAction,
    },
};
use k8s_openapi::apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString};

use crate::cluster::node_set::{override_env_vars, ClusterConfig};
use crate::cluster::DashboardsSpec;
use crate::labels::{cluster_labels_extend, selector_labels};

const DASHBOARDS_PORT: i32 = 5601;

/// Name of the dashboards workload and endpoint.
pub fn deployment_name(cluster: &str) -> String {
    format!("{cluster}-dashboards")
}

/// Resolved dashboards config.
pub struct DashboardsConfig {
    pub enable: bool,
    pub replicas: i32,
    pub image: String,
    pub resources: ResourceRequirements,
    pub additional_config: Option<std::collections::BTreeMap<String, String>>,
    pub credentials_secret: Option<String>,
}

impl DashboardsConfig {
    /// Resolve the dashboards spec against the cluster version.
    pub fn from_spec(spec: Option<&DashboardsSpec>, cluster_version: &str) -> Self {
        let spec = spec.cloned().unwrap_or_default();
        let version = spec.version.unwrap_or_else(|| cluster_version.to_owned());
        Self {
            enable: spec.enable.unwrap_or_default(),
            replicas: spec.replicas.unwrap_or(1),
            image: spec.image.unwrap_or_else(|| {
                format!("docker.io/opensearchproject/opensearch-dashboards:{version}")
            }),
            resources: spec.resources.unwrap_or_default(),
            additional_config: spec.additional_config,
            credentials_secret: spec.credentials_secret,
        }
    }
}

fn env_vars(cluster: &ClusterConfig, config: &DashboardsConfig) -> Vec<EnvVar> {
    let mut env = vec![
        EnvVar {
            name: "OPENSEARCH_HOSTS".to_owned(),
            value: Some(format!(
                "http://{}:{}",
                cluster.service_name, cluster.http_port
            )),
            ..Default::default()
        },
        EnvVar {
            name: "SERVER_HOST".to_owned(),
            value: Some("0.0.0.0".to_owned()),
            ..Default::default()
        },
    ];
    if let Some(secret) = &config.credentials_secret {
        for (name, key) in [
            ("OPENSEARCH_USERNAME", "username"),
            ("OPENSEARCH_PASSWORD", "password"),
        ] {
            env.push(EnvVar {
                name: name.to_owned(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: Some(secret.clone()),
                        key: key.to_owned(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
    }
    override_env_vars(&mut env, &config.additional_config);
    env.sort_unstable_by(|a, b| a.name.cmp(&b.name));
    env
}

/// Workload spec of the dashboards companion service.
pub fn deployment_spec(cluster: &ClusterConfig, config: &DashboardsConfig) -> DeploymentSpec {
    let name = deployment_name(&cluster.name);
    DeploymentSpec {
        replicas: Some(config.replicas),
        selector: LabelSelector {
            match_labels: selector_labels(&name),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(kube::core::ObjectMeta {
                labels: cluster_labels_extend(&cluster.name, selector_labels(&name)),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "dashboards".to_owned(),
                    image: Some(config.image.clone()),
                    env: Some(env_vars(cluster, config)),
                    ports: Some(vec![ContainerPort {
                        container_port: DASHBOARDS_PORT,
                        name: Some("http".to_owned()),
                        ..Default::default()
                    }]),
                    resources: Some(config.resources.clone()),
                    readiness_probe: Some(Probe {
                        tcp_socket: Some(TCPSocketAction {
                            port: IntOrString::Int(DASHBOARDS_PORT),
                            ..Default::default()
                        }),
                        initial_delay_seconds: Some(10),
                        period_seconds: Some(20),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        ..Default::default()
    }
}

/// Routable endpoint of the dashboards service.
pub fn service_spec(cluster: &str) -> ServiceSpec {
    ServiceSpec {
        ports: Some(vec![ServicePort {
            port: DASHBOARDS_PORT,
            name: Some("http".to_owned()),
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        }]),
        selector: selector_labels(&deployment_name(cluster)),
        type_: Some("ClusterIP".to_owned()),
        ..Default::default()
    }
}
