//! Utils is shared functions and constants for the controller

use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::{
    api::{
        apps::v1::{
            Deployment, DeploymentSpec, DeploymentStatus, StatefulSet, StatefulSetSpec,
            StatefulSetStatus,
        },
        core::v1::{Service, ServiceSpec, ServiceStatus},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};

use crate::cluster::search_rpc::SearchRpcClient;
use crate::CONTROLLER_NAME;

use kube::{
    api::{DeleteParams, Patch, PatchParams},
    client::Client,
    core::ObjectMeta,
    Api,
};

/// Operator Context
pub struct Context<R> {
    /// Kube client
    pub k_client: Client,
    /// Client for the search cluster admin API
    pub rpc_client: R,
}

impl<R> Context<R>
where
    R: SearchRpcClient,
{
    /// Create new context
    pub fn new(k_client: Client, rpc_client: R) -> Self {
        Context {
            k_client,
            rpc_client,
        }
    }
}

/// Apply a Service with the given labels
pub async fn apply_service(
    cx: Arc<Context<impl SearchRpcClient>>,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    labels: Option<BTreeMap<String, String>>,
    spec: ServiceSpec,
) -> Result<Option<ServiceStatus>, kube::error::Error> {
    let serverside = PatchParams::apply(CONTROLLER_NAME);
    let services: Api<Service> = Api::namespaced(cx.k_client.clone(), ns);

    // Server-side apply service
    let service: Service = Service {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            owner_references: Some(orefs),
            labels,
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        ..Default::default()
    };
    let service = services
        .patch(name, &serverside, &Patch::Apply(service))
        .await?;
    Ok(service.status)
}

/// Delete a service in namespace
pub async fn delete_service(
    cx: Arc<Context<impl SearchRpcClient>>,
    ns: &str,
    name: &str,
) -> Result<(), kube::error::Error> {
    let services: Api<Service> = Api::namespaced(cx.k_client.clone(), ns);

    match services.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(e) => Err(e),
    }
}

/// Apply a stateful set in namespace with the given labels
pub async fn apply_stateful_set(
    cx: Arc<Context<impl SearchRpcClient>>,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    labels: Option<BTreeMap<String, String>>,
    spec: StatefulSetSpec,
) -> Result<Option<StatefulSetStatus>, kube::error::Error> {
    let serverside = PatchParams::apply(CONTROLLER_NAME);
    let stateful_sets: Api<StatefulSet> = Api::namespaced(cx.k_client.clone(), ns);

    // Server-side apply stateful_set
    let stateful_set: StatefulSet = StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            owner_references: Some(orefs),
            labels,
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        ..Default::default()
    };
    let stateful_set = stateful_sets
        .patch(name, &serverside, &Patch::Apply(stateful_set))
        .await?;
    Ok(stateful_set.status)
}

/// Delete a stateful set in namespace
pub async fn delete_stateful_set(
    cx: Arc<Context<impl SearchRpcClient>>,
    ns: &str,
    name: &str,
) -> Result<(), kube::error::Error> {
    let stateful_sets: Api<StatefulSet> = Api::namespaced(cx.k_client.clone(), ns);

    match stateful_sets.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(e) => Err(e),
    }
}

/// Apply a deployment in namespace with the given labels
pub async fn apply_deployment(
    cx: Arc<Context<impl SearchRpcClient>>,
    ns: &str,
    orefs: Vec<OwnerReference>,
    name: &str,
    labels: Option<BTreeMap<String, String>>,
    spec: DeploymentSpec,
) -> Result<Option<DeploymentStatus>, kube::error::Error> {
    let serverside = PatchParams::apply(CONTROLLER_NAME);
    let deployments: Api<Deployment> = Api::namespaced(cx.k_client.clone(), ns);

    // Server-side apply deployment
    let deployment: Deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            owner_references: Some(orefs),
            labels,
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        ..Default::default()
    };
    let deployment = deployments
        .patch(name, &serverside, &Patch::Apply(deployment))
        .await?;
    Ok(deployment.status)
}

/// Delete a deployment in namespace
pub async fn delete_deployment(
    cx: Arc<Context<impl SearchRpcClient>>,
    ns: &str,
    name: &str,
) -> Result<(), kube::error::Error> {
    let deployments: Api<Deployment> = Api::namespaced(cx.k_client.clone(), ns);

    match deployments.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(e) => Err(e),
    }
}
