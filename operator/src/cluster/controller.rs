use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use futures::stream::StreamExt;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec},
        core::v1::{Secret, Service, ServiceSpec},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    ByteString,
};
use kube::{
    api::{ListParams, Patch, PatchParams},
    client::Client,
    core::{object::HasSpec, ObjectMeta},
    runtime::{
        controller::Action,
        watcher::{self, Config},
        Controller,
    },
    Api, Resource, ResourceExt,
};
use tracing::{debug, error, info, warn};

use crate::cluster::{
    bootstrap,
    dashboards::{self, DashboardsConfig},
    discovery,
    node_set::{self, ClusterConfig, NodeSetConfig},
    search_rpc::{AdminCredentials, HttpRpcClient, SearchRpcClient},
    status::{ComponentLedger, UPGRADER},
    upgrade::{self, PoolObservation},
    ClusterPhase, ComponentState, InvalidSpec, SearchCluster, SearchClusterStatus,
};
use crate::labels::{
    cluster_labels, cluster_labels_extend, cluster_selector, MANAGED_BY_LABEL_SELECTOR,
    NODE_POOL_LABEL,
};
use crate::utils::{
    apply_deployment, apply_service, apply_stateful_set, delete_deployment, delete_service,
    delete_stateful_set, Context,
};

/// Handle errors during reconciliation.
fn on_error(
    _cluster: Arc<SearchCluster>,
    error: &Error,
    _context: Arc<Context<impl SearchRpcClient>>,
) -> Action {
    match error {
        // A contradictory spec cannot be retried into existence.
        Error::InvalidSpec { .. } => Action::await_change(),
        _ => Action::requeue(Duration::from_secs(5)),
    }
}

/// Errors produced by the reconcile function.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The spec contradicts itself. Surfaced through the observed status and
    /// not retried until the spec changes.
    #[error("invalid spec: {source}")]
    InvalidSpec {
        #[from]
        source: InvalidSpec,
    },
    /// A child resource exists but is not owned by this cluster.
    /// It is never adopted automatically.
    #[error("resource {name} exists but is not owned by this cluster")]
    OwnershipConflict {
        /// Name of the conflicting resource.
        name: String,
    },
    /// Draining a node pool did not complete. The image change stays pending
    /// and the drain is retried on the next pass.
    #[error("drain of node pool {component} has not completed")]
    DrainTimeout {
        /// Pool whose members are still relocating data.
        component: String,
    },
    /// App error.
    #[error("App error: {source}")]
    App {
        #[from]
        source: anyhow::Error,
    },
    /// Kube error.
    #[error("Kube error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },
}

/// Start a controller for the SearchCluster CRD.
pub async fn run() {
    let k_client = Client::try_default().await.unwrap();
    let context = Arc::new(Context::new(k_client.clone(), HttpRpcClient));

    let clusters: Api<SearchCluster> = Api::all(k_client.clone());
    let stateful_sets = Api::<StatefulSet>::all(k_client.clone());
    let services = Api::<Service>::all(k_client.clone());
    let deployments = Api::<Deployment>::all(k_client.clone());

    Controller::new(clusters, Config::default())
        .owns(
            stateful_sets,
            watcher::Config::default().labels(MANAGED_BY_LABEL_SELECTOR),
        )
        .owns(
            services,
            watcher::Config::default().labels(MANAGED_BY_LABEL_SELECTOR),
        )
        .owns(
            deployments,
            watcher::Config::default().labels(MANAGED_BY_LABEL_SELECTOR),
        )
        .run(reconcile, on_error, context)
        .for_each(|rec_res| async move {
            match rec_res {
                Ok((cluster, _)) => {
                    debug!(cluster.name, "reconcile success");
                }
                Err(err) => {
                    error!(?err, "reconcile error")
                }
            }
        })
        .await;
}

/// Perform a reconcile pass for the SearchCluster CRD.
///
/// Every step is idempotent: child resources are read first and written only
/// when the desired state differs, so re-running a pass with no external
/// change performs no writes.
pub(crate) async fn reconcile(
    cluster: Arc<SearchCluster>,
    cx: Arc<Context<impl SearchRpcClient>>,
) -> Result<Action, Error> {
    let spec = cluster.spec();
    let name = cluster.name_any();
    let ns = cluster
        .namespace()
        .ok_or_else(|| anyhow::anyhow!("SearchCluster {name} has no namespace"))?;
    debug!(?spec, "reconcile");

    let mut status = cluster.status.clone().unwrap_or_default();

    if let Err(invalid) = spec.validate() {
        status.phase = ClusterPhase::Pending;
        if cluster.status.as_ref() != Some(&status) {
            patch_status(cx.clone(), &ns, &name, &status).await?;
        }
        return Err(invalid.into());
    }

    let config = ClusterConfig::from_cluster(&cluster);
    let pools: Vec<NodeSetConfig> = spec.node_pools.iter().map(NodeSetConfig::from).collect();
    let orefs: Vec<_> = cluster
        .controller_owner_ref(&())
        .map(|oref| vec![oref])
        .unwrap_or_default();
    let uid = cluster.meta().uid.clone();

    // The discovery endpoint and the cluster wide endpoint are created once
    // and never deleted while the cluster exists.
    ensure_service(
        cx.clone(),
        &ns,
        &orefs,
        &uid,
        &name,
        &discovery::service_name(&name),
        discovery::service_spec(&name),
    )
    .await?;
    ensure_service(
        cx.clone(),
        &ns,
        &orefs,
        &uid,
        &name,
        &config.service_name,
        node_set::cluster_service_spec(&config),
    )
    .await?;

    // Probe the cluster's admin interface. Failures are expected while the
    // first quorum has not formed yet.
    let addr = config.admin_addr(&ns);
    let creds = admin_credentials(cx.clone(), &ns, &cluster).await?;
    let stable = match &creds {
        Some(creds) => match cx.rpc_client.cluster_health(&addr, creds).await {
            Ok(health) => health.is_stable(),
            Err(err) => {
                debug!(%err, "cluster health probe failed");
                false
            }
        },
        None => false,
    };

    // Bootstrap: seed the first quorum, retire once it has formed.
    // The initialized flag latches, it is never cleared again.
    if !status.initialized && stable {
        info!(cluster = %name, "cluster formed its first quorum");
        status.initialized = true;
    }
    apply_bootstrap(cx.clone(), &ns, &orefs, &uid, &config, status.initialized).await?;
    let initial_master_nodes = (!status.initialized).then(|| bootstrap::seed_node_name(&name));

    // Observe the current workloads before deciding any version move.
    let sts_api: Api<StatefulSet> = Api::namespaced(cx.k_client.clone(), &ns);
    let mut observations = BTreeMap::new();
    let mut existing_sets: BTreeMap<String, StatefulSet> = BTreeMap::new();
    for pool in &pools {
        let sts_name = node_set::stateful_set_name(&name, &pool.component);
        if let Some(existing) = sts_api.get_opt(&sts_name).await? {
            observations.insert(pool.component.clone(), observe(&existing));
            existing_sets.insert(pool.component.clone(), existing);
        }
    }

    // Upgrade orchestration: confirm finished rollouts, then start at most
    // one new pool, then decide the image each workload may run this pass.
    let mut ledger = ComponentLedger::new(status.components_status.clone());
    let target_image = config.image.clone();
    for pool in &pools {
        let upgrading = ledger.get(UPGRADER, &pool.component).map(|entry| entry.status)
            == Some(ComponentState::Upgrading);
        let done = observations
            .get(&pool.component)
            .map(|observed| observed.image == target_image && observed.rolled_out)
            .unwrap_or(false);
        if upgrading && done && stable {
            let mut cleared = true;
            if config.drain_data_nodes && pool.data {
                cleared = match &creds {
                    Some(creds) => match cx.rpc_client.clear_drain(&addr, creds).await {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(%err, component = %pool.component, "clearing drain exclusions failed");
                            false
                        }
                    },
                    None => false,
                };
            }
            if cleared {
                info!(component = %pool.component, "node pool upgraded");
                ledger.upsert(upgrade::upgraded(&pool.component));
            }
        }
    }
    let order = upgrade::upgrade_order(&pools);
    if stable {
        if let Some(component) = upgrade::next_to_upgrade(&order, &observations, &target_image, &ledger)
        {
            info!(component, "node pool upgrading");
            ledger.upsert(upgrade::upgrading(component));
        }
    }
    let mut drain_pending = None;
    let mut images = BTreeMap::new();
    for pool in &pools {
        let mut image =
            upgrade::image_allowed(&pool.component, &observations, &target_image, &ledger);
        let upgrading = ledger.get(UPGRADER, &pool.component).map(|entry| entry.status)
            == Some(ComponentState::Upgrading);
        let current = observations.get(&pool.component).map(|o| o.image.clone());
        if upgrading
            && config.drain_data_nodes
            && pool.data
            && current.as_deref() != Some(image.as_str())
        {
            // Members must be drained before they restart. An incomplete or
            // failed drain holds the old image, the pool stays Upgrading and
            // the drain is retried next pass.
            let drained = match &creds {
                Some(creds) => {
                    let workload = node_set::stateful_set_name(&name, &pool.component);
                    match cx.rpc_client.drain_pool(&addr, creds, &workload).await {
                        Ok(drain) => drain.is_complete(),
                        Err(err) => {
                            warn!(%err, component = %pool.component, "drain call failed");
                            false
                        }
                    }
                }
                None => {
                    warn!(
                        component = %pool.component,
                        "no admin credentials, cannot drain"
                    );
                    false
                }
            };
            if !drained {
                drain_pending = Some(pool.component.clone());
                if let Some(current) = current {
                    image = current;
                }
            }
        }
        images.insert(pool.component.clone(), image);
    }

    // Apply structural state per pool. A failure aborts only the affected
    // pool, the rest of the pass still completes.
    let mut pool_error = None;
    for pool in &pools {
        let image = &images[&pool.component];
        if let Err(err) = apply_node_pool(
            cx.clone(),
            &ns,
            &orefs,
            &uid,
            &config,
            pool,
            existing_sets.get(&pool.component),
            image,
            initial_master_nodes.as_deref(),
        )
        .await
        {
            error!(%err, component = %pool.component, "applying node pool failed");
            pool_error = Some(err);
        }
    }

    // Remove workloads of pools no longer present in spec. Deletion cascades
    // to pods through the stamped owner references.
    let desired: BTreeSet<&str> = pools.iter().map(|pool| pool.component.as_str()).collect();
    let listed = sts_api
        .list(&ListParams::default().labels(&cluster_selector(&name)))
        .await?;
    for sts in listed.items {
        let Some(component) = sts.labels().get(NODE_POOL_LABEL).cloned() else {
            continue;
        };
        if !desired.contains(component.as_str()) {
            info!(component = %component, "removing node pool no longer in spec");
            delete_stateful_set(cx.clone(), &ns, &sts.name_any()).await?;
            delete_service(
                cx.clone(),
                &ns,
                &node_set::pool_service_name(&config.service_name, &component),
            )
            .await?;
        }
    }

    apply_dashboards(cx.clone(), &ns, &orefs, &uid, &config, spec).await?;

    // The reported version advances only once every workload runs the target
    // image and no component is still migrating; the resolved transition's
    // ledger entries are pruned with it.
    if pool_error.is_none() && upgrade::can_certify(&observations, &target_image, &ledger) {
        if ledger.has_component(UPGRADER) {
            ledger.prune_component(UPGRADER);
        }
        if status.version.as_deref() != Some(config.version.as_str()) {
            info!(version = %config.version, "cluster version confirmed");
            status.version = Some(config.version.clone());
        }
    }

    status.phase = if status.initialized {
        ClusterPhase::Running
    } else {
        ClusterPhase::Pending
    };
    status.components_status = ledger.into_entries();

    if cluster.status.as_ref() != Some(&status) {
        patch_status(cx.clone(), &ns, &name, &status).await?;
    }

    if let Some(component) = drain_pending {
        return Err(Error::DrainTimeout { component });
    }
    if let Some(err) = pool_error {
        return Err(err);
    }
    Ok(Action::requeue(Duration::from_secs(30)))
}

/// Image and rollout state of an existing workload.
fn observe(existing: &StatefulSet) -> PoolObservation {
    let image = existing
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|pod| pod.containers.first())
        .and_then(|container| container.image.clone())
        .unwrap_or_default();
    let replicas = existing
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or_default();
    let rolled_out = existing
        .status
        .as_ref()
        .map(|status| {
            status.updated_replicas.unwrap_or_default() == replicas
                && status.ready_replicas.unwrap_or_default() == replicas
        })
        .unwrap_or(false);
    PoolObservation { image, rolled_out }
}

/// Fail when an existing resource does not carry this cluster's owner reference.
fn check_ownership(meta: &ObjectMeta, uid: &Option<String>, name: &str) -> Result<(), Error> {
    let Some(uid) = uid else {
        return Ok(());
    };
    let owned = meta
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|oref| &oref.uid == uid))
        .unwrap_or(false);
    if owned {
        Ok(())
    } else {
        Err(Error::OwnershipConflict {
            name: name.to_owned(),
        })
    }
}

/// Structural fields of a workload that may be updated in place.
/// The pod template carries the gated image, so an unreleased version change
/// never shows up as a diff here.
fn stateful_set_changed(existing: &StatefulSet, desired: &StatefulSetSpec) -> bool {
    match &existing.spec {
        None => true,
        Some(current) => {
            current.replicas != desired.replicas || current.template != desired.template
        }
    }
}

fn deployment_changed(existing: &Deployment, desired: &DeploymentSpec) -> bool {
    match &existing.spec {
        None => true,
        Some(current) => {
            current.replicas != desired.replicas || current.template != desired.template
        }
    }
}

/// Create a service if it does not exist yet.
async fn ensure_service(
    cx: Arc<Context<impl SearchRpcClient>>,
    ns: &str,
    orefs: &[OwnerReference],
    uid: &Option<String>,
    cluster_name: &str,
    name: &str,
    spec: ServiceSpec,
) -> Result<(), Error> {
    let services: Api<Service> = Api::namespaced(cx.k_client.clone(), ns);
    match services.get_opt(name).await? {
        Some(existing) => check_ownership(existing.meta(), uid, name),
        None => {
            apply_service(
                cx.clone(),
                ns,
                orefs.to_vec(),
                name,
                cluster_labels(cluster_name),
                spec,
            )
            .await?;
            Ok(())
        }
    }
}

/// Maintain the transient seed member while the cluster has not yet formed a
/// quorum; retire it once it has.
async fn apply_bootstrap(
    cx: Arc<Context<impl SearchRpcClient>>,
    ns: &str,
    orefs: &[OwnerReference],
    uid: &Option<String>,
    config: &ClusterConfig,
    initialized: bool,
) -> Result<(), Error> {
    let name = bootstrap::stateful_set_name(&config.name);
    let sts_api: Api<StatefulSet> = Api::namespaced(cx.k_client.clone(), ns);
    let existing = sts_api.get_opt(&name).await?;
    if initialized {
        if existing.is_some() {
            info!("retiring bootstrap seed member");
            delete_stateful_set(cx.clone(), ns, &name).await?;
        }
        return Ok(());
    }
    let desired = bootstrap::stateful_set_spec(config);
    match existing {
        Some(existing) => {
            check_ownership(existing.meta(), uid, &name)?;
            if stateful_set_changed(&existing, &desired) {
                apply_stateful_set(
                    cx.clone(),
                    ns,
                    orefs.to_vec(),
                    &name,
                    cluster_labels(&config.name),
                    desired,
                )
                .await?;
            }
        }
        None => {
            apply_stateful_set(
                cx.clone(),
                ns,
                orefs.to_vec(),
                &name,
                cluster_labels(&config.name),
                desired,
            )
            .await?;
        }
    }
    Ok(())
}

/// Apply one pool's workload and dedicated endpoint.
#[allow(clippy::too_many_arguments)]
async fn apply_node_pool(
    cx: Arc<Context<impl SearchRpcClient>>,
    ns: &str,
    orefs: &[OwnerReference],
    uid: &Option<String>,
    config: &ClusterConfig,
    pool: &NodeSetConfig,
    existing: Option<&StatefulSet>,
    image: &str,
    initial_master_nodes: Option<&str>,
) -> Result<(), Error> {
    let sts_name = node_set::stateful_set_name(&config.name, &pool.component);
    let desired = node_set::stateful_set_spec(config, pool, image, initial_master_nodes);
    let labels = cluster_labels_extend(
        &config.name,
        Some(BTreeMap::from_iter(vec![(
            NODE_POOL_LABEL.to_owned(),
            pool.component.clone(),
        )])),
    );
    match existing {
        Some(existing) => {
            check_ownership(existing.meta(), uid, &sts_name)?;
            if stateful_set_changed(existing, &desired) {
                apply_stateful_set(cx.clone(), ns, orefs.to_vec(), &sts_name, labels, desired)
                    .await?;
            }
        }
        None => {
            apply_stateful_set(cx.clone(), ns, orefs.to_vec(), &sts_name, labels, desired).await?;
        }
    }
    ensure_service(
        cx,
        ns,
        orefs,
        uid,
        &config.name,
        &node_set::pool_service_name(&config.service_name, &pool.component),
        node_set::pool_service_spec(config, &pool.component),
    )
    .await
}

/// Maintain the dashboards companion service.
async fn apply_dashboards(
    cx: Arc<Context<impl SearchRpcClient>>,
    ns: &str,
    orefs: &[OwnerReference],
    uid: &Option<String>,
    config: &ClusterConfig,
    spec: &crate::cluster::SearchClusterSpec,
) -> Result<(), Error> {
    let dash = DashboardsConfig::from_spec(spec.dashboards.as_ref(), &config.version);
    let name = dashboards::deployment_name(&config.name);
    let deployments: Api<Deployment> = Api::namespaced(cx.k_client.clone(), ns);
    let existing = deployments.get_opt(&name).await?;
    if !dash.enable {
        if existing.is_some() {
            delete_deployment(cx.clone(), ns, &name).await?;
            delete_service(cx.clone(), ns, &name).await?;
        }
        return Ok(());
    }
    let desired = dashboards::deployment_spec(config, &dash);
    match existing {
        Some(existing) => {
            check_ownership(existing.meta(), uid, &name)?;
            if deployment_changed(&existing, &desired) {
                apply_deployment(
                    cx.clone(),
                    ns,
                    orefs.to_vec(),
                    &name,
                    cluster_labels(&config.name),
                    desired,
                )
                .await?;
            }
        }
        None => {
            apply_deployment(
                cx.clone(),
                ns,
                orefs.to_vec(),
                &name,
                cluster_labels(&config.name),
                desired,
            )
            .await?;
        }
    }
    ensure_service(
        cx,
        ns,
        orefs,
        uid,
        &config.name,
        &name,
        dashboards::service_spec(&config.name),
    )
    .await
}

/// Resolve admin credentials from the externally managed secret.
async fn admin_credentials(
    cx: Arc<Context<impl SearchRpcClient>>,
    ns: &str,
    cluster: &SearchCluster,
) -> Result<Option<AdminCredentials>, Error> {
    let secret_name = cluster
        .spec
        .security
        .as_ref()
        .and_then(|security| security.config.as_ref())
        .and_then(|config| config.admin_credentials_secret.clone())
        .unwrap_or_else(|| format!("{}-admin-credentials", cluster.name_any()));
    let secrets: Api<Secret> = Api::namespaced(cx.k_client.clone(), ns);
    let Some(secret) = secrets.get_opt(&secret_name).await? else {
        return Ok(None);
    };
    match (
        secret_value(&secret, "username"),
        secret_value(&secret, "password"),
    ) {
        (Some(username), Some(password)) => Ok(Some(AdminCredentials { username, password })),
        _ => {
            warn!(
                secret = %secret_name,
                "admin credentials secret is missing username or password"
            );
            Ok(None)
        }
    }
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    if let Some(value) = secret
        .string_data
        .as_ref()
        .and_then(|data| data.get(key))
    {
        return Some(value.clone());
    }
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|ByteString(bytes)| String::from_utf8(bytes.clone()).ok())
}

async fn patch_status(
    cx: Arc<Context<impl SearchRpcClient>>,
    ns: &str,
    name: &str,
    status: &SearchClusterStatus,
) -> Result<(), kube::Error> {
    let clusters: Api<SearchCluster> = Api::namespaced(cx.k_client.clone(), ns);
    let _patched = clusters
        .patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;
    Ok(())
}

// Tests drive reconcile against the in-memory stub API server from stub.rs
// and a mocked admin API client.
#[cfg(test)]
mod tests {
    use super::{reconcile, Error};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use k8s_openapi::{
        api::apps::v1::StatefulSet,
        apimachinery::pkg::api::resource::Quantity,
    };
    use serde_json::json;
    use tracing_test::traced_test;

    use crate::cluster::{
        search_rpc::tests::MockSearchRpcClientTest,
        search_rpc::{ClusterHealth, DrainStatus},
        status::UPGRADER,
        stub::{ApiServerState, StubApiServer, WriteOp},
        ClusterPhase, ComponentState, ComponentStatus, Context, GeneralSpec, NodePoolSpec,
        SearchCluster, SearchClusterSpec, CLUSTER_MANAGER_ROLE, DATA_ROLE,
    };

    const NS: &str = "default";
    const OLD_IMAGE: &str = "docker.io/opensearchproject/opensearch:1.0.0";
    const NEW_IMAGE: &str = "docker.io/opensearchproject/opensearch:1.1.0";

    fn test_spec(version: &str) -> SearchClusterSpec {
        SearchClusterSpec {
            general: GeneralSpec {
                version: version.to_owned(),
                additional_config: Some(BTreeMap::from_iter(vec![(
                    "foo".to_owned(),
                    "bar".to_owned(),
                )])),
                ..Default::default()
            },
            node_pools: vec![
                NodePoolSpec {
                    component: "master".to_owned(),
                    replicas: 3,
                    roles: vec![CLUSTER_MANAGER_ROLE.to_owned()],
                    resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
                        limits: Some(BTreeMap::from_iter(vec![
                            ("cpu".to_owned(), Quantity("500m".to_owned())),
                            ("memory".to_owned(), Quantity("2Gi".to_owned())),
                        ])),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                NodePoolSpec {
                    component: "nodes".to_owned(),
                    replicas: 3,
                    roles: vec![DATA_ROLE.to_owned()],
                    ..Default::default()
                },
                NodePoolSpec {
                    component: "client".to_owned(),
                    replicas: 2,
                    roles: vec!["ingest".to_owned()],
                    additional_config: Some(BTreeMap::from_iter(vec![(
                        "baz".to_owned(),
                        "bat".to_owned(),
                    )])),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn seed_cluster(state: &Arc<Mutex<ApiServerState>>, cluster: &SearchCluster) {
        let mut state = state.lock().unwrap();
        state.insert("searchclusters", NS, "test", cluster);
        state.insert(
            "secrets",
            NS,
            "test-admin-credentials",
            &json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": { "name": "test-admin-credentials", "namespace": NS },
                "stringData": { "username": "admin", "password": "admin" },
            }),
        );
    }

    fn health_unavailable() -> MockSearchRpcClientTest {
        let mut mock = MockSearchRpcClientTest::new();
        mock.expect_cluster_health()
            .returning(|_, _| Err(anyhow::anyhow!("connection refused")));
        mock
    }

    fn health_stable() -> MockSearchRpcClientTest {
        let mut mock = MockSearchRpcClientTest::new();
        mock.expect_cluster_health()
            .returning(|_, _| Ok(ClusterHealth::Green));
        mock
    }

    async fn run_reconcile(
        state: &Arc<Mutex<ApiServerState>>,
        cluster: &SearchCluster,
        mock: MockSearchRpcClientTest,
    ) -> Result<kube::runtime::controller::Action, Error> {
        let (testctx, handle) = Context::test(mock);
        let server = StubApiServer::run(state.clone(), handle);
        let result = reconcile(Arc::new(cluster.clone()), testctx).await;
        server.abort();
        result
    }

    fn stored_cluster(state: &Arc<Mutex<ApiServerState>>) -> SearchCluster {
        state
            .lock()
            .unwrap()
            .get("searchclusters", NS, "test")
            .expect("cluster should be stored")
    }

    fn sts_image(state: &Arc<Mutex<ApiServerState>>, name: &str) -> String {
        let sts: StatefulSet = state
            .lock()
            .unwrap()
            .get("statefulsets", NS, name)
            .unwrap_or_else(|| panic!("{name} should exist"));
        sts.spec
            .and_then(|spec| spec.template.spec)
            .and_then(|pod| pod.containers.into_iter().next())
            .and_then(|container| container.image)
            .expect("image should be set")
    }

    fn sts_env(state: &Arc<Mutex<ApiServerState>>, name: &str) -> BTreeMap<String, String> {
        let sts: StatefulSet = state
            .lock()
            .unwrap()
            .get("statefulsets", NS, name)
            .unwrap_or_else(|| panic!("{name} should exist"));
        sts.spec
            .and_then(|spec| spec.template.spec)
            .and_then(|pod| pod.containers.into_iter().next())
            .and_then(|container| container.env)
            .map(|env| {
                env.into_iter()
                    .filter_map(|var| var.value.map(|value| (var.name, value)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn mark_rolled_out(state: &Arc<Mutex<ApiServerState>>, name: &str, replicas: i32) {
        state.lock().unwrap().set_status(
            "statefulsets",
            NS,
            name,
            json!({ "replicas": replicas, "updatedReplicas": replicas, "readyReplicas": replicas }),
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn reconcile_creates_cluster() {
        let state = Arc::new(Mutex::new(ApiServerState::default()));
        let cluster = SearchCluster::test().with_spec(test_spec("1.0.0"));
        seed_cluster(&state, &cluster);

        run_reconcile(&state, &cluster, health_unavailable())
            .await
            .expect("reconciler");

        // Exactly one workload and one endpoint per declared pool, each
        // carrying the cluster's owner reference.
        for component in ["master", "nodes", "client"] {
            let sts: StatefulSet = state
                .lock()
                .unwrap()
                .get("statefulsets", NS, &format!("test-{component}"))
                .expect("node pool workload should exist");
            let owners = sts.metadata.owner_references.expect("owner refs");
            assert_eq!(owners.len(), 1);
            assert_eq!(owners[0].uid, "uid-test");
            assert_eq!(owners[0].kind, "SearchCluster");
            assert!(state
                .lock()
                .unwrap()
                .contains("services", NS, &format!("test-{component}")));

            let env = sts_env(&state, &format!("test-{component}"));
            assert_eq!(env.get("discovery.seed_hosts").map(String::as_str), Some("test-discovery"));
            assert_eq!(
                env.get("cluster.initial_master_nodes").map(String::as_str),
                Some("test-bootstrap-0")
            );
            assert_eq!(env.get("foo").map(String::as_str), Some("bar"));
        }
        // Pool specific config only lands on its own pool.
        let env = sts_env(&state, "test-client");
        assert_eq!(env.get("baz").map(String::as_str), Some("bat"));
        assert!(sts_env(&state, "test-nodes").get("baz").is_none());

        // Resources are copied verbatim.
        let master: StatefulSet = state
            .lock()
            .unwrap()
            .get("statefulsets", NS, "test-master")
            .expect("master workload");
        let limits = master
            .spec
            .and_then(|spec| spec.template.spec)
            .and_then(|pod| pod.containers.into_iter().next())
            .and_then(|container| container.resources)
            .and_then(|resources| resources.limits)
            .expect("limits");
        assert_eq!(limits.get("cpu"), Some(&Quantity("500m".to_owned())));
        assert_eq!(limits.get("memory"), Some(&Quantity("2Gi".to_owned())));

        // Bootstrap seed, discovery endpoint and cluster endpoint.
        assert!(state.lock().unwrap().contains("statefulsets", NS, "test-bootstrap"));
        assert!(state.lock().unwrap().contains("services", NS, "test-discovery"));
        assert!(state.lock().unwrap().contains("services", NS, "test"));

        let status = stored_cluster(&state).status.expect("status");
        assert_eq!(status.version.as_deref(), Some("1.0.0"));
        assert_eq!(status.phase, ClusterPhase::Pending);
        assert!(!status.initialized);
        assert!(status.components_status.is_empty());
    }

    #[tokio::test]
    async fn reconcile_twice_performs_no_additional_writes() {
        let state = Arc::new(Mutex::new(ApiServerState::default()));
        let cluster = SearchCluster::test().with_spec(test_spec("1.0.0"));
        seed_cluster(&state, &cluster);
        run_reconcile(&state, &cluster, health_unavailable())
            .await
            .expect("first pass");

        let cluster = stored_cluster(&state);
        state.lock().unwrap().clear_writes();
        run_reconcile(&state, &cluster, health_unavailable())
            .await
            .expect("second pass");

        let writes = state.lock().unwrap().writes.clone();
        assert_eq!(writes, Vec::<WriteOp>::new());
    }

    #[tokio::test]
    async fn reconcile_removes_orphaned_pools() {
        let state = Arc::new(Mutex::new(ApiServerState::default()));
        let mut spec = test_spec("1.0.0");
        spec.node_pools.push(NodePoolSpec {
            component: "coordinator".to_owned(),
            replicas: 2,
            roles: vec!["ingest".to_owned()],
            ..Default::default()
        });
        let cluster = SearchCluster::test().with_spec(spec.clone());
        seed_cluster(&state, &cluster);
        run_reconcile(&state, &cluster, health_unavailable())
            .await
            .expect("first pass");
        assert_eq!(state.lock().unwrap().names("statefulsets", NS).len(), 5);

        // Truncate the spec to two pools and bump the version, as a user
        // would in a single update.
        let mut truncated = test_spec("1.1.0");
        truncated.node_pools.truncate(2);
        let cluster = stored_cluster(&state).with_spec(truncated);
        run_reconcile(&state, &cluster, health_unavailable())
            .await
            .expect("second pass");

        let names = state.lock().unwrap().names("statefulsets", NS);
        assert_eq!(
            names,
            vec![
                "test-bootstrap".to_owned(),
                "test-master".to_owned(),
                "test-nodes".to_owned(),
            ]
        );
        assert!(!state.lock().unwrap().contains("services", NS, "test-client"));
        assert!(!state.lock().unwrap().contains("services", NS, "test-coordinator"));
        // Shared endpoints survive pool removal.
        assert!(state.lock().unwrap().contains("services", NS, "test-discovery"));
        assert!(state.lock().unwrap().contains("services", NS, "test"));

        // The version change is not applied along the way: the workload
        // images and the reported version stay at the confirmed value.
        assert_eq!(sts_image(&state, "test-master"), OLD_IMAGE);
        assert_eq!(sts_image(&state, "test-nodes"), OLD_IMAGE);
        let status = stored_cluster(&state).status.expect("status");
        assert_eq!(status.version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn image_moves_only_when_marked_upgrading() {
        let state = Arc::new(Mutex::new(ApiServerState::default()));
        let cluster = SearchCluster::test().with_spec(test_spec("1.0.0"));
        seed_cluster(&state, &cluster);
        run_reconcile(&state, &cluster, health_unavailable())
            .await
            .expect("create pass");

        // Bump the version while the cluster is not stable: nothing moves.
        let cluster = stored_cluster(&state).with_spec(test_spec("1.1.0"));
        run_reconcile(&state, &cluster, health_unavailable())
            .await
            .expect("gated pass");
        for component in ["master", "nodes", "client"] {
            assert_eq!(sts_image(&state, &format!("test-{component}")), OLD_IMAGE);
        }

        // An Upgrading entry releases the image for exactly that pool.
        let mut status = stored_cluster(&state).status.expect("status");
        status.components_status.push(ComponentStatus {
            component: UPGRADER.to_owned(),
            status: ComponentState::Upgrading,
            description: "nodes".to_owned(),
        });
        let cluster = stored_cluster(&state)
            .with_spec(test_spec("1.1.0"))
            .with_status(status);
        run_reconcile(&state, &cluster, health_unavailable())
            .await
            .expect("upgrading pass");
        assert_eq!(sts_image(&state, "test-nodes"), NEW_IMAGE);
        assert_eq!(sts_image(&state, "test-master"), OLD_IMAGE);
        assert_eq!(sts_image(&state, "test-client"), OLD_IMAGE);
        let status = stored_cluster(&state).status.expect("status");
        assert_eq!(status.version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn failed_drain_holds_image_indefinitely() {
        let state = Arc::new(Mutex::new(ApiServerState::default()));
        let mut spec = test_spec("1.0.0");
        spec.general.drain_data_nodes = Some(true);
        let cluster = SearchCluster::test().with_spec(spec);
        seed_cluster(&state, &cluster);
        run_reconcile(&state, &cluster, health_unavailable())
            .await
            .expect("create pass");

        let mut upgraded_spec = test_spec("1.1.0");
        upgraded_spec.general.drain_data_nodes = Some(true);
        let mut status = stored_cluster(&state).status.expect("status");
        status.components_status.push(ComponentStatus {
            component: UPGRADER.to_owned(),
            status: ComponentState::Upgrading,
            description: "nodes".to_owned(),
        });
        let cluster = stored_cluster(&state)
            .with_spec(upgraded_spec.clone())
            .with_status(status.clone());

        // The drain never completes: the image stays old and the pool stays
        // Upgrading, pass after pass.
        for _ in 0..3 {
            let mut mock = health_unavailable();
            mock.expect_drain_pool().returning(|_, _, _| {
                Ok(DrainStatus {
                    relocating_shards: 7,
                })
            });
            let err = run_reconcile(&state, &cluster, mock)
                .await
                .expect_err("drain should be pending");
            assert!(matches!(err, Error::DrainTimeout { ref component } if component == "nodes"));
            assert_eq!(sts_image(&state, "test-nodes"), OLD_IMAGE);
        }

        // Once relocation finishes the image moves.
        let mut mock = health_unavailable();
        mock.expect_drain_pool().returning(|_, _, _| {
            Ok(DrainStatus {
                relocating_shards: 0,
            })
        });
        run_reconcile(&state, &cluster, mock)
            .await
            .expect("drained pass");
        assert_eq!(sts_image(&state, "test-nodes"), NEW_IMAGE);
    }

    #[tokio::test]
    #[traced_test]
    async fn reconcile_rolls_cluster_through_upgrade() {
        let state = Arc::new(Mutex::new(ApiServerState::default()));
        let cluster = SearchCluster::test().with_spec(test_spec("1.0.0"));
        seed_cluster(&state, &cluster);
        run_reconcile(&state, &cluster, health_unavailable())
            .await
            .expect("create pass");

        // Quorum forms: the cluster initializes and the seed member retires.
        let cluster = stored_cluster(&state);
        run_reconcile(&state, &cluster, health_stable())
            .await
            .expect("quorum pass");
        let status = stored_cluster(&state).status.expect("status");
        assert!(status.initialized);
        assert_eq!(status.phase, ClusterPhase::Running);
        assert!(!state.lock().unwrap().contains("statefulsets", NS, "test-bootstrap"));
        assert!(sts_env(&state, "test-nodes")
            .get("cluster.initial_master_nodes")
            .is_none());

        // Version bump: pools move one at a time, managers last, and the
        // reported version holds until every pool confirms.
        let order = ["test-nodes", "test-client", "test-master"];
        for (step, workload) in order.iter().enumerate() {
            let cluster = stored_cluster(&state).with_spec(test_spec("1.1.0"));
            run_reconcile(&state, &cluster, health_stable())
                .await
                .expect("upgrade pass");
            assert_eq!(sts_image(&state, workload), NEW_IMAGE);
            // Pools after this one have not moved yet.
            for waiting in &order[step + 1..] {
                assert_eq!(sts_image(&state, waiting), OLD_IMAGE);
            }
            let status = stored_cluster(&state).status.expect("status");
            assert_eq!(status.version.as_deref(), Some("1.0.0"));
            assert!(status
                .components_status
                .iter()
                .any(|entry| entry.component == UPGRADER
                    && entry.status == ComponentState::Upgrading));

            // The workload finishes rolling out, which the next pass
            // confirms before advancing to the next pool.
            mark_rolled_out(&state, workload, if *workload == "test-client" { 2 } else { 3 });
        }

        // Final pass: the last pool confirms, the version advances and the
        // transition's ledger entries are pruned.
        let cluster = stored_cluster(&state).with_spec(test_spec("1.1.0"));
        run_reconcile(&state, &cluster, health_stable())
            .await
            .expect("certify pass");
        let status = stored_cluster(&state).status.expect("status");
        assert_eq!(status.version.as_deref(), Some("1.1.0"));
        assert!(status.components_status.is_empty());

        // The initialized latch survives later instability.
        let cluster = stored_cluster(&state).with_spec(test_spec("1.1.0"));
        run_reconcile(&state, &cluster, health_unavailable())
            .await
            .expect("unstable pass");
        assert!(stored_cluster(&state).status.expect("status").initialized);
    }

    #[tokio::test]
    async fn invalid_spec_is_surfaced_and_nothing_is_created() {
        let state = Arc::new(Mutex::new(ApiServerState::default()));
        let mut spec = test_spec("1.0.0");
        let duplicate = spec.node_pools[0].clone();
        spec.node_pools.push(duplicate);
        let cluster = SearchCluster::test().with_spec(spec);
        seed_cluster(&state, &cluster);

        let err = run_reconcile(&state, &cluster, MockSearchRpcClientTest::new())
            .await
            .expect_err("spec is contradictory");
        assert!(matches!(err, Error::InvalidSpec { .. }));
        assert!(state.lock().unwrap().names("statefulsets", NS).is_empty());
        let status = stored_cluster(&state).status.expect("status");
        assert_eq!(status.phase, ClusterPhase::Pending);
    }

    #[tokio::test]
    async fn foreign_resources_are_never_adopted() {
        let state = Arc::new(Mutex::new(ApiServerState::default()));
        let cluster = SearchCluster::test().with_spec(test_spec("1.0.0"));
        seed_cluster(&state, &cluster);
        // A workload with the pool's name already exists but belongs to
        // someone else.
        state.lock().unwrap().insert(
            "statefulsets",
            NS,
            "test-nodes",
            &json!({
                "apiVersion": "apps/v1",
                "kind": "StatefulSet",
                "metadata": { "name": "test-nodes", "namespace": NS },
                "spec": {
                    "selector": {},
                    "serviceName": "elsewhere",
                    "template": {
                        "spec": { "containers": [ { "name": "other", "image": "other:1" } ] }
                    }
                }
            }),
        );

        let err = run_reconcile(&state, &cluster, health_unavailable())
            .await
            .expect_err("conflicting resource");
        assert!(matches!(err, Error::OwnershipConflict { ref name } if name == "test-nodes"));
        // The conflicting workload is untouched while the other pools were
        // still applied.
        let foreign: StatefulSet = state
            .lock()
            .unwrap()
            .get("statefulsets", NS, "test-nodes")
            .expect("foreign workload");
        assert!(foreign.metadata.owner_references.is_none());
        assert_eq!(sts_image(&state, "test-nodes"), "other:1");
        assert!(state.lock().unwrap().contains("statefulsets", NS, "test-master"));
        assert!(state.lock().unwrap().contains("statefulsets", NS, "test-client"));
    }
}
