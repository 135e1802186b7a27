//! Sequencing policy for rolling version upgrades.
//!
//! Only version affecting changes pass through this module. Structural
//! changes (replicas, resources, placement) are applied unconditionally by
//! the child resource reconciler.
use std::collections::BTreeMap;

use crate::cluster::node_set::NodeSetConfig;
use crate::cluster::status::{ComponentLedger, UPGRADER};
use crate::cluster::{ComponentState, ComponentStatus};

/// Observed state of one node pool's workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolObservation {
    /// Image the workload currently runs.
    pub image: String,
    /// The workload reports every member updated and ready.
    pub rolled_out: bool,
}

/// Ledger entry recording that a pool began migrating to a new version.
pub fn upgrading(component: &str) -> ComponentStatus {
    ComponentStatus {
        component: UPGRADER.to_owned(),
        status: ComponentState::Upgrading,
        description: component.to_owned(),
    }
}

/// Ledger entry recording that a pool confirmed a version migration.
pub fn upgraded(component: &str) -> ComponentStatus {
    ComponentStatus {
        component: UPGRADER.to_owned(),
        status: ComponentState::Upgraded,
        description: component.to_owned(),
    }
}

/// Stable upgrade order for node pools.
///
/// Manager eligible pools go last so quorum availability is never reduced
/// while other pools restart; within each group spec order is preserved.
pub fn upgrade_order(pools: &[NodeSetConfig]) -> Vec<&NodeSetConfig> {
    let mut order: Vec<&NodeSetConfig> = Vec::with_capacity(pools.len());
    order.extend(pools.iter().filter(|pool| !pool.manager_eligible));
    order.extend(pools.iter().filter(|pool| pool.manager_eligible));
    order
}

/// Component of the upgrade currently in flight, if any.
pub fn in_flight(ledger: &ComponentLedger) -> Option<String> {
    ledger
        .iter()
        .find(|entry| entry.component == UPGRADER && entry.status == ComponentState::Upgrading)
        .map(|entry| entry.description.clone())
}

/// Next pool that may begin upgrading.
///
/// Pools move one at a time: while any upgrade is in flight nothing new
/// starts. Otherwise the first pool in upgrade order whose workload exists
/// and runs a different image than the target is picked.
pub fn next_to_upgrade<'a>(
    order: &[&'a NodeSetConfig],
    observations: &BTreeMap<String, PoolObservation>,
    target_image: &str,
    ledger: &ComponentLedger,
) -> Option<&'a str> {
    if in_flight(ledger).is_some() {
        return None;
    }
    order
        .iter()
        .find(|pool| {
            observations
                .get(&pool.component)
                .map(|observed| observed.image != target_image)
                .unwrap_or(false)
                && ledger.get(UPGRADER, &pool.component).is_none()
        })
        .map(|pool| pool.component.as_str())
}

/// Image the reconciler may apply to a pool's workload this pass.
///
/// A workload that does not exist yet is created directly at the target. An
/// existing workload keeps its observed image until the ledger carries an
/// `Upgrading` or `Upgraded` entry for the pool.
pub fn image_allowed(
    component: &str,
    observations: &BTreeMap<String, PoolObservation>,
    target_image: &str,
    ledger: &ComponentLedger,
) -> String {
    let Some(observed) = observations.get(component) else {
        return target_image.to_owned();
    };
    if observed.image == target_image {
        return target_image.to_owned();
    }
    match ledger.get(UPGRADER, component).map(|entry| entry.status) {
        Some(ComponentState::Upgrading) | Some(ComponentState::Upgraded) => {
            target_image.to_owned()
        }
        _ => observed.image.clone(),
    }
}

/// True when every observed workload runs the target image.
pub fn all_at_target(
    observations: &BTreeMap<String, PoolObservation>,
    target_image: &str,
) -> bool {
    observations
        .values()
        .all(|observed| observed.image == target_image)
}

/// True when the cluster wide reported version may advance to the target.
///
/// Requires every workload at the target image and no component still
/// migrating. Until then the reported version stays at the last fully
/// confirmed value even though individual workloads may already run the new
/// image.
pub fn can_certify(
    observations: &BTreeMap<String, PoolObservation>,
    target_image: &str,
    ledger: &ComponentLedger,
) -> bool {
    all_at_target(observations, target_image)
        && !ledger.any_in_state(UPGRADER, ComponentState::Upgrading)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{NodePoolSpec, CLUSTER_MANAGER_ROLE, DATA_ROLE};

    const OLD: &str = "search:1.0.0";
    const NEW: &str = "search:1.1.0";

    fn pool(component: &str, roles: &[&str]) -> NodeSetConfig {
        NodeSetConfig::from(&NodePoolSpec {
            component: component.to_owned(),
            replicas: 3,
            roles: roles.iter().map(|role| role.to_string()).collect(),
            ..Default::default()
        })
    }

    fn observed(image: &str) -> PoolObservation {
        PoolObservation {
            image: image.to_owned(),
            rolled_out: true,
        }
    }

    #[test]
    fn managers_upgrade_last() {
        let pools = vec![
            pool("master", &[CLUSTER_MANAGER_ROLE]),
            pool("nodes", &[DATA_ROLE]),
            pool("client", &[]),
        ];
        let order: Vec<_> = upgrade_order(&pools)
            .iter()
            .map(|pool| pool.component.clone())
            .collect();
        assert_eq!(order, vec!["nodes", "client", "master"]);
    }

    #[test]
    fn one_pool_at_a_time() {
        let pools = vec![
            pool("master", &[CLUSTER_MANAGER_ROLE]),
            pool("nodes", &[DATA_ROLE]),
        ];
        let order = upgrade_order(&pools);
        let observations = BTreeMap::from_iter(vec![
            ("master".to_owned(), observed(OLD)),
            ("nodes".to_owned(), observed(OLD)),
        ]);
        let mut ledger = ComponentLedger::default();
        assert_eq!(
            next_to_upgrade(&order, &observations, NEW, &ledger),
            Some("nodes")
        );
        // While nodes is in flight nothing new starts.
        ledger.upsert(upgrading("nodes"));
        assert_eq!(next_to_upgrade(&order, &observations, NEW, &ledger), None);
        // Once nodes confirmed, the manager pool is next.
        ledger.upsert(upgraded("nodes"));
        assert_eq!(
            next_to_upgrade(&order, &observations, NEW, &ledger),
            Some("master")
        );
    }

    #[test]
    fn image_gated_by_ledger() {
        let observations = BTreeMap::from_iter(vec![("nodes".to_owned(), observed(OLD))]);
        let mut ledger = ComponentLedger::default();
        // No entry: the workload keeps its observed image.
        assert_eq!(image_allowed("nodes", &observations, NEW, &ledger), OLD);
        // Upgrading releases the image.
        ledger.upsert(upgrading("nodes"));
        assert_eq!(image_allowed("nodes", &observations, NEW, &ledger), NEW);
        // A workload that does not exist yet is created at the target.
        assert_eq!(
            image_allowed("fresh", &observations, NEW, &ledger),
            NEW
        );
    }

    #[test]
    fn certification_waits_for_every_pool() {
        let mut observations = BTreeMap::from_iter(vec![
            ("nodes".to_owned(), observed(NEW)),
            ("master".to_owned(), observed(OLD)),
        ]);
        let mut ledger = ComponentLedger::default();
        ledger.upsert(upgraded("nodes"));
        assert!(!can_certify(&observations, NEW, &ledger));
        observations.insert("master".to_owned(), observed(NEW));
        ledger.upsert(upgrading("master"));
        assert!(!can_certify(&observations, NEW, &ledger));
        ledger.upsert(upgraded("master"));
        assert!(can_certify(&observations, NEW, &ledger));
    }
}
