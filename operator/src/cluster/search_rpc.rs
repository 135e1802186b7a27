use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// Credentials for the cluster admin API, consumed from an external secret.
#[derive(Debug, Clone)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

/// Health of the cluster as reported by its admin interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterHealth {
    Green,
    Yellow,
    Red,
}

impl ClusterHealth {
    /// True when the cluster has formed a quorum and serves requests.
    pub fn is_stable(&self) -> bool {
        matches!(self, ClusterHealth::Green | ClusterHealth::Yellow)
    }
}

/// Progress of relocating data off the members of a node pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainStatus {
    /// Number of shards still relocating off the excluded members.
    pub relocating_shards: i32,
}

impl DrainStatus {
    /// True when no data remains on the excluded members.
    pub fn is_complete(&self) -> bool {
        self.relocating_shards == 0
    }
}

/// Define the behavior we consume from the cluster admin API.
///
/// The quorum probe and drain operations are opaque blocking calls with
/// bounded timeouts, safe to retry on any pass.
#[async_trait]
pub trait SearchRpcClient {
    /// Report cluster health, used as the quorum/stabilization probe.
    async fn cluster_health(&self, addr: &str, creds: &AdminCredentials)
        -> Result<ClusterHealth>;
    /// Exclude the named workload's members from shard allocation and report
    /// relocation progress.
    async fn drain_pool(
        &self,
        addr: &str,
        creds: &AdminCredentials,
        workload: &str,
    ) -> Result<DrainStatus>;
    /// Remove any allocation exclusions previously set by `drain_pool`.
    async fn clear_drain(&self, addr: &str, creds: &AdminCredentials) -> Result<()>;
}

pub struct HttpRpcClient;

#[derive(Deserialize)]
struct HealthResponse {
    status: ClusterHealth,
    relocating_shards: Option<i32>,
}

impl HttpRpcClient {
    async fn health(&self, addr: &str, creds: &AdminCredentials) -> Result<HealthResponse> {
        let client = reqwest::Client::new();
        let resp = client
            .get(format!("{addr}/_cluster/health"))
            .basic_auth(&creds.username, Some(&creds.password))
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("cluster health failed: {}", resp.status());
        }
        Ok(resp.json().await?)
    }

    async fn set_allocation_exclusion(
        &self,
        addr: &str,
        creds: &AdminCredentials,
        exclusion: Option<&str>,
    ) -> Result<()> {
        let client = reqwest::Client::new();
        let resp = client
            .put(format!("{addr}/_cluster/settings"))
            .basic_auth(&creds.username, Some(&creds.password))
            .json(&serde_json::json!({
                "transient": {
                    "cluster.routing.allocation.exclude._name": exclusion,
                }
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("updating allocation exclusions failed: {}", resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl SearchRpcClient for HttpRpcClient {
    async fn cluster_health(
        &self,
        addr: &str,
        creds: &AdminCredentials,
    ) -> Result<ClusterHealth> {
        Ok(self.health(addr, creds).await?.status)
    }

    async fn drain_pool(
        &self,
        addr: &str,
        creds: &AdminCredentials,
        workload: &str,
    ) -> Result<DrainStatus> {
        // Exclude all members of the workload by pod name, then report how
        // many shards are still moving off of them.
        self.set_allocation_exclusion(addr, creds, Some(&format!("{workload}-*")))
            .await?;
        let health = self.health(addr, creds).await?;
        Ok(DrainStatus {
            relocating_shards: health.relocating_shards.unwrap_or(0),
        })
    }

    async fn clear_drain(&self, addr: &str, creds: &AdminCredentials) -> Result<()> {
        self.set_allocation_exclusion(addr, creds, None).await
    }
}
