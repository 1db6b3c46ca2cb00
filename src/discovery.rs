//! Discovery: the read side of the discovery store.
//!
//! Computes a candidate id set from the type/name/capability indices,
//! fetches each entry, and post-filters by metadata. Dimensions
//! intersect; multiple requested capabilities union within the
//! capability dimension ("supports at least one of"). Expired and
//! malformed entries are skipped, never surfaced.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::fields;
use crate::registry::{RedisRegistry, Registry, RegistryOptions};
use crate::service::{DiscoveryFilter, HealthStatus, ServiceInfo};
use crate::store::KvStore;

/// Read side of the discovery store. Every discovery is also a registry
/// (agents register themselves before querying).
#[async_trait]
pub trait Discovery: Registry {
    /// Return fresh `ServiceInfo` values matching the filter. An empty
    /// result is a normal success.
    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<ServiceInfo>>;
}

/// `a ∩ b`, deduplicated, ordered by occurrence in `b`.
pub(crate) fn intersect(a: &[String], b: &[String]) -> Vec<String> {
    let members: HashSet<&str> = a.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    b.iter()
        .filter(|id| members.contains(id.as_str()) && seen.insert(id.as_str()))
        .cloned()
        .collect()
}

/// Deduplicate preserving first occurrence.
pub(crate) fn dedup(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Store-backed discovery wrapping a [`RedisRegistry`].
pub struct RedisDiscovery {
    inner: Arc<RedisRegistry>,
}

impl RedisDiscovery {
    /// Connect to the store at `url` and build a discovery over it.
    pub async fn connect(url: &str, options: RegistryOptions) -> Result<Self> {
        let registry = RedisRegistry::connect(url, options).await?;
        Ok(Self {
            inner: Arc::new(registry),
        })
    }

    /// Build a discovery over an existing registry.
    pub fn from_registry(registry: Arc<RedisRegistry>) -> Self {
        Self { inner: registry }
    }

    /// The underlying registry shared with the heartbeat supervisors.
    pub fn registry(&self) -> Arc<RedisRegistry> {
        self.inner.clone()
    }

    fn store(&self) -> &Arc<dyn KvStore> {
        &self.inner.store
    }

    /// Candidate ids for a filter, before per-entry fetch and metadata
    /// post-filtering.
    async fn candidate_ids(&self, filter: &DiscoveryFilter) -> Result<Vec<String>> {
        let mut candidate: Option<Vec<String>> = None;

        if let Some(component_type) = filter.component_type {
            let ids = self
                .store()
                .smembers(&self.inner.type_key(component_type.as_str()))
                .await?;
            candidate = Some(ids);
        }

        if let Some(name) = &filter.name {
            let fetched = self.store().smembers(&self.inner.name_key(name)).await?;
            candidate = Some(match candidate {
                Some(existing) => intersect(&existing, &fetched),
                None => fetched,
            });
        }

        if !filter.capabilities.is_empty() {
            let mut cap_ids = Vec::new();
            for capability in &filter.capabilities {
                let ids = self
                    .store()
                    .smembers(&self.inner.capability_key(capability))
                    .await?;
                cap_ids.extend(ids);
            }
            candidate = Some(match candidate {
                Some(existing) => intersect(&existing, &cap_ids),
                None => cap_ids,
            });
        }

        let ids = match candidate {
            Some(ids) => ids,
            None => {
                // No index dimension set: scan the service keys.
                let prefix = format!("{}:services:", self.inner.namespace());
                self.store()
                    .keys(&self.inner.service_key_pattern())
                    .await?
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
                    .collect()
            }
        };

        Ok(dedup(ids))
    }

    /// Fetch one entry; `None` for expired or malformed entries.
    async fn fetch(&self, id: &str) -> Option<ServiceInfo> {
        let key = self.inner.service_key(id);
        let raw = match self.store().get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None, // expired between index read and fetch
            Err(e) => {
                self.inner.logger.warn(
                    "Discovery fetch failed for entry",
                    &fields! { "service_id" => id, "error" => e.to_string() },
                );
                return None;
            }
        };

        match serde_json::from_str::<ServiceInfo>(&raw) {
            Ok(info) => Some(info),
            Err(e) => {
                self.inner.logger.warn(
                    "Skipping malformed registry entry",
                    &fields! { "service_id" => id, "error" => e.to_string() },
                );
                None
            }
        }
    }
}

#[async_trait]
impl Registry for RedisDiscovery {
    async fn register(&self, info: &ServiceInfo) -> Result<()> {
        self.inner.register(info).await
    }

    async fn update_health(&self, id: &str, status: HealthStatus) -> Result<()> {
        self.inner.update_health(id, status).await
    }

    async fn unregister(&self, id: &str) -> Result<()> {
        self.inner.unregister(id).await
    }

    fn start_heartbeat(self: Arc<Self>, id: &str) -> Result<()> {
        self.inner.clone().start_heartbeat(id)
    }

    fn stop_heartbeat(&self, id: &str) {
        self.inner.stop_heartbeat(id)
    }
}

#[async_trait]
impl Discovery for RedisDiscovery {
    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<ServiceInfo>> {
        let ids = self.candidate_ids(filter).await?;

        let mut matches = Vec::new();
        for id in &ids {
            let Some(info) = self.fetch(id).await else {
                continue;
            };
            if !filter.metadata.is_empty() && !filter.metadata_matches(&info) {
                continue;
            }
            matches.push(info);
        }

        self.inner.logger.debug(
            "Discovery query complete",
            &fields! { "candidates" => ids.len(), "matches" => matches.len() },
        );
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Capability, ComponentType};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_intersect_orders_by_second_argument() {
        let a = strings(&["x", "y", "z"]);
        let b = strings(&["z", "w", "x"]);
        assert_eq!(intersect(&a, &b), strings(&["z", "x"]));
    }

    #[test]
    fn test_intersect_dedupes_output() {
        let a = strings(&["x", "y"]);
        let b = strings(&["x", "x", "y", "x"]);
        assert_eq!(intersect(&a, &b), strings(&["x", "y"]));
    }

    #[test]
    fn test_intersect_empty_cases() {
        assert!(intersect(&[], &strings(&["a"])).is_empty());
        assert!(intersect(&strings(&["a"]), &[]).is_empty());
        assert!(intersect(&strings(&["a"]), &strings(&["b"])).is_empty());
    }

    #[test]
    fn test_dedup_preserves_first_occurrence() {
        assert_eq!(
            dedup(strings(&["a", "b", "a", "c", "b"])),
            strings(&["a", "b", "c"])
        );
    }

    async fn discovery_over(
        store: Arc<MemoryStore>,
        ttl: Duration,
    ) -> (RedisDiscovery, Arc<MemoryStore>) {
        let registry = RedisRegistry::with_store(
            store.clone(),
            RegistryOptions {
                ttl,
                logger: crate::logger::noop(),
                ..RegistryOptions::default()
            },
        );
        (RedisDiscovery::from_registry(Arc::new(registry)), store)
    }

    fn service(id: &str, name: &str, component_type: ComponentType, caps: &[&str]) -> ServiceInfo {
        let mut info = ServiceInfo::new(name, component_type);
        info.id = id.to_string();
        for cap in caps {
            info = info.with_capability(Capability::new(*cap));
        }
        info
    }

    #[tokio::test]
    async fn test_capability_union_type_intersection() {
        let (discovery, _) =
            discovery_over(Arc::new(MemoryStore::new()), Duration::from_secs(30)).await;

        discovery
            .register(&service("t1", "calc", ComponentType::Tool, &["add"]))
            .await
            .unwrap();
        discovery
            .register(&service("a1", "planner", ComponentType::Agent, &["add", "plan"]))
            .await
            .unwrap();

        // Type intersects with the capability union.
        let filter = DiscoveryFilter::default()
            .with_type(ComponentType::Tool)
            .with_capability("add")
            .with_capability("plan");
        let found = discovery.discover(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "t1");

        // A capability-only filter matches anything providing it.
        let filter = DiscoveryFilter::default().with_capability("plan");
        let found = discovery.discover(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a1");
    }

    #[tokio::test]
    async fn test_name_filter_intersects_type() {
        let (discovery, _) =
            discovery_over(Arc::new(MemoryStore::new()), Duration::from_secs(30)).await;

        discovery
            .register(&service("t1", "calc", ComponentType::Tool, &["add"]))
            .await
            .unwrap();
        discovery
            .register(&service("a1", "calc", ComponentType::Agent, &["add"]))
            .await
            .unwrap();

        let filter = DiscoveryFilter::default()
            .with_type(ComponentType::Agent)
            .with_name("calc");
        let found = discovery.discover(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a1");
    }

    #[tokio::test]
    async fn test_unscoped_filter_scans_all_services() {
        let (discovery, _) =
            discovery_over(Arc::new(MemoryStore::new()), Duration::from_secs(30)).await;

        discovery
            .register(&service("t1", "calc", ComponentType::Tool, &["add"]))
            .await
            .unwrap();
        discovery
            .register(&service("a1", "planner", ComponentType::Agent, &["plan"]))
            .await
            .unwrap();

        let found = discovery.discover(&DiscoveryFilter::default()).await.unwrap();
        let mut ids: Vec<&str> = found.iter().map(|i| i.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a1", "t1"]);
    }

    #[tokio::test]
    async fn test_metadata_post_filter() {
        let (discovery, _) =
            discovery_over(Arc::new(MemoryStore::new()), Duration::from_secs(30)).await;

        let prod = service("a1", "planner", ComponentType::Agent, &["plan"])
            .with_metadata("env", json!("prod"));
        let staging = service("a2", "planner", ComponentType::Agent, &["plan"])
            .with_metadata("env", json!("staging"));
        discovery.register(&prod).await.unwrap();
        discovery.register(&staging).await.unwrap();

        let filter = DiscoveryFilter::default()
            .with_capability("plan")
            .with_metadata("env", json!("prod"));
        let found = discovery.discover(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a1");
    }

    #[tokio::test]
    async fn test_expired_index_entry_is_skipped() {
        let (discovery, store) =
            discovery_over(Arc::new(MemoryStore::new()), Duration::from_secs(30)).await;

        discovery
            .register(&service("t1", "calc", ComponentType::Tool, &["add"]))
            .await
            .unwrap();

        // Simulate service-key expiry with the index set still present.
        store.del("gomind:services:t1").await.unwrap();

        let filter = DiscoveryFilter::default().with_capability("add");
        let found = discovery.discover(&filter).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_entry_is_skipped() {
        let (discovery, store) =
            discovery_over(Arc::new(MemoryStore::new()), Duration::from_secs(30)).await;

        discovery
            .register(&service("t1", "calc", ComponentType::Tool, &["add"]))
            .await
            .unwrap();
        discovery
            .register(&service("t2", "calc", ComponentType::Tool, &["add"]))
            .await
            .unwrap();

        store
            .set("gomind:services:t1", "{not json", Duration::from_secs(30))
            .await
            .unwrap();

        let filter = DiscoveryFilter::default().with_capability("add");
        let found = discovery.discover(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "t2");
    }

    #[tokio::test]
    async fn test_empty_result_is_success() {
        let (discovery, _) =
            discovery_over(Arc::new(MemoryStore::new()), Duration::from_secs(30)).await;
        let found = discovery
            .discover(&DiscoveryFilter::default().with_capability("nothing"))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_ttl_expiry_makes_service_undiscoverable() {
        let (discovery, _) =
            discovery_over(Arc::new(MemoryStore::new()), Duration::from_millis(150)).await;

        discovery
            .register(&service("t1", "calc", ComponentType::Tool, &["add"]))
            .await
            .unwrap();

        let filter = DiscoveryFilter::default().with_type(ComponentType::Tool);
        assert_eq!(discovery.discover(&filter).await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(discovery.discover(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_capability_memberships_dedup() {
        let (discovery, _) =
            discovery_over(Arc::new(MemoryStore::new()), Duration::from_secs(30)).await;

        // One service providing both requested capabilities appears once.
        discovery
            .register(&service("a1", "planner", ComponentType::Agent, &["add", "plan"]))
            .await
            .unwrap();

        let filter = DiscoveryFilter::default()
            .with_capability("add")
            .with_capability("plan");
        let found = discovery.discover(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
    }
}
