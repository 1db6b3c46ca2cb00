//! In-memory registry and discovery.
//!
//! Reference implementation of the `Registry ∪ Discovery` contract,
//! minus TTLs and heartbeats. Used in tests and in development mode so
//! components run without a store. Discovery hands out deep copies;
//! callers never observe shared mutable state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::discovery::{dedup, intersect, Discovery};
use crate::error::{CoreError, Result};
use crate::registry::Registry;
use crate::service::{DiscoveryFilter, HealthStatus, ServiceInfo};

#[derive(Default)]
struct MemoryState {
    services: HashMap<String, ServiceInfo>,
    // capability name -> insertion-ordered ids
    by_capability: HashMap<String, Vec<String>>,
}

impl MemoryState {
    fn index(&mut self, info: &ServiceInfo) {
        for capability in &info.capabilities {
            let ids = self.by_capability.entry(capability.name.clone()).or_default();
            if !ids.iter().any(|id| id == &info.id) {
                ids.push(info.id.clone());
            }
        }
    }

    fn unindex(&mut self, id: &str) {
        self.by_capability.retain(|_, ids| {
            ids.retain(|member| member != id);
            !ids.is_empty()
        });
    }
}

/// Non-persistent registry + discovery. Thread-safe.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<MemoryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, info: &ServiceInfo) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        // Re-registration replaces the previous entry and its index rows.
        state.unindex(&info.id);
        state.services.insert(info.id.clone(), info.clone());
        state.index(info);
        Ok(())
    }

    async fn update_health(&self, id: &str, status: HealthStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.services.get_mut(id) {
            Some(info) => {
                info.touch(status);
                Ok(())
            }
            None => Err(CoreError::ServiceNotFound(id.to_string())),
        }
    }

    async fn unregister(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.services.remove(id);
        state.unindex(id);
        Ok(())
    }

    // No TTLs to refresh: heartbeats are a no-op here.
    fn start_heartbeat(self: Arc<Self>, _id: &str) -> Result<()> {
        Ok(())
    }

    fn stop_heartbeat(&self, _id: &str) {}
}

#[async_trait]
impl Discovery for MemoryRegistry {
    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<ServiceInfo>> {
        let state = self.state.lock().unwrap();

        let mut candidate: Option<Vec<String>> = None;

        if let Some(component_type) = filter.component_type {
            let ids: Vec<String> = state
                .services
                .values()
                .filter(|info| info.component_type == component_type)
                .map(|info| info.id.clone())
                .collect();
            candidate = Some(ids);
        }

        if let Some(name) = &filter.name {
            let fetched: Vec<String> = state
                .services
                .values()
                .filter(|info| &info.name == name)
                .map(|info| info.id.clone())
                .collect();
            candidate = Some(match candidate {
                Some(existing) => intersect(&existing, &fetched),
                None => fetched,
            });
        }

        if !filter.capabilities.is_empty() {
            let mut cap_ids = Vec::new();
            for capability in &filter.capabilities {
                if let Some(ids) = state.by_capability.get(capability) {
                    cap_ids.extend(ids.iter().cloned());
                }
            }
            candidate = Some(match candidate {
                Some(existing) => intersect(&existing, &cap_ids),
                None => cap_ids,
            });
        }

        let ids = match candidate {
            Some(ids) => dedup(ids),
            None => state.services.keys().cloned().collect(),
        };

        let matches = ids
            .iter()
            .filter_map(|id| state.services.get(id))
            .filter(|info| filter.metadata.is_empty() || filter.metadata_matches(info))
            .cloned()
            .collect();
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Capability, ComponentType};
    use serde_json::json;

    fn service(id: &str, name: &str, component_type: ComponentType, caps: &[&str]) -> ServiceInfo {
        let mut info = ServiceInfo::new(name, component_type);
        info.id = id.to_string();
        for cap in caps {
            info = info.with_capability(Capability::new(*cap));
        }
        info
    }

    #[tokio::test]
    async fn test_register_discover_unregister() {
        let registry = MemoryRegistry::new();
        registry
            .register(&service("t1", "calc", ComponentType::Tool, &["add"]))
            .await
            .unwrap();
        assert_eq!(registry.len(), 1);

        let found = registry
            .discover(&DiscoveryFilter::default().with_capability("add"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "t1");

        registry.unregister("t1").await.unwrap();
        assert!(registry.is_empty());
        let found = registry
            .discover(&DiscoveryFilter::default().with_capability("add"))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_same_filter_semantics_as_store_backed() {
        let registry = MemoryRegistry::new();
        registry
            .register(&service("t1", "calc", ComponentType::Tool, &["add"]))
            .await
            .unwrap();
        registry
            .register(&service("a1", "planner", ComponentType::Agent, &["add", "plan"]))
            .await
            .unwrap();

        let filter = DiscoveryFilter::default()
            .with_type(ComponentType::Tool)
            .with_capability("add")
            .with_capability("plan");
        let found = registry.discover(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "t1");

        let found = registry
            .discover(&DiscoveryFilter::default().with_capability("plan"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a1");
    }

    #[tokio::test]
    async fn test_update_health() {
        let registry = MemoryRegistry::new();
        registry
            .register(&service("t1", "calc", ComponentType::Tool, &[]))
            .await
            .unwrap();

        registry
            .update_health("t1", HealthStatus::Unhealthy)
            .await
            .unwrap();
        let found = registry.discover(&DiscoveryFilter::default()).await.unwrap();
        assert_eq!(found[0].health, HealthStatus::Unhealthy);

        let err = registry
            .update_health("ghost", HealthStatus::Healthy)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_discover_returns_deep_copies() {
        let registry = MemoryRegistry::new();
        registry
            .register(&service("t1", "calc", ComponentType::Tool, &["add"]))
            .await
            .unwrap();

        let mut found = registry.discover(&DiscoveryFilter::default()).await.unwrap();
        found[0].name = "mutated".to_string();
        found[0].metadata.insert("x".to_string(), json!(1));

        let again = registry.discover(&DiscoveryFilter::default()).await.unwrap();
        assert_eq!(again[0].name, "calc");
        assert!(again[0].metadata.is_empty());
    }

    #[tokio::test]
    async fn test_reregistration_replaces_capabilities() {
        let registry = MemoryRegistry::new();
        registry
            .register(&service("t1", "calc", ComponentType::Tool, &["add"]))
            .await
            .unwrap();
        registry
            .register(&service("t1", "calc", ComponentType::Tool, &["multiply"]))
            .await
            .unwrap();

        assert!(registry
            .discover(&DiscoveryFilter::default().with_capability("add"))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            registry
                .discover(&DiscoveryFilter::default().with_capability("multiply"))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_concurrent_use() {
        let registry = Arc::new(MemoryRegistry::new());

        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("s{}", i);
                registry
                    .register(&service(&id, "worker", ComponentType::Tool, &["work"]))
                    .await
                    .unwrap();
                let found = registry
                    .discover(&DiscoveryFilter::default().with_capability("work"))
                    .await
                    .unwrap();
                assert!(!found.is_empty());
                if i % 2 == 0 {
                    registry.unregister(&id).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.len(), 8);
    }
}
