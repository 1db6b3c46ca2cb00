//! Registry: the write side of the discovery store.
//!
//! Handles:
//! - atomic register (service key + three index sets, one pipeline)
//! - health updates that refresh the service key and index-set TTLs
//! - unregister cleanup
//! - heartbeat supervisor lifecycle per registered id
//!
//! The service key lives for one TTL window; index sets live for two, so
//! a re-registered service refills them before lookups start failing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{CoreError, Result};
use crate::fields;
use crate::heartbeat::{self, HeartbeatHandle, HeartbeatStats};
use crate::logger::{for_component, Logger, TracingLogger};
use crate::metrics::{self, MetricsSink};
use crate::service::{HealthStatus, ServiceInfo};
use crate::store::{KvStore, RedisStore, StorePipeline};

/// Default lifetime of a service key. Index sets live twice as long.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Write side of the discovery store.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Atomically store a service and add it to every index it belongs to.
    async fn register(&self, info: &ServiceInfo) -> Result<()>;

    /// Refresh a service's health, `last_seen`, and all of its TTLs.
    /// Returns `service-not-found` when the service key has expired.
    async fn update_health(&self, id: &str, status: HealthStatus) -> Result<()>;

    /// Remove the service key and every index membership.
    async fn unregister(&self, id: &str) -> Result<()>;

    /// Start the periodic heartbeat supervisor for a registered id.
    fn start_heartbeat(self: Arc<Self>, id: &str) -> Result<()>;

    /// Cancel the heartbeat supervisor for an id. Idempotent.
    fn stop_heartbeat(&self, id: &str);
}

/// Construction options for [`RedisRegistry`] and
/// [`crate::discovery::RedisDiscovery`].
#[derive(Clone)]
pub struct RegistryOptions {
    pub namespace: String,
    pub ttl: Duration,
    pub logger: Arc<dyn Logger>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            namespace: crate::config::DEFAULT_NAMESPACE.to_string(),
            ttl: DEFAULT_TTL,
            logger: Arc::new(TracingLogger::new("framework")),
            metrics: metrics::noop(),
        }
    }
}

/// Store-backed registry. Safe for concurrent use; one instance per
/// component.
pub struct RedisRegistry {
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) namespace: String,
    pub(crate) ttl: Duration,
    /// Mirror of the most recent successful registration per id; the
    /// authoritative source for self-healing re-registration. Survives
    /// store-side TTL expiry until explicit unregister.
    pub(crate) registration_state: RwLock<HashMap<String, ServiceInfo>>,
    pub(crate) heartbeats: Mutex<HashMap<String, HeartbeatHandle>>,
    pub(crate) stats: RwLock<HashMap<String, HeartbeatStats>>,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
}

impl RedisRegistry {
    /// Connect to the store at `url` and build a registry over it.
    pub async fn connect(url: &str, options: RegistryOptions) -> Result<Self> {
        let store = RedisStore::connect(url, options.logger.clone()).await?;
        Ok(Self::with_store(Arc::new(store), options))
    }

    /// Build a registry over an existing store (tests, development).
    pub fn with_store(store: Arc<dyn KvStore>, options: RegistryOptions) -> Self {
        Self {
            store,
            namespace: options.namespace,
            ttl: options.ttl,
            registration_state: RwLock::new(HashMap::new()),
            heartbeats: Mutex::new(HashMap::new()),
            stats: RwLock::new(HashMap::new()),
            logger: for_component(&options.logger, "framework/registry"),
            metrics: options.metrics,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub(crate) fn service_key(&self, id: &str) -> String {
        format!("{}:services:{}", self.namespace, id)
    }

    pub(crate) fn type_key(&self, component_type: &str) -> String {
        format!("{}:types:{}", self.namespace, component_type)
    }

    pub(crate) fn name_key(&self, name: &str) -> String {
        format!("{}:names:{}", self.namespace, name)
    }

    pub(crate) fn capability_key(&self, capability: &str) -> String {
        format!("{}:capabilities:{}", self.namespace, capability)
    }

    pub(crate) fn service_key_pattern(&self) -> String {
        format!("{}:services:*", self.namespace)
    }

    fn index_keys(&self, info: &ServiceInfo) -> Vec<String> {
        let mut keys = vec![
            self.type_key(info.component_type.as_str()),
            self.name_key(&info.name),
        ];
        for capability in &info.capabilities {
            keys.push(self.capability_key(&capability.name));
        }
        keys
    }

    /// Copy of the last successfully-registered info for an id.
    pub fn registration_state(&self, id: &str) -> Option<ServiceInfo> {
        self.registration_state.read().unwrap().get(id).cloned()
    }

    /// Snapshot of the stats for an active heartbeat.
    pub fn heartbeat_stats(&self, id: &str) -> Option<HeartbeatStats> {
        self.stats.read().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl Registry for RedisRegistry {
    async fn register(&self, info: &ServiceInfo) -> Result<()> {
        let started = Instant::now();

        // Mirror first: re-registration stays possible even when the
        // store write below fails partway through its retries.
        self.registration_state
            .write()
            .unwrap()
            .insert(info.id.clone(), info.clone());

        let payload = serde_json::to_string(info).map_err(CoreError::Marshal)?;
        let index_ttl = self.ttl * 2;

        let mut pipe = StorePipeline::new().set_ex(self.service_key(&info.id), payload, self.ttl);
        for key in self.index_keys(info) {
            pipe = pipe.sadd(key.clone(), info.id.clone()).expire(key, index_ttl);
        }

        match self.store.exec(pipe).await {
            Ok(()) => {
                self.metrics
                    .incr_counter("discovery.registrations", &[("status", "success")]);
                self.metrics.record_duration(
                    "discovery.registration.duration_ms",
                    started.elapsed(),
                    &[],
                );
                self.logger.debug(
                    "Service registered",
                    &fields! {
                        "service_id" => info.id,
                        "name" => info.name,
                        "type" => info.component_type.as_str(),
                        "capabilities" => info.capability_names(),
                    },
                );
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .incr_counter("discovery.registrations", &[("status", "error")]);
                self.logger.warn(
                    "Service registration failed",
                    &fields! { "service_id" => info.id, "error" => e.to_string() },
                );
                Err(e)
            }
        }
    }

    async fn update_health(&self, id: &str, status: HealthStatus) -> Result<()> {
        let key = self.service_key(id);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| CoreError::ServiceNotFound(id.to_string()))?;

        let mut info: ServiceInfo =
            serde_json::from_str(&raw).map_err(CoreError::Unmarshal)?;
        info.touch(status);

        let payload = serde_json::to_string(&info).map_err(CoreError::Marshal)?;
        let index_ttl = self.ttl * 2;

        // Re-extend the index sets alongside the service key so index
        // expiry cannot strand a healthy entry.
        let mut pipe = StorePipeline::new().set_ex(key, payload, self.ttl);
        for index_key in self.index_keys(&info) {
            pipe = pipe.expire(index_key, index_ttl);
        }
        self.store.exec(pipe).await
    }

    async fn unregister(&self, id: &str) -> Result<()> {
        // Best-effort read so we know which index sets to clean; fall
        // back to the local mirror when the key already expired.
        let stored = match self.store.get(&self.service_key(id)).await {
            Ok(Some(raw)) => serde_json::from_str::<ServiceInfo>(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                self.logger.warn(
                    "Unregister could not read stored info",
                    &fields! { "service_id" => id, "error" => e.to_string() },
                );
                None
            }
        };
        let info = stored.or_else(|| self.registration_state(id));

        let mut pipe = StorePipeline::new();
        if let Some(info) = &info {
            for key in self.index_keys(info) {
                pipe = pipe.srem(key, id);
            }
        }
        pipe = pipe.del(self.service_key(id));

        let result = self.store.exec(pipe).await;
        self.registration_state.write().unwrap().remove(id);

        match result {
            Ok(()) => {
                self.logger
                    .debug("Service unregistered", &fields! { "service_id" => id });
                Ok(())
            }
            Err(e) => {
                // Stragglers are reaped by TTL.
                self.logger.warn(
                    "Unregister cleanup incomplete",
                    &fields! { "service_id" => id, "error" => e.to_string() },
                );
                Err(e)
            }
        }
    }

    fn start_heartbeat(self: Arc<Self>, id: &str) -> Result<()> {
        heartbeat::start(&self, id)
    }

    fn stop_heartbeat(&self, id: &str) {
        heartbeat::stop(self, id)
    }
}
