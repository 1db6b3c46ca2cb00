//! Component registration glue.
//!
//! A `Framework` value owns the configuration, logger, and metrics sink
//! and builds the two component kinds:
//! - `Tool`: registers itself and heartbeats; cannot discover.
//! - `Agent`: everything a tool does, plus discovery queries.
//!
//! The type split enforces the architectural rule that tools cannot
//! discover. Component initialization never fails on registry
//! unreachability when retry is enabled: the component keeps serving
//! and acquires its registry reference in the background.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use crate::address::{build_service_metadata, resolve_service_address};
use crate::config::Config;
use crate::discovery::Discovery;
use crate::error::Result;
use crate::fields;
use crate::logger::{for_component, Logger, TracingLogger};
use crate::memory::MemoryRegistry;
use crate::metrics::{self, MetricsSink};
use crate::registry::{RedisRegistry, Registry, RegistryOptions};
use crate::retry::{spawn_discovery_retry, spawn_registry_retry, RetryHandle};
use crate::schema::capability_schema;
use crate::service::{Capability, ComponentType, DiscoveryFilter, ServiceInfo};

/// Owner of the ambient pieces every component needs. Construct once,
/// then build tools and agents from it.
pub struct Framework {
    config: Arc<Config>,
    logger: Arc<dyn Logger>,
    metrics: Arc<dyn MetricsSink>,
    /// Shared development-mode registry, so components built from the
    /// same framework can find each other without a store.
    mock_registry: Arc<MemoryRegistry>,
}

impl Framework {
    /// Validate the config and build a framework around it.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            logger: Arc::new(TracingLogger::new("framework")),
            metrics: metrics::noop(),
            mock_registry: Arc::new(MemoryRegistry::new()),
        })
    }

    /// Replace the log sink. The original, unwrapped logger is handed to
    /// every component so each can tag its own records.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Replace the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build a tool exposing the given capabilities.
    pub fn tool(&self, capabilities: Vec<Capability>) -> Tool {
        Tool {
            core: self.core(ComponentType::Tool, capabilities),
            registry: Arc::new(RwLock::new(None)),
        }
    }

    /// Build an agent exposing the given capabilities.
    pub fn agent(&self, capabilities: Vec<Capability>) -> Agent {
        Agent {
            core: self.core(ComponentType::Agent, capabilities),
            discovery: Arc::new(RwLock::new(None)),
        }
    }

    fn core(&self, component_type: ComponentType, capabilities: Vec<Capability>) -> ComponentCore {
        let (address, port) = resolve_service_address(Some(&self.config));
        let mut info = ServiceInfo::new(&self.config.name, component_type)
            .with_address(address, port);
        info.capabilities = capabilities;
        info.metadata = build_service_metadata(Some(&self.config));

        let component = format!("{}/{}", component_type.as_str(), info.id);
        ComponentCore {
            config: self.config.clone(),
            base_logger: self.logger.clone(),
            logger: for_component(&self.logger, &component),
            metrics: self.metrics.clone(),
            mock_registry: self.mock_registry.clone(),
            info,
            retry: Mutex::new(None),
        }
    }
}

struct ComponentCore {
    config: Arc<Config>,
    /// Original logger, propagated unwrapped to sub-components.
    base_logger: Arc<dyn Logger>,
    /// Component-tagged logger for this component's own records.
    logger: Arc<dyn Logger>,
    metrics: Arc<dyn MetricsSink>,
    mock_registry: Arc<MemoryRegistry>,
    info: ServiceInfo,
    retry: Mutex<Option<RetryHandle>>,
}

impl ComponentCore {
    fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            namespace: self.config.namespace.clone(),
            logger: self.base_logger.clone(),
            metrics: self.metrics.clone(),
            ..RegistryOptions::default()
        }
    }

    fn cancel_retry(&self) {
        if let Some(handle) = self.retry.lock().unwrap().take() {
            handle.cancel();
        }
    }

    fn health_payload(&self) -> Value {
        json!({
            "status": self.info.health.as_str(),
            "type": self.info.component_type.as_str(),
            "name": self.info.name,
            "id": self.info.id,
        })
    }

    fn schema_for(&self, capability: &str) -> Option<Value> {
        self.info
            .capabilities
            .iter()
            .find(|c| c.name == capability)
            .and_then(capability_schema)
    }
}

/// A passive component: registered and discovered, never discovering.
pub struct Tool {
    core: ComponentCore,
    registry: Arc<RwLock<Option<Arc<dyn Registry>>>>,
}

impl Tool {
    pub fn id(&self) -> &str {
        &self.core.info.id
    }

    pub fn name(&self) -> &str {
        &self.core.info.name
    }

    pub fn info(&self) -> &ServiceInfo {
        &self.core.info
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.core.info.capabilities
    }

    /// Whether a live registry reference is currently held.
    pub fn is_registered(&self) -> bool {
        self.registry.read().unwrap().is_some()
    }

    /// Body served at `GET /health` when health checks are enabled.
    pub fn health_payload(&self) -> Value {
        self.core.health_payload()
    }

    /// JSON Schema served at `GET <endpoint>/schema`, when the
    /// capability declares input hints.
    pub fn schema_for(&self, capability: &str) -> Option<Value> {
        self.core.schema_for(capability)
    }

    /// Register with the discovery store and start the heartbeat.
    ///
    /// With retry enabled, store unreachability is not an error: the
    /// tool starts without a registry and acquires one in the
    /// background.
    pub async fn initialize(&self) -> Result<()> {
        let core = &self.core;
        if !core.config.discovery.enabled {
            core.logger
                .info("Service discovery disabled", &fields! {});
            return Ok(());
        }

        if core.config.discovery.mock {
            let registry: Arc<dyn Registry> = core.mock_registry.clone();
            registry.register(&core.info).await?;
            registry.clone().start_heartbeat(&core.info.id)?;
            *self.registry.write().unwrap() = Some(registry);
            core.logger
                .info("Registered with in-memory registry", &fields! {});
            return Ok(());
        }

        match RedisRegistry::connect(&core.config.redis_url, core.registry_options()).await {
            Ok(registry) => {
                let registry = Arc::new(registry);
                registry.register(&core.info).await?;
                registry.clone().start_heartbeat(&core.info.id)?;
                *self.registry.write().unwrap() = Some(registry);
                core.logger.info(
                    "Registered with service registry",
                    &fields! { "address" => core.info.address, "port" => core.info.port },
                );
                Ok(())
            }
            Err(e) if core.config.discovery.retry_on_failure => {
                let slot = self.registry.clone();
                let id = core.info.id.clone();
                let handle = spawn_registry_retry(
                    core.config.redis_url.clone(),
                    core.info.clone(),
                    core.config.discovery.retry_interval,
                    core.registry_options(),
                    Box::new(move |new_registry| {
                        // Cancel the old heartbeat outside the reference
                        // lock; stop_heartbeat takes its own locks.
                        let old = slot.write().unwrap().take();
                        if let Some(old) = old {
                            old.stop_heartbeat(&id);
                        }
                        *slot.write().unwrap() = Some(new_registry);
                        Ok(())
                    }),
                );
                *core.retry.lock().unwrap() = Some(handle);
                core.logger.warn(
                    "Running without service registry; background retry started",
                    &fields! { "error" => e.to_string() },
                );
                Ok(())
            }
            Err(e) => {
                core.logger.warn(
                    "Running without service registry",
                    &fields! { "error" => e.to_string() },
                );
                Ok(())
            }
        }
    }

    /// Unregister best-effort within the deadline, stop the heartbeat,
    /// and cancel any background retry.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.core.cancel_retry();

        let registry = self.registry.write().unwrap().take();
        if let Some(registry) = registry {
            // A heartbeat tick racing this finds no mirror entry left
            // to re-register from.
            match timeout(deadline, registry.unregister(self.id())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.core.logger.warn(
                    "Unregister failed during shutdown",
                    &fields! { "error" => e.to_string() },
                ),
                Err(_) => self.core.logger.warn(
                    "Unregister timed out during shutdown",
                    &fields! { "deadline_ms" => deadline.as_millis() as u64 },
                ),
            }
            registry.stop_heartbeat(self.id());
        }
        self.core.logger.info("Component shut down", &fields! {});
        Ok(())
    }
}

/// An active component: registers itself and queries the registry.
pub struct Agent {
    core: ComponentCore,
    discovery: Arc<RwLock<Option<Arc<dyn Discovery>>>>,
}

impl Agent {
    pub fn id(&self) -> &str {
        &self.core.info.id
    }

    pub fn name(&self) -> &str {
        &self.core.info.name
    }

    pub fn info(&self) -> &ServiceInfo {
        &self.core.info
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.core.info.capabilities
    }

    pub fn is_registered(&self) -> bool {
        self.discovery.read().unwrap().is_some()
    }

    pub fn health_payload(&self) -> Value {
        self.core.health_payload()
    }

    pub fn schema_for(&self, capability: &str) -> Option<Value> {
        self.core.schema_for(capability)
    }

    /// Query the registry. During an outage (no registry reference yet)
    /// this returns an empty result rather than an error.
    pub async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<ServiceInfo>> {
        let discovery = self.discovery.read().unwrap().clone();
        match discovery {
            Some(discovery) => discovery.discover(filter).await,
            None => Ok(Vec::new()),
        }
    }

    /// Register with the discovery store and start the heartbeat; see
    /// [`Tool::initialize`] for the failure policy.
    pub async fn initialize(&self) -> Result<()> {
        let core = &self.core;
        if !core.config.discovery.enabled {
            core.logger
                .info("Service discovery disabled", &fields! {});
            return Ok(());
        }

        if core.config.discovery.mock {
            let discovery: Arc<dyn Discovery> = core.mock_registry.clone();
            discovery.register(&core.info).await?;
            discovery.clone().start_heartbeat(&core.info.id)?;
            *self.discovery.write().unwrap() = Some(discovery);
            core.logger
                .info("Registered with in-memory registry", &fields! {});
            return Ok(());
        }

        match crate::discovery::RedisDiscovery::connect(
            &core.config.redis_url,
            core.registry_options(),
        )
        .await
        {
            Ok(discovery) => {
                let discovery = Arc::new(discovery);
                discovery.register(&core.info).await?;
                discovery.clone().start_heartbeat(&core.info.id)?;
                *self.discovery.write().unwrap() = Some(discovery);
                core.logger.info(
                    "Registered with service registry",
                    &fields! { "address" => core.info.address, "port" => core.info.port },
                );
                Ok(())
            }
            Err(e) if core.config.discovery.retry_on_failure => {
                let slot = self.discovery.clone();
                let id = core.info.id.clone();
                let handle = spawn_discovery_retry(
                    core.config.redis_url.clone(),
                    core.info.clone(),
                    core.config.discovery.retry_interval,
                    core.registry_options(),
                    Box::new(move |new_discovery| {
                        // Cancel the old heartbeat outside the reference
                        // lock; stop_heartbeat takes its own locks.
                        let old = slot.write().unwrap().take();
                        if let Some(old) = old {
                            old.stop_heartbeat(&id);
                        }
                        *slot.write().unwrap() = Some(new_discovery);
                        Ok(())
                    }),
                );
                *core.retry.lock().unwrap() = Some(handle);
                core.logger.warn(
                    "Running without service registry; background retry started",
                    &fields! { "error" => e.to_string() },
                );
                Ok(())
            }
            Err(e) => {
                core.logger.warn(
                    "Running without service registry",
                    &fields! { "error" => e.to_string() },
                );
                Ok(())
            }
        }
    }

    /// Unregister best-effort within the deadline, stop the heartbeat,
    /// and cancel any background retry.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.core.cancel_retry();

        let discovery = self.discovery.write().unwrap().take();
        if let Some(discovery) = discovery {
            // A heartbeat tick racing this finds no mirror entry left
            // to re-register from.
            match timeout(deadline, discovery.unregister(self.id())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.core.logger.warn(
                    "Unregister failed during shutdown",
                    &fields! { "error" => e.to_string() },
                ),
                Err(_) => self.core.logger.warn(
                    "Unregister timed out during shutdown",
                    &fields! { "deadline_ms" => deadline.as_millis() as u64 },
                ),
            }
            discovery.stop_heartbeat(self.id());
        }
        self.core.logger.info("Component shut down", &fields! {});
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{FieldHint, InputSummary};

    fn dev_config(name: &str) -> Config {
        let mut config = Config {
            name: name.to_string(),
            ..Config::default()
        };
        config.discovery.mock = true;
        config
    }

    fn add_capability() -> Capability {
        Capability::new("add").with_input_summary(InputSummary {
            required: vec![FieldHint::new("a", "number"), FieldHint::new("b", "number")],
            optional: vec![],
        })
    }

    #[test]
    fn test_framework_rejects_invalid_config() {
        let config = Config {
            name: String::new(),
            ..Config::default()
        };
        assert!(Framework::new(config).is_err());
    }

    #[tokio::test]
    async fn test_tool_initialize_in_dev_mode() {
        let framework = Framework::new(dev_config("calc")).unwrap();
        let tool = framework.tool(vec![add_capability()]);

        tool.initialize().await.unwrap();
        assert!(tool.is_registered());
        assert!(tool.id().starts_with("calc-"));

        tool.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(!tool.is_registered());
    }

    #[tokio::test]
    async fn test_agent_discovers_tool_from_same_framework() {
        let framework = Framework::new(dev_config("mesh")).unwrap();
        let tool = framework.tool(vec![add_capability()]);
        let agent = framework.agent(vec![]);

        tool.initialize().await.unwrap();
        agent.initialize().await.unwrap();

        let found = agent
            .discover(&DiscoveryFilter::default().with_capability("add"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, tool.id());

        tool.shutdown(Duration::from_secs(1)).await.unwrap();
        let found = agent
            .discover(&DiscoveryFilter::default().with_capability("add"))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_discovery_leaves_no_registry() {
        let mut config = dev_config("quiet");
        config.discovery.enabled = false;

        let framework = Framework::new(config).unwrap();
        let agent = framework.agent(vec![]);
        agent.initialize().await.unwrap();

        assert!(!agent.is_registered());
        // Discover during an outage is an empty success, not an error.
        let found = agent.discover(&DiscoveryFilter::default()).await.unwrap();
        assert!(found.is_empty());

        agent.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_payload_contract() {
        let framework = Framework::new(dev_config("calc")).unwrap();
        let tool = framework.tool(vec![]);

        let payload = tool.health_payload();
        assert_eq!(payload["status"], "healthy");
        assert_eq!(payload["type"], "tool");
        assert_eq!(payload["name"], "calc");
        assert_eq!(payload["id"], tool.id());
    }

    #[tokio::test]
    async fn test_schema_for_capability() {
        let framework = Framework::new(dev_config("calc")).unwrap();
        let tool = framework.tool(vec![add_capability(), Capability::new("noop")]);

        let schema = tool.schema_for("add").unwrap();
        assert_eq!(schema["title"], "add");
        assert_eq!(schema["required"], json!(["a", "b"]));

        // No input summary, no schema document.
        assert!(tool.schema_for("noop").is_none());
        assert!(tool.schema_for("missing").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_store_starts_retry_supervisor() {
        let mut config = Config {
            name: "resilient".to_string(),
            redis_url: "redis://127.0.0.1:1".to_string(),
            ..Config::default()
        };
        config.discovery.retry_on_failure = true;
        config.discovery.retry_interval = Duration::from_millis(50);

        let framework = Framework::new(config).unwrap();
        let tool = framework.tool(vec![]);

        // Initialization succeeds despite the unreachable store.
        tool.initialize().await.unwrap();
        assert!(!tool.is_registered());
        assert!(tool.core.retry.lock().unwrap().is_some());

        tool.shutdown(Duration::from_millis(200)).await.unwrap();
    }

    #[tokio::test]
    async fn test_metadata_attached_from_config() {
        let mut config = dev_config("calc");
        config.kubernetes.pod_name = "calc-7d9f".to_string();

        let framework = Framework::new(config).unwrap();
        let tool = framework.tool(vec![]);
        assert_eq!(tool.info().metadata["pod_name"], json!("calc-7d9f"));
        assert_eq!(tool.info().metadata["namespace"], json!("gomind"));
    }
}
