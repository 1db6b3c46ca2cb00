//! GoMind core: service registry and discovery for a distributed
//! agent/tool mesh.
//!
//! Components (passive tools and active agents) run as independent
//! network services and find each other by name, type, or capability
//! through a shared key/value store. The core provides:
//! - atomic multi-index registration with TTL-bounded liveness
//! - self-healing heartbeats that re-register expired entries
//! - a discovery query engine over the type/name/capability indices
//! - a background retry supervisor for registry outages at startup
//! - a TTL'd schema cache for capability input validation

pub mod address;
pub mod cache;
pub mod component;
pub mod config;
pub mod discovery;
pub mod error;
pub mod heartbeat;
pub mod logger;
pub mod memory;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod service;
pub mod store;

pub use cache::{CacheStats, SchemaCache};
pub use component::{Agent, Framework, Tool};
pub use config::{Config, DiscoveryConfig, KubernetesConfig};
pub use discovery::{Discovery, RedisDiscovery};
pub use error::{CoreError, ErrorKind, Result};
pub use heartbeat::HeartbeatStats;
pub use logger::{init_logging, Logger, TracingLogger};
pub use memory::MemoryRegistry;
pub use metrics::MetricsSink;
pub use registry::{RedisRegistry, Registry, RegistryOptions, DEFAULT_TTL};
pub use retry::{spawn_discovery_retry, spawn_registry_retry, RetryHandle};
pub use service::{
    Capability, ComponentType, DiscoveryFilter, FieldHint, HealthStatus, InputSummary, ServiceInfo,
};
pub use store::{KvStore, MemoryStore, RedisStore, StorePipeline};
