//! Service data model for the GoMind mesh.
//!
//! These types define what gets registered, stored, and discovered:
//! - `ServiceInfo`: the single registered entity
//! - `Capability`: a named endpoint a component exposes
//! - `DiscoveryFilter`: the query value accepted by discovery

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of registered component.
///
/// Tools are passive (registered and discovered, never discovering);
/// agents additionally query the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    Tool,
    Agent,
}

impl ComponentType {
    /// String form used in index keys and API payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Tool => "tool",
            ComponentType::Agent => "agent",
        }
    }
}

/// Health of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// String form used in API payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

/// One input-field hint used to generate a JSON-schema document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldHint {
    /// Field name as it appears in the request payload
    pub name: String,

    /// JSON type ("string", "number", "boolean", ...)
    #[serde(rename = "type")]
    pub field_type: String,

    /// Human-readable description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Example value surfaced in the generated schema
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<Value>,
}

impl FieldHint {
    /// Create a hint with just a name and type.
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            description: None,
            example: None,
        }
    }
}

/// Required/optional field hints attached to a capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InputSummary {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<FieldHint>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional: Vec<FieldHint>,
}

impl InputSummary {
    /// Whether any field is declared at all.
    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.optional.is_empty()
    }
}

/// A named endpoint a component exposes for discovery and invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Capability name used in the discovery index
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Relative URL path serving this capability
    #[serde(default)]
    pub endpoint: String,

    /// Relative URL path serving the generated JSON schema, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_endpoint: Option<String>,

    /// Field hints used to generate the JSON-schema document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_summary: Option<InputSummary>,
}

impl Capability {
    /// Create a capability with a name and default endpoint path.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let endpoint = format!("/api/capabilities/{}", name);
        Self {
            name,
            description: String::new(),
            endpoint,
            schema_endpoint: None,
            input_summary: None,
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Attach input field hints.
    pub fn with_input_summary(mut self, summary: InputSummary) -> Self {
        self.input_summary = Some(summary);
        self
    }
}

/// The registered entity: one running tool or agent instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Unique per process lifetime: name plus a random suffix
    pub id: String,

    /// Human-chosen service name
    pub name: String,

    /// Component kind
    #[serde(rename = "type")]
    pub component_type: ComponentType,

    /// Advertised host or DNS name
    pub address: String,

    /// Advertised port
    pub port: u16,

    /// Ordered capability list
    #[serde(default)]
    pub capabilities: Vec<Capability>,

    /// Current health
    #[serde(default)]
    pub health: HealthStatus,

    /// Unix-seconds timestamp of the last heartbeat
    pub last_seen: u64,

    /// Small, bounded environment metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl ServiceInfo {
    /// Create a new service with a fresh `<name>-<suffix>` id.
    pub fn new(name: impl Into<String>, component_type: ComponentType) -> Self {
        let name = name.into();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", name, &suffix[..8]);
        Self {
            id,
            name,
            component_type,
            address: "localhost".to_string(),
            port: 8080,
            capabilities: Vec::new(),
            health: HealthStatus::Healthy,
            last_seen: unix_now(),
            metadata: HashMap::new(),
        }
    }

    /// Set the advertised address and port.
    pub fn with_address(mut self, address: impl Into<String>, port: u16) -> Self {
        self.address = address.into();
        self.port = port;
        self
    }

    /// Append a capability.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Insert a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Update health and refresh `last_seen`.
    pub fn touch(&mut self, health: HealthStatus) {
        self.health = health;
        self.last_seen = unix_now();
    }

    /// Capability names, in declaration order.
    pub fn capability_names(&self) -> Vec<&str> {
        self.capabilities.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Query value accepted by discovery.
///
/// All set dimensions intersect; multiple capabilities union within the
/// capability dimension ("supports at least one of"). Metadata entries
/// must all match by equality.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    pub component_type: Option<ComponentType>,
    pub name: Option<String>,
    pub capabilities: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

impl DiscoveryFilter {
    /// Filter restricted to a component type.
    pub fn with_type(mut self, component_type: ComponentType) -> Self {
        self.component_type = Some(component_type);
        self
    }

    /// Filter restricted to a service name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add one capability to the "at least one of" set.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Require a metadata key/value match.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// True when no index dimension is set (full scan).
    pub fn is_unscoped(&self) -> bool {
        self.component_type.is_none() && self.name.is_none() && self.capabilities.is_empty()
    }

    /// True when `info`'s metadata matches every filter entry.
    pub fn metadata_matches(&self, info: &ServiceInfo) -> bool {
        self.metadata
            .iter()
            .all(|(k, v)| info.metadata.get(k) == Some(v))
    }
}

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
