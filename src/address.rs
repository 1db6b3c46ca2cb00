//! Address resolution for registered components.
//!
//! Pure functions of the configuration: what `(address, port)` a
//! registered entry advertises, and the environment metadata describing
//! where it runs.

use std::collections::HashMap;

use serde_json::Value;

use crate::config::{kubernetes_hints, Config};

/// Resolve the address and port a registered entry should advertise.
///
/// Precedence:
/// 1. Kubernetes mode with a service name: the in-cluster DNS name
///    `<service>.<namespace-or-"default">.svc.cluster.local` with the
///    Kubernetes service port.
/// 2. A non-empty configured address, with the configured port.
/// 3. `"localhost"` with the configured port.
///
/// An absent config resolves to `("localhost", 8080)`.
pub fn resolve_service_address(config: Option<&Config>) -> (String, u16) {
    let config = match config {
        Some(c) => c,
        None => return ("localhost".to_string(), 8080),
    };

    let k8s = &config.kubernetes;
    if k8s.enabled && !k8s.service_name.is_empty() {
        let namespace = if k8s.namespace.is_empty() {
            "default"
        } else {
            k8s.namespace.as_str()
        };
        let address = format!("{}.{}.svc.cluster.local", k8s.service_name, namespace);
        return (address, k8s.service_port);
    }

    if !config.address.is_empty() {
        return (config.address.clone(), config.port);
    }

    ("localhost".to_string(), config.port)
}

/// Build the metadata map attached to a registered entry.
///
/// Contains the environment hints (namespace, pod, node, ports) that
/// make metadata-filtered discovery possible, e.g. "all agents in the
/// production pod". An absent config produces an empty map.
pub fn build_service_metadata(config: Option<&Config>) -> HashMap<String, Value> {
    match config {
        Some(c) => kubernetes_hints(c),
        None => HashMap::new(),
    }
}
