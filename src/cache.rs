//! Schema cache fronting the registry store.
//!
//! Read-through cache mapping `(tool, capability)` to a JSON-schema
//! document, used to validate request payloads before invoking a
//! discovered capability. Misses include absent keys, store read
//! errors, and corrupt cached bytes; none of them surface to callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::fields;
use crate::logger::{for_component, Logger};
use crate::store::KvStore;

/// Default key prefix.
pub const DEFAULT_SCHEMA_PREFIX: &str = "gomind:schema:";

/// Default document lifetime.
pub const DEFAULT_SCHEMA_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Hit/miss counters reported by [`SchemaCache::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_lookups: u64,
    pub hit_rate: f64,
}

/// Shared, TTL'd schema cache over the registry store.
pub struct SchemaCache {
    store: Arc<dyn KvStore>,
    prefix: String,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    logger: Arc<dyn Logger>,
}

impl SchemaCache {
    /// Cache with the default prefix and TTL.
    pub fn new(store: Arc<dyn KvStore>, logger: Arc<dyn Logger>) -> Self {
        Self::with_options(store, DEFAULT_SCHEMA_PREFIX, DEFAULT_SCHEMA_TTL, logger)
    }

    pub fn with_options(
        store: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        ttl: Duration,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            logger: for_component(&logger, "framework/schema-cache"),
        }
    }

    fn key(&self, tool: &str, capability: &str) -> String {
        format!("{}{}:{}", self.prefix, tool, capability)
    }

    /// Look up the schema for `(tool, capability)`. `None` is a miss;
    /// corrupt cached bytes and store errors count as misses and are
    /// never surfaced.
    pub async fn get(&self, tool: &str, capability: &str) -> Option<Value> {
        let key = self.key(tool, capability);

        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                self.logger.warn(
                    "Schema cache read failed",
                    &fields! { "key" => key, "error" => e.to_string() },
                );
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(schema) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(schema)
            }
            Err(e) => {
                self.logger.warn(
                    "Discarding corrupt cached schema",
                    &fields! { "key" => key, "error" => e.to_string() },
                );
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store the schema for `(tool, capability)` with the cache TTL.
    /// Errors only on store write failure.
    pub async fn set(&self, tool: &str, capability: &str, schema: &Value) -> Result<()> {
        let payload = serde_json::to_string(schema).map_err(CoreError::Marshal)?;
        self.store
            .set(&self.key(tool, capability), &payload, self.ttl)
            .await
    }

    /// Current counters. Consistent enough for monitoring; hits and
    /// misses are updated atomically by concurrent lookups.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            total_lookups: total,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}
