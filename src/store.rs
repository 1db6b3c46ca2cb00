//! Key/value store client backing the registry.
//!
//! Provides a stable surface to the rest of the core:
//! - string GET/SET with TTL, DEL
//! - set membership (SADD/SREM/SMEMBERS)
//! - key expiry refresh (EXPIRE), pattern scan (KEYS), PING
//! - a transactional pipeline committing a batch atomically
//!
//! Two implementations: `RedisStore` for production and `MemoryStore`
//! (TTL-aware, single-process) for tests and development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::{sleep, timeout};

use crate::config::validate_store_url;
use crate::error::{CoreError, Result};
use crate::logger::{for_component, Logger};
use crate::fields;

/// Per-operation timeout.
pub const OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum concurrent in-flight store operations.
pub const MAX_CONCURRENT_OPS: usize = 10;

/// Bound on waiting for an operation slot.
pub const SLOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Internal retries per operation.
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_BACKOFF: Duration = Duration::from_millis(100);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Startup connect: PING attempts, per-attempt timeout, fixed backoff.
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// One command inside a transactional pipeline.
#[derive(Debug, Clone)]
pub enum PipelineCmd {
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    Del {
        key: String,
    },
}

/// A batch of commands committed atomically (MULTI/EXEC on Redis).
#[derive(Debug, Clone, Default)]
pub struct StorePipeline {
    cmds: Vec<PipelineCmd>,
}

impl StorePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ex(mut self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Self {
        self.cmds.push(PipelineCmd::SetEx {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn sadd(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.cmds.push(PipelineCmd::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.cmds.push(PipelineCmd::SRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.cmds.push(PipelineCmd::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.cmds.push(PipelineCmd::Del { key: key.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    fn commands(&self) -> &[PipelineCmd] {
        &self.cmds
    }
}

/// Stable store surface used by registry, discovery, and schema cache.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
    async fn ping(&self) -> Result<()>;

    /// Commit every command in the pipeline atomically, or none of them.
    async fn exec(&self, pipeline: StorePipeline) -> Result<()>;
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

// ============================================================================
// Redis implementation
// ============================================================================

/// Redis-backed store with bounded concurrency, per-op timeouts, and
/// internal retries on transient errors.
pub struct RedisStore {
    client: redis::Client,
    conn: RwLock<redis::aio::MultiplexedConnection>,
    slots: Semaphore,
    logger: Arc<dyn Logger>,
}

impl RedisStore {
    /// Connect to the store at `url`.
    ///
    /// Validates the URL form, then performs up to three PING attempts
    /// with a fixed backoff between them. Fails with
    /// `invalid-configuration` on a bad URL and `connection-failed`
    /// when the store never answers.
    pub async fn connect(url: &str, logger: Arc<dyn Logger>) -> Result<Self> {
        validate_store_url(url)?;
        let logger = for_component(&logger, "framework/store");

        let client = redis::Client::open(url)
            .map_err(|e| CoreError::InvalidConfiguration(format!("store URL: {}", e)))?;

        let mut last_error = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            match timeout(CONNECT_TIMEOUT, Self::ping_once(&client)).await {
                Ok(Ok(conn)) => {
                    logger.debug(
                        "Connected to registry store",
                        &fields! { "attempt" => attempt },
                    );
                    return Ok(Self {
                        client,
                        conn: RwLock::new(conn),
                        slots: Semaphore::new(MAX_CONCURRENT_OPS),
                        logger,
                    });
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("ping timed out after {:?}", CONNECT_TIMEOUT),
            }
            logger.warn(
                "Store connect attempt failed",
                &fields! { "attempt" => attempt, "error" => last_error.clone() },
            );
            if attempt < CONNECT_ATTEMPTS {
                sleep(CONNECT_BACKOFF).await;
            }
        }

        Err(CoreError::ConnectionFailed(last_error))
    }

    async fn ping_once(
        client: &redis::Client,
    ) -> std::result::Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(conn)
    }

    fn is_retryable(error: &redis::RedisError) -> bool {
        error.is_io_error()
            || error.is_timeout()
            || error.is_connection_dropped()
            || error.is_connection_refusal()
    }

    async fn reconnect(&self) {
        match self.client.get_multiplexed_async_connection().await {
            Ok(fresh) => {
                *self.conn.write().await = fresh;
            }
            Err(e) => {
                self.logger.warn(
                    "Store reconnect failed",
                    &fields! { "error" => e.to_string() },
                );
            }
        }
    }

    async fn acquire_slot(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        match timeout(SLOT_TIMEOUT, self.slots.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(CoreError::ConnectionFailed(
                "store client closed".to_string(),
            )),
            Err(_) => Err(CoreError::Timeout {
                op: "acquire-slot",
                timeout: SLOT_TIMEOUT,
            }),
        }
    }

    /// Run a command with the shared timeout/retry policy.
    async fn query<T>(&self, op: &'static str, cmd: &redis::Cmd) -> Result<T>
    where
        T: redis::FromRedisValue + Send + 'static,
    {
        let _slot = self.acquire_slot().await?;

        let mut attempt = 0u32;
        loop {
            let mut conn = self.conn.read().await.clone();
            let outcome: std::result::Result<redis::RedisResult<T>, _> =
                timeout(OP_TIMEOUT, cmd.query_async(&mut conn)).await;

            match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if attempt < MAX_RETRIES && Self::is_retryable(&e) => {
                    self.backoff(op, attempt, &e.to_string()).await;
                    attempt += 1;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) if attempt < MAX_RETRIES => {
                    self.backoff(op, attempt, "timeout").await;
                    attempt += 1;
                }
                Err(_) => {
                    return Err(CoreError::Timeout {
                        op,
                        timeout: OP_TIMEOUT,
                    })
                }
            }
        }
    }

    async fn backoff(&self, op: &'static str, attempt: u32, error: &str) {
        let factor = 2u32.saturating_pow(attempt);
        let delay = RETRY_BASE_BACKOFF
            .saturating_mul(factor)
            .min(RETRY_MAX_BACKOFF);
        self.logger.debug(
            "Retrying store operation",
            &fields! { "op" => op, "attempt" => attempt + 1, "error" => error },
        );
        sleep(delay).await;
        self.reconnect().await;
    }

    fn build_pipeline(pipeline: &StorePipeline) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for cmd in pipeline.commands() {
            match cmd {
                PipelineCmd::SetEx { key, value, ttl } => {
                    pipe.cmd("SET").arg(key).arg(value).arg("EX").arg(ttl_secs(*ttl)).ignore();
                }
                PipelineCmd::SAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                PipelineCmd::SRem { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member).ignore();
                }
                PipelineCmd::Expire { key, ttl } => {
                    pipe.cmd("EXPIRE").arg(key).arg(ttl_secs(*ttl)).ignore();
                }
                PipelineCmd::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
            }
        }
        pipe
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query("GET", redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let _: String = self
            .query(
                "SET",
                redis::cmd("SET").arg(key).arg(value).arg("EX").arg(ttl_secs(ttl)),
            )
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let _: i64 = self.query("DEL", redis::cmd("DEL").arg(key)).await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let _: i64 = self
            .query("SADD", redis::cmd("SADD").arg(key).arg(member))
            .await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let _: i64 = self
            .query("SREM", redis::cmd("SREM").arg(key).arg(member))
            .await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.query("SMEMBERS", redis::cmd("SMEMBERS").arg(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let _: i64 = self
            .query("EXPIRE", redis::cmd("EXPIRE").arg(key).arg(ttl_secs(ttl)))
            .await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.query("KEYS", redis::cmd("KEYS").arg(pattern)).await
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.query("PING", &redis::cmd("PING")).await?;
        Ok(())
    }

    async fn exec(&self, pipeline: StorePipeline) -> Result<()> {
        if pipeline.is_empty() {
            return Ok(());
        }
        let _slot = self.acquire_slot().await?;
        let pipe = Self::build_pipeline(&pipeline);

        let mut attempt = 0u32;
        loop {
            let mut conn = self.conn.read().await.clone();
            let outcome: std::result::Result<redis::RedisResult<redis::Value>, _> =
                timeout(OP_TIMEOUT, pipe.query_async(&mut conn)).await;

            match outcome {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) if attempt < MAX_RETRIES && Self::is_retryable(&e) => {
                    self.backoff("EXEC", attempt, &e.to_string()).await;
                    attempt += 1;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) if attempt < MAX_RETRIES => {
                    self.backoff("EXEC", attempt, "timeout").await;
                    attempt += 1;
                }
                Err(_) => {
                    return Err(CoreError::Timeout {
                        op: "EXEC",
                        timeout: OP_TIMEOUT,
                    })
                }
            }
        }
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug, Clone)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
struct SetEntry {
    // Insertion-ordered, deduplicated members.
    members: Vec<String>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, StringEntry>,
    sets: HashMap<String, SetEntry>,
}

impl MemoryInner {
    fn purge_string(&mut self, key: &str) {
        if let Some(entry) = self.strings.get(key) {
            if entry.expires_at.map(|at| at <= Instant::now()).unwrap_or(false) {
                self.strings.remove(key);
            }
        }
    }

    fn purge_set(&mut self, key: &str) {
        if let Some(entry) = self.sets.get(key) {
            if entry.expires_at.map(|at| at <= Instant::now()).unwrap_or(false) {
                self.sets.remove(key);
            }
        }
    }

    fn apply(&mut self, cmd: &PipelineCmd) {
        match cmd {
            PipelineCmd::SetEx { key, value, ttl } => {
                self.strings.insert(
                    key.clone(),
                    StringEntry {
                        value: value.clone(),
                        expires_at: Some(Instant::now() + *ttl),
                    },
                );
            }
            PipelineCmd::SAdd { key, member } => {
                self.purge_set(key);
                let entry = self.sets.entry(key.clone()).or_default();
                if !entry.members.iter().any(|m| m == member) {
                    entry.members.push(member.clone());
                }
            }
            PipelineCmd::SRem { key, member } => {
                self.purge_set(key);
                if let Some(entry) = self.sets.get_mut(key) {
                    entry.members.retain(|m| m != member);
                    if entry.members.is_empty() {
                        self.sets.remove(key);
                    }
                }
            }
            PipelineCmd::Expire { key, ttl } => {
                let deadline = Instant::now() + *ttl;
                self.purge_string(key);
                self.purge_set(key);
                if let Some(entry) = self.strings.get_mut(key) {
                    entry.expires_at = Some(deadline);
                }
                if let Some(entry) = self.sets.get_mut(key) {
                    entry.expires_at = Some(deadline);
                }
            }
            PipelineCmd::Del { key } => {
                self.strings.remove(key);
                self.sets.remove(key);
            }
        }
    }
}

/// Single-process store with real TTL semantics (lazily enforced).
/// Used in tests and development so the registry core runs unchanged
/// without a Redis server.
#[derive(Default)]
pub struct MemoryStore {
    inner: std::sync::Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Glob-style key pattern (`*`, `?`) to an anchored regex.
    fn pattern_to_regex(pattern: &str) -> Result<regex::Regex> {
        let mut translated = String::with_capacity(pattern.len() + 8);
        translated.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => translated.push_str(".*"),
                '?' => translated.push('.'),
                other => translated.push_str(&regex::escape(&other.to_string())),
            }
        }
        translated.push('$');
        regex::Regex::new(&translated)
            .map_err(|e| CoreError::InvalidConfiguration(format!("key pattern: {}", e)))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_string(key);
        Ok(inner.strings.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.apply(&PipelineCmd::SetEx {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        });
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.apply(&PipelineCmd::Del {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.apply(&PipelineCmd::SAdd {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.apply(&PipelineCmd::SRem {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_set(key);
        Ok(inner
            .sets
            .get(key)
            .map(|e| e.members.clone())
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.apply(&PipelineCmd::Expire {
            key: key.to_string(),
            ttl,
        });
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let regex = Self::pattern_to_regex(pattern)?;
        let mut inner = self.inner.lock().unwrap();

        let now = Instant::now();
        inner
            .strings
            .retain(|_, e| e.expires_at.map(|at| at > now).unwrap_or(true));
        inner
            .sets
            .retain(|_, e| e.expires_at.map(|at| at > now).unwrap_or(true));

        let mut matches: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.sets.keys())
            .filter(|k| regex.is_match(k))
            .cloned()
            .collect();
        matches.sort();
        matches.dedup();
        Ok(matches)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn exec(&self, pipeline: StorePipeline) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for cmd in pipeline.commands() {
            inner.apply(cmd);
        }
        Ok(())
    }
}
