//! Heartbeat supervisor for registered services.
//!
//! One supervisor task per registered id:
//! - ticks at `T/2` plus a uniform jitter in `[0, T/8]` so co-starting
//!   instances spread their load on the store
//! - refreshes health and every index-set TTL on each tick
//! - self-heals on `service-not-found` by re-registering from the local
//!   mirror, after a secondary jitter in `[0, 1 s)`
//! - logs a stats summary every five minutes of uptime and a final one
//!   on cancel

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::error::{CoreError, Result};
use crate::fields;
use crate::registry::{RedisRegistry, Registry};
use crate::service::HealthStatus;

/// Wall-clock interval between periodic stats summaries.
pub const SUMMARY_INTERVAL: Duration = Duration::from_secs(300);

/// Upper bound of the secondary jitter drawn before a self-healing
/// re-registration, so a registry restart does not trigger a thundering
/// herd of re-registrations.
const SELF_HEAL_JITTER: Duration = Duration::from_secs(1);

/// Cancel handle for one running supervisor.
pub(crate) struct HeartbeatHandle {
    shutdown: mpsc::Sender<()>,
}

/// Counters and timestamps for one active heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub started_at: Instant,
    pub last_summary_at: Instant,
}

impl HeartbeatStats {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            success_count: 0,
            failure_count: 0,
            last_success: None,
            last_failure: None,
            started_at: now,
            last_summary_at: now,
        }
    }

    /// Fraction of ticks that succeeded, in `[0, 1]`.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64
    }

    /// Time since the supervisor started.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn record_success(&mut self) {
        self.success_count += 1;
        self.last_success = Some(Instant::now());
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
    }
}

/// Uniform jitter in `[0, max)` from the thread-local CSPRNG.
pub(crate) fn jitter(max: Duration) -> Duration {
    let millis = max.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..millis))
}

/// Start (or restart) the supervisor for `id` on this registry.
///
/// A still-running supervisor for the same id is cancelled first, so at
/// most one runs per `(registry, id)` pair.
pub(crate) fn start(registry: &Arc<RedisRegistry>, id: &str) -> Result<()> {
    if registry.registration_state(id).is_none() {
        return Err(CoreError::ServiceNotFound(format!(
            "cannot heartbeat unregistered service '{}'",
            id
        )));
    }

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let previous = registry
        .heartbeats
        .lock()
        .unwrap()
        .insert(id.to_string(), HeartbeatHandle { shutdown: shutdown_tx });
    if let Some(previous) = previous {
        let _ = previous.shutdown.try_send(());
    }

    registry
        .stats
        .write()
        .unwrap()
        .insert(id.to_string(), HeartbeatStats::new());

    tokio::spawn(run(registry.clone(), id.to_string(), shutdown_rx));
    Ok(())
}

/// Cancel the supervisor for `id`. Safe to call repeatedly; a second
/// call is a no-op.
pub(crate) fn stop(registry: &RedisRegistry, id: &str) {
    let handle = registry.heartbeats.lock().unwrap().remove(id);
    if let Some(handle) = handle {
        let _ = handle.shutdown.try_send(());
    }
    // Stats only exist while a heartbeat is active.
    registry.stats.write().unwrap().remove(id);
}

async fn run(registry: Arc<RedisRegistry>, id: String, mut shutdown: mpsc::Receiver<()>) {
    let base_interval = registry.ttl() / 2;
    let jitter_window = registry.ttl() / 8;
    let logger = registry.logger.clone();
    let mut stats = HeartbeatStats::new();

    logger.debug(
        "Heartbeat started",
        &fields! { "service_id" => id, "interval_ms" => base_interval.as_millis() as u64 },
    );

    loop {
        let tick = base_interval + jitter(jitter_window);
        tokio::select! {
            _ = sleep(tick) => {}
            _ = shutdown.recv() => break,
        }

        // A stuck store call must not delay the next tick indefinitely.
        let outcome = timeout(
            base_interval,
            registry.update_health(&id, HealthStatus::Healthy),
        )
        .await;

        match outcome {
            Ok(Ok(())) => stats.record_success(),
            Ok(Err(e)) if e.is_not_found() => {
                let healed = self_heal(&registry, &id, &mut shutdown).await;
                match healed {
                    SelfHeal::Recovered => stats.record_success(),
                    SelfHeal::Failed => stats.record_failure(),
                    SelfHeal::Cancelled => break,
                }
            }
            Ok(Err(e)) => {
                logger.warn(
                    "Heartbeat health update failed",
                    &fields! { "service_id" => id, "error" => e.to_string() },
                );
                stats.record_failure();
            }
            Err(_) => {
                logger.warn(
                    "Heartbeat health update timed out",
                    &fields! { "service_id" => id, "timeout_ms" => base_interval.as_millis() as u64 },
                );
                stats.record_failure();
            }
        }

        publish(&registry, &id, &stats);

        if stats.last_summary_at.elapsed() >= SUMMARY_INTERVAL {
            stats.last_summary_at = Instant::now();
            log_summary(&registry, &id, &stats, false);
        }
    }

    log_summary(&registry, &id, &stats, true);
}

enum SelfHeal {
    Recovered,
    Failed,
    Cancelled,
}

/// Re-register from the local mirror after the service key expired
/// behind the supervisor's back.
async fn self_heal(
    registry: &Arc<RedisRegistry>,
    id: &str,
    shutdown: &mut mpsc::Receiver<()>,
) -> SelfHeal {
    let logger = &registry.logger;

    tokio::select! {
        _ = sleep(jitter(SELF_HEAL_JITTER)) => {}
        _ = shutdown.recv() => return SelfHeal::Cancelled,
    }

    let info = match registry.registration_state(id) {
        Some(info) => info,
        None => {
            logger.warn(
                "No registration state for self-healing",
                &fields! { "service_id" => id },
            );
            return SelfHeal::Failed;
        }
    };

    match registry.register(&info).await {
        Ok(()) => {
            logger.info(
                "Re-registered service after key expiry",
                &fields! { "service_id" => id, "name" => info.name },
            );
            SelfHeal::Recovered
        }
        Err(e) => {
            logger.warn(
                "Self-healing re-registration failed",
                &fields! { "service_id" => id, "error" => e.to_string() },
            );
            SelfHeal::Failed
        }
    }
}

/// Mirror the supervisor-local stats into the shared map. Only updates
/// an existing slot: once `stop` removed the entry, a late in-flight
/// tick cannot resurrect it.
fn publish(registry: &RedisRegistry, id: &str, stats: &HeartbeatStats) {
    if let Some(slot) = registry.stats.write().unwrap().get_mut(id) {
        *slot = stats.clone();
    }
}

fn log_summary(registry: &RedisRegistry, id: &str, stats: &HeartbeatStats, fin: bool) {
    let message = if fin {
        "Heartbeat stopped"
    } else {
        "Heartbeat summary"
    };
    registry.logger.info(
        message,
        &fields! {
            "service_id" => id,
            "success_count" => stats.success_count,
            "failure_count" => stats.failure_count,
            "success_rate" => stats.success_rate(),
            "uptime_minutes" => stats.uptime().as_secs() / 60,
            "seconds_since_last_success" =>
                stats.last_success.map(|at| at.elapsed().as_secs()),
            "seconds_since_last_failure" =>
                stats.last_failure.map(|at| at.elapsed().as_secs()),
        },
    );
}
