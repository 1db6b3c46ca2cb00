//! Background reconnection supervisor.
//!
//! Launched when the registry store is unreachable at component startup.
//! Ticks at an exponentially growing interval; on each tick it attempts
//! to construct a fresh registry (tools) or discovery (agents), register
//! the stored `ServiceInfo`, and start its heartbeat. On success it
//! invokes the typed callback that swaps the parent component's registry
//! reference, then terminates. Cancellation terminates it without
//! invoking the callback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::discovery::RedisDiscovery;
use crate::error::Result;
use crate::fields;
use crate::logger::{for_component, Logger};
use crate::registry::{RedisRegistry, Registry, RegistryOptions};
use crate::service::ServiceInfo;

/// Default initial retry interval.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Cap on the doubled retry interval.
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(300);

/// Callback receiving the freshly-connected registry (tool components).
pub type RegistryCallback = Box<dyn FnOnce(Arc<RedisRegistry>) -> Result<()> + Send>;

/// Callback receiving the freshly-connected discovery (agent components).
pub type DiscoveryCallback = Box<dyn FnOnce(Arc<RedisDiscovery>) -> Result<()> + Send>;

/// Handle to a running retry supervisor.
pub struct RetryHandle {
    shutdown: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl RetryHandle {
    /// Request cancellation. The supervisor exits at its next suspension
    /// point without invoking the callback.
    pub fn cancel(&self) {
        let _ = self.shutdown.try_send(());
    }

    /// Whether the supervisor task has terminated.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the supervisor task to terminate.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// One reconnection strategy: how to build a handle worth handing to
/// the success callback.
#[async_trait]
pub(crate) trait Connect: Send + Sync {
    type Handle: Send + 'static;

    async fn connect(&self) -> Result<Self::Handle>;
}

/// Builds a registered, heartbeating `RedisRegistry`.
struct RegistryConnector {
    url: String,
    info: ServiceInfo,
    options: RegistryOptions,
}

#[async_trait]
impl Connect for RegistryConnector {
    type Handle = Arc<RedisRegistry>;

    async fn connect(&self) -> Result<Self::Handle> {
        let registry = Arc::new(RedisRegistry::connect(&self.url, self.options.clone()).await?);
        registry.register(&self.info).await?;
        registry.clone().start_heartbeat(&self.info.id)?;
        Ok(registry)
    }
}

/// Builds a registered, heartbeating `RedisDiscovery` (agents need the
/// query side too).
struct DiscoveryConnector {
    url: String,
    info: ServiceInfo,
    options: RegistryOptions,
}

#[async_trait]
impl Connect for DiscoveryConnector {
    type Handle = Arc<RedisDiscovery>;

    async fn connect(&self) -> Result<Self::Handle> {
        let discovery =
            Arc::new(RedisDiscovery::connect(&self.url, self.options.clone()).await?);
        discovery.register(&self.info).await?;
        discovery.clone().start_heartbeat(&self.info.id)?;
        Ok(discovery)
    }
}

/// Spawn a retry supervisor for a tool component.
pub fn spawn_registry_retry(
    url: impl Into<String>,
    info: ServiceInfo,
    initial_interval: Duration,
    options: RegistryOptions,
    callback: RegistryCallback,
) -> RetryHandle {
    let logger = for_component(&options.logger, "framework/retry");
    spawn(
        RegistryConnector {
            url: url.into(),
            info,
            options,
        },
        initial_interval,
        logger,
        callback,
    )
}

/// Spawn a retry supervisor for an agent component.
pub fn spawn_discovery_retry(
    url: impl Into<String>,
    info: ServiceInfo,
    initial_interval: Duration,
    options: RegistryOptions,
    callback: DiscoveryCallback,
) -> RetryHandle {
    let logger = for_component(&options.logger, "framework/retry");
    spawn(
        DiscoveryConnector {
            url: url.into(),
            info,
            options,
        },
        initial_interval,
        logger,
        callback,
    )
}

pub(crate) fn spawn<C>(
    connector: C,
    initial_interval: Duration,
    logger: Arc<dyn Logger>,
    callback: Box<dyn FnOnce(C::Handle) -> Result<()> + Send>,
) -> RetryHandle
where
    C: Connect + 'static,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let join = tokio::spawn(run(
        connector,
        initial_interval,
        logger,
        callback,
        shutdown_rx,
    ));
    RetryHandle {
        shutdown: shutdown_tx,
        join,
    }
}

async fn run<C>(
    connector: C,
    initial_interval: Duration,
    logger: Arc<dyn Logger>,
    callback: Box<dyn FnOnce(C::Handle) -> Result<()> + Send>,
    mut shutdown: mpsc::Receiver<()>,
) where
    C: Connect,
{
    let mut interval = initial_interval;
    let mut attempt = 0u32;

    loop {
        tokio::select! {
            _ = sleep(interval) => {}
            _ = shutdown.recv() => {
                logger.debug(
                    "Retry supervisor cancelled",
                    &fields! { "attempts" => attempt },
                );
                return;
            }
        }

        attempt += 1;
        match connector.connect().await {
            Ok(handle) => {
                logger.info(
                    "Reconnected to service registry",
                    &fields! { "attempts" => attempt },
                );
                if let Err(e) = callback(handle) {
                    logger.error(
                        "Registry swap callback failed",
                        &fields! { "error" => e.to_string() },
                    );
                }
                return;
            }
            Err(e) => {
                interval = (interval * 2).min(MAX_RETRY_INTERVAL);
                logger.warn(
                    "Service registry still unreachable",
                    &fields! {
                        "attempt" => attempt,
                        "error" => e.to_string(),
                        "next_interval_secs" => interval.as_secs(),
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Instant;
    use tokio::time::timeout;

    /// Connector that fails a fixed number of times, then succeeds.
    struct FlakyConnector {
        attempts: Arc<AtomicU32>,
        fail_first: u32,
    }

    #[async_trait]
    impl Connect for FlakyConnector {
        type Handle = ();

        async fn connect(&self) -> Result<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(CoreError::ConnectionFailed(format!("attempt {}", n)))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_callback_fires_after_store_recovers() {
        let attempts = Arc::new(AtomicU32::new(0));
        let fired = Arc::new(AtomicBool::new(false));

        let handle = spawn(
            FlakyConnector {
                attempts: attempts.clone(),
                fail_first: 2,
            },
            Duration::from_millis(30),
            crate::logger::noop(),
            Box::new({
                let fired = fired.clone();
                move |_| {
                    fired.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        timeout(Duration::from_secs(2), handle.join())
            .await
            .expect("supervisor should terminate after success");

        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_attempts_after_success() {
        let attempts = Arc::new(AtomicU32::new(0));

        let handle = spawn(
            FlakyConnector {
                attempts: attempts.clone(),
                fail_first: 0,
            },
            Duration::from_millis(20),
            crate::logger::noop(),
            Box::new(|_| Ok(())),
        );

        timeout(Duration::from_secs(1), handle.join()).await.unwrap();
        let settled = attempts.load(Ordering::SeqCst);
        sleep(Duration::from_millis(150)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), settled);
        assert_eq!(settled, 1);
    }

    #[tokio::test]
    async fn test_interval_doubles_between_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let handle = spawn(
            FlakyConnector {
                attempts: attempts.clone(),
                fail_first: 3,
            },
            Duration::from_millis(50),
            crate::logger::noop(),
            Box::new(|_| Ok(())),
        );

        timeout(Duration::from_secs(3), handle.join()).await.unwrap();

        // Ticks at 50 + 100 + 200 + 400 ms: success cannot land before
        // the undoubled schedule would allow.
        assert!(started.elapsed() >= Duration::from_millis(350));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancel_terminates_without_callback() {
        let attempts = Arc::new(AtomicU32::new(0));
        let fired = Arc::new(AtomicBool::new(false));

        let handle = spawn(
            FlakyConnector {
                attempts: attempts.clone(),
                fail_first: u32::MAX,
            },
            Duration::from_millis(40),
            crate::logger::noop(),
            Box::new({
                let fired = fired.clone();
                move |_| {
                    fired.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        sleep(Duration::from_millis(100)).await;
        handle.cancel();
        timeout(Duration::from_secs(1), handle.join()).await.unwrap();

        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_before_first_tick() {
        let handle = spawn(
            FlakyConnector {
                attempts: Arc::new(AtomicU32::new(0)),
                fail_first: u32::MAX,
            },
            Duration::from_secs(30),
            crate::logger::noop(),
            Box::new(|_| Ok(())),
        );

        handle.cancel();
        timeout(Duration::from_secs(1), handle.join()).await.unwrap();
    }
}
