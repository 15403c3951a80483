//! Lifecycle supervisor: ordered startup, health aggregation, and bounded
//! shutdown
//!
//! Storage comes up first and is the only critical dependency. The KV
//! store, broker and SMTP degrade: without KV the limiter fails open,
//! without the broker events are dropped and consumers never start. On
//! shutdown the intake gate closes, the sweeper and consumers drain under
//! one deadline, then connections close; anything still running past the
//! deadline is aborted hard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::{amqp, AmqpEventBus, EventPublisher, NullPublisher};
use crate::cache::{IdentityCache, RedisPool, TokenRevocations};
use crate::config::Config;
use crate::health::{ComponentHealth, Status};
use crate::limiter::AdmissionLimiter;
use crate::notification::{NotificationWorker, SmtpMailer, TemplateRegistry};
use crate::reservation::ReservationEngine;
use crate::storage::{create_pool, PostgresDb, PostgresGateway, StorageGateway};
use crate::sweeper::ExpirationSweeper;
use crate::Result;

/// Install the process-wide tracing subscriber. Binaries call this once
/// before `Supervisor::start`; repeated calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,flashsale_core=debug"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Boots the core and hands back a running handle
pub struct Supervisor;

impl Supervisor {
    /// Start against PostgreSQL plus whatever optional dependencies come up.
    /// Storage failure aborts startup; KV and broker failures degrade.
    pub async fn start(config: Config) -> Result<RunningCore> {
        config.validate()?;

        let pool = create_pool(&config.storage.url, config.storage.pool_size).await?;
        let gateway: Arc<dyn StorageGateway> = Arc::new(PostgresGateway::new(
            PostgresDb::new(pool.clone()),
            config.storage.tx_deadline(),
        ));

        let kv = match RedisPool::connect(&config.kv).await {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!(error = %e, "KV store unavailable; limiter fails open, cache disabled");
                None
            }
        };

        let bus = match AmqpEventBus::connect(config.broker.clone()).await {
            Ok(bus) => Some(Arc::new(bus)),
            Err(e) => {
                warn!(error = %e, "broker unavailable; events disabled");
                None
            }
        };

        let mut core = RunningCore::assemble(gateway, kv, bus, &config)?;
        core.storage_pool = Some(pool);
        Ok(core)
    }

    /// Wait for SIGINT or SIGTERM
    pub async fn wait_for_signal() {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = term.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received ctrl-c");
        }
    }
}

/// A running core: component handles plus the shutdown machinery
pub struct RunningCore {
    pub engine: Arc<ReservationEngine>,
    pub sweeper: Arc<ExpirationSweeper>,
    pub limiter: Arc<AdmissionLimiter>,
    pub identity_cache: Option<Arc<IdentityCache>>,
    pub revocations: Option<Arc<TokenRevocations>>,

    gateway: Arc<dyn StorageGateway>,
    kv: Option<RedisPool>,
    storage_pool: Option<sqlx::Pool<sqlx::Postgres>>,
    accepting: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    drain_timeout: Duration,
}

impl RunningCore {
    /// Wire components together in dependency order. No network I/O happens
    /// here; connections are handed in already established (or absent).
    pub fn assemble(
        gateway: Arc<dyn StorageGateway>,
        kv: Option<RedisPool>,
        bus: Option<Arc<AmqpEventBus>>,
        config: &Config,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        // Admission and cache sit on the KV store
        let limiter = Arc::new(AdmissionLimiter::new(kv.clone(), &config.limiter));
        let identity_cache = kv
            .clone()
            .map(|pool| Arc::new(IdentityCache::new(pool, config.cache.identity_ttl_secs)));
        let revocations = kv.clone().map(|pool| Arc::new(TokenRevocations::new(pool)));

        // The engine publishes through the broker when it is up
        let publisher: Arc<dyn EventPublisher> = match &bus {
            Some(bus) => Arc::clone(bus) as Arc<dyn EventPublisher>,
            None => Arc::new(NullPublisher),
        };
        let engine = Arc::new(ReservationEngine::new(
            Arc::clone(&gateway),
            publisher,
            config.reservation.clone(),
        ));

        // Notification consumers start only with a live broker; a broken
        // SMTP configuration degrades rather than blocking startup
        if let Some(bus) = &bus {
            match SmtpMailer::new(&config.smtp) {
                Ok(mailer) => {
                    let worker = Arc::new(NotificationWorker::new(
                        TemplateRegistry::new()?,
                        Arc::new(mailer),
                    ));
                    for event_type in amqp::EMAIL_EVENTS {
                        let handle = bus.start_consumer(
                            amqp::queue_name(event_type),
                            Arc::clone(&worker) as Arc<dyn crate::bus::EventHandler>,
                            shutdown_rx.clone(),
                        );
                        tasks.push(("consumer", handle));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "SMTP unavailable; notification consumers disabled");
                }
            }
        }

        // The sweeper starts last: everything it calls is already up
        let sweeper = Arc::new(ExpirationSweeper::new(
            Arc::clone(&engine),
            config.sweeper.clone(),
        ));
        tasks.push(("sweeper", sweeper.start(shutdown_rx)));

        info!(
            kv = kv.is_some(),
            broker = bus.is_some(),
            consumers = tasks.len().saturating_sub(1),
            "core started"
        );

        Ok(Self {
            engine,
            sweeper,
            limiter,
            identity_cache,
            revocations,
            gateway,
            kv,
            storage_pool: None,
            accepting: Arc::new(AtomicBool::new(true)),
            shutdown_tx,
            tasks,
            drain_timeout: config.shutdown.drain_timeout(),
        })
    }

    /// Gate the surrounding framework checks before admitting new work
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Operator surface: report items whose derived count drifted
    pub async fn audit_stock(&self) -> Result<Vec<crate::storage::StockDrift>> {
        crate::stock::StockAccountant::audit(&self.gateway).await
    }

    /// Operator surface: re-derive drifted counts; returns repaired rows
    pub async fn repair_stock(&self) -> Result<u64> {
        crate::stock::StockAccountant::repair(&self.gateway).await
    }

    /// Operator surface: zero a caller's current window under the named
    /// limiter policy
    pub async fn reset_limiter(
        &self,
        policy: &str,
        identity: &crate::limiter::CallerIdentity,
    ) -> Result<()> {
        self.limiter.reset(policy, identity).await
    }

    /// Per-component health plus the overall grade
    pub async fn health(&self) -> (Status, Vec<ComponentHealth>) {
        let mut components = Vec::new();

        let storage = match self.gateway.ping().await {
            Ok(()) => ComponentHealth {
                name: "storage",
                status: Status::Healthy,
                detail: "ok".to_string(),
            },
            Err(e) => ComponentHealth {
                name: "storage",
                status: Status::Unhealthy,
                detail: e.to_string(),
            },
        };
        components.push(storage);

        let kv = match &self.kv {
            Some(pool) => {
                if pool.health_check().await {
                    ComponentHealth {
                        name: "kv",
                        status: Status::Healthy,
                        detail: "ok".to_string(),
                    }
                } else {
                    ComponentHealth {
                        name: "kv",
                        status: Status::Degraded,
                        detail: "unreachable; limiter failing open".to_string(),
                    }
                }
            }
            None => ComponentHealth {
                name: "kv",
                status: Status::Degraded,
                detail: "not connected".to_string(),
            },
        };
        components.push(kv);

        components.push(self.sweeper.health());

        let overall = components
            .iter()
            .fold(Status::Healthy, |acc, c| acc.worst(c.status));
        (overall, components)
    }

    /// Ordered shutdown: close the intake gate, stop the sweeper and drain
    /// consumers under the deadline, then close storage and KV. Tasks still
    /// running past the deadline are aborted.
    pub async fn shutdown(mut self) {
        info!("shutdown: closing intake");
        self.accepting.store(false, Ordering::Release);

        if self.shutdown_tx.send(true).is_err() {
            warn!("shutdown: no live subscribers");
        }

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        for (name, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => info!(task = name, "task drained"),
                Ok(Err(e)) => warn!(task = name, error = %e, "task ended abnormally"),
                Err(_) => {
                    error!(task = name, "drain deadline exceeded, aborting task");
                    handle.abort();
                }
            }
        }

        if let Some(pool) = self.storage_pool.take() {
            pool.close().await;
            info!("storage pool closed");
        }
        // KV connections close on drop
        self.kv = None;

        info!("shutdown complete");
    }
}
