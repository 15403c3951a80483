//! Expiration sweeper: restores stock held by overdue reservations
//!
//! A single cooperative worker ticks on a timer, drains a bounded batch of
//! Pending reservations strictly past their deadline, and runs the engine's
//! expire transition on each. One bad row never aborts a batch. Ticks are
//! guarded: if one is still running when the next fires, the new tick is
//! skipped and coalesced into the running one.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::SweeperConfig;
use crate::health::{ComponentHealth, Status};
use crate::reservation::{ExpireOutcome, ReservationEngine};
use crate::Result;

/// Counters for one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub scanned: usize,
    pub expired: usize,
    pub failed: usize,
    pub duration_ms: u64,
    /// True when the tick was coalesced into one already running
    pub skipped: bool,
}

/// Cumulative counters since start or the last reset
#[derive(Debug, Clone, Default)]
pub struct SweeperStats {
    pub ticks: u64,
    pub ticks_skipped: u64,
    pub scanned: u64,
    pub expired: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_expired_at: Option<DateTime<Utc>>,
}

/// Periodic task that releases overdue holds
pub struct ExpirationSweeper {
    engine: Arc<ReservationEngine>,
    config: SweeperConfig,
    running: AtomicBool,
    stats: Mutex<SweeperStats>,
}

impl ExpirationSweeper {
    pub fn new(engine: Arc<ReservationEngine>, config: SweeperConfig) -> Self {
        Self { engine, config, running: AtomicBool::new(false), stats: Mutex::new(SweeperStats::default()) }
    }

    /// Spawn the timer loop. Stops when `shutdown` flips to true.
    pub fn start(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let sweeper = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweeper.config.tick_interval());
            // The first tick of tokio's interval fires immediately
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                interval_secs = sweeper.config.tick_interval_secs,
                batch = sweeper.config.batch_size,
                "expiration sweeper started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let summary = sweeper.tick().await;
                        if summary.failed > 0 {
                            warn!(?summary, "sweeper tick finished with failures");
                        } else if summary.expired > 0 {
                            debug!(?summary, "sweeper tick finished");
                        }
                    }
                    changed = shutdown.changed() => {
                        // A dropped sender means the supervisor is gone
                        if changed.is_err() || *shutdown.borrow() {
                            info!("expiration sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Manual trigger for operators; same guard as the timer path
    pub async fn tick_now(&self) -> TickSummary {
        self.tick().await
    }

    /// One scan-and-expire pass. Re-entrancy guarded: a tick that fires
    /// while another runs is recorded as skipped.
    async fn tick(&self) -> TickSummary {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let mut stats = self.stats.lock().unwrap();
            stats.ticks_skipped += 1;
            return TickSummary { skipped: true, ..Default::default() };
        }

        let summary = match tokio::time::timeout(self.config.tick_deadline(), self.drain()).await
        {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                error!(error = %e, "sweeper tick failed");
                TickSummary { failed: 1, ..Default::default() }
            }
            Err(_) => {
                error!(
                    deadline_secs = self.config.tick_deadline_secs,
                    "sweeper tick exceeded its deadline"
                );
                TickSummary { failed: 1, ..Default::default() }
            }
        };

        self.record(summary);
        self.running.store(false, Ordering::Release);
        summary
    }

    /// Fetch and expire one batch. A failed row is logged and skipped.
    async fn drain(&self) -> Result<TickSummary> {
        let started = Instant::now();
        let now = Utc::now();

        let due = self
            .engine
            .gateway()
            .find_pending_expired(now, self.config.batch_size)
            .await?;

        let mut summary = TickSummary { scanned: due.len(), ..Default::default() };

        for reservation in due {
            match self.engine.expire_reservation(reservation.id, now).await {
                Ok(ExpireOutcome::Expired(_)) => summary.expired += 1,
                // Terminal or no-longer-due rows are fine: another actor won
                Ok(_) => {}
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        reservation_id = %reservation.id,
                        error = %e,
                        "failed to expire reservation"
                    );
                }
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        Ok(summary)
    }

    fn record(&self, summary: TickSummary) {
        let now = Utc::now();
        let mut stats = self.stats.lock().unwrap();
        stats.ticks += 1;
        stats.scanned += summary.scanned as u64;
        stats.expired += summary.expired as u64;
        stats.failed += summary.failed as u64;
        stats.last_tick_at = Some(now);

        if summary.failed == 0 {
            stats.consecutive_failures = 0;
            stats.last_success_at = Some(now);
        } else {
            stats.consecutive_failures += 1;
        }
        if summary.expired > 0 {
            stats.last_expired_at = Some(now);
        }
    }

    pub fn stats(&self) -> SweeperStats {
        self.stats.lock().unwrap().clone()
    }

    /// Zero the cumulative counters (operator surface)
    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap() = SweeperStats::default();
    }

    /// Grade the sweeper from its recent history: missed intervals and
    /// consecutive failures degrade it, sustained silence marks it unhealthy.
    pub fn health(&self) -> ComponentHealth {
        let stats = self.stats.lock().unwrap();
        let interval = self.config.tick_interval();

        let mut status = Status::Healthy;
        let mut detail = String::from("ok");

        if let Some(last_success) = stats.last_success_at {
            let silence = Utc::now().signed_duration_since(last_success);
            let intervals_missed =
                (silence.num_seconds().max(0) as u64) / interval.as_secs().max(1);
            if intervals_missed >= 10 {
                status = Status::Unhealthy;
                detail = format!("no successful tick for {} intervals", intervals_missed);
            } else if intervals_missed >= 3 {
                status = Status::Degraded;
                detail = format!("no successful tick for {} intervals", intervals_missed);
            }
        } else if stats.ticks > 0 {
            status = Status::Degraded;
            detail = "no successful tick yet".to_string();
        }

        let failure_status = if stats.consecutive_failures >= 10 {
            Status::Unhealthy
        } else if stats.consecutive_failures >= 3 {
            Status::Degraded
        } else {
            Status::Healthy
        };
        if failure_status != Status::Healthy {
            status = status.worst(failure_status);
            detail = format!("{} consecutive failing ticks", stats.consecutive_failures);
        }

        ComponentHealth { name: "sweeper", status, detail }
    }
}
