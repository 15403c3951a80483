//! Admission limiter: caps request frequency per caller per named policy
//!
//! Fixed-window counters in the KV store, keyed by caller identity. A KV
//! outage fails open: the write path stays available and the miss is
//! logged. A breach always carries `retry_after`.

use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheNamespace, RedisPool};
use crate::config::{LimiterConfig, PolicyConfig};
use crate::{Error, Result};

/// Who is knocking: an authenticated user, or a network peer
#[derive(Debug, Clone, Default)]
pub struct CallerIdentity {
    pub user_id: Option<Uuid>,
    pub remote_addr: Option<IpAddr>,
    /// Raw forwarded-for header when the caller came through a proxy
    pub forwarded_for: Option<String>,
    pub is_admin: bool,
}

impl CallerIdentity {
    pub fn user(user_id: Uuid) -> Self {
        Self { user_id: Some(user_id), ..Default::default() }
    }

    pub fn anonymous(remote_addr: IpAddr) -> Self {
        Self { remote_addr: Some(remote_addr), ..Default::default() }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self { user_id: Some(user_id), is_admin: true, ..Default::default() }
    }

    pub fn with_forwarded_for(mut self, header: impl Into<String>) -> Self {
        self.forwarded_for = Some(header.into());
        self
    }

    /// Counter key: the user id when authenticated, otherwise the first hop
    /// of the forwarded chain, otherwise the socket peer.
    pub fn key(&self) -> String {
        if let Some(user_id) = self.user_id {
            return format!("user:{}", user_id);
        }
        if let Some(forwarded) = &self.forwarded_for {
            if let Some(first_hop) = forwarded.split(',').next() {
                let first_hop = first_hop.trim();
                if !first_hop.is_empty() {
                    return format!("ip:{}", first_hop);
                }
            }
        }
        match self.remote_addr {
            Some(addr) => format!("ip:{}", addr),
            None => "anonymous".to_string(),
        }
    }
}

/// Why a request was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Counted under the window; `remaining` may hit zero
    Allowed { remaining: u64 },
    /// Policy skips admins, or the limiter is disabled
    Skipped,
    /// KV unavailable; deliberately admitted
    FailOpen,
}

/// Fixed-window admission limiter over the KV store
pub struct AdmissionLimiter {
    pool: Option<RedisPool>,
    policies: HashMap<&'static str, PolicyConfig>,
    enabled: bool,
}

impl AdmissionLimiter {
    /// `pool` empty means the KV store never came up; every check fails open
    pub fn new(pool: Option<RedisPool>, config: &LimiterConfig) -> Self {
        let policies = config.policies().into_iter().map(|p| (p.name, p)).collect();
        Self { pool, policies, enabled: config.enabled }
    }

    /// Admit or reject one request under the named policy. Rejection is
    /// `Error::RateLimited` with the seconds left in the window.
    pub async fn check(&self, policy: &str, identity: &CallerIdentity) -> Result<Admission> {
        if !self.enabled {
            return Ok(Admission::Skipped);
        }

        let policy = self
            .policies
            .get(policy)
            .ok_or_else(|| Error::internal(format!("unknown limiter policy: {}", policy)))?;

        if policy.skip_admin && identity.is_admin {
            return Ok(Admission::Skipped);
        }

        let pool = match &self.pool {
            Some(pool) => pool,
            None => {
                warn!(policy = policy.name, "limiter KV unavailable, failing open");
                return Ok(Admission::FailOpen);
            }
        };

        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let (window_start, retry_after) = window_state(now, policy.window_secs);
        let key = CacheNamespace::Limiter
            .key(format!("{}:{}:{}", policy.name, identity.key(), window_start));

        let mut conn = pool.get();
        let count = match conn.incr(&key).await {
            Ok(count) => count as u64,
            Err(e) => {
                warn!(policy = policy.name, error = %e, "limiter KV error, failing open");
                return Ok(Admission::FailOpen);
            }
        };

        // First hit opens the window; the TTL covers the whole window plus
        // slack so a straggling counter cannot live forever
        if count == 1 {
            if let Err(e) = conn.expire(&key, policy.window_secs + 1).await {
                warn!(policy = policy.name, error = %e, "failed to set window TTL");
            }
        }

        if count > policy.max {
            debug!(
                policy = policy.name,
                identity = %identity.key(),
                count,
                max = policy.max,
                "admission rejected"
            );
            return Err(Error::RateLimited { retry_after });
        }

        Ok(Admission::Allowed { remaining: policy.max - count })
    }

    /// Zero the current window's counter (operator surface)
    pub async fn reset(&self, policy: &str, identity: &CallerIdentity) -> Result<()> {
        let policy = self
            .policies
            .get(policy)
            .ok_or_else(|| Error::internal(format!("unknown limiter policy: {}", policy)))?;

        if let Some(pool) = &self.pool {
            let now = chrono::Utc::now().timestamp().max(0) as u64;
            let (window_start, _) = window_state(now, policy.window_secs);
            let key = CacheNamespace::Limiter
                .key(format!("{}:{}:{}", policy.name, identity.key(), window_start));
            pool.get().del(&key).await.map_err(crate::Error::from)?;
        }
        Ok(())
    }
}

/// Fixed-window arithmetic: the window containing `now` and the seconds
/// until it rolls over
fn window_state(now_secs: u64, window_secs: u64) -> (u64, u64) {
    let window = window_secs.max(1);
    let start = now_secs - (now_secs % window);
    let retry_after = start + window - now_secs;
    (start, retry_after)
}
