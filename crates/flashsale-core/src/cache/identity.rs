//! Identity memoization and the token-revocation set
//!
//! The surrounding auth layer resolves tokens to users; the core memoizes
//! that lookup for a short TTL and keeps a revocation set so a revoked
//! token dies before its natural expiry. Invalidation is explicit on user
//! mutation, never pattern-based.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::cache::{CacheNamespace, CacheResult, RedisPool};

/// Memoized view of an authenticated user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedIdentity {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub is_admin: bool,
    pub cached_at: DateTime<Utc>,
}

/// Short-TTL memoization of identity lookups
pub struct IdentityCache {
    pool: RedisPool,
    ttl_secs: u64,
}

impl IdentityCache {
    pub fn new(pool: RedisPool, ttl_secs: u64) -> Self {
        Self { pool, ttl_secs }
    }

    pub async fn get(&self, user_id: Uuid) -> CacheResult<Option<CachedIdentity>> {
        let key = CacheNamespace::Identity.key(user_id.to_string());
        let mut conn = self.pool.get();

        match conn.get(&key).await? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(identity) => Ok(Some(identity)),
                Err(e) => {
                    // A stale or corrupt entry is a miss, not a failure
                    debug!(user_id = %user_id, error = %e, "dropping undecodable identity entry");
                    conn.del(&key).await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn put(&self, identity: &CachedIdentity) -> CacheResult<()> {
        let key = CacheNamespace::Identity.key(identity.user_id.to_string());
        let bytes = serde_json::to_vec(identity)
            .map_err(|e| crate::cache::CacheError::Serialization(e.to_string()))?;
        self.pool.get().setex(&key, self.ttl_secs, &bytes).await
    }

    /// Explicit invalidation on user mutation
    pub async fn invalidate(&self, user_id: Uuid) -> CacheResult<bool> {
        let key = CacheNamespace::Identity.key(user_id.to_string());
        self.pool.get().del(&key).await
    }
}

/// Revocation set for issued tokens. An entry lives exactly until the
/// token's own expiry; after that the token is dead anyway.
pub struct TokenRevocations {
    pool: RedisPool,
}

impl TokenRevocations {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    pub async fn revoke(&self, token_id: &str, expires_at: DateTime<Utc>) -> CacheResult<()> {
        let remaining = expires_at.signed_duration_since(Utc::now()).num_seconds();
        if remaining <= 0 {
            // Already past natural expiry; nothing to hold
            return Ok(());
        }
        let key = CacheNamespace::TokenRevocation.key(token_id);
        self.pool.get().setex(&key, remaining as u64, b"1").await
    }

    pub async fn is_revoked(&self, token_id: &str) -> CacheResult<bool> {
        let key = CacheNamespace::TokenRevocation.key(token_id);
        self.pool.get().exists(&key).await
    }
}
