//! Redis-backed cache and KV layer
//!
//! Serves the read-side shortcuts orthogonal to the write path: memoized
//! identity lookups, the token-revocation set, and the admission limiter's
//! counters. Keys are namespaced to prevent collisions.

pub mod connection;
pub mod identity;

pub use connection::{RedisConnection, RedisPool};
pub use identity::{CachedIdentity, IdentityCache, TokenRevocations};

/// Cache result type alias
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Operation failed: {0}")]
    Operation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("KV operation timed out")]
    Timeout,
}

impl From<CacheError> for crate::Error {
    fn from(err: CacheError) -> Self {
        crate::Error::Cache(err.to_string())
    }
}

/// Cache namespace for the different data types sharing the KV store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
    /// Memoized authenticated-user lookups
    Identity,
    /// Revoked token ids, held until natural token expiry
    TokenRevocation,
    /// Admission limiter window counters
    Limiter,
}

impl CacheNamespace {
    /// Get the string prefix for this namespace
    pub fn prefix(&self) -> &'static str {
        match self {
            CacheNamespace::Identity => "identity",
            CacheNamespace::TokenRevocation => "revoked",
            CacheNamespace::Limiter => "limiter",
        }
    }

    /// Create a prefixed key
    pub fn key(&self, key: impl AsRef<str>) -> String {
        format!("flashsale:{}:{}", self.prefix(), key.as_ref())
    }
}
