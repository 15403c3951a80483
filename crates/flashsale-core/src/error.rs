use std::fmt;

/// Main error type for the flash-sale core
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),

    /// Database errors (SQLx wrapped)
    Database(sqlx::Error),

    /// Entity not found (item, reservation)
    NotFound(String),

    /// Caller is not authenticated
    Unauthorized(String),

    /// Caller lacks ownership or capability
    Forbidden(String),

    /// Wrong state for the requested transition (expired hold, closed sale
    /// window, per-user cap, already-terminal reservation)
    PreconditionFailed(String),

    /// Not enough available stock to cover the requested quantity
    InsufficientStock { available: i32, requested: i32 },

    /// Unique-key collision (sku, reservation_code)
    Conflict(String),

    /// Admission limiter breach; retry_after is seconds until the window resets
    RateLimited { retry_after: u64 },

    /// Malformed input
    Validation(String),

    /// Deadlock, lock timeout, broker disconnect; retried internally
    Transient(String),

    /// Cache/KV errors
    Cache(String),

    /// Event bus errors
    Bus(String),

    /// Notification delivery errors
    Notification(String),

    /// Serialization/deserialization errors
    Serialization(serde_json::Error),

    /// IO errors
    Io(std::io::Error),

    /// Unexpected internal errors; never exposes internals to callers
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Database(e) => write!(f, "Database error: {}", e),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            Error::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            Error::PreconditionFailed(msg) => write!(f, "Precondition failed: {}", msg),
            Error::InsufficientStock { available, requested } => write!(
                f,
                "Insufficient stock: available {}, requested {}",
                available, requested
            ),
            Error::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Error::RateLimited { retry_after } => {
                write!(f, "Rate limited: retry after {}s", retry_after)
            }
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::Transient(msg) => write!(f, "Transient error: {}", msg),
            Error::Cache(msg) => write!(f, "Cache error: {}", msg),
            Error::Bus(msg) => write!(f, "Event bus error: {}", msg),
            Error::Notification(msg) => write!(f, "Notification error: {}", msg),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Internal(_) => write!(f, "Internal error"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

// Conversions from external error types
impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Error::Database(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

// Common error constructors
impl Error {
    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a new forbidden error
    pub fn forbidden<T: Into<String>>(msg: T) -> Self {
        Error::Forbidden(msg.into())
    }

    /// Create a new precondition error
    pub fn precondition<T: Into<String>>(msg: T) -> Self {
        Error::PreconditionFailed(msg.into())
    }

    /// Create a new conflict error
    pub fn conflict<T: Into<String>>(msg: T) -> Self {
        Error::Conflict(msg.into())
    }

    /// Create a new transient error
    pub fn transient<T: Into<String>>(msg: T) -> Self {
        Error::Transient(msg.into())
    }

    /// Create a new cache error
    pub fn cache<T: Into<String>>(msg: T) -> Self {
        Error::Cache(msg.into())
    }

    /// Create a new bus error
    pub fn bus<T: Into<String>>(msg: T) -> Self {
        Error::Bus(msg.into())
    }

    /// Create a new notification error
    pub fn notification<T: Into<String>>(msg: T) -> Self {
        Error::Notification(msg.into())
    }

    /// Create a new internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        Error::Internal(msg.into())
    }
}

impl Error {
    /// True for failures that are safe to retry with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// True for unique-key collisions the engine recovers from internally
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Get HTTP status code for error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::PreconditionFailed(_) => 409,
            Error::InsufficientStock { .. } => 409,
            Error::Conflict(_) => 409,
            Error::RateLimited { .. } => 429,
            Error::Validation(_) => 422,
            Error::Transient(_) => 503,
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::Cache(_) => 500,
            Error::Bus(_) => 500,
            Error::Notification(_) => 500,
            Error::Serialization(_) => 500,
            Error::Io(_) => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Get error category for monitoring
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::NotFound(_) => "not_found",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::PreconditionFailed(_) => "precondition",
            Error::InsufficientStock { .. } => "insufficient_stock",
            Error::Conflict(_) => "conflict",
            Error::RateLimited { .. } => "rate_limited",
            Error::Validation(_) => "validation",
            Error::Transient(_) => "transient",
            Error::Cache(_) => "cache",
            Error::Bus(_) => "bus",
            Error::Notification(_) => "notification",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }
}
