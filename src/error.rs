use std::fmt;

use uuid::Uuid;

/// Engine error taxonomy. Every variant carries the entity id that failed and
/// maps to a stable wire code via [`EngineError::code`]; facades translate
/// codes to their own conventions.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Task does not exist in the caller's tenant.
    TaskNotFound { task_id: Uuid },
    /// The task state machine disallows the requested move.
    InvalidStateTransition {
        task_id: Uuid,
        from: String,
        to: String,
    },
    /// Caller is not permitted to perform the operation.
    Unauthorized { reason: String },
    /// Two concurrent creations raced on the same idempotency key and the
    /// re-read could not resolve the winner. Internal; callers retry.
    IdempotencyConflict { key: String },
    /// Lease missing, expired, or owned by a different worker.
    LeaseInvalidOrExpired { task_id: Uuid, lease_id: Uuid },
    /// Lease has been renewed the maximum number of times.
    RenewalLimitExceeded { lease_id: Uuid, renewal_count: i32 },
    /// Renewal would push the lease past its absolute lifetime cap.
    LifetimeExceeded { lease_id: Uuid },
    /// Receipt or task spec failed validation (body too large, too many
    /// parents, terminal without parents, unknown parent, illegal terminator).
    Validation { reason: String },
    /// Raised by external middleware, never by the engine itself; listed so
    /// facades can map it alongside engine codes.
    RateLimited,
    Configuration { reason: String },
    Database { operation: String, reason: String },
    Serialization { reason: String },
}

impl EngineError {
    /// Stable error code for wire mapping.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            EngineError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            EngineError::Unauthorized { .. } => "UNAUTHORIZED",
            EngineError::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            EngineError::LeaseInvalidOrExpired { .. } => "LEASE_INVALID_OR_EXPIRED",
            EngineError::RenewalLimitExceeded { .. } => "RENEWAL_LIMIT_EXCEEDED",
            EngineError::LifetimeExceeded { .. } => "LIFETIME_EXCEEDED",
            EngineError::Validation { .. } => "VALIDATION_ERROR",
            EngineError::RateLimited => "RATE_LIMITED",
            EngineError::Configuration { .. } => "CONFIGURATION_ERROR",
            EngineError::Database { .. } => "DATABASE_ERROR",
            EngineError::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::TaskNotFound { task_id } => write!(f, "Task not found: {task_id}"),
            EngineError::InvalidStateTransition { task_id, from, to } => {
                write!(f, "Invalid transition for task {task_id}: {from} -> {to}")
            }
            EngineError::Unauthorized { reason } => write!(f, "Unauthorized: {reason}"),
            EngineError::IdempotencyConflict { key } => {
                write!(f, "Idempotency conflict on key '{key}'")
            }
            EngineError::LeaseInvalidOrExpired { task_id, lease_id } => {
                write!(f, "Lease {lease_id} invalid or expired for task {task_id}")
            }
            EngineError::RenewalLimitExceeded {
                lease_id,
                renewal_count,
            } => {
                write!(
                    f,
                    "Lease {lease_id} renewal limit exceeded after {renewal_count} renewals"
                )
            }
            EngineError::LifetimeExceeded { lease_id } => {
                write!(f, "Lease {lease_id} would exceed maximum lifetime")
            }
            EngineError::Validation { reason } => write!(f, "Validation error: {reason}"),
            EngineError::RateLimited => write!(f, "Rate limited"),
            EngineError::Configuration { reason } => write!(f, "Configuration error: {reason}"),
            EngineError::Database { operation, reason } => {
                write!(f, "Database operation '{operation}' failed: {reason}")
            }
            EngineError::Serialization { reason } => write!(f, "Serialization error: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(error: sqlx::Error) -> Self {
        EngineError::Database {
            operation: "query".to_string(),
            reason: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Serialization {
            reason: error.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// True when a database error is a unique-constraint violation on the named
/// constraint. Used by the idempotent-create and receipt-dedup races.
pub fn is_unique_violation(error: &sqlx::Error, constraint: &str) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("23505")
                && db.constraint().map(|c| c == constraint).unwrap_or(true)
        }
        _ => false,
    }
}
