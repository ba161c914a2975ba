//! Fault taxonomy shared by every subfleet crate.
//!
//! [`FleetError`] is what orchestration calls return and what background
//! failures are converted into before they reach the error handler. Each
//! structured variant maps to exactly one [`Category`]; only
//! [`FleetError::External`] (raised for opaque third-party failures) has no
//! declared category and is left to the handler's message heuristics.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Connection,
    Auth,
    RateLimit,
    Storage,
    Integrity,
    Validation,
    Capacity,
    Unknown,
}

impl Category {
    /// Categories whose failures can be cured by reconnecting.
    pub fn is_restartable(self) -> bool {
        matches!(
            self,
            Category::Connection | Category::RateLimit | Category::Storage
        )
    }

    /// Categories that must never be retried automatically.
    pub fn is_fatal(self) -> bool {
        matches!(self, Category::Auth | Category::Integrity)
    }

    /// Severity assigned when the caller does not supply one.
    pub fn default_severity(self) -> Severity {
        match self {
            Category::Integrity => Severity::Critical,
            Category::Auth | Category::Storage => Severity::High,
            Category::Connection | Category::Capacity | Category::Unknown => Severity::Medium,
            Category::RateLimit | Category::Validation => Severity::Low,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Category::Connection => "CONNECTION",
            Category::Auth => "AUTH",
            Category::RateLimit => "RATE_LIMIT",
            Category::Storage => "STORAGE",
            Category::Integrity => "INTEGRITY",
            Category::Validation => "VALIDATION",
            Category::Capacity => "CAPACITY",
            Category::Unknown => "UNKNOWN",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// FleetError
// ---------------------------------------------------------------------------

/// Errors surfaced by the orchestration core.
///
/// Synchronous administrative calls (register, unregister, status, restart)
/// return these directly. Failures inside background tasks are converted into
/// a `FleetError` and handed to the error handler instead of propagating.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FleetError {
    /// Malformed instance configuration.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The registration ceiling has been reached.
    #[error("instance capacity reached: at most {limit} instances may be registered")]
    Capacity { limit: usize },

    /// No registry entry exists for the id.
    #[error("instance not found: {0}")]
    NotFound(Uuid),

    /// The requested operation is not valid in the entry's current status.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Transport failure talking to the chat platform.
    #[error("connection failure: {0}")]
    Connection(String),

    /// The remote platform rejected the credential.
    #[error("credential rejected: {0}")]
    Auth(String),

    /// The remote platform throttled the instance.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Credential tampering or instance-binding mismatch.
    #[error("credential integrity violation: {0}")]
    Integrity(String),

    /// Any other cryptographic failure while opening a credential.
    #[error("credential decryption failed: {0}")]
    Decrypt(String),

    /// Repository failure after the repository's own retries.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Failure from an opaque collaborator that carries no structured kind.
    #[error("{0}")]
    External(String),

    #[error("unknown failure: {0}")]
    Unknown(String),
}

impl FleetError {
    /// The declared category, or `None` when only the message is known.
    pub fn category(&self) -> Option<Category> {
        match self {
            FleetError::Validation(_) | FleetError::InvalidState(_) => Some(Category::Validation),
            FleetError::Capacity { .. } => Some(Category::Capacity),
            FleetError::NotFound(_) => Some(Category::Validation),
            FleetError::Connection(_) => Some(Category::Connection),
            FleetError::Auth(_) => Some(Category::Auth),
            FleetError::RateLimited(_) => Some(Category::RateLimit),
            FleetError::Integrity(_) | FleetError::Decrypt(_) => Some(Category::Integrity),
            FleetError::Storage(_) => Some(Category::Storage),
            FleetError::Unknown(_) => Some(Category::Unknown),
            FleetError::External(_) => None,
        }
    }

    /// Short type name recorded on error events.
    pub fn kind_name(&self) -> &'static str {
        match self {
            FleetError::Validation(_) => "ValidationError",
            FleetError::Capacity { .. } => "CapacityError",
            FleetError::NotFound(_) => "NotFoundError",
            FleetError::InvalidState(_) => "InvalidStateError",
            FleetError::Connection(_) => "ConnectionError",
            FleetError::Auth(_) => "AuthError",
            FleetError::RateLimited(_) => "RateLimitError",
            FleetError::Integrity(_) => "IntegrityError",
            FleetError::Decrypt(_) => "DecryptError",
            FleetError::Storage(_) => "StorageError",
            FleetError::External(_) => "ExternalError",
            FleetError::Unknown(_) => "UnknownError",
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
