use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use sf_core::crypto::SecretToken;
use sf_core::error::FleetError;
use sf_core::types::AssistantSettings;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Failure kinds a platform adapter can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    Connection,
    Auth,
    RateLimited,
    Other,
}

/// Error raised by a chat-platform adapter.
///
/// Adapters that know what went wrong set a `kind`. Errors built with
/// [`AdapterError::opaque`] carry only a message and are classified from it
/// by the error handler.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AdapterError {
    pub kind: Option<AdapterErrorKind>,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            message: message.into(),
        }
    }

    pub fn opaque(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Connection, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Auth, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::RateLimited, message)
    }
}

impl From<AdapterError> for FleetError {
    fn from(err: AdapterError) -> Self {
        match err.kind {
            Some(AdapterErrorKind::Connection) => FleetError::Connection(err.message),
            Some(AdapterErrorKind::Auth) => FleetError::Auth(err.message),
            Some(AdapterErrorKind::RateLimited) => FleetError::RateLimited(err.message),
            Some(AdapterErrorKind::Other) => FleetError::Unknown(err.message),
            None => FleetError::External(err.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Connect request
// ---------------------------------------------------------------------------

/// Everything an adapter needs to bring one instance online.
#[derive(Clone)]
pub struct ConnectRequest {
    pub instance_id: Uuid,
    pub name: String,
    pub token: SecretToken,
    pub channels: BTreeSet<String>,
    pub assistant: Option<AssistantSettings>,
    pub rate_limit_per_minute: u32,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("instance_id", &self.instance_id)
            .field("name", &self.name)
            .field("token", &self.token)
            .field("channels", &self.channels)
            .field("assistant", &self.assistant.as_ref().map(|a| &a.model))
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Adapter traits
// ---------------------------------------------------------------------------

/// A live client session for one instance.
#[async_trait::async_trait]
pub trait ClientHandle: Send + Sync {
    /// Cheap local readiness flag.
    fn is_ready(&self) -> bool;

    /// Round-trip liveness check. `Ok(false)` means reachable but not ready.
    async fn probe(&self) -> Result<bool, AdapterError>;

    /// Close the session. Must be safe to call more than once.
    async fn close(&self);
}

/// Factory for client sessions on the chat platform.
#[async_trait::async_trait]
pub trait PlatformAdapter: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn ClientHandle>, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_core::error::Category;

    #[test]
    fn declared_kinds_keep_their_category() {
        let err: FleetError = AdapterError::auth("token revoked").into();
        assert_eq!(err.category(), Some(Category::Auth));
        let err: FleetError = AdapterError::rate_limited("slow down").into();
        assert_eq!(err.category(), Some(Category::RateLimit));
    }

    #[test]
    fn opaque_errors_have_no_category() {
        let err: FleetError = AdapterError::opaque("socket hang up").into();
        assert_eq!(err.category(), None);
    }

    #[test]
    fn request_debug_redacts_token() {
        let req = ConnectRequest {
            instance_id: Uuid::new_v4(),
            name: "bot".into(),
            token: SecretToken::new("super-secret"),
            channels: BTreeSet::new(),
            assistant: None,
            rate_limit_per_minute: 60,
        };
        assert!(!format!("{req:?}").contains("super-secret"));
    }
}
