//! HTTP adapter for the chat platform's REST API.
//!
//! A session is considered live while the platform keeps accepting the bot
//! token on its identity endpoint. Connecting performs the first identity
//! call; every probe repeats it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use sf_agents::adapter::{AdapterError, AdapterErrorKind, ClientHandle, ConnectRequest, PlatformAdapter};
use sf_core::config::GatewayConfig;
use sf_core::crypto::SecretToken;

/// Account the platform reports for a bot token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayIdentity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct HttpGatewayAdapter {
    http: Client,
    identity_url: String,
    auth_scheme: String,
}

impl HttpGatewayAdapter {
    pub fn new(config: &GatewayConfig) -> Result<Self, AdapterError> {
        let http = Client::builder()
            .user_agent(concat!("subfleet/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| AdapterError::new(AdapterErrorKind::Other, e.to_string()))?;
        Ok(Self {
            http,
            identity_url: format!(
                "{}{}",
                config.base_url.trim_end_matches('/'),
                config.identity_path
            ),
            auth_scheme: config.auth_scheme.clone(),
        })
    }

    pub fn identity_url(&self) -> &str {
        &self.identity_url
    }
}

#[async_trait::async_trait]
impl PlatformAdapter for HttpGatewayAdapter {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn ClientHandle>, AdapterError> {
        let authorization = SecretToken::new(format!(
            "{} {}",
            self.auth_scheme,
            request.token.expose()
        ));
        let identity =
            fetch_identity(&self.http, &self.identity_url, &authorization).await?;
        info!(
            id = %request.instance_id,
            name = %request.name,
            account = %identity.username,
            channels = request.channels.len(),
            "gateway session established"
        );
        Ok(Arc::new(GatewaySession {
            instance_id: request.instance_id,
            http: self.http.clone(),
            identity_url: self.identity_url.clone(),
            authorization,
            identity,
            open: AtomicBool::new(true),
        }))
    }
}

pub struct GatewaySession {
    instance_id: Uuid,
    http: Client,
    identity_url: String,
    authorization: SecretToken,
    identity: GatewayIdentity,
    open: AtomicBool,
}

impl GatewaySession {
    pub fn identity(&self) -> &GatewayIdentity {
        &self.identity
    }
}

#[async_trait::async_trait]
impl ClientHandle for GatewaySession {
    fn is_ready(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn probe(&self) -> Result<bool, AdapterError> {
        if !self.is_ready() {
            return Ok(false);
        }
        fetch_identity(&self.http, &self.identity_url, &self.authorization).await?;
        Ok(true)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!(id = %self.instance_id, "gateway session closed");
        }
    }
}

async fn fetch_identity(
    http: &Client,
    url: &str,
    authorization: &SecretToken,
) -> Result<GatewayIdentity, AdapterError> {
    let resp = http
        .get(url)
        .header(reqwest::header::AUTHORIZATION, authorization.expose())
        .send()
        .await
        .map_err(|e| AdapterError::connection(format!("gateway request failed: {e}")))?;

    let status = resp.status();
    if let Some(err) = classify_status(status) {
        return Err(err);
    }
    resp.json::<GatewayIdentity>()
        .await
        .map_err(|e| AdapterError::new(AdapterErrorKind::Other, format!("malformed identity response: {e}")))
}

/// Map a non-success HTTP status onto an adapter error kind.
pub fn classify_status(status: StatusCode) -> Option<AdapterError> {
    if status.is_success() {
        return None;
    }
    let err = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AdapterError::auth(format!("gateway rejected the token ({status})"))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            AdapterError::rate_limited(format!("gateway throttled the session ({status})"))
        }
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            AdapterError::connection(format!("gateway unavailable ({status})"))
        }
        _ => AdapterError::new(AdapterErrorKind::Other, format!("unexpected gateway status {status}")),
    };
    Some(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::OK).is_none());
        let kind = |s| classify_status(s).and_then(|e| e.kind);
        assert_eq!(kind(StatusCode::UNAUTHORIZED), Some(AdapterErrorKind::Auth));
        assert_eq!(kind(StatusCode::FORBIDDEN), Some(AdapterErrorKind::Auth));
        assert_eq!(kind(StatusCode::TOO_MANY_REQUESTS), Some(AdapterErrorKind::RateLimited));
        assert_eq!(kind(StatusCode::BAD_GATEWAY), Some(AdapterErrorKind::Connection));
        assert_eq!(kind(StatusCode::NOT_FOUND), Some(AdapterErrorKind::Other));
    }

    #[test]
    fn identity_url_joins_base_and_path() {
        let cfg = GatewayConfig {
            base_url: "https://chat.example/api/".into(),
            ..GatewayConfig::default()
        };
        let adapter = HttpGatewayAdapter::new(&cfg).unwrap();
        assert_eq!(adapter.identity_url(), "https://chat.example/api/users/@me");
    }
}
