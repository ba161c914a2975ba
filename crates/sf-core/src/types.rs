use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{EncryptedCredential, SecretToken};
use crate::error::FleetError;

/// Longest accepted instance name.
pub const MAX_NAME_LEN: usize = 64;
/// Longest accepted plaintext token.
pub const MAX_TOKEN_LEN: usize = 512;
/// Rate limit applied when the caller does not choose one.
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 120;
/// Hard ceiling for a per-instance rate limit.
pub const MAX_RATE_LIMIT_PER_MINUTE: u32 = 10_000;

// ---------------------------------------------------------------------------
// InstanceStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Registered,
    Starting,
    Online,
    Healthy,
    Unhealthy,
    Restarting,
    Disabled,
    Stopped,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Registered => "registered",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Online => "online",
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Restarting => "restarting",
            InstanceStatus::Disabled => "disabled",
            InstanceStatus::Stopped => "stopped",
        }
    }

    /// Statuses with an established (or previously established) client
    /// session that the health loop should probe.
    pub fn is_probeable(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Online | InstanceStatus::Healthy | InstanceStatus::Unhealthy
        )
    }

    /// Statuses that leave the instance serving traffic or trying to.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Starting
                | InstanceStatus::Online
                | InstanceStatus::Healthy
                | InstanceStatus::Unhealthy
                | InstanceStatus::Restarting
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

impl FromStr for InstanceStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "registered" => Ok(InstanceStatus::Registered),
            "starting" => Ok(InstanceStatus::Starting),
            "online" => Ok(InstanceStatus::Online),
            "healthy" => Ok(InstanceStatus::Healthy),
            "unhealthy" => Ok(InstanceStatus::Unhealthy),
            "restarting" => Ok(InstanceStatus::Restarting),
            "disabled" => Ok(InstanceStatus::Disabled),
            "stopped" => Ok(InstanceStatus::Stopped),
            other => Err(FleetError::Validation(format!(
                "unknown instance status `{other}`"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Assistant settings
// ---------------------------------------------------------------------------

/// Present only when assistant mode is enabled for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantSettings {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl AssistantSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
        }
    }

    fn validate(&self) -> Result<(), FleetError> {
        if self.model.trim().is_empty() {
            return Err(FleetError::Validation(
                "assistant model must not be empty".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InstanceSpec: registration input
// ---------------------------------------------------------------------------

/// Caller-supplied description of a new instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub token: SecretToken,
    pub channels: Vec<String>,
    pub assistant: Option<AssistantSettings>,
    pub rate_limit_per_minute: Option<u32>,
}

impl InstanceSpec {
    pub fn new(name: impl Into<String>, token: impl Into<SecretToken>) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            channels: Vec::new(),
            assistant: None,
            rate_limit_per_minute: None,
        }
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_assistant(mut self, assistant: AssistantSettings) -> Self {
        self.assistant = Some(assistant);
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = Some(per_minute);
        self
    }

    /// Check every field; returns the normalized channel set on success.
    pub fn validate(&self) -> Result<BTreeSet<String>, FleetError> {
        validate_name(&self.name)?;
        validate_token(&self.token)?;
        if let Some(assistant) = &self.assistant {
            assistant.validate()?;
        }
        validate_rate_limit(self.effective_rate_limit())?;
        validate_channels(&self.channels)
    }

    pub fn effective_rate_limit(&self) -> u32 {
        self.rate_limit_per_minute
            .unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE)
    }
}

/// Wholesale replacement of an instance's mutable configuration.
///
/// A `token` of `Some` rotates the credential; `None` keeps the current one.
#[derive(Debug, Clone)]
pub struct InstanceUpdate {
    pub name: String,
    pub token: Option<SecretToken>,
    pub channels: Vec<String>,
    pub assistant: Option<AssistantSettings>,
    pub rate_limit_per_minute: u32,
}

impl InstanceUpdate {
    /// Start an update from the current configuration.
    pub fn from_config(config: &InstanceConfig) -> Self {
        Self {
            name: config.name.clone(),
            token: None,
            channels: config.channels.iter().cloned().collect(),
            assistant: config.assistant.clone(),
            rate_limit_per_minute: config.rate_limit_per_minute,
        }
    }

    pub fn validate(&self) -> Result<BTreeSet<String>, FleetError> {
        validate_name(&self.name)?;
        if let Some(token) = &self.token {
            validate_token(token)?;
        }
        if let Some(assistant) = &self.assistant {
            assistant.validate()?;
        }
        validate_rate_limit(self.rate_limit_per_minute)?;
        validate_channels(&self.channels)
    }
}

fn validate_name(name: &str) -> Result<(), FleetError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(FleetError::Validation("instance name must not be empty".into()));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(FleetError::Validation(format!(
            "instance name exceeds {MAX_NAME_LEN} characters"
        )));
    }
    if let Some(bad) = trimmed
        .chars()
        .find(|c| !(c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ')))
    {
        return Err(FleetError::Validation(format!(
            "instance name contains invalid character `{bad}`"
        )));
    }
    Ok(())
}

fn validate_token(token: &SecretToken) -> Result<(), FleetError> {
    if token.is_empty() {
        return Err(FleetError::Validation("token must not be empty".into()));
    }
    if token.len() > MAX_TOKEN_LEN {
        return Err(FleetError::Validation(format!(
            "token exceeds {MAX_TOKEN_LEN} bytes"
        )));
    }
    if token.expose().chars().any(char::is_whitespace) {
        return Err(FleetError::Validation("token must not contain whitespace".into()));
    }
    Ok(())
}

fn validate_rate_limit(per_minute: u32) -> Result<(), FleetError> {
    if per_minute == 0 || per_minute > MAX_RATE_LIMIT_PER_MINUTE {
        return Err(FleetError::Validation(format!(
            "rate limit must be between 1 and {MAX_RATE_LIMIT_PER_MINUTE} per minute"
        )));
    }
    Ok(())
}

fn validate_channels(channels: &[String]) -> Result<BTreeSet<String>, FleetError> {
    let mut set = BTreeSet::new();
    for channel in channels {
        let channel = channel.trim();
        if channel.is_empty() || channel.chars().any(char::is_whitespace) {
            return Err(FleetError::Validation(format!(
                "invalid channel id `{channel}`"
            )));
        }
        set.insert(channel.to_string());
    }
    Ok(set)
}

// ---------------------------------------------------------------------------
// InstanceConfig
// ---------------------------------------------------------------------------

/// Persisted description of a managed instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: Uuid,
    pub name: String,
    pub credential: EncryptedCredential,
    pub channels: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant: Option<AssistantSettings>,
    pub rate_limit_per_minute: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceConfig {
    pub fn assistant_enabled(&self) -> bool {
        self.assistant.is_some()
    }
}

/// A config together with its last persisted status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub config: InstanceConfig,
    pub status: InstanceStatus,
}
