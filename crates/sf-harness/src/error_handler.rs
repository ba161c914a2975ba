//! Failure classification and recovery decisions.
//!
//! Every failure the orchestration core cannot hand back to a caller ends up
//! in [`ErrorHandler::handle`]. The handler records an [`ErrorEvent`], keeps
//! rolling statistics over a sliding window and answers with a
//! [`RecoveryDirective`] the instance manager applies.
//!
//! Classification uses the structured [`FleetError`] category. Only opaque
//! [`FleetError::External`] errors fall back to [`classify_message`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sf_core::error::{Category, FleetError, Severity};
use tracing::{error, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    /// Automatic restarts allowed per instance inside `window`.
    pub restart_budget: u32,
    /// Sliding window for restart attempts and statistics.
    pub window: Duration,
    /// Hard cap on retained events.
    pub max_events: usize,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            restart_budget: 3,
            window: Duration::from_secs(24 * 60 * 60),
            max_events: 10_000,
        }
    }
}

impl RecoveryPolicy {
    fn window_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::days(36_500))
    }
}

// ---------------------------------------------------------------------------
// Directive / context / event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryDirective {
    Restart,
    Disable,
    Ignore,
}

impl fmt::Display for RecoveryDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RecoveryDirective::Restart => "RESTART",
            RecoveryDirective::Disable => "DISABLE",
            RecoveryDirective::Ignore => "IGNORE",
        };
        write!(f, "{}", label)
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub instance_id: Option<Uuid>,
    pub operation: String,
    /// The instance's consecutive failure count after this failure.
    pub error_count: u32,
    /// Record only. The failure is attributed to the instance but never
    /// drives recovery.
    pub advisory: bool,
    pub extra: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn for_instance(instance_id: Uuid, operation: impl Into<String>) -> Self {
        Self {
            instance_id: Some(instance_id),
            ..Self::new(operation)
        }
    }

    pub fn with_error_count(mut self, count: u32) -> Self {
        self.error_count = count;
        self
    }

    pub fn advisory(mut self) -> Self {
        self.advisory = true;
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.extra.insert(key.into(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: Uuid,
    pub instance_id: Option<Uuid>,
    pub error_type: String,
    pub message: String,
    pub severity: Severity,
    pub category: Category,
    pub context: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolution_note: Option<String>,
    pub directive: RecoveryDirective,
}

#[derive(Debug, Clone)]
pub struct HandledError {
    pub event: ErrorEvent,
    pub directive: RecoveryDirective,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub total_last_24h: usize,
    pub unresolved: usize,
    pub by_category: BTreeMap<Category, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_instance: BTreeMap<Uuid, usize>,
}

// ---------------------------------------------------------------------------
// Message heuristics
// ---------------------------------------------------------------------------

/// Best-effort category for an error that carries only a message.
pub fn classify_message(message: &str) -> Category {
    let msg = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if has(&["tamper", "integrity"]) {
        Category::Integrity
    } else if has(&["401", "403", "unauthorized", "invalid token", "forbidden"]) {
        Category::Auth
    } else if has(&["429", "rate limit", "too many requests"]) {
        Category::RateLimit
    } else if has(&["database", "sqlite", "disk", "storage"]) {
        Category::Storage
    } else if has(&["timeout", "timed out", "connection", "refused", "reset", "dns", "eof"]) {
        Category::Connection
    } else {
        Category::Unknown
    }
}

// ---------------------------------------------------------------------------
// ErrorHandler
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HandlerState {
    events: VecDeque<ErrorEvent>,
    restarts: HashMap<Uuid, VecDeque<DateTime<Utc>>>,
}

pub struct ErrorHandler {
    policy: RecoveryPolicy,
    state: Mutex<HandlerState>,
}

impl ErrorHandler {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(HandlerState::default()),
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Classify, record and decide. `severity` overrides the category's
    /// default severity.
    pub fn handle(
        &self,
        err: &FleetError,
        context: ErrorContext,
        severity: Option<Severity>,
    ) -> HandledError {
        self.handle_at(err, context, severity, Utc::now())
    }

    fn handle_at(
        &self,
        err: &FleetError,
        context: ErrorContext,
        severity: Option<Severity>,
        now: DateTime<Utc>,
    ) -> HandledError {
        let category = err
            .category()
            .unwrap_or_else(|| classify_message(&err.to_string()));
        let severity = severity.unwrap_or_else(|| category.default_severity());

        let mut state = self.lock();
        self.prune(&mut state, now);
        let directive = self.decide(&mut state, category, &context, now);

        let mut ctx_map = context.extra;
        ctx_map.insert("operation".into(), context.operation.clone());
        if context.instance_id.is_some() {
            ctx_map.insert("error_count".into(), context.error_count.to_string());
        }

        let event = ErrorEvent {
            id: Uuid::new_v4(),
            instance_id: context.instance_id,
            error_type: err.kind_name().to_string(),
            message: err.to_string(),
            severity,
            category,
            context: ctx_map,
            timestamp: now,
            resolved: false,
            resolution_note: None,
            directive,
        };
        state.events.push_back(event.clone());
        while state.events.len() > self.policy.max_events {
            state.events.pop_front();
        }
        drop(state);

        log_event(&event);
        HandledError { event, directive }
    }

    fn decide(
        &self,
        state: &mut HandlerState,
        category: Category,
        context: &ErrorContext,
        now: DateTime<Utc>,
    ) -> RecoveryDirective {
        let Some(instance_id) = context.instance_id else {
            return RecoveryDirective::Ignore;
        };
        if context.advisory {
            return RecoveryDirective::Ignore;
        }
        if category.is_fatal() {
            return RecoveryDirective::Disable;
        }
        let budget = self.policy.restart_budget;
        if context.error_count > budget {
            return RecoveryDirective::Disable;
        }
        if !category.is_restartable() {
            return RecoveryDirective::Ignore;
        }
        let attempts = state.restarts.entry(instance_id).or_default();
        if attempts.len() >= budget as usize {
            return RecoveryDirective::Disable;
        }
        attempts.push_back(now);
        RecoveryDirective::Restart
    }

    /// Statistics over the sliding window.
    pub fn summary(&self) -> ErrorSummary {
        let mut state = self.lock();
        self.prune(&mut state, Utc::now());

        let mut summary = ErrorSummary::default();
        for event in &state.events {
            summary.total_last_24h += 1;
            if !event.resolved {
                summary.unresolved += 1;
            }
            *summary.by_category.entry(event.category).or_insert(0) += 1;
            *summary.by_severity.entry(event.severity).or_insert(0) += 1;
            if let Some(id) = event.instance_id {
                *summary.by_instance.entry(id).or_insert(0) += 1;
            }
        }
        summary
    }

    /// Mark an event resolved. `false` for unknown or already-resolved events.
    pub fn manual_resolve(&self, event_id: Uuid, note: impl Into<String>) -> bool {
        let mut state = self.lock();
        let Some(event) = state.events.iter_mut().find(|e| e.id == event_id) else {
            return false;
        };
        if event.resolved {
            return false;
        }
        event.resolved = true;
        event.resolution_note = Some(note.into());
        info!(event_id = %event_id, "error event resolved manually");
        true
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<ErrorEvent> {
        self.lock().events.iter().rev().take(limit).cloned().collect()
    }

    pub fn events_for(&self, instance_id: Uuid) -> Vec<ErrorEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.instance_id == Some(instance_id))
            .cloned()
            .collect()
    }

    /// Automatic restarts recorded for the instance inside the window.
    pub fn restart_attempts(&self, instance_id: Uuid) -> usize {
        let mut state = self.lock();
        self.prune(&mut state, Utc::now());
        state.restarts.get(&instance_id).map_or(0, VecDeque::len)
    }

    /// Drop the restart history of an unregistered instance.
    pub fn forget_instance(&self, instance_id: Uuid) {
        self.lock().restarts.remove(&instance_id);
    }

    fn prune(&self, state: &mut HandlerState, now: DateTime<Utc>) {
        let cutoff = now - self.policy.window_delta();
        while state
            .events
            .front()
            .is_some_and(|e| e.timestamp < cutoff)
        {
            state.events.pop_front();
        }
        state.restarts.retain(|_, attempts| {
            while attempts.front().is_some_and(|t| *t < cutoff) {
                attempts.pop_front();
            }
            !attempts.is_empty()
        });
    }

    fn lock(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(RecoveryPolicy::default())
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("policy", &self.policy)
            .field("events", &self.lock().events.len())
            .finish()
    }
}

fn log_event(event: &ErrorEvent) {
    let instance = event
        .instance_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".into());
    match event.severity {
        Severity::Critical | Severity::High => error!(
            instance = %instance,
            category = %event.category,
            severity = %event.severity,
            directive = %event.directive,
            error = %event.message,
            "failure handled"
        ),
        Severity::Medium => warn!(
            instance = %instance,
            category = %event.category,
            severity = %event.severity,
            directive = %event.directive,
            error = %event.message,
            "failure handled"
        ),
        Severity::Low => info!(
            instance = %instance,
            category = %event.category,
            directive = %event.directive,
            error = %event.message,
            "failure handled"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(budget: u32) -> ErrorHandler {
        ErrorHandler::new(RecoveryPolicy {
            restart_budget: budget,
            ..RecoveryPolicy::default()
        })
    }

    #[test]
    fn heuristics_cover_documented_markers() {
        assert_eq!(classify_message("connection reset by peer"), Category::Connection);
        assert_eq!(classify_message("request timed out"), Category::Connection);
        assert_eq!(classify_message("HTTP 401 Unauthorized"), Category::Auth);
        assert_eq!(classify_message("429 Too Many Requests"), Category::RateLimit);
        assert_eq!(classify_message("sqlite busy"), Category::Storage);
        assert_eq!(classify_message("payload tampered"), Category::Integrity);
        assert_eq!(classify_message("something odd"), Category::Unknown);
    }

    #[test]
    fn structured_kind_wins_over_message() {
        let h = handler(3);
        let err = FleetError::Storage("connection pool exhausted".into());
        let handled = h.handle(&err, ErrorContext::new("persist"), None);
        assert_eq!(handled.event.category, Category::Storage);
        assert_eq!(handled.event.severity, Severity::High);
        assert_eq!(handled.event.error_type, "StorageError");
    }

    #[test]
    fn fatal_categories_disable() {
        let h = handler(3);
        let id = Uuid::new_v4();
        let auth = h.handle(
            &FleetError::Auth("bad token".into()),
            ErrorContext::for_instance(id, "connect"),
            None,
        );
        assert_eq!(auth.directive, RecoveryDirective::Disable);

        let integrity = h.handle(
            &FleetError::Decrypt("aead".into()),
            ErrorContext::for_instance(id, "decrypt"),
            None,
        );
        assert_eq!(integrity.directive, RecoveryDirective::Disable);
        assert_eq!(integrity.event.severity, Severity::Critical);
    }

    #[test]
    fn restart_budget_is_enforced_in_window() {
        let h = handler(2);
        let id = Uuid::new_v4();
        let err = FleetError::Connection("gateway closed".into());
        let ctx = || ErrorContext::for_instance(id, "probe").with_error_count(1);

        assert_eq!(h.handle(&err, ctx(), None).directive, RecoveryDirective::Restart);
        assert_eq!(h.handle(&err, ctx(), None).directive, RecoveryDirective::Restart);
        assert_eq!(h.handle(&err, ctx(), None).directive, RecoveryDirective::Disable);
        assert_eq!(h.restart_attempts(id), 2);
    }

    #[test]
    fn restart_attempts_expire_with_window() {
        let h = handler(1);
        let id = Uuid::new_v4();
        let err = FleetError::Connection("gateway closed".into());
        let long_ago = Utc::now() - chrono::Duration::hours(25);

        let first = h.handle_at(&err, ErrorContext::for_instance(id, "probe"), None, long_ago);
        assert_eq!(first.directive, RecoveryDirective::Restart);

        let second = h.handle(&err, ErrorContext::for_instance(id, "probe"), None);
        assert_eq!(second.directive, RecoveryDirective::Restart);
    }

    #[test]
    fn error_count_over_budget_disables() {
        let h = handler(3);
        let id = Uuid::new_v4();
        let err = FleetError::External("opaque failure".into());
        let under = h.handle(
            &err,
            ErrorContext::for_instance(id, "probe").with_error_count(3),
            None,
        );
        assert_eq!(under.directive, RecoveryDirective::Ignore);
        let over = h.handle(
            &err,
            ErrorContext::for_instance(id, "probe").with_error_count(4),
            None,
        );
        assert_eq!(over.directive, RecoveryDirective::Disable);
    }

    #[test]
    fn failures_without_instance_are_ignored() {
        let h = handler(3);
        let handled = h.handle(
            &FleetError::Auth("rejected".into()),
            ErrorContext::new("status-persist"),
            None,
        );
        assert_eq!(handled.directive, RecoveryDirective::Ignore);
    }

    #[test]
    fn advisory_failures_count_per_instance_without_recovery() {
        let h = handler(3);
        let id = Uuid::new_v4();
        let handled = h.handle(
            &FleetError::Storage("disk full".into()),
            ErrorContext::for_instance(id, "persist_status").advisory(),
            None,
        );
        assert_eq!(handled.directive, RecoveryDirective::Ignore);
        assert_eq!(handled.event.instance_id, Some(id));
        assert_eq!(h.summary().by_instance.get(&id), Some(&1));
        assert_eq!(h.restart_attempts(id), 0);
    }

    #[test]
    fn summary_and_manual_resolve() {
        let h = handler(3);
        let id = Uuid::new_v4();
        let a = h.handle(
            &FleetError::Connection("x".into()),
            ErrorContext::for_instance(id, "probe"),
            None,
        );
        h.handle(
            &FleetError::Validation("y".into()),
            ErrorContext::new("register"),
            Some(Severity::Low),
        );

        let summary = h.summary();
        assert_eq!(summary.total_last_24h, 2);
        assert_eq!(summary.unresolved, 2);
        assert_eq!(summary.by_category.get(&Category::Connection), Some(&1));
        assert_eq!(summary.by_instance.get(&id), Some(&1));

        assert!(h.manual_resolve(a.event.id, "network restored"));
        assert!(!h.manual_resolve(a.event.id, "again"));
        assert!(!h.manual_resolve(Uuid::new_v4(), "unknown"));
        assert_eq!(h.summary().unresolved, 1);
        assert_eq!(h.events_for(id)[0].resolution_note.as_deref(), Some("network restored"));
    }

    #[test]
    fn event_cap_drops_oldest() {
        let h = ErrorHandler::new(RecoveryPolicy {
            max_events: 3,
            ..RecoveryPolicy::default()
        });
        for i in 0..5 {
            h.handle(
                &FleetError::Unknown(format!("e{i}")),
                ErrorContext::new("op"),
                None,
            );
        }
        let recent = h.recent(10);
        assert_eq!(recent.len(), 3);
        assert!(recent[0].message.contains("e4"));
        assert!(recent[2].message.contains("e2"));
    }
}
