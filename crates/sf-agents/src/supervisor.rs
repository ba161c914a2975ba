use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sf_core::config::FleetConfig;
use sf_core::crypto::{IntegrityStatus, TokenSecurityManager};
use sf_core::error::{FleetError, Result};
use sf_core::repository::InstanceRepository;
use sf_core::types::{InstanceConfig, InstanceSpec, InstanceStatus, InstanceUpdate};
use sf_harness::error_handler::{ErrorContext, ErrorHandler, RecoveryDirective};
use sf_harness::task_manager::{AsyncTaskManager, BatchResult, BatchStrategy, TaskExit, TaskId};

use crate::adapter::{ClientHandle, ConnectRequest, PlatformAdapter};
use crate::state_machine::{InstanceEvent, InstanceStateMachine, Transition};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_instances: usize,
    pub health_check_interval: Duration,
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
    pub unregister_grace: Duration,
    pub monitor_grace: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&FleetConfig::default())
    }
}

impl ManagerSettings {
    pub fn from_config(cfg: &FleetConfig) -> Self {
        Self {
            max_instances: cfg.max_instances,
            health_check_interval: cfg.health_check_interval(),
            probe_timeout: cfg.probe_timeout(),
            connect_timeout: cfg.connect_timeout(),
            unregister_grace: cfg.unregister_grace(),
            monitor_grace: cfg.monitor_grace(),
        }
    }
}

// ---------------------------------------------------------------------------
// Public views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: Uuid,
    pub name: String,
    pub status: InstanceStatus,
    pub error_count: u32,
    pub task_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatusReport {
    pub id: Uuid,
    pub name: String,
    pub status: InstanceStatus,
    pub error_count: u32,
    pub task_active: bool,
    pub registered_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_probe: Option<ProbeOutcome>,
    pub channels: Vec<String>,
    pub assistant_model: Option<String>,
    pub rate_limit_per_minute: u32,
    pub last_error: Option<String>,
    pub recent_transitions: Vec<Transition>,
}

/// Outcome of one pass of the health loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSweep {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub restarted: usize,
    pub disabled: usize,
    pub skipped: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorHandle {
    pub task_id: TaskId,
    pub interval: Duration,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialAudit {
    pub id: Uuid,
    pub name: String,
    pub integrity: IntegrityStatus,
    pub disabled: bool,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct RegistryEntry {
    config: InstanceConfig,
    sm: InstanceStateMachine,
    last_health_check: Option<DateTime<Utc>>,
    last_probe: Option<ProbeOutcome>,
    error_count: u32,
    task: Option<TaskId>,
    generation: u64,
    client: Option<Arc<dyn ClientHandle>>,
    seq: u64,
    last_error: Option<String>,
    /// A recovery task owns this session; sweeps leave it alone.
    recovery_pending: bool,
}

impl RegistryEntry {
    fn new(config: InstanceConfig, sm: InstanceStateMachine, seq: u64) -> Self {
        Self {
            config,
            sm,
            last_health_check: None,
            last_probe: None,
            error_count: 0,
            task: None,
            generation: 0,
            client: None,
            seq,
            last_error: None,
            recovery_pending: false,
        }
    }

    /// Invalidate the running session: bump the generation and hand back
    /// whatever has to be torn down.
    fn detach(&mut self) -> (Option<TaskId>, Option<Arc<dyn ClientHandle>>) {
        self.generation += 1;
        self.recovery_pending = false;
        (self.task.take(), self.client.take())
    }
}

#[derive(Default)]
struct Registry {
    entries: HashMap<Uuid, RegistryEntry>,
    next_seq: u64,
    /// Registrations past the capacity check but not yet inserted.
    reserved: usize,
}

impl Registry {
    fn insert(&mut self, config: InstanceConfig, sm: InstanceStateMachine) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(config.id, RegistryEntry::new(config, sm, seq));
    }

    fn ordered_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<(u64, Uuid)> = self.entries.values().map(|e| (e.seq, e.config.id)).collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Entry for `id` whose session generation is still `generation`.
    fn current(&mut self, id: Uuid, generation: u64) -> Option<&mut RegistryEntry> {
        self.entries
            .get_mut(&id)
            .filter(|e| e.generation == generation)
    }
}

struct Inner {
    settings: ManagerSettings,
    repo: Arc<dyn InstanceRepository>,
    adapter: Arc<dyn PlatformAdapter>,
    security: Arc<TokenSecurityManager>,
    tasks: Arc<AsyncTaskManager>,
    errors: Arc<ErrorHandler>,
    registry: Mutex<Registry>,
    monitor: Mutex<Option<MonitorHandle>>,
}

/// Releases a capacity reservation if `register` is abandoned midway.
struct Reservation {
    inner: Arc<Inner>,
    armed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let inner = Arc::clone(&self.inner);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut reg = inner.registry.lock().await;
                reg.reserved = reg.reserved.saturating_sub(1);
            });
        }
    }
}

// ---------------------------------------------------------------------------
// InstanceManager
// ---------------------------------------------------------------------------

/// Owns the registry of managed bot instances and drives their lifecycle.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct InstanceManager {
    inner: Arc<Inner>,
}

impl InstanceManager {
    pub fn new(
        settings: ManagerSettings,
        repo: Arc<dyn InstanceRepository>,
        adapter: Arc<dyn PlatformAdapter>,
        security: Arc<TokenSecurityManager>,
        tasks: Arc<AsyncTaskManager>,
        errors: Arc<ErrorHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                repo,
                adapter,
                security,
                tasks,
                errors,
                registry: Mutex::new(Registry::default()),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.inner.errors
    }

    pub fn task_manager(&self) -> &Arc<AsyncTaskManager> {
        &self.inner.tasks
    }

    pub async fn len(&self) -> usize {
        self.inner.registry.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // -- registration -------------------------------------------------------

    /// Validate, encrypt and persist a new instance. The connection is not
    /// started.
    pub async fn register(&self, spec: InstanceSpec) -> Result<Uuid> {
        let channels = spec.validate()?;
        let max = self.inner.settings.max_instances;

        let mut reservation = {
            let mut reg = self.inner.registry.lock().await;
            if reg.entries.len() + reg.reserved >= max {
                tracing::warn!(name = %spec.name, limit = max, "registration rejected at capacity");
                return Err(FleetError::Capacity { limit: max });
            }
            reg.reserved += 1;
            Reservation {
                inner: Arc::clone(&self.inner),
                armed: true,
            }
        };

        let id = Uuid::new_v4();
        let prepared = async {
            let credential = self.inner.security.encrypt(&spec.token, id).await?;
            let now = Utc::now();
            let config = InstanceConfig {
                id,
                name: spec.name.trim().to_string(),
                credential,
                channels,
                assistant: spec.assistant.clone(),
                rate_limit_per_minute: spec.effective_rate_limit(),
                created_at: now,
                updated_at: now,
            };
            self.inner.repo.save(&config).await?;
            Ok::<_, FleetError>(config)
        }
        .await;

        let mut reg = self.inner.registry.lock().await;
        reg.reserved = reg.reserved.saturating_sub(1);
        reservation.armed = false;
        let config = prepared?;
        let name = config.name.clone();
        reg.insert(config, InstanceStateMachine::new());
        drop(reg);

        tracing::info!(id = %id, name = %name, "instance registered");
        Ok(id)
    }

    /// Remove an instance, stopping its connection task first. `false` for
    /// unknown ids.
    pub async fn unregister(&self, id: Uuid) -> Result<bool> {
        let (task, client) = {
            let mut reg = self.inner.registry.lock().await;
            let Some(mut entry) = reg.entries.remove(&id) else {
                return Ok(false);
            };
            entry.detach()
        };

        self.teardown(id, task, client, self.inner.settings.unregister_grace)
            .await;
        self.inner.errors.forget_instance(id);
        self.inner.repo.delete(id).await?;

        tracing::info!(id = %id, "instance unregistered");
        Ok(true)
    }

    // -- queries ------------------------------------------------------------

    /// Every instance in registration order.
    pub async fn list(&self) -> Vec<InstanceSummary> {
        let reg = self.inner.registry.lock().await;
        reg.ordered_ids()
            .into_iter()
            .filter_map(|id| reg.entries.get(&id))
            .map(|e| InstanceSummary {
                id: e.config.id,
                name: e.config.name.clone(),
                status: e.sm.state(),
                error_count: e.error_count,
                task_active: self.task_active(e),
            })
            .collect()
    }

    pub async fn status(&self, id: Uuid) -> Result<InstanceStatusReport> {
        let reg = self.inner.registry.lock().await;
        let e = reg.entries.get(&id).ok_or(FleetError::NotFound(id))?;
        let registered_at = e.config.created_at;
        Ok(InstanceStatusReport {
            id,
            name: e.config.name.clone(),
            status: e.sm.state(),
            error_count: e.error_count,
            task_active: self.task_active(e),
            registered_at,
            uptime_secs: u64::try_from((Utc::now() - registered_at).num_seconds()).unwrap_or(0),
            last_health_check: e.last_health_check,
            last_probe: e.last_probe,
            channels: e.config.channels.iter().cloned().collect(),
            assistant_model: e.config.assistant.as_ref().map(|a| a.model.clone()),
            rate_limit_per_minute: e.config.rate_limit_per_minute,
            last_error: e.last_error.clone(),
            recent_transitions: e.sm.history().copied().collect(),
        })
    }

    fn task_active(&self, entry: &RegistryEntry) -> bool {
        entry.task.is_some_and(|t| self.inner.tasks.is_active(t))
    }

    // -- lifecycle ----------------------------------------------------------

    /// Launch the connection task of a `Registered` or `Stopped` instance.
    /// `false` for unknown ids.
    pub async fn start(&self, id: Uuid) -> Result<bool> {
        {
            let mut reg = self.inner.registry.lock().await;
            let Some(entry) = reg.entries.get_mut(&id) else {
                return Ok(false);
            };
            entry.sm.transition(InstanceEvent::Start)?;
            entry.detach();
            self.spawn_connection(entry);
        }
        self.persist_status(id, InstanceStatus::Starting).await;
        tracing::info!(id = %id, "instance starting");
        Ok(true)
    }

    /// Stop an instance manually. Stopping a stopped instance is a no-op.
    pub async fn stop(&self, id: Uuid) -> Result<bool> {
        let (task, client) = {
            let mut reg = self.inner.registry.lock().await;
            let Some(entry) = reg.entries.get_mut(&id) else {
                return Ok(false);
            };
            if entry.sm.state() == InstanceStatus::Stopped {
                return Ok(true);
            }
            entry.sm.transition(InstanceEvent::Stop)?;
            entry.detach()
        };

        self.persist_status(id, InstanceStatus::Stopped).await;
        self.teardown(id, task, client, self.inner.settings.unregister_grace)
            .await;
        tracing::info!(id = %id, "instance stopped");
        Ok(true)
    }

    /// Cancel the current session, reset the error count and launch a fresh
    /// connection task. `false` for unknown ids, and when a concurrent stop,
    /// disable or restart took over the session before the relaunch.
    pub async fn restart(&self, id: Uuid) -> Result<bool> {
        let (generation, task, client) = {
            let mut reg = self.inner.registry.lock().await;
            let Some(entry) = reg.entries.get_mut(&id) else {
                return Ok(false);
            };
            if entry.sm.state() == InstanceStatus::Disabled {
                return Err(FleetError::InvalidState(format!(
                    "instance {id} is disabled"
                )));
            }
            entry.sm.transition(InstanceEvent::Restart)?;
            entry.error_count = 0;
            let (task, client) = entry.detach();
            (entry.generation, task, client)
        };

        self.persist_status(id, InstanceStatus::Restarting).await;
        self.teardown(id, task, client, self.inner.settings.unregister_grace)
            .await;

        let mut reg = self.inner.registry.lock().await;
        let relaunched = match reg.current(id, generation) {
            Some(entry) if entry.sm.state() == InstanceStatus::Restarting && entry.task.is_none() => {
                self.spawn_connection(entry);
                true
            }
            _ => false,
        };
        drop(reg);

        if relaunched {
            tracing::info!(id = %id, "instance restarting");
        } else {
            tracing::debug!(id = %id, "restart superseded by a concurrent lifecycle change");
        }
        Ok(relaunched)
    }

    /// Replace an instance's configuration. A running session keeps the old
    /// configuration until its next (re)start.
    pub async fn update(&self, id: Uuid, update: InstanceUpdate) -> Result<()> {
        let channels = update.validate()?;
        let current = {
            let reg = self.inner.registry.lock().await;
            reg.entries
                .get(&id)
                .map(|e| e.config.clone())
                .ok_or(FleetError::NotFound(id))?
        };

        let credential = match &update.token {
            Some(token) => self.inner.security.encrypt(token, id).await?,
            None => current.credential.clone(),
        };
        let config = InstanceConfig {
            id,
            name: update.name.trim().to_string(),
            credential,
            channels,
            assistant: update.assistant.clone(),
            rate_limit_per_minute: update.rate_limit_per_minute,
            created_at: current.created_at,
            updated_at: Utc::now(),
        };
        self.inner.repo.save(&config).await?;

        let mut reg = self.inner.registry.lock().await;
        let entry = reg.entries.get_mut(&id).ok_or(FleetError::NotFound(id))?;
        entry.config = config;
        drop(reg);

        tracing::info!(id = %id, rotated = update.token.is_some(), "instance configuration updated");
        Ok(())
    }

    // -- bulk ---------------------------------------------------------------

    /// Rebuild the registry from the repository. Records already present
    /// are skipped; running statuses come back as `Registered`.
    pub async fn load_persisted(&self) -> Result<usize> {
        let records = self.inner.repo.list_all().await?;
        let max = self.inner.settings.max_instances;

        let mut reg = self.inner.registry.lock().await;
        let mut loaded = 0;
        for record in records {
            if reg.entries.contains_key(&record.config.id) {
                continue;
            }
            if reg.entries.len() + reg.reserved >= max {
                tracing::warn!(
                    id = %record.config.id,
                    limit = max,
                    "persisted instance skipped at capacity"
                );
                continue;
            }
            let status = match record.status {
                InstanceStatus::Disabled | InstanceStatus::Stopped => record.status,
                _ => InstanceStatus::Registered,
            };
            reg.insert(record.config, InstanceStateMachine::resume(status));
            loaded += 1;
        }
        drop(reg);

        tracing::info!(loaded, "persisted instances loaded");
        Ok(loaded)
    }

    /// Start every instance still in `Registered`.
    pub async fn start_all_enabled(&self) -> BatchResult<bool> {
        let ids = self
            .ids_where(|s| s == InstanceStatus::Registered)
            .await;
        let ops: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let mgr = self.clone();
                move || async move { mgr.start(id).await }
            })
            .collect();
        self.inner
            .tasks
            .execute_batch(ops, BatchStrategy::Parallel, None)
            .await
    }

    /// Stop monitoring, then stop every running instance.
    pub async fn shutdown(&self) -> BatchResult<bool> {
        self.stop_monitoring().await;
        let ids = self.ids_where(|s| s.is_running()).await;
        let ops: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let mgr = self.clone();
                move || async move { mgr.stop(id).await }
            })
            .collect();
        let result = self
            .inner
            .tasks
            .execute_batch(ops, BatchStrategy::Parallel, None)
            .await;
        tracing::info!(
            stopped = result.success_count,
            failed = result.failure_count,
            "instance manager shut down"
        );
        result
    }

    async fn ids_where(&self, pred: impl Fn(InstanceStatus) -> bool) -> Vec<Uuid> {
        let reg = self.inner.registry.lock().await;
        reg.ordered_ids()
            .into_iter()
            .filter(|id| reg.entries.get(id).is_some_and(|e| pred(e.sm.state())))
            .collect()
    }

    /// Verify every stored credential; tampered ones disable their instance.
    pub async fn audit_credentials(&self) -> Vec<CredentialAudit> {
        let snapshot: Vec<(Uuid, String, u64, sf_core::crypto::EncryptedCredential)> = {
            let reg = self.inner.registry.lock().await;
            reg.ordered_ids()
                .into_iter()
                .filter_map(|id| reg.entries.get(&id))
                .map(|e| {
                    (
                        e.config.id,
                        e.config.name.clone(),
                        e.generation,
                        e.config.credential.clone(),
                    )
                })
                .collect()
        };

        let mut report = Vec::with_capacity(snapshot.len());
        for (id, name, generation, credential) in snapshot {
            let integrity = self.inner.security.verify_integrity(id, &credential);
            let mut disabled = false;
            match integrity {
                IntegrityStatus::Valid => {}
                IntegrityStatus::Expired => {
                    tracing::warn!(id = %id, name = %name, "credential has expired; rotate it");
                }
                IntegrityStatus::Tampered => {
                    let err = FleetError::Integrity(format!("stored credential of {id} failed verification"));
                    let directive = {
                        let mut reg = self.inner.registry.lock().await;
                        let handled = self.inner.errors.handle(
                            &err,
                            ErrorContext::for_instance(id, "credential_audit"),
                            None,
                        );
                        reg.current(id, generation)
                            .map(|entry| Self::claim_recovery(entry, handled.directive))
                            .unwrap_or(RecoveryDirective::Ignore)
                    };
                    disabled = self.recover(id, generation, directive).await
                        == Some(RecoveryDirective::Disable);
                }
            }
            report.push(CredentialAudit {
                id,
                name,
                integrity,
                disabled,
            });
        }
        report
    }

    // -- monitoring ---------------------------------------------------------

    /// Start the periodic health loop. Calling it while the loop runs
    /// returns the existing handle.
    pub async fn start_monitoring(&self) -> MonitorHandle {
        let mut monitor = self.inner.monitor.lock().await;
        if let Some(handle) = monitor.as_ref() {
            if self.inner.tasks.is_active(handle.task_id) {
                return handle.clone();
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.settings.health_check_interval;
        let task_id = self
            .inner
            .tasks
            .create_background_task("health-monitor", move |token| {
                monitor_loop(weak, interval, token)
            });
        let handle = MonitorHandle {
            task_id,
            interval,
            started_at: Utc::now(),
        };
        *monitor = Some(handle.clone());
        tracing::info!(interval_secs = interval.as_secs(), "health monitoring started");
        handle
    }

    /// Stop the health loop. `false` when it was not running.
    pub async fn stop_monitoring(&self) -> bool {
        let Some(handle) = self.inner.monitor.lock().await.take() else {
            return false;
        };
        let exit = self
            .inner
            .tasks
            .stop_background_task(handle.task_id, self.inner.settings.monitor_grace)
            .await;
        if exit == TaskExit::Aborted {
            tracing::warn!("health monitor did not stop within grace period; forced termination");
        }
        tracing::info!("health monitoring stopped");
        true
    }

    pub async fn is_monitoring(&self) -> bool {
        self.inner
            .monitor
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| self.inner.tasks.is_active(h.task_id))
    }

    /// Run one health sweep now.
    pub async fn check_all(&self) -> HealthSweep {
        self.sweep(None).await
    }

    async fn sweep(&self, cancel: Option<&CancellationToken>) -> HealthSweep {
        let started = Instant::now();
        let mut sweep = HealthSweep::default();
        let ids = self.inner.registry.lock().await.ordered_ids();

        for id in ids {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                break;
            }
            let target = {
                let reg = self.inner.registry.lock().await;
                reg.entries
                    .get(&id)
                    .filter(|e| e.sm.state().is_probeable() && !e.recovery_pending)
                    .map(|e| (e.generation, e.client.clone()))
            };
            let Some((generation, client)) = target else {
                sweep.skipped += 1;
                continue;
            };
            sweep.checked += 1;

            match self.probe(client).await {
                Ok(()) => {
                    if self.record_probe_success(id, generation).await {
                        sweep.healthy += 1;
                    }
                }
                Err(err) => {
                    sweep.unhealthy += 1;
                    match self.record_probe_failure(id, generation, err).await {
                        Some(RecoveryDirective::Restart) => sweep.restarted += 1,
                        Some(RecoveryDirective::Disable) => sweep.disabled += 1,
                        _ => {}
                    }
                }
            }
        }

        sweep.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            checked = sweep.checked,
            healthy = sweep.healthy,
            unhealthy = sweep.unhealthy,
            "health sweep finished"
        );
        sweep
    }

    async fn probe(&self, client: Option<Arc<dyn ClientHandle>>) -> Result<()> {
        let Some(client) = client else {
            return Err(FleetError::Connection("no active client session".into()));
        };
        let timeout = self.inner.settings.probe_timeout;
        match tokio::time::timeout(timeout, client.probe()).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(FleetError::Connection(
                "liveness probe reported not ready".into(),
            )),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(FleetError::Connection(format!(
                "liveness probe timed out after {timeout:?}"
            ))),
        }
    }

    async fn record_probe_success(&self, id: Uuid, generation: u64) -> bool {
        let changed = {
            let mut reg = self.inner.registry.lock().await;
            let Some(entry) = reg.current(id, generation).filter(|e| !e.recovery_pending) else {
                return false;
            };
            let before = entry.sm.state();
            if entry.sm.transition(InstanceEvent::ProbePassed).is_err() {
                return false;
            }
            entry.last_health_check = Some(Utc::now());
            entry.last_probe = Some(ProbeOutcome::Passed);
            before != InstanceStatus::Healthy
        };
        if changed {
            self.persist_status(id, InstanceStatus::Healthy).await;
        }
        true
    }

    /// Count the failure, mark the instance unhealthy and wait for the error
    /// handler's directive to be applied.
    async fn record_probe_failure(
        &self,
        id: Uuid,
        generation: u64,
        err: FleetError,
    ) -> Option<RecoveryDirective> {
        let directive = {
            let mut reg = self.inner.registry.lock().await;
            // A fault already handed to a recovery task is not counted again.
            let entry = reg.current(id, generation).filter(|e| !e.recovery_pending)?;
            entry.error_count += 1;
            entry.last_health_check = Some(Utc::now());
            entry.last_probe = Some(ProbeOutcome::Failed);
            entry.last_error = Some(err.to_string());
            if entry.sm.transition(InstanceEvent::ProbeFailed).is_err() {
                return None;
            }
            let handled = self.inner.errors.handle(
                &err,
                ErrorContext::for_instance(id, "health_check").with_error_count(entry.error_count),
                None,
            );
            Self::claim_recovery(entry, handled.directive)
        };
        self.persist_status(id, InstanceStatus::Unhealthy).await;
        self.recover(id, generation, directive).await
    }

    // -- recovery -----------------------------------------------------------

    /// Mark `entry` as owned by a recovery task when `directive` acts on it.
    /// Runs under the registry lock so no sweep can count the same fault
    /// twice.
    fn claim_recovery(entry: &mut RegistryEntry, directive: RecoveryDirective) -> RecoveryDirective {
        if directive != RecoveryDirective::Ignore {
            entry.recovery_pending = true;
        }
        directive
    }

    /// Apply `directive` from a dedicated background task. The task outlives
    /// its caller, so cancelling a sweep never strands a half-applied
    /// restart or disable.
    fn spawn_recovery(
        &self,
        id: Uuid,
        generation: u64,
        directive: RecoveryDirective,
    ) -> oneshot::Receiver<Option<RecoveryDirective>> {
        let (tx, rx) = oneshot::channel();
        let mgr = self.clone();
        self.inner
            .tasks
            .create_background_task(format!("recovery:{id}"), move |_token| async move {
                let applied = mgr.apply_directive(id, generation, directive).await;
                if let Some(entry) = mgr.inner.registry.lock().await.current(id, generation) {
                    entry.recovery_pending = false;
                }
                let _ = tx.send(applied);
            });
        rx
    }

    /// Spawn the recovery for a claimed directive and wait for its outcome.
    async fn recover(
        &self,
        id: Uuid,
        generation: u64,
        directive: RecoveryDirective,
    ) -> Option<RecoveryDirective> {
        if directive == RecoveryDirective::Ignore {
            return None;
        }
        self.spawn_recovery(id, generation, directive)
            .await
            .ok()
            .flatten()
    }

    /// Apply a directive to the session identified by `generation`. Returns
    /// the directive when it took effect.
    async fn apply_directive(
        &self,
        id: Uuid,
        generation: u64,
        directive: RecoveryDirective,
    ) -> Option<RecoveryDirective> {
        match directive {
            RecoveryDirective::Ignore => None,
            RecoveryDirective::Restart => {
                let still_current = self
                    .inner
                    .registry
                    .lock()
                    .await
                    .current(id, generation)
                    .is_some();
                if !still_current {
                    return None;
                }
                match self.restart(id).await {
                    Ok(true) => Some(RecoveryDirective::Restart),
                    Ok(false) => None,
                    Err(e) => {
                        tracing::warn!(id = %id, error = %e, "automatic restart failed");
                        None
                    }
                }
            }
            RecoveryDirective::Disable => self
                .disable(id, generation)
                .await
                .then_some(RecoveryDirective::Disable),
        }
    }

    async fn disable(&self, id: Uuid, generation: u64) -> bool {
        let (task, client) = {
            let mut reg = self.inner.registry.lock().await;
            let Some(entry) = reg.current(id, generation) else {
                return false;
            };
            if entry.sm.transition(InstanceEvent::Disable).is_err() {
                return false;
            }
            tracing::error!(
                id = %id,
                name = %entry.config.name,
                error_count = entry.error_count,
                "instance disabled; manual intervention required"
            );
            entry.detach()
        };

        self.persist_status(id, InstanceStatus::Disabled).await;
        self.teardown(id, task, client, self.inner.settings.unregister_grace)
            .await;
        true
    }

    /// Failure inside a connection task. The recovery is not awaited so the
    /// failing task never waits on itself.
    async fn on_connection_failure(&self, id: Uuid, generation: u64, err: FleetError, op: &str) {
        let directive = {
            let mut reg = self.inner.registry.lock().await;
            let Some(entry) = reg.current(id, generation) else {
                return;
            };
            entry.error_count += 1;
            entry.last_error = Some(err.to_string());
            // Fault is valid from every state a connection task runs in.
            let _ = entry.sm.transition(InstanceEvent::Fault);
            let handled = self.inner.errors.handle(
                &err,
                ErrorContext::for_instance(id, op).with_error_count(entry.error_count),
                None,
            );
            Self::claim_recovery(entry, handled.directive)
        };
        self.persist_status(id, InstanceStatus::Unhealthy).await;

        if directive != RecoveryDirective::Ignore {
            drop(self.spawn_recovery(id, generation, directive));
        }
    }

    // -- plumbing -----------------------------------------------------------

    /// Spawn the connection task for `entry`. Runs under the registry lock.
    fn spawn_connection(&self, entry: &mut RegistryEntry) {
        let id = entry.config.id;
        let generation = entry.generation;
        let weak = Arc::downgrade(&self.inner);
        let task_id = self.inner.tasks.create_background_task(
            format!("instance:{}", entry.config.name),
            move |token| connection_task(weak, id, generation, token),
        );
        entry.task = Some(task_id);
    }

    async fn teardown(
        &self,
        id: Uuid,
        task: Option<TaskId>,
        client: Option<Arc<dyn ClientHandle>>,
        grace: Duration,
    ) {
        if let Some(task) = task {
            if self.inner.tasks.stop_background_task(task, grace).await == TaskExit::Aborted {
                tracing::warn!(
                    id = %id,
                    grace_ms = grace.as_millis() as u64,
                    "connection task did not stop within grace period; forced termination"
                );
            }
        }
        if let Some(client) = client {
            client.close().await;
        }
    }

    /// Status writes never fail the caller; persistence problems go to the
    /// error handler instead.
    async fn persist_status(&self, id: Uuid, status: InstanceStatus) {
        if let Err(e) = self.inner.repo.update_status(id, status).await {
            self.inner.errors.handle(
                &e.into(),
                ErrorContext::for_instance(id, "persist_status")
                    .advisory()
                    .with("status", status),
                None,
            );
        }
    }
}

impl std::fmt::Debug for InstanceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceManager")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn monitor_loop(inner: Weak<Inner>, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let mgr = InstanceManager { inner };
                mgr.sweep(Some(&token)).await;
            }
        }
    }
    tracing::debug!("health monitor exited");
}

async fn connection_task(
    inner: Weak<Inner>,
    id: Uuid,
    generation: u64,
    token: CancellationToken,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mgr = InstanceManager { inner };

    let config = {
        let mut reg = mgr.inner.registry.lock().await;
        match reg.current(id, generation) {
            Some(entry) => entry.config.clone(),
            None => return,
        }
    };

    let secret = match mgr.inner.security.decrypt(&config.credential, id).await {
        Ok(secret) => secret,
        Err(e) => {
            mgr.on_connection_failure(id, generation, e.into(), "decrypt_credential")
                .await;
            return;
        }
    };

    let request = ConnectRequest {
        instance_id: id,
        name: config.name.clone(),
        token: secret,
        channels: config.channels.clone(),
        assistant: config.assistant.clone(),
        rate_limit_per_minute: config.rate_limit_per_minute,
    };
    let connect_timeout = mgr.inner.settings.connect_timeout;
    let connected = tokio::select! {
        _ = token.cancelled() => return,
        r = tokio::time::timeout(connect_timeout, mgr.inner.adapter.connect(request)) => r,
    };
    let client = match connected {
        Ok(Ok(client)) => client,
        Ok(Err(e)) => {
            mgr.on_connection_failure(id, generation, e.into(), "connect")
                .await;
            return;
        }
        Err(_) => {
            let err = FleetError::Connection(format!("connect timed out after {connect_timeout:?}"));
            mgr.on_connection_failure(id, generation, err, "connect").await;
            return;
        }
    };

    let installed = {
        let mut reg = mgr.inner.registry.lock().await;
        match reg.current(id, generation) {
            Some(entry) if !token.is_cancelled() => {
                if entry.sm.transition(InstanceEvent::Connected).is_ok() {
                    entry.client = Some(Arc::clone(&client));
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    };
    if !installed {
        client.close().await;
        return;
    }

    mgr.persist_status(id, InstanceStatus::Online).await;
    tracing::info!(id = %id, name = %config.name, "instance online");
    drop(mgr);

    token.cancelled().await;
    client.close().await;
    tracing::debug!(id = %id, "connection task exited");
}
