use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use sf_agents::adapter::PlatformAdapter;
use sf_agents::supervisor::{InstanceManager, ManagerSettings};
use sf_core::config::{Config, MasterKeyProvider, RecoveryConfig};
use sf_core::crypto::{EncryptionKey, EncryptionLevel, LocalKeyWrapper, TokenSecurityManager};
use sf_core::repository::InstanceRepository;
use sf_core::store::SqliteRepository;
use sf_harness::error_handler::{ErrorHandler, RecoveryPolicy};
use sf_harness::task_manager::{AsyncTaskManager, ShutdownReport};

use crate::gateway::HttpGatewayAdapter;

/// Key-encryption key used when credentials are sealed at `High` level.
const KEK_FILE: &str = "kek.key";

pub fn recovery_policy(cfg: &RecoveryConfig) -> RecoveryPolicy {
    RecoveryPolicy {
        restart_budget: cfg.restart_budget,
        window: Duration::from_secs(cfg.window_hours.saturating_mul(60 * 60)),
        max_events: cfg.max_events,
    }
}

/// Build the credential manager described by the `security` section.
pub fn security_manager(config: &Config, master: &EncryptionKey) -> Result<TokenSecurityManager> {
    let sec = &config.security;
    let mut manager = TokenSecurityManager::new(master)
        .context("failed to derive credential keys")?
        .with_level(sec.level);
    if sec.level == EncryptionLevel::High {
        let kek = MasterKeyProvider::load_or_create(&config.data_dir().join(KEK_FILE))
            .context("failed to load key-encryption key")?;
        manager = manager.with_key_wrapper(Arc::new(LocalKeyWrapper::new(kek, "local:kek")));
    }
    if let Some(days) = sec.max_token_age_days {
        manager = manager.with_max_age(chrono::Duration::days(i64::from(days)));
    }
    Ok(manager)
}

/// What [`Daemon::boot`] brought up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootReport {
    pub loaded: usize,
    pub started: usize,
    pub failed: usize,
}

/// What [`Daemon::shutdown`] tore down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownSummary {
    pub stopped: usize,
    pub failed: usize,
    pub tasks: ShutdownReport,
}

/// The subfleet process: one instance manager wired from config.
pub struct Daemon {
    config: Config,
    repo: Arc<dyn InstanceRepository>,
    manager: InstanceManager,
    tasks: Arc<AsyncTaskManager>,
}

impl Daemon {
    /// Open the SQLite store, resolve the master key and connect instances
    /// through the HTTP gateway.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let storage_path = config.storage_path();
        let repo = SqliteRepository::open(&storage_path)
            .await
            .with_context(|| format!("failed to open instance store {}", storage_path.display()))?;
        let master = MasterKeyProvider::resolve(&config).context("failed to resolve master key")?;
        let adapter = HttpGatewayAdapter::new(&config.gateway)
            .context("failed to build gateway client")?;

        Self::with_parts(config, Arc::new(repo), Arc::new(adapter), &master)
    }

    /// Wire a daemon from already-built collaborators.
    pub fn with_parts(
        config: Config,
        repo: Arc<dyn InstanceRepository>,
        adapter: Arc<dyn PlatformAdapter>,
        master: &EncryptionKey,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let security = Arc::new(security_manager(&config, master)?);
        let tasks = Arc::new(AsyncTaskManager::new(config.tasks.max_concurrency));
        let errors = Arc::new(ErrorHandler::new(recovery_policy(&config.recovery)));
        let manager = InstanceManager::new(
            ManagerSettings::from_config(&config.fleet),
            Arc::clone(&repo),
            adapter,
            security,
            Arc::clone(&tasks),
            errors,
        );
        Ok(Self {
            config,
            repo,
            manager,
            tasks,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &InstanceManager {
        &self.manager
    }

    pub fn repository(&self) -> &Arc<dyn InstanceRepository> {
        &self.repo
    }

    /// Restore persisted instances, start the enabled ones and begin health
    /// monitoring.
    pub async fn boot(&self) -> Result<BootReport> {
        let loaded = self
            .manager
            .load_persisted()
            .await
            .context("failed to load persisted instances")?;
        let started = self.manager.start_all_enabled().await;
        for (idx, err) in started.failures() {
            warn!(index = idx, error = %err, "instance failed to start");
        }
        self.manager.start_monitoring().await;

        let report = BootReport {
            loaded,
            started: started.success_count,
            failed: started.failure_count,
        };
        info!(
            loaded = report.loaded,
            started = report.started,
            failed = report.failed,
            "subfleet daemon booted"
        );
        Ok(report)
    }

    /// Stop every instance, then every remaining background task.
    pub async fn shutdown(&self) -> ShutdownSummary {
        let stopped = self.manager.shutdown().await;
        let grace = Duration::from_secs(self.config.tasks.shutdown_grace_secs);
        let tasks = self.tasks.shutdown(grace).await;
        ShutdownSummary {
            stopped: stopped.success_count,
            failed: stopped.failure_count,
            tasks,
        }
    }

    /// Boot, wait for `signal`, then shut down.
    pub async fn run_until<F>(&self, signal: F) -> Result<ShutdownSummary>
    where
        F: Future<Output = ()>,
    {
        self.boot().await?;
        signal.await;
        info!("shutdown requested");
        let summary = self.shutdown().await;
        info!(
            stopped = summary.stopped,
            failed = summary.failed,
            aborted_tasks = summary.tasks.aborted,
            "subfleet daemon stopped"
        );
        Ok(summary)
    }

    /// Run until ctrl-c.
    pub async fn run(&self) -> Result<ShutdownSummary> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
    }
}
