#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sf_agents::adapter::{AdapterError, ClientHandle, ConnectRequest, PlatformAdapter};
use sf_agents::supervisor::{InstanceManager, ManagerSettings};
use sf_core::crypto::{EncryptionKey, TokenSecurityManager};
use sf_core::repository::InMemoryRepository;
use sf_core::types::{InstanceSpec, InstanceStatus};
use sf_harness::error_handler::ErrorHandler;
use sf_harness::task_manager::AsyncTaskManager;
use tokio::sync::Semaphore;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Scripted platform adapter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeAdapter {
    pub connects: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    pub last_token: Mutex<Option<String>>,
    connect_script: Mutex<VecDeque<AdapterError>>,
    probe_script: Arc<Mutex<VecDeque<Result<bool, AdapterError>>>>,
    gate: Option<Arc<Semaphore>>,
    close_delay: Duration,
    probe_delay: Duration,
}

impl FakeAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every connect waits for a permit on the returned semaphore.
    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let adapter = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (Arc::new(adapter), gate)
    }

    /// Clients take `delay` to close, longer than a short grace period.
    pub fn slow_close(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            close_delay: delay,
            ..Self::default()
        })
    }

    /// Every probe takes `delay` before answering.
    pub fn slow_probe(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            probe_delay: delay,
            ..Self::default()
        })
    }

    pub fn fail_next_connect(&self, err: AdapterError) {
        self.connect_script.lock().unwrap().push_back(err);
    }

    /// Outcomes for upcoming probes; once exhausted probes pass.
    pub fn script_probes(&self, outcomes: impl IntoIterator<Item = Result<bool, AdapterError>>) {
        self.probe_script.lock().unwrap().extend(outcomes);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PlatformAdapter for FakeAdapter {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn ClientHandle>, AdapterError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        *self.last_token.lock().unwrap() = Some(request.token.expose().to_string());
        if let Some(err) = self.connect_script.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(Arc::new(FakeClient {
            probe_script: Arc::clone(&self.probe_script),
            closes: Arc::clone(&self.closes),
            closed: AtomicBool::new(false),
            close_delay: self.close_delay,
            probe_delay: self.probe_delay,
        }))
    }
}

struct FakeClient {
    probe_script: Arc<Mutex<VecDeque<Result<bool, AdapterError>>>>,
    closes: Arc<AtomicUsize>,
    closed: AtomicBool,
    close_delay: Duration,
    probe_delay: Duration,
}

#[async_trait::async_trait]
impl ClientHandle for FakeClient {
    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> Result<bool, AdapterError> {
        if !self.probe_delay.is_zero() {
            tokio::time::sleep(self.probe_delay).await;
        }
        self.probe_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(true))
    }

    async fn close(&self) {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ---------------------------------------------------------------------------
// Manager wiring
// ---------------------------------------------------------------------------

pub struct Harness {
    pub mgr: InstanceManager,
    pub adapter: Arc<FakeAdapter>,
    pub repo: Arc<InMemoryRepository>,
    pub master: EncryptionKey,
}

pub fn settings(max_instances: usize) -> ManagerSettings {
    ManagerSettings {
        max_instances,
        health_check_interval: Duration::from_millis(50),
        probe_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(1),
        unregister_grace: Duration::from_millis(200),
        monitor_grace: Duration::from_millis(200),
    }
}

pub fn harness(max_instances: usize) -> Harness {
    harness_with(
        FakeAdapter::new(),
        Arc::new(InMemoryRepository::new()),
        EncryptionKey::generate().unwrap(),
        max_instances,
    )
}

pub fn harness_with(
    adapter: Arc<FakeAdapter>,
    repo: Arc<InMemoryRepository>,
    master: EncryptionKey,
    max_instances: usize,
) -> Harness {
    build(adapter, repo, master, settings(max_instances))
}

pub fn harness_with_settings(adapter: Arc<FakeAdapter>, settings: ManagerSettings) -> Harness {
    build(
        adapter,
        Arc::new(InMemoryRepository::new()),
        EncryptionKey::generate().unwrap(),
        settings,
    )
}

fn build(
    adapter: Arc<FakeAdapter>,
    repo: Arc<InMemoryRepository>,
    master: EncryptionKey,
    settings: ManagerSettings,
) -> Harness {
    let security = Arc::new(TokenSecurityManager::new(&master).unwrap());
    let mgr = InstanceManager::new(
        settings,
        repo.clone(),
        adapter.clone(),
        security,
        Arc::new(AsyncTaskManager::new(8)),
        Arc::new(ErrorHandler::default()),
    );
    Harness {
        mgr,
        adapter,
        repo,
        master,
    }
}

pub fn spec(name: &str) -> InstanceSpec {
    InstanceSpec::new(name, format!("tok.{name}.secret")).with_channels(["1001", "1002"])
}

pub async fn wait_for_status(mgr: &InstanceManager, id: Uuid, status: InstanceStatus) {
    for _ in 0..300 {
        if mgr.status(id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "instance {id} never reached {status}; last seen {}",
        mgr.status(id).await.unwrap().status
    );
}
