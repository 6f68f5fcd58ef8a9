//! The HubSoft Integration Engine.
//!
//! Every upstream call in the system is a durable job: submitted through
//! [`IntegrationEngine::schedule`], persisted before anything runs, pulled
//! by a polling scheduler in priority-then-time order, leased to exactly one
//! worker, executed with a deadline, and retried with saturating exponential
//! backoff when the failure is transient. Upstream downtime just makes the
//! queue grow; the health monitor triggers reconciliation when the API comes
//! back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use sn_domain::{
    DomainError, IntegrationId, IntegrationPayload, IntegrationPriority, IntegrationRequest,
    IntegrationStatus,
};
use sn_events::EventBus;
use sn_hubsoft::{ApiCache, HubSoftClient, HubSoftError};
use sn_storage::{IntegrationRepository, TicketRepository, UserRepository};

pub mod executor;
pub mod health;
pub mod reconcile;
pub mod recovery;

pub use health::HealthMonitor;
pub use reconcile::{jaccard_similarity, ReconcileReport, Reconciler};

/// Chat-side group membership revocation, wired in by the presentation
/// layer. Jobs that need it fail retryably when no revoker is configured.
#[async_trait::async_trait]
pub trait GroupRevoker: Send + Sync {
    async fn revoke(&self, user_id: sn_domain::ChatUserId, reason: &str) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage failure: {0}")]
    Storage(anyhow::Error),

    #[error(transparent)]
    Upstream(#[from] HubSoftError),

    #[error("integration {0} not found")]
    NotFound(IntegrationId),
}

// anyhow::Error is not a std error, so thiserror cannot derive this one.
impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Storage(e)
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub workers: usize,
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub hubsoft_enabled: bool,
    pub health_check_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(5),
            batch_size: 25,
            hubsoft_enabled: true,
            health_check_interval: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(20),
        }
    }
}

/// Optional knobs for [`IntegrationEngine::schedule_with`].
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub run_at: Option<chrono::DateTime<chrono::Utc>>,
    pub max_retries: Option<u32>,
    pub metadata: Vec<(String, serde_json::Value)>,
}

pub struct IntegrationEngine {
    pub(crate) integrations: Arc<dyn IntegrationRepository>,
    pub(crate) tickets: Arc<dyn TicketRepository>,
    pub(crate) users: Arc<dyn UserRepository>,
    pub(crate) client: Arc<HubSoftClient>,
    pub(crate) cache: Arc<ApiCache>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) settings: EngineSettings,
    pub(crate) revoker: RwLock<Option<Arc<dyn GroupRevoker>>>,
    /// Dispatch pause deadline after an observed 429.
    pause_until: RwLock<Option<Instant>>,
    /// Last known upstream health, maintained by the health monitor.
    upstream_healthy: AtomicBool,
}

impl IntegrationEngine {
    pub fn new(
        integrations: Arc<dyn IntegrationRepository>,
        tickets: Arc<dyn TicketRepository>,
        users: Arc<dyn UserRepository>,
        client: Arc<HubSoftClient>,
        cache: Arc<ApiCache>,
        bus: Arc<EventBus>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            integrations,
            tickets,
            users,
            client,
            cache,
            bus,
            settings,
            revoker: RwLock::new(None),
            pause_until: RwLock::new(None),
            upstream_healthy: AtomicBool::new(false),
        })
    }

    /// Installs the chat-side revoker. Called once during wiring.
    pub fn set_revoker(&self, revoker: Arc<dyn GroupRevoker>) {
        *self.revoker.write() = Some(revoker);
    }

    // ========================================================================
    // Submission
    // ========================================================================

    pub async fn schedule(
        &self,
        payload: IntegrationPayload,
        priority: IntegrationPriority,
    ) -> Result<IntegrationId, EngineError> {
        self.schedule_with(payload, priority, ScheduleOptions::default())
            .await
    }

    pub async fn schedule_with(
        &self,
        payload: IntegrationPayload,
        priority: IntegrationPriority,
        options: ScheduleOptions,
    ) -> Result<IntegrationId, EngineError> {
        enqueue(
            self.integrations.as_ref(),
            &self.bus,
            payload,
            priority,
            options,
        )
        .await
    }

    pub async fn cancel(&self, id: &IntegrationId, reason: &str) -> Result<(), EngineError> {
        let mut job = self
            .integrations
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        job.cancel(reason)?;
        self.integrations.save(&job).await?;
        self.bus.publish_many(job.take_events()).await;
        Ok(())
    }

    pub async fn update_priority(
        &self,
        id: &IntegrationId,
        priority: IntegrationPriority,
        reason: &str,
    ) -> Result<(), EngineError> {
        let mut job = self
            .integrations
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        job.update_priority(priority, reason)?;
        self.integrations.save(&job).await?;
        self.bus.publish_many(job.take_events()).await;
        Ok(())
    }

    /// Runs a USER_VERIFICATION job inline and returns its result. The job
    /// is still durable: callers that need the answer now (the verification
    /// flow) get it, and the attempt history lands in the queue table.
    pub async fn run_user_verification(
        &self,
        cpf: sn_domain::Cpf,
        force_refresh: bool,
    ) -> Result<Option<sn_hubsoft::ClientInfo>, EngineError> {
        let payload = IntegrationPayload::UserVerification {
            cpf,
            include_contracts: true,
            cache_ttl_secs: None,
            force_refresh,
        };
        let id = self
            .schedule(payload, IntegrationPriority::High)
            .await?;

        let mut job = self
            .integrations
            .find_by_id(&id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;

        job.start()?;
        if !self.integrations.lease_for_processing(&job).await? {
            // Nobody else can have it this fast; treat as a storage race.
            return Err(EngineError::Storage(anyhow::anyhow!(
                "freshly scheduled job already leased"
            )));
        }
        self.bus.publish_many(job.take_events()).await;

        let outcome = executor::execute(self, &mut job).await;
        self.integrations.save(&job).await?;
        self.bus.publish_many(job.take_events()).await;

        match outcome {
            executor::Outcome::Completed => {
                let info = job
                    .hubsoft_response
                    .as_ref()
                    .filter(|v| !v.is_null())
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| HubSoftError::Schema(e.to_string()))?;
                Ok(info)
            }
            executor::Outcome::Retrying(e) | executor::Outcome::Failed(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Dispatch state
    // ========================================================================

    pub fn pause_dispatch_for(&self, duration: Duration) {
        let until = Instant::now() + duration;
        *self.pause_until.write() = Some(until);
        warn!(pause_secs = duration.as_secs(), "Engine dispatch paused");
    }

    pub fn is_dispatch_paused(&self) -> bool {
        match *self.pause_until.read() {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    pub fn set_upstream_healthy(&self, healthy: bool) {
        self.upstream_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn is_upstream_healthy(&self) -> bool {
        self.upstream_healthy.load(Ordering::Relaxed)
    }

    pub fn hubsoft_enabled(&self) -> bool {
        self.settings.hubsoft_enabled
    }

    // ========================================================================
    // Runtime
    // ========================================================================

    /// Spawns the scheduler and worker pool. Resolves when `shutdown` fires
    /// and the pool has drained (bounded by `shutdown_grace`).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        // Jobs stranded by a previous crash go back through the retry policy
        // before anything new is dispatched.
        if let Err(e) = recovery::recover_orphans(self.integrations.as_ref(), &self.bus).await {
            error!(error = %e, "Orphan recovery on startup failed");
        }

        let (tx, rx) = mpsc::channel::<IntegrationId>(self.settings.batch_size as usize * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = Vec::with_capacity(self.settings.workers);
        for worker_id in 0..self.settings.workers {
            let engine = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            let mut shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job_id = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            id = rx.recv() => id,
                            _ = shutdown.changed() => None,
                        }
                    };
                    let Some(job_id) = job_id else { break };
                    engine.process(worker_id, job_id).await;
                }
                debug!(worker_id, "Engine worker stopped");
            }));
        }

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut orphan_sweep = tokio::time::interval(Duration::from_secs(60));
        orphan_sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            workers = self.settings.workers,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Integration engine started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(&tx).await {
                        error!(error = %e, "Scheduler poll failed");
                    }
                }
                _ = orphan_sweep.tick() => {
                    if let Err(e) = recovery::recover_orphans(self.integrations.as_ref(), &self.bus).await {
                        error!(error = %e, "Orphan sweep failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        drop(tx);
        let drain = futures::future::join_all(workers);
        if tokio::time::timeout(self.settings.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!("Engine shutdown grace elapsed; in-flight jobs left for orphan recovery");
        }
        info!("Integration engine stopped");
    }

    /// One scheduler pass: pull due work and feed the pool.
    pub async fn poll_once(&self, tx: &mpsc::Sender<IntegrationId>) -> Result<(), EngineError> {
        if !self.settings.hubsoft_enabled {
            return Ok(());
        }
        if self.is_dispatch_paused() {
            debug!("Dispatch paused, skipping poll");
            return Ok(());
        }

        let due = self
            .integrations
            .find_scheduled_until(Utc::now(), self.settings.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(());
        }

        metrics::gauge!("engine.due_jobs").set(due.len() as f64);
        debug!(count = due.len(), "Dispatching due integrations");

        for job in due {
            if tx.send(job.id.clone()).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Lease, execute, persist. Losing the lease race is a silent skip.
    async fn process(&self, worker_id: usize, job_id: IntegrationId) {
        let job = match self.integrations.find_by_id(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                error!(integration_id = %job_id, error = %e, "Failed to load integration");
                return;
            }
        };

        let mut job = job;
        if job.start().is_err() {
            // Already finished or cancelled between poll and here.
            return;
        }
        match self.integrations.lease_for_processing(&job).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!(integration_id = %job_id, error = %e, "Lease attempt failed");
                return;
            }
        }
        self.bus.publish_many(job.take_events()).await;

        debug!(worker_id, integration_id = %job.id, kind = job.integration_type().as_str(), "Executing integration");
        metrics::counter!("engine.jobs_started_total").increment(1);

        let outcome = executor::execute(self, &mut job).await;
        match &outcome {
            executor::Outcome::Completed => {
                metrics::counter!("engine.jobs_completed_total").increment(1);
            }
            executor::Outcome::Retrying(e) => {
                metrics::counter!("engine.jobs_retried_total").increment(1);
                warn!(integration_id = %job.id, error = %e, "Integration attempt failed, retry scheduled");
            }
            executor::Outcome::Failed(e) => {
                metrics::counter!("engine.jobs_failed_total").increment(1);
                warn!(integration_id = %job.id, error = %e, "Integration failed terminally");
            }
        }

        // An admin cancel that landed while the attempt ran wins; the
        // attempt's result is discarded.
        match self.integrations.find_by_id(&job.id).await {
            Ok(Some(stored)) if stored.status == IntegrationStatus::Cancelled => {
                debug!(integration_id = %job.id, "Job cancelled mid-flight; result discarded");
                return;
            }
            _ => {}
        }

        if let Err(e) = self.integrations.save(&job).await {
            error!(integration_id = %job.id, error = %e, "Failed to persist integration result");
            return;
        }
        self.bus.publish_many(job.take_events()).await;
    }
}

/// Builds, validates, persists and announces a new job. Shared by the
/// engine handle and the reconciler.
pub async fn enqueue(
    repo: &dyn IntegrationRepository,
    bus: &EventBus,
    payload: IntegrationPayload,
    priority: IntegrationPriority,
    options: ScheduleOptions,
) -> Result<IntegrationId, EngineError> {
    let mut job = IntegrationRequest::new(payload, priority)?;
    if let Some(max_retries) = options.max_retries {
        job = job.with_max_retries(max_retries);
    }
    for (key, value) in options.metadata {
        job.metadata.insert(key, value);
    }
    job.schedule(options.run_at)?;

    repo.save(&job).await?;
    let id = job.id.clone();
    bus.publish_many(job.take_events()).await;
    metrics::counter!("engine.jobs_scheduled_total").increment(1);
    debug!(integration_id = %id, "Integration scheduled");
    Ok(id)
}
