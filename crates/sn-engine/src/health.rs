//! Upstream health monitor.
//!
//! Probes the API on a fixed interval and watches for edges. Down→up
//! publishes `HubSoftConnectionRestored` with the downtime duration and the
//! queued backlog, then triggers offline-ticket reconciliation. Up→down
//! publishes `HubSoftConnectionLost`; jobs keep queueing either way.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use sn_domain::events::{HubSoftConnectionLost, HubSoftConnectionRestored};
use sn_events::EventBus;
use sn_hubsoft::HubSoftClient;
use sn_storage::IntegrationRepository;

use crate::{IntegrationEngine, Reconciler};

pub struct HealthMonitor {
    engine: Arc<IntegrationEngine>,
    client: Arc<HubSoftClient>,
    integrations: Arc<dyn IntegrationRepository>,
    reconciler: Arc<Reconciler>,
    bus: Arc<EventBus>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        engine: Arc<IntegrationEngine>,
        client: Arc<HubSoftClient>,
        integrations: Arc<dyn IntegrationRepository>,
        reconciler: Arc<Reconciler>,
        bus: Arc<EventBus>,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            client,
            integrations,
            reconciler,
            bus,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.engine.hubsoft_enabled() {
            info!("HubSoft disabled; health monitor idle");
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_status: Option<bool> = None;
        let mut went_down_at: Option<Instant> = None;

        info!(interval_secs = self.interval.as_secs(), "HubSoft health monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let healthy = self.client.check_api_health().await;
            self.engine.set_upstream_healthy(healthy);
            metrics::gauge!("hubsoft.healthy").set(if healthy { 1.0 } else { 0.0 });

            match (last_status, healthy) {
                (Some(false), true) => {
                    let downtime_seconds = went_down_at
                        .map(|t| t.elapsed().as_secs())
                        .unwrap_or(0);
                    let pending = self.integrations.count_runnable().await.unwrap_or(0);
                    info!(downtime_seconds, pending, "HubSoft back online, starting recovery");

                    self.bus
                        .publish(&HubSoftConnectionRestored {
                            downtime_seconds,
                            pending_operations: pending.max(0) as u64,
                        })
                        .await;

                    if let Err(e) = self.reconciler.run_recovery().await {
                        error!(error = %e, "Recovery after reconnection failed");
                    }
                    went_down_at = None;
                }
                (Some(true), false) | (None, false) => {
                    if last_status == Some(true) {
                        warn!("HubSoft went offline; new jobs will queue");
                        self.bus
                            .publish(&HubSoftConnectionLost { at: Utc::now() })
                            .await;
                    }
                    if went_down_at.is_none() {
                        went_down_at = Some(Instant::now());
                    }
                }
                _ => {}
            }
            last_status = Some(healthy);
        }
        info!("HubSoft health monitor stopped");
    }
}
