//! Orphaned-job recovery.
//!
//! A crash mid-execution leaves a job IN_PROGRESS with no completion. Once
//! its start time is at least twice the job timeout in the past, it is
//! failed as `orphaned` with `retryable = true`, and the normal retry
//! policy decides whether it runs again.

use chrono::Utc;
use tracing::{info, warn};

use sn_events::EventBus;
use sn_storage::IntegrationRepository;

use crate::EngineError;

pub async fn recover_orphans(
    repo: &dyn IntegrationRepository,
    bus: &EventBus,
) -> Result<u64, EngineError> {
    let orphans = repo.find_orphans(Utc::now()).await?;
    if orphans.is_empty() {
        return Ok(0);
    }

    let mut recovered = 0;
    for mut job in orphans {
        warn!(integration_id = %job.id, started_at = ?job.started_at, "Recovering orphaned integration");
        if let Err(e) = job.fail("orphaned", None, true) {
            warn!(integration_id = %job.id, error = %e, "Orphan could not be failed");
            continue;
        }
        repo.save(&job).await?;
        bus.publish_many(job.take_events()).await;
        recovered += 1;
    }

    info!(recovered, "Orphaned integrations recovered");
    metrics::counter!("engine.orphans_recovered_total").increment(recovered);
    Ok(recovered)
}
