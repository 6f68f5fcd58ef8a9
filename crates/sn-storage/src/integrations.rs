//! Integration job repository — the durable queue behind the engine.
//!
//! Jobs are leased with a conditional UPDATE: the worker whose save moves
//! the row out of a runnable status wins; everyone else sees zero affected
//! rows and walks away.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::debug;

use sn_domain::{
    IntegrationAttempt, IntegrationId, IntegrationPayload, IntegrationPriority,
    IntegrationRequest, IntegrationStatus, IntegrationType,
};

use crate::{from_millis_opt, millis};

#[derive(Debug, Clone, Default)]
pub struct StatusCounts {
    pub by_status: HashMap<String, i64>,
}

impl StatusCounts {
    pub fn get(&self, status: IntegrationStatus) -> i64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

#[async_trait]
pub trait IntegrationRepository: Send + Sync {
    async fn save(&self, request: &IntegrationRequest) -> Result<()>;
    async fn find_by_id(&self, id: &IntegrationId) -> Result<Option<IntegrationRequest>>;
    /// Runnable jobs whose due time has arrived, priority first, then time.
    async fn find_scheduled_until(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<IntegrationRequest>>;
    async fn find_pending(
        &self,
        integration_type: Option<IntegrationType>,
        limit: u32,
    ) -> Result<Vec<IntegrationRequest>>;
    async fn find_active(
        &self,
        integration_type: Option<IntegrationType>,
    ) -> Result<Vec<IntegrationRequest>>;
    async fn find_failed(&self, limit: u32) -> Result<Vec<IntegrationRequest>>;
    /// Atomically claims a started job. Returns false when another worker
    /// (or a cancel) got there first.
    async fn lease_for_processing(&self, request: &IntegrationRequest) -> Result<bool>;
    /// Jobs stuck IN_PROGRESS for at least twice their timeout.
    async fn find_orphans(&self, now: DateTime<Utc>) -> Result<Vec<IntegrationRequest>>;
    async fn count_by_status(&self, since: Option<DateTime<Utc>>) -> Result<StatusCounts>;
    async fn count_runnable(&self) -> Result<i64>;
    async fn find_by_metadata(
        &self,
        key: &str,
        value: &str,
        status: Option<IntegrationStatus>,
    ) -> Result<Vec<IntegrationRequest>>;
    async fn cleanup_completed(&self, older_than: DateTime<Utc>, batch: u32) -> Result<u64>;
}

pub struct SqliteIntegrationRepository {
    pool: SqlitePool,
}

const INTEGRATION_COLUMNS: &str = "id, integration_type, priority, status, payload, metadata, max_retries, timeout_seconds, attempts, scheduled_at, next_attempt_at, started_at, completed_at, hubsoft_response, error_details";

impl SqliteIntegrationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<IntegrationRequest> {
        let priority_raw: String = row.get("priority");
        let priority = IntegrationPriority::from_str(&priority_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown integration priority: {priority_raw}"))?;

        let status_raw: String = row.get("status");
        let status = IntegrationStatus::from_str(&status_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown integration status: {status_raw}"))?;

        let payload: IntegrationPayload = serde_json::from_str(row.get("payload"))?;
        let metadata: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(row.get("metadata"))?;
        let attempts: Vec<IntegrationAttempt> = serde_json::from_str(row.get("attempts"))?;

        let hubsoft_response: Option<String> = row.try_get("hubsoft_response").ok().flatten();
        let error_details: Option<String> = row.try_get("error_details").ok().flatten();

        Ok(IntegrationRequest::rehydrate(
            IntegrationId(row.get("id")),
            payload,
            priority,
            status,
            metadata,
            row.get::<i64, _>("max_retries") as u32,
            row.get::<i64, _>("timeout_seconds") as u64,
            attempts,
            from_millis_opt(row.try_get("scheduled_at").ok().flatten())?,
            from_millis_opt(row.try_get("next_attempt_at").ok().flatten())?,
            from_millis_opt(row.try_get("started_at").ok().flatten())?,
            from_millis_opt(row.try_get("completed_at").ok().flatten())?,
            hubsoft_response.map(|raw| serde_json::from_str(&raw)).transpose()?,
            error_details.map(|raw| serde_json::from_str(&raw)).transpose()?,
        ))
    }

    fn bind_fields<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        request: &'q IntegrationRequest,
        payload: &'q str,
        metadata: &'q str,
        attempts: &'q str,
        hubsoft_response: &'q Option<String>,
        error_details: &'q Option<String>,
        now: i64,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        query
            .bind(request.integration_type().as_str())
            .bind(request.priority.as_str())
            .bind(request.priority.rank())
            .bind(request.status.as_str())
            .bind(payload)
            .bind(metadata)
            .bind(request.max_retries as i64)
            .bind(request.timeout_seconds as i64)
            .bind(attempts)
            .bind(request.scheduled_at.map(millis))
            .bind(request.next_attempt_at.map(millis))
            .bind(request.started_at.map(millis))
            .bind(request.completed_at.map(millis))
            .bind(hubsoft_response.as_deref())
            .bind(error_details.as_deref())
            .bind(now)
            .bind(now)
    }
}

#[async_trait]
impl IntegrationRepository for SqliteIntegrationRepository {
    async fn save(&self, request: &IntegrationRequest) -> Result<()> {
        let payload = serde_json::to_string(&request.payload)?;
        let metadata = serde_json::to_string(&request.metadata)?;
        let attempts = serde_json::to_string(&request.attempts)?;
        let hubsoft_response = request
            .hubsoft_response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let error_details = request
            .error_details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = millis(Utc::now());

        let query = sqlx::query(
            "INSERT INTO integrations (id, integration_type, priority, priority_rank, status, payload, metadata, max_retries, timeout_seconds, attempts, scheduled_at, next_attempt_at, started_at, completed_at, hubsoft_response, error_details, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                priority = excluded.priority,
                priority_rank = excluded.priority_rank,
                status = excluded.status,
                metadata = excluded.metadata,
                attempts = excluded.attempts,
                scheduled_at = excluded.scheduled_at,
                next_attempt_at = excluded.next_attempt_at,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                hubsoft_response = excluded.hubsoft_response,
                error_details = excluded.error_details,
                updated_at = excluded.updated_at",
        )
        .bind(&request.id.0);

        // created_at and updated_at both bind `now`; the upsert branch only
        // ever touches updated_at.
        let query = Self::bind_fields(
            query,
            request,
            &payload,
            &metadata,
            &attempts,
            &hubsoft_response,
            &error_details,
            now,
        );

        query.execute(&self.pool).await?;
        debug!(integration_id = %request.id, status = request.status.as_str(), "Integration saved");
        Ok(())
    }

    async fn find_by_id(&self, id: &IntegrationId) -> Result<Option<IntegrationRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn find_scheduled_until(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<IntegrationRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations
             WHERE status IN ('PENDING', 'RETRY_SCHEDULED')
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
             ORDER BY priority_rank DESC, COALESCE(next_attempt_at, 0) ASC
             LIMIT ?"
        ))
        .bind(millis(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn find_pending(
        &self,
        integration_type: Option<IntegrationType>,
        limit: u32,
    ) -> Result<Vec<IntegrationRequest>> {
        let rows = match integration_type {
            Some(kind) => {
                sqlx::query(&format!(
                    "SELECT {INTEGRATION_COLUMNS} FROM integrations
                     WHERE status = 'PENDING' AND integration_type = ?
                     ORDER BY priority_rank DESC, created_at ASC LIMIT ?"
                ))
                .bind(kind.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {INTEGRATION_COLUMNS} FROM integrations
                     WHERE status = 'PENDING'
                     ORDER BY priority_rank DESC, created_at ASC LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::parse_row).collect()
    }

    async fn find_active(
        &self,
        integration_type: Option<IntegrationType>,
    ) -> Result<Vec<IntegrationRequest>> {
        let rows = match integration_type {
            Some(kind) => {
                sqlx::query(&format!(
                    "SELECT {INTEGRATION_COLUMNS} FROM integrations
                     WHERE status IN ('PENDING', 'IN_PROGRESS', 'RETRY_SCHEDULED')
                       AND integration_type = ?
                     ORDER BY created_at ASC"
                ))
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {INTEGRATION_COLUMNS} FROM integrations
                     WHERE status IN ('PENDING', 'IN_PROGRESS', 'RETRY_SCHEDULED')
                     ORDER BY created_at ASC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::parse_row).collect()
    }

    async fn find_failed(&self, limit: u32) -> Result<Vec<IntegrationRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations
             WHERE status = 'FAILED' ORDER BY completed_at DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn lease_for_processing(&self, request: &IntegrationRequest) -> Result<bool> {
        let attempts = serde_json::to_string(&request.attempts)?;
        let now = millis(Utc::now());
        let result = sqlx::query(
            "UPDATE integrations SET
                status = 'IN_PROGRESS', started_at = ?, attempts = ?, updated_at = ?
             WHERE id = ? AND status IN ('PENDING', 'RETRY_SCHEDULED')",
        )
        .bind(request.started_at.map(millis))
        .bind(&attempts)
        .bind(now)
        .bind(&request.id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_orphans(&self, now: DateTime<Utc>) -> Result<Vec<IntegrationRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations
             WHERE status = 'IN_PROGRESS'
               AND started_at IS NOT NULL
               AND started_at + (2 * timeout_seconds * 1000) < ?"
        ))
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn count_by_status(&self, since: Option<DateTime<Utc>>) -> Result<StatusCounts> {
        let rows = match since {
            Some(ts) => {
                sqlx::query(
                    "SELECT status, COUNT(*) AS n FROM integrations WHERE created_at >= ? GROUP BY status",
                )
                .bind(millis(ts))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT status, COUNT(*) AS n FROM integrations GROUP BY status")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut counts = StatusCounts::default();
        for row in rows {
            counts.by_status.insert(row.get("status"), row.get("n"));
        }
        Ok(counts)
    }

    async fn count_runnable(&self) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM integrations WHERE status IN ('PENDING', 'RETRY_SCHEDULED')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    async fn find_by_metadata(
        &self,
        key: &str,
        value: &str,
        status: Option<IntegrationStatus>,
    ) -> Result<Vec<IntegrationRequest>> {
        let path = format!("$.{key}");
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {INTEGRATION_COLUMNS} FROM integrations
                     WHERE json_extract(metadata, ?) = ? AND status = ?
                     ORDER BY created_at ASC"
                ))
                .bind(&path)
                .bind(value)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {INTEGRATION_COLUMNS} FROM integrations
                     WHERE json_extract(metadata, ?) = ?
                     ORDER BY created_at ASC"
                ))
                .bind(&path)
                .bind(value)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::parse_row).collect()
    }

    async fn cleanup_completed(&self, older_than: DateTime<Utc>, batch: u32) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM integrations WHERE id IN (
                SELECT id FROM integrations
                WHERE status = 'COMPLETED' AND completed_at < ?
                ORDER BY completed_at ASC LIMIT ?
             )",
        )
        .bind(millis(older_than))
        .bind(batch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect_in_memory, MigrationRunner};
    use sn_domain::{TicketId, TicketSyncKind};

    async fn repo() -> SqliteIntegrationRepository {
        let pool = connect_in_memory().await.unwrap();
        MigrationRunner::embedded(pool.clone()).run().await.unwrap();
        SqliteIntegrationRepository::new(pool)
    }

    fn request(priority: IntegrationPriority) -> IntegrationRequest {
        let mut r = IntegrationRequest::new(
            IntegrationPayload::TicketSync {
                ticket_id: TicketId(1),
                sync_type: TicketSyncKind::Create,
            },
            priority,
        )
        .unwrap();
        r.schedule(None).unwrap();
        r.take_events();
        r
    }

    #[tokio::test]
    async fn save_and_rehydrate() {
        let repo = repo().await;
        let r = request(IntegrationPriority::High)
            .with_metadata("ticket_id", serde_json::json!("1"));
        repo.save(&r).await.unwrap();

        let loaded = repo.find_by_id(&r.id).await.unwrap().unwrap();
        assert_eq!(loaded.payload, r.payload);
        assert_eq!(loaded.priority, IntegrationPriority::High);
        assert_eq!(loaded.status, IntegrationStatus::Pending);
        assert_eq!(loaded.metadata.get("ticket_id"), Some(&serde_json::json!("1")));
    }

    #[tokio::test]
    async fn find_scheduled_until_orders_by_priority_then_time() {
        let repo = repo().await;
        let low = request(IntegrationPriority::Low);
        let urgent = request(IntegrationPriority::Urgent);
        let normal = request(IntegrationPriority::Normal);
        for r in [&low, &urgent, &normal] {
            repo.save(r).await.unwrap();
        }

        let due = repo.find_scheduled_until(Utc::now(), 10).await.unwrap();
        let priorities: Vec<_> = due.iter().map(|r| r.priority).collect();
        assert_eq!(
            priorities,
            vec![
                IntegrationPriority::Urgent,
                IntegrationPriority::Normal,
                IntegrationPriority::Low
            ]
        );
    }

    #[tokio::test]
    async fn future_jobs_are_not_due() {
        let repo = repo().await;
        let mut r = IntegrationRequest::new(
            IntegrationPayload::TicketSync {
                ticket_id: TicketId(1),
                sync_type: TicketSyncKind::Create,
            },
            IntegrationPriority::Normal,
        )
        .unwrap();
        r.schedule(Some(Utc::now() + chrono::Duration::hours(1))).unwrap();
        repo.save(&r).await.unwrap();

        assert!(repo.find_scheduled_until(Utc::now(), 10).await.unwrap().is_empty());
        assert_eq!(
            repo.find_scheduled_until(Utc::now() + chrono::Duration::hours(2), 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn lease_is_exclusive() {
        let repo = repo().await;
        let mut r = request(IntegrationPriority::Normal);
        repo.save(&r).await.unwrap();

        r.start().unwrap();
        assert!(repo.lease_for_processing(&r).await.unwrap());
        // A second worker with a stale copy loses the race.
        assert!(!repo.lease_for_processing(&r).await.unwrap());

        let stored = repo.find_by_id(&r.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IntegrationStatus::InProgress);
    }

    #[tokio::test]
    async fn orphan_detection_uses_double_timeout() {
        let repo = repo().await;
        let mut r = request(IntegrationPriority::Normal);
        r.start().unwrap();
        repo.save(&r).await.unwrap();

        let now = Utc::now();
        assert!(repo.find_orphans(now).await.unwrap().is_empty());

        // 2 x 30s timeout, plus slack.
        let later = now + chrono::Duration::seconds(61);
        let orphans = repo.find_orphans(later).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, r.id);
    }

    #[tokio::test]
    async fn metadata_queries_filter_by_status() {
        let repo = repo().await;
        let r = request(IntegrationPriority::Normal)
            .with_metadata("bulk_batch_id", serde_json::json!("batch-9"));
        repo.save(&r).await.unwrap();

        let found = repo
            .find_by_metadata("bulk_batch_id", "batch-9", Some(IntegrationStatus::Pending))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let none = repo
            .find_by_metadata("bulk_batch_id", "batch-9", Some(IntegrationStatus::Completed))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_completed() {
        let repo = repo().await;
        let mut done = request(IntegrationPriority::Normal);
        done.start().unwrap();
        done.record_attempt(true, None, None, None).unwrap();
        repo.save(&done).await.unwrap();

        let live = request(IntegrationPriority::Normal);
        repo.save(&live).await.unwrap();

        let removed = repo
            .cleanup_completed(Utc::now() + chrono::Duration::hours(1), 100)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(repo.find_by_id(&live.id).await.unwrap().is_some());
    }
}
