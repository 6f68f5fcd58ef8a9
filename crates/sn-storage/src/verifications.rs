//! Verification repository.
//!
//! Live rows sit in `pending_cpf_verifications`; every terminal transition
//! also appends a `cpf_verification_history` row, which is what survives the
//! pruning of old pending rows.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use sn_domain::{
    ChatUserId, Cpf, Verification, VerificationId, VerificationStatus, VerificationType,
};

use crate::{from_millis, from_millis_opt, millis};

#[async_trait]
pub trait VerificationRepository: Send + Sync {
    async fn save(&self, verification: &Verification) -> Result<()>;
    async fn find_by_id(&self, id: &VerificationId) -> Result<Option<Verification>>;
    /// The user's current non-terminal verification, if any.
    async fn find_pending_by_user(&self, user_id: ChatUserId) -> Result<Option<Verification>>;
    async fn find_expired_pending(&self, now: DateTime<Utc>) -> Result<Vec<Verification>>;
    async fn find_by_status(
        &self,
        status: VerificationStatus,
        limit: u32,
    ) -> Result<Vec<Verification>>;
    /// Removes terminal rows whose deadline passed more than `older_than_days`
    /// ago. History rows are kept indefinitely.
    async fn prune_finished(&self, older_than_days: i64) -> Result<u64>;
    async fn count_history_since(&self, since: DateTime<Utc>) -> Result<(i64, i64)>;
}

pub struct SqliteVerificationRepository {
    pool: SqlitePool,
}

const VERIFICATION_COLUMNS: &str = "id, user_id, username, user_mention, verification_type, source_action, status, created_at, expires_at, started_at, completed_at, attempt_count, cpf_verified, client_data, failure_reason";

impl SqliteVerificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<Verification> {
        let type_raw: String = row.get("verification_type");
        let verification_type = VerificationType::from_str(&type_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown verification type: {type_raw}"))?;

        let status_raw: String = row.get("status");
        let status = VerificationStatus::from_str(&status_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown verification status: {status_raw}"))?;

        let cpf: Option<String> = row.try_get("cpf_verified").ok().flatten();
        let cpf = cpf.map(|raw| Cpf::parse(&raw)).transpose()?;

        let client_data: Option<String> = row.try_get("client_data").ok().flatten();
        let client_data = client_data
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?;

        Ok(Verification::rehydrate(
            VerificationId(row.get("id")),
            ChatUserId(row.get("user_id")),
            row.get("username"),
            row.get("user_mention"),
            verification_type,
            row.try_get("source_action").ok().flatten(),
            status,
            from_millis(row.get("created_at"))?,
            from_millis(row.get("expires_at"))?,
            from_millis_opt(row.try_get("started_at").ok().flatten())?,
            from_millis_opt(row.try_get("completed_at").ok().flatten())?,
            row.get::<i64, _>("attempt_count") as u32,
            cpf,
            client_data,
            row.try_get("failure_reason").ok().flatten(),
        ))
    }

    async fn append_history(&self, v: &Verification) -> Result<()> {
        sqlx::query(
            "INSERT INTO cpf_verification_history (verification_id, user_id, username, verification_type, source_action, status, cpf_masked, success, failure_reason, completed_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&v.id.0)
        .bind(v.user_id.0)
        .bind(&v.username)
        .bind(v.verification_type.as_str())
        .bind(&v.source_action)
        .bind(v.status.as_str())
        .bind(v.cpf_verified.as_ref().map(|c| c.masked()))
        .bind((v.status == VerificationStatus::Completed) as i64)
        .bind(&v.failure_reason)
        .bind(v.completed_at.map(millis))
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl VerificationRepository for SqliteVerificationRepository {
    async fn save(&self, verification: &Verification) -> Result<()> {
        sqlx::query(
            "INSERT INTO pending_cpf_verifications (id, user_id, username, user_mention, verification_type, source_action, status, created_at, expires_at, started_at, completed_at, attempt_count, cpf_verified, client_data, failure_reason)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                attempt_count = excluded.attempt_count,
                cpf_verified = excluded.cpf_verified,
                client_data = excluded.client_data,
                failure_reason = excluded.failure_reason",
        )
        .bind(&verification.id.0)
        .bind(verification.user_id.0)
        .bind(&verification.username)
        .bind(&verification.user_mention)
        .bind(verification.verification_type.as_str())
        .bind(&verification.source_action)
        .bind(verification.status.as_str())
        .bind(millis(verification.created_at))
        .bind(millis(verification.expires_at))
        .bind(verification.started_at.map(millis))
        .bind(verification.completed_at.map(millis))
        .bind(verification.attempt_count as i64)
        .bind(verification.cpf_verified.as_ref().map(|c| c.as_str().to_string()))
        .bind(
            verification
                .client_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&verification.failure_reason)
        .execute(&self.pool)
        .await?;

        if verification.status.is_terminal() {
            self.append_history(verification).await?;
        }
        debug!(verification_id = %verification.id, status = verification.status.as_str(), "Verification saved");
        Ok(())
    }

    async fn find_by_id(&self, id: &VerificationId) -> Result<Option<Verification>> {
        let row = sqlx::query(&format!(
            "SELECT {VERIFICATION_COLUMNS} FROM pending_cpf_verifications WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn find_pending_by_user(&self, user_id: ChatUserId) -> Result<Option<Verification>> {
        let row = sqlx::query(&format!(
            "SELECT {VERIFICATION_COLUMNS} FROM pending_cpf_verifications
             WHERE user_id = ? AND status IN ('PENDING', 'IN_PROGRESS')
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn find_expired_pending(&self, now: DateTime<Utc>) -> Result<Vec<Verification>> {
        let rows = sqlx::query(&format!(
            "SELECT {VERIFICATION_COLUMNS} FROM pending_cpf_verifications
             WHERE status IN ('PENDING', 'IN_PROGRESS') AND expires_at <= ?
             ORDER BY expires_at ASC"
        ))
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn find_by_status(
        &self,
        status: VerificationStatus,
        limit: u32,
    ) -> Result<Vec<Verification>> {
        let rows = sqlx::query(&format!(
            "SELECT {VERIFICATION_COLUMNS} FROM pending_cpf_verifications
             WHERE status = ? ORDER BY created_at DESC LIMIT ?"
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn prune_finished(&self, older_than_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
        let result = sqlx::query(
            "DELETE FROM pending_cpf_verifications
             WHERE status NOT IN ('PENDING', 'IN_PROGRESS') AND expires_at < ?",
        )
        .bind(millis(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_history_since(&self, since: DateTime<Utc>) -> Result<(i64, i64)> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS ok,
                COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) AS failed
             FROM cpf_verification_history WHERE created_at >= ?",
        )
        .bind(millis(since))
        .fetch_one(&self.pool)
        .await?;
        Ok((row.get("ok"), row.get("failed")))
    }
}
