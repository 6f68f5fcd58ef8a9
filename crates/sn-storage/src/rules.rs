//! Rules-acceptance tracking: new joiners must press the accept button
//! within 24 hours or be removed by the checkup sweep.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use sn_domain::ChatUserId;

use crate::{from_millis, millis};

#[derive(Debug, Clone, PartialEq)]
pub struct RulesState {
    pub user_id: ChatUserId,
    pub prompted_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RulesRepository: Send + Sync {
    /// Records that the user was shown the rules (idempotent, keeps the
    /// first prompt time).
    async fn record_prompt(&self, user_id: ChatUserId) -> Result<()>;
    async fn record_acceptance(&self, user_id: ChatUserId) -> Result<()>;
    async fn find(&self, user_id: ChatUserId) -> Result<Option<RulesState>>;
    /// Users prompted before `deadline` who never accepted.
    async fn find_overdue(&self, deadline: DateTime<Utc>) -> Result<Vec<RulesState>>;
    async fn remove(&self, user_id: ChatUserId) -> Result<()>;
}

pub struct SqliteRulesRepository {
    pool: SqlitePool,
}

impl SqliteRulesRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<RulesState> {
        let accepted: Option<i64> = row.try_get("accepted_at").ok().flatten();
        Ok(RulesState {
            user_id: ChatUserId(row.get("user_id")),
            prompted_at: from_millis(row.get("prompted_at"))?,
            accepted_at: accepted.map(from_millis).transpose()?,
        })
    }
}

#[async_trait]
impl RulesRepository for SqliteRulesRepository {
    async fn record_prompt(&self, user_id: ChatUserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_rules (user_id, prompted_at) VALUES (?, ?)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id.0)
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_acceptance(&self, user_id: ChatUserId) -> Result<()> {
        let now = millis(Utc::now());
        sqlx::query(
            "INSERT INTO user_rules (user_id, prompted_at, accepted_at) VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET accepted_at = excluded.accepted_at",
        )
        .bind(user_id.0)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, user_id: ChatUserId) -> Result<Option<RulesState>> {
        let row = sqlx::query(
            "SELECT user_id, prompted_at, accepted_at FROM user_rules WHERE user_id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn find_overdue(&self, deadline: DateTime<Utc>) -> Result<Vec<RulesState>> {
        let rows = sqlx::query(
            "SELECT user_id, prompted_at, accepted_at FROM user_rules
             WHERE accepted_at IS NULL AND prompted_at < ?",
        )
        .bind(millis(deadline))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn remove(&self, user_id: ChatUserId) -> Result<()> {
        sqlx::query("DELETE FROM user_rules WHERE user_id = ?")
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
