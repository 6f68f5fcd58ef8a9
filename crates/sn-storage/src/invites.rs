//! Group invite repository.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use sn_domain::{ChatUserId, Cpf, GroupInvite};

use crate::{from_millis, from_millis_opt, millis};

#[async_trait]
pub trait InviteRepository: Send + Sync {
    /// Persists the invite and returns it with its assigned id.
    async fn save(&self, invite: GroupInvite) -> Result<GroupInvite>;
    async fn find_by_id(&self, id: i64) -> Result<Option<GroupInvite>>;
    async fn find_by_user(&self, user_id: ChatUserId) -> Result<Vec<GroupInvite>>;
    async fn mark_used(&self, id: i64) -> Result<()>;
    async fn find_expired(&self) -> Result<Vec<GroupInvite>>;
    /// Deletes invites created more than `days` days ago. Returns the count.
    async fn cleanup_old(&self, days: i64) -> Result<u64>;
}

pub struct SqliteInviteRepository {
    pool: SqlitePool,
}

const INVITE_COLUMNS: &str =
    "id, user_id, cpf, invite_url, created_at, expires_at, used, used_at, client_name, plan_name";

impl SqliteInviteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<GroupInvite> {
        let cpf_raw: String = row.get("cpf");
        Ok(GroupInvite {
            invite_id: Some(row.get("id")),
            user_id: ChatUserId(row.get("user_id")),
            cpf: Cpf::parse(&cpf_raw)?,
            invite_url: row.get("invite_url"),
            created_at: from_millis(row.get("created_at"))?,
            expires_at: from_millis(row.get("expires_at"))?,
            used: row.get::<i64, _>("used") != 0,
            used_at: from_millis_opt(row.try_get("used_at").ok().flatten())?,
            client_name: row.try_get("client_name").ok().flatten(),
            plan_name: row.try_get("plan_name").ok().flatten(),
        })
    }
}

#[async_trait]
impl InviteRepository for SqliteInviteRepository {
    async fn save(&self, mut invite: GroupInvite) -> Result<GroupInvite> {
        let result = sqlx::query(
            "INSERT INTO group_invites (user_id, cpf, invite_url, created_at, expires_at, used, used_at, client_name, plan_name)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(invite.user_id.0)
        .bind(invite.cpf.as_str())
        .bind(&invite.invite_url)
        .bind(millis(invite.created_at))
        .bind(millis(invite.expires_at))
        .bind(invite.used as i64)
        .bind(invite.used_at.map(millis))
        .bind(&invite.client_name)
        .bind(&invite.plan_name)
        .execute(&self.pool)
        .await?;

        invite.invite_id = Some(result.last_insert_rowid());
        Ok(invite)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<GroupInvite>> {
        let row = sqlx::query(&format!(
            "SELECT {INVITE_COLUMNS} FROM group_invites WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn find_by_user(&self, user_id: ChatUserId) -> Result<Vec<GroupInvite>> {
        let rows = sqlx::query(&format!(
            "SELECT {INVITE_COLUMNS} FROM group_invites WHERE user_id = ? ORDER BY created_at DESC"
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn mark_used(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE group_invites SET used = 1, used_at = ? WHERE id = ?")
            .bind(millis(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_expired(&self) -> Result<Vec<GroupInvite>> {
        let rows = sqlx::query(&format!(
            "SELECT {INVITE_COLUMNS} FROM group_invites WHERE used = 0 AND expires_at <= ?"
        ))
        .bind(millis(Utc::now()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn cleanup_old(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let result = sqlx::query("DELETE FROM group_invites WHERE created_at < ?")
            .bind(millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
