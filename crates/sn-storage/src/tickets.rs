//! Ticket repository.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use sn_domain::{
    AffectedGame, ChatUserId, NewTicket, ProblemTiming, SyncStatus, Ticket, TicketCategory,
    TicketId, TicketStatus, Urgency,
};

use crate::{from_millis, millis};

#[async_trait]
pub trait TicketRepository: Send + Sync {
    /// Inserts a validated draft and returns the stored aggregate with its
    /// assigned id.
    async fn insert(&self, new: NewTicket) -> Result<Ticket>;
    /// Persists aggregate mutations. Optimistic: fails when the stored
    /// version no longer matches the one the aggregate was loaded with.
    async fn save(&self, ticket: &mut Ticket) -> Result<()>;
    async fn find_by_id(&self, id: TicketId) -> Result<Option<Ticket>>;
    async fn find_active_by_user(&self, user_id: ChatUserId) -> Result<Option<Ticket>>;
    async fn find_by_user(&self, user_id: ChatUserId, limit: u32) -> Result<Vec<Ticket>>;
    /// Tickets created while the upstream was down: no HubSoft id and a
    /// pending or failed sync status.
    async fn find_offline_tickets(&self) -> Result<Vec<Ticket>>;
    async fn find_active_with_hubsoft_id(&self) -> Result<Vec<Ticket>>;
    /// Latest tickets, optionally filtered by status.
    async fn find_recent(&self, status: Option<TicketStatus>, limit: u32) -> Result<Vec<Ticket>>;
    async fn count_by_status(&self, status: TicketStatus) -> Result<i64>;
    async fn count_created_since(&self, since: chrono::DateTime<chrono::Utc>) -> Result<i64>;
}

pub struct SqliteTicketRepository {
    pool: SqlitePool,
}

const TICKET_COLUMNS: &str = "id, user_id, category, affected_game, problem_timing, description, attachments, thread_id, urgency, status, hubsoft_ticket_id, hubsoft_protocol, sync_status, assigned_technician, created_at, updated_at, version";

impl SqliteTicketRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<Ticket> {
        let category_raw: String = row.get("category");
        let category = TicketCategory::from_str(&category_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown ticket category: {category_raw}"))?;

        let game_raw: String = row.get("affected_game");
        let game = AffectedGame::from_key(&game_raw).unwrap_or(AffectedGame::Other(game_raw));

        let timing_raw: String = row.get("problem_timing");
        let timing = ProblemTiming::from_str(&timing_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown problem timing: {timing_raw}"))?;

        let urgency_raw: String = row.get("urgency");
        let urgency = Urgency::from_str(&urgency_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown urgency: {urgency_raw}"))?;

        let status_raw: String = row.get("status");
        let status = TicketStatus::from_str(&status_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown ticket status: {status_raw}"))?;

        let sync_raw: String = row.get("sync_status");
        let sync_status = SyncStatus::from_str(&sync_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown sync status: {sync_raw}"))?;

        let attachments: Vec<String> = serde_json::from_str(row.get("attachments"))?;

        Ok(Ticket::rehydrate(
            TicketId(row.get("id")),
            ChatUserId(row.get("user_id")),
            category,
            game,
            timing,
            row.get("description"),
            attachments,
            row.try_get("thread_id").ok().flatten(),
            urgency,
            status,
            row.try_get("hubsoft_ticket_id").ok().flatten(),
            row.try_get("hubsoft_protocol").ok().flatten(),
            sync_status,
            row.try_get("assigned_technician").ok().flatten(),
            from_millis(row.get("created_at"))?,
            from_millis(row.get("updated_at"))?,
            row.get("version"),
        ))
    }
}

#[async_trait]
impl TicketRepository for SqliteTicketRepository {
    async fn insert(&self, new: NewTicket) -> Result<Ticket> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO support_tickets (user_id, category, affected_game, problem_timing, description, attachments, thread_id, urgency, status, sync_status, created_at, updated_at, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(new.user_id.0)
        .bind(new.category.as_str())
        .bind(new.game.as_key().to_string())
        .bind(new.timing.as_str())
        .bind(&new.description)
        .bind(serde_json::to_string(&new.attachments)?)
        .bind(new.thread_id)
        .bind(new.urgency.as_str())
        .bind(new.status.as_str())
        .bind(new.sync_status.as_str())
        .bind(millis(now))
        .bind(millis(now))
        .execute(&self.pool)
        .await?;

        let id = TicketId(result.last_insert_rowid());
        debug!(ticket_id = %id, "Ticket inserted");
        Ok(Ticket::from_parts(id, new, now, now, 1))
    }

    async fn save(&self, ticket: &mut Ticket) -> Result<()> {
        let result = sqlx::query(
            "UPDATE support_tickets SET
                status = ?, urgency = ?, hubsoft_ticket_id = ?, hubsoft_protocol = ?,
                sync_status = ?, assigned_technician = ?, updated_at = ?, version = version + 1
             WHERE id = ? AND version = ?",
        )
        .bind(ticket.status.as_str())
        .bind(ticket.urgency.as_str())
        .bind(&ticket.hubsoft_ticket_id)
        .bind(&ticket.hubsoft_protocol)
        .bind(ticket.sync_status.as_str())
        .bind(&ticket.assigned_technician)
        .bind(millis(ticket.updated_at))
        .bind(ticket.id.0)
        .bind(ticket.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!(
                "concurrent modification of ticket {} (version {})",
                ticket.id,
                ticket.version
            );
        }
        ticket.version += 1;
        Ok(())
    }

    async fn find_by_id(&self, id: TicketId) -> Result<Option<Ticket>> {
        let row = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM support_tickets WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn find_active_by_user(&self, user_id: ChatUserId) -> Result<Option<Ticket>> {
        let row = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM support_tickets
             WHERE user_id = ? AND status IN ('PENDING', 'OPEN', 'IN_PROGRESS')
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn find_by_user(&self, user_id: ChatUserId, limit: u32) -> Result<Vec<Ticket>> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM support_tickets
             WHERE user_id = ? ORDER BY created_at DESC LIMIT ?"
        ))
        .bind(user_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn find_offline_tickets(&self) -> Result<Vec<Ticket>> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM support_tickets
             WHERE hubsoft_ticket_id IS NULL AND sync_status IN ('pending', 'failed')
             ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn find_active_with_hubsoft_id(&self) -> Result<Vec<Ticket>> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM support_tickets
             WHERE hubsoft_ticket_id IS NOT NULL AND status IN ('PENDING', 'OPEN', 'IN_PROGRESS')
             ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn find_recent(&self, status: Option<TicketStatus>, limit: u32) -> Result<Vec<Ticket>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {TICKET_COLUMNS} FROM support_tickets
                     WHERE status = ? ORDER BY created_at DESC LIMIT ?"
                ))
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {TICKET_COLUMNS} FROM support_tickets
                     ORDER BY created_at DESC LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::parse_row).collect()
    }

    async fn count_by_status(&self, status: TicketStatus) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM support_tickets WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn count_created_since(&self, since: chrono::DateTime<chrono::Utc>) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM support_tickets WHERE created_at >= ?")
            .bind(millis(since))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect_in_memory, MigrationRunner};

    async fn repo() -> SqliteTicketRepository {
        let pool = connect_in_memory().await.unwrap();
        MigrationRunner::embedded(pool.clone()).run().await.unwrap();
        SqliteTicketRepository::new(pool)
    }

    fn draft(user: i64) -> NewTicket {
        NewTicket::create(
            ChatUserId(user),
            TicketCategory::Connectivity,
            AffectedGame::Valorant,
            ProblemTiming::Now,
            "Ping alto em Valorant ontem à noite".into(),
            vec!["file-1".into()],
            Some(148),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn insert_assigns_sequential_ids() {
        let repo = repo().await;
        let first = repo.insert(draft(1)).await.unwrap();
        let second = repo.insert(draft(2)).await.unwrap();
        assert_eq!(first.id, TicketId(1));
        assert_eq!(second.id, TicketId(2));
        assert_eq!(first.local_protocol().to_string(), "LOC000001");
    }

    #[tokio::test]
    async fn round_trip_preserves_fields() {
        let repo = repo().await;
        let inserted = repo.insert(draft(7)).await.unwrap();
        let loaded = repo.find_by_id(inserted.id).await.unwrap().unwrap();

        assert_eq!(loaded.user_id, ChatUserId(7));
        assert_eq!(loaded.category, TicketCategory::Connectivity);
        assert_eq!(loaded.game, AffectedGame::Valorant);
        assert_eq!(loaded.urgency, Urgency::High);
        assert_eq!(loaded.status, TicketStatus::Pending);
        assert_eq!(loaded.attachments, vec!["file-1".to_string()]);
        assert_eq!(loaded.thread_id, Some(148));
    }

    #[tokio::test]
    async fn free_text_game_round_trips() {
        let repo = repo().await;
        let mut new = draft(7);
        new.game = AffectedGame::Other("Rocket League".into());
        let inserted = repo.insert(new).await.unwrap();
        let loaded = repo.find_by_id(inserted.id).await.unwrap().unwrap();
        assert_eq!(loaded.game, AffectedGame::Other("Rocket League".into()));
    }

    #[tokio::test]
    async fn active_lookup_ignores_closed_tickets() {
        let repo = repo().await;
        let mut t = repo.insert(draft(7)).await.unwrap();
        t.change_status(TicketStatus::Cancelled, None).unwrap();
        repo.save(&mut t).await.unwrap();

        assert!(repo.find_active_by_user(ChatUserId(7)).await.unwrap().is_none());

        let active = repo.insert(draft(7)).await.unwrap();
        let found = repo.find_active_by_user(ChatUserId(7)).await.unwrap().unwrap();
        assert_eq!(found.id, active.id);
    }

    #[tokio::test]
    async fn save_detects_concurrent_modification() {
        let repo = repo().await;
        let inserted = repo.insert(draft(7)).await.unwrap();

        let mut copy_a = repo.find_by_id(inserted.id).await.unwrap().unwrap();
        let mut copy_b = repo.find_by_id(inserted.id).await.unwrap().unwrap();

        copy_a.change_status(TicketStatus::Open, None).unwrap();
        repo.save(&mut copy_a).await.unwrap();

        copy_b.change_status(TicketStatus::Cancelled, None).unwrap();
        assert!(repo.save(&mut copy_b).await.is_err());
    }

    #[tokio::test]
    async fn offline_tickets_are_unsynced_pending_or_failed() {
        let repo = repo().await;
        let offline = repo.insert(draft(1)).await.unwrap();

        let mut synced = repo.insert(draft(2)).await.unwrap();
        synced.attach_hubsoft(
            "555".into(),
            Some("P555".into()),
            SyncStatus::Synced,
            sn_domain::TicketSyncKind::Create,
        );
        repo.save(&mut synced).await.unwrap();

        let found = repo.find_offline_tickets().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, offline.id);

        let active_synced = repo.find_active_with_hubsoft_id().await.unwrap();
        assert_eq!(active_synced.len(), 1);
        assert_eq!(active_synced[0].id, synced.id);
    }
}
