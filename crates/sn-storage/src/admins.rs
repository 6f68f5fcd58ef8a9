//! Administrator cache repository, refreshed from the chat service.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::info;

use sn_domain::{AdminEntry, AdminRole, ChatUserId};

use crate::{from_millis, millis};

#[async_trait]
pub trait AdminRepository: Send + Sync {
    /// Replaces the whole cache with a fresh detection result.
    async fn replace_all(&self, admins: &[AdminEntry]) -> Result<()>;
    async fn list(&self) -> Result<Vec<AdminEntry>>;
    async fn is_admin(&self, user_id: ChatUserId) -> Result<bool>;
}

pub struct SqliteAdminRepository {
    pool: SqlitePool,
}

impl SqliteAdminRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AdminRepository for SqliteAdminRepository {
    async fn replace_all(&self, admins: &[AdminEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM admin_cache").execute(&mut *tx).await?;

        for admin in admins {
            sqlx::query(
                "INSERT INTO admin_cache (user_id, username, first_name, last_name, status, detected_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(admin.user_id.0)
            .bind(&admin.username)
            .bind(&admin.first_name)
            .bind(&admin.last_name)
            .bind(admin.role.as_str())
            .bind(millis(admin.detected_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(count = admins.len(), "Admin cache replaced");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<AdminEntry>> {
        let rows = sqlx::query(
            "SELECT user_id, username, first_name, last_name, status, detected_at
             FROM admin_cache ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let role_raw: String = row.get("status");
                let role = AdminRole::from_str(&role_raw)
                    .ok_or_else(|| anyhow::anyhow!("unknown admin role: {role_raw}"))?;
                Ok(AdminEntry {
                    user_id: ChatUserId(row.get("user_id")),
                    username: row.try_get("username").ok().flatten(),
                    first_name: row.get("first_name"),
                    last_name: row.try_get("last_name").ok().flatten(),
                    role,
                    detected_at: from_millis(row.get("detected_at"))?,
                })
            })
            .collect()
    }

    async fn is_admin(&self, user_id: ChatUserId) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM admin_cache WHERE user_id = ?")
            .bind(user_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect_in_memory, MigrationRunner};
    use chrono::Utc;

    async fn repo() -> SqliteAdminRepository {
        let pool = connect_in_memory().await.unwrap();
        MigrationRunner::embedded(pool.clone()).run().await.unwrap();
        SqliteAdminRepository::new(pool)
    }

    fn admin(id: i64, role: AdminRole) -> AdminEntry {
        AdminEntry {
            user_id: ChatUserId(id),
            username: Some(format!("admin{id}")),
            first_name: "Admin".into(),
            last_name: None,
            role,
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn replace_all_swaps_the_set() {
        let repo = repo().await;
        repo.replace_all(&[admin(1, AdminRole::Owner), admin(2, AdminRole::Administrator)])
            .await
            .unwrap();
        assert!(repo.is_admin(ChatUserId(1)).await.unwrap());
        assert!(repo.is_admin(ChatUserId(2)).await.unwrap());

        repo.replace_all(&[admin(3, AdminRole::Administrator)]).await.unwrap();
        assert!(!repo.is_admin(ChatUserId(1)).await.unwrap());
        assert!(repo.is_admin(ChatUserId(3)).await.unwrap());
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }
}
