//! User repository: chat accounts and their CPF bindings.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use sn_domain::{ChatUserId, Cpf, User};

use crate::{from_millis, from_millis_opt, millis};

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn save(&self, user: &User) -> Result<()>;
    async fn find_by_id(&self, id: ChatUserId) -> Result<Option<User>>;
    /// The single active account bound to this CPF, if any.
    async fn find_active_by_cpf(&self, cpf: &Cpf) -> Result<Option<User>>;
    /// Binds a CPF (plus client snapshot) to an existing or new account.
    async fn bind_cpf(
        &self,
        id: ChatUserId,
        username: &str,
        cpf: &Cpf,
        client_name: Option<&str>,
        service_name: Option<&str>,
        service_status: Option<&str>,
    ) -> Result<()>;
    /// Moves the CPF binding from `loser` to `winner` in one transaction.
    /// The loser account is deactivated and unbound.
    async fn transfer_cpf(
        &self,
        cpf: &Cpf,
        loser: ChatUserId,
        winner: ChatUserId,
        winner_username: &str,
    ) -> Result<()>;
    async fn deactivate(&self, id: ChatUserId) -> Result<()>;
    async fn all_active_with_cpf(&self) -> Result<Vec<User>>;
    async fn count_active(&self) -> Result<i64>;
}

pub struct SqliteUserRepository {
    pool: SqlitePool,
}

impl SqliteUserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
        let cpf: Option<String> = row.try_get("cpf").ok().flatten();
        let cpf = cpf.map(|raw| Cpf::parse(&raw)).transpose().context("stored CPF is invalid")?;
        Ok(User {
            id: ChatUserId(row.get("user_id")),
            username: row.get("username"),
            cpf,
            client_name: row.try_get("client_name").ok().flatten(),
            service_name: row.try_get("service_name").ok().flatten(),
            service_status: row.try_get("service_status").ok().flatten(),
            is_active: row.get::<i64, _>("is_active") != 0,
            created_at: from_millis(row.get("created_at"))?,
            last_verification: from_millis_opt(row.try_get("last_verification").ok().flatten())?,
        })
    }
}

const USER_COLUMNS: &str = "user_id, username, cpf, client_name, service_name, service_status, is_active, created_at, last_verification";

#[async_trait]
impl UserRepository for SqliteUserRepository {
    async fn save(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (user_id, username, cpf, client_name, service_name, service_status, is_active, created_at, last_verification)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                cpf = excluded.cpf,
                client_name = excluded.client_name,
                service_name = excluded.service_name,
                service_status = excluded.service_status,
                is_active = excluded.is_active,
                last_verification = excluded.last_verification",
        )
        .bind(user.id.0)
        .bind(&user.username)
        .bind(user.cpf.as_ref().map(|c| c.as_str().to_string()))
        .bind(&user.client_name)
        .bind(&user.service_name)
        .bind(&user.service_status)
        .bind(user.is_active as i64)
        .bind(millis(user.created_at))
        .bind(user.last_verification.map(millis))
        .execute(&self.pool)
        .await?;
        debug!(user_id = %user.id, "User saved");
        Ok(())
    }

    async fn find_by_id(&self, id: ChatUserId) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn find_active_by_cpf(&self, cpf: &Cpf) -> Result<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE cpf = ? AND is_active = 1"
        ))
        .bind(cpf.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn bind_cpf(
        &self,
        id: ChatUserId,
        username: &str,
        cpf: &Cpf,
        client_name: Option<&str>,
        service_name: Option<&str>,
        service_status: Option<&str>,
    ) -> Result<()> {
        let now = millis(Utc::now());
        sqlx::query(
            "INSERT INTO users (user_id, username, cpf, client_name, service_name, service_status, is_active, created_at, last_verification)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                cpf = excluded.cpf,
                client_name = excluded.client_name,
                service_name = excluded.service_name,
                service_status = excluded.service_status,
                is_active = 1,
                last_verification = excluded.last_verification",
        )
        .bind(id.0)
        .bind(username)
        .bind(cpf.as_str())
        .bind(client_name)
        .bind(service_name)
        .bind(service_status)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        info!(user_id = %id, cpf = %cpf.masked(), "CPF bound to user");
        Ok(())
    }

    async fn transfer_cpf(
        &self,
        cpf: &Cpf,
        loser: ChatUserId,
        winner: ChatUserId,
        winner_username: &str,
    ) -> Result<()> {
        let now = millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE users SET cpf = NULL, is_active = 0 WHERE user_id = ?")
            .bind(loser.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO users (user_id, username, cpf, is_active, created_at, last_verification)
             VALUES (?, ?, ?, 1, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                cpf = excluded.cpf,
                is_active = 1,
                last_verification = excluded.last_verification",
        )
        .bind(winner.0)
        .bind(winner_username)
        .bind(cpf.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(cpf = %cpf.masked(), from = %loser, to = %winner, "CPF binding transferred");
        Ok(())
    }

    async fn deactivate(&self, id: ChatUserId) -> Result<()> {
        sqlx::query("UPDATE users SET is_active = 0 WHERE user_id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn all_active_with_cpf(&self) -> Result<Vec<User>> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE is_active = 1 AND cpf IS NOT NULL ORDER BY user_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn count_active(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM users WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect_in_memory, MigrationRunner};

    async fn repo() -> SqliteUserRepository {
        let pool = connect_in_memory().await.unwrap();
        MigrationRunner::embedded(pool.clone()).run().await.unwrap();
        SqliteUserRepository::new(pool)
    }

    fn cpf() -> Cpf {
        Cpf::parse("11144477735").unwrap()
    }

    #[tokio::test]
    async fn bind_and_find_by_cpf() {
        let repo = repo().await;
        repo.bind_cpf(ChatUserId(7001), "alice", &cpf(), Some("Alice"), Some("Gamer 500"), Some("habilitado"))
            .await
            .unwrap();

        let found = repo.find_active_by_cpf(&cpf()).await.unwrap().unwrap();
        assert_eq!(found.id, ChatUserId(7001));
        assert_eq!(found.client_name.as_deref(), Some("Alice"));
        assert!(found.is_verified());
    }

    #[tokio::test]
    async fn active_cpf_binding_is_unique() {
        let repo = repo().await;
        repo.bind_cpf(ChatUserId(8001), "old", &cpf(), None, None, None)
            .await
            .unwrap();
        // A second active account on the same CPF violates the partial
        // unique index.
        let result = repo
            .bind_cpf(ChatUserId(8002), "new", &cpf(), None, None, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn transfer_moves_binding_and_deactivates_loser() {
        let repo = repo().await;
        repo.bind_cpf(ChatUserId(8001), "old", &cpf(), None, None, None)
            .await
            .unwrap();

        repo.transfer_cpf(&cpf(), ChatUserId(8001), ChatUserId(8002), "new")
            .await
            .unwrap();

        let winner = repo.find_active_by_cpf(&cpf()).await.unwrap().unwrap();
        assert_eq!(winner.id, ChatUserId(8002));

        let loser = repo.find_by_id(ChatUserId(8001)).await.unwrap().unwrap();
        assert!(!loser.is_active);
        assert!(loser.cpf.is_none());
    }

    #[tokio::test]
    async fn missing_user_is_none() {
        let repo = repo().await;
        assert!(repo.find_by_id(ChatUserId(1)).await.unwrap().is_none());
    }
}
