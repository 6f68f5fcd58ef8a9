//! SQLite persistence for Sentinela.
//!
//! One repository per aggregate, each an `async_trait` contract with a
//! SQLite implementation over a shared `SqlitePool`. Timestamps are stored
//! as UTC epoch milliseconds; enum columns store the canonical string form
//! from `sn-domain`.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

pub mod admins;
pub mod integrations;
pub mod invites;
pub mod migrations;
pub mod rules;
pub mod tickets;
pub mod users;
pub mod verifications;

pub use admins::{AdminRepository, SqliteAdminRepository};
pub use integrations::{IntegrationRepository, SqliteIntegrationRepository, StatusCounts};
pub use invites::{InviteRepository, SqliteInviteRepository};
pub use migrations::{MigrationRunner, MigrationSource};
pub use rules::{RulesRepository, SqliteRulesRepository};
pub use tickets::{SqliteTicketRepository, TicketRepository};
pub use users::{SqliteUserRepository, UserRepository};
pub use verifications::{SqliteVerificationRepository, VerificationRepository};

/// Opens (and creates, if missing) the SQLite database at `path`.
pub async fn connect(path: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// In-memory database for tests and dry runs.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub(crate) fn millis(ts: chrono::DateTime<chrono::Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| anyhow::anyhow!("invalid timestamp: {ms}"))
}

pub(crate) fn from_millis_opt(ms: Option<i64>) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    ms.map(from_millis).transpose()
}
