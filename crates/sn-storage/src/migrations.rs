//! Schema migration runner.
//!
//! Migrations are numbered SQL files (`NNN_description.sql`) applied in
//! ascending version order inside a transaction each. Applied versions are
//! tracked in `schema_migrations` with an MD5 checksum of the file content.
//! The run aborts on the first failure. After a run that applied anything,
//! critical row counts are compared against the pre-run snapshot and a drop
//! above 5% is logged as an error (the run still stands; see ops docs).

use anyhow::{bail, Context, Result};
use md5::{Digest, Md5};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::{error, info, warn};

const CRITICAL_LOSS_PERCENT: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct MigrationSource {
    pub version: i64,
    pub filename: String,
    pub sql: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CriticalCounts {
    pub total_users: i64,
    pub users_with_cpf: i64,
}

pub struct MigrationRunner {
    pool: SqlitePool,
    sources: Vec<MigrationSource>,
}

impl MigrationRunner {
    pub fn new(pool: SqlitePool, mut sources: Vec<MigrationSource>) -> Self {
        sources.sort_by_key(|s| s.version);
        Self { pool, sources }
    }

    /// The migrations shipped with this crate.
    pub fn embedded(pool: SqlitePool) -> Self {
        let sources = vec![
            MigrationSource {
                version: 1,
                filename: "001_initial_schema.sql".into(),
                sql: include_str!("../migrations/001_initial_schema.sql").into(),
            },
            MigrationSource {
                version: 2,
                filename: "002_indexes.sql".into(),
                sql: include_str!("../migrations/002_indexes.sql").into(),
            },
        ];
        Self::new(pool, sources)
    }

    /// Loads `NNN_description.sql` files from a directory.
    pub fn from_dir(pool: SqlitePool, dir: &Path) -> Result<Self> {
        let mut sources = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("reading migrations dir {}", dir.display()))?
            .collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".sql") {
                continue;
            }
            let Some(version) = name
                .get(..3)
                .and_then(|prefix| prefix.parse::<i64>().ok())
            else {
                warn!(filename = %name, "Skipping migration file with invalid name format");
                continue;
            };
            let sql = std::fs::read_to_string(entry.path())?;
            sources.push(MigrationSource {
                version,
                filename: name,
                sql,
            });
        }
        Ok(Self::new(pool, sources))
    }

    /// Applies every pending migration. Returns how many were applied.
    pub async fn run(&self) -> Result<usize> {
        self.init_migrations_table().await?;

        let applied = self.applied_versions().await?;
        let pending: Vec<&MigrationSource> = self
            .sources
            .iter()
            .filter(|s| !applied.contains(&s.version))
            .collect();

        if pending.is_empty() {
            info!("Schema is up to date");
            return Ok(0);
        }

        let before = self.critical_counts().await.unwrap_or_default();

        for source in &pending {
            info!(version = source.version, filename = %source.filename, "Applying migration");
            if let Err(e) = self.apply_one(source).await {
                bail!(
                    "migration {} ({}) failed, aborting: {e}",
                    source.version,
                    source.filename
                );
            }
        }

        let after = self.critical_counts().await.unwrap_or_default();
        self.validate_counts(before, after);

        info!(count = pending.len(), "Migrations applied");
        Ok(pending.len())
    }

    async fn apply_one(&self, source: &MigrationSource) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::raw_sql(&source.sql).execute(&mut *tx).await?;

        let checksum = format!("{:x}", Md5::digest(source.sql.as_bytes()));
        sqlx::query(
            "INSERT INTO schema_migrations (version, filename, applied_at, checksum) VALUES (?, ?, ?, ?)",
        )
        .bind(source.version)
        .bind(&source.filename)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(checksum)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn init_migrations_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                filename TEXT NOT NULL,
                applied_at INTEGER NOT NULL,
                checksum TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn applied_versions(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT version FROM schema_migrations ORDER BY version")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("version")).collect())
    }

    async fn critical_counts(&self) -> Result<CriticalCounts> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM users")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        let with_cpf: i64 = sqlx::query("SELECT COUNT(*) AS n FROM users WHERE cpf IS NOT NULL")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        Ok(CriticalCounts {
            total_users: total,
            users_with_cpf: with_cpf,
        })
    }

    fn validate_counts(&self, before: CriticalCounts, after: CriticalCounts) {
        for (label, b, a) in [
            ("total_users", before.total_users, after.total_users),
            ("users_with_cpf", before.users_with_cpf, after.users_with_cpf),
        ] {
            if b == 0 {
                continue;
            }
            let loss = ((b - a) as f64 / b as f64) * 100.0;
            if loss > CRITICAL_LOSS_PERCENT {
                error!(
                    table = label,
                    before = b,
                    after = a,
                    loss_percent = format!("{loss:.1}"),
                    "Migration reduced critical row count beyond threshold"
                );
            } else if loss > 0.0 {
                warn!(table = label, before = b, after = a, "Critical row count shrank");
            }
        }
    }
}
