//! Sentinela operational commands.
//!
//! One-shot jobs sharing the server's repositories; every command exits
//! non-zero on failure.
//!
//! ## Usage
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sn-ops migrate [dir]` | Apply pending schema migrations (embedded set, or a directory of `NNN_*.sql` files) |
//! | `sn-ops checkup` | Re-verify subscribers upstream, open auto-checkup verifications, flag overdue rules acceptance |
//! | `sn-ops cpf-sweep` | Expire overdue verifications and queue the chat-side removals |
//! | `sn-ops export <dir>` | Dump users, tickets and verification history as JSON |
//! | `sn-ops integrity` | Invariant checks over the store (fails on violation) |
//! | `sn-ops queue-stats` | Integration queue counts by status |

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use sqlx::Row;
use tracing::{info, warn};

use sn_config::ConfigLoader;
use sn_domain::{IntegrationPayload, IntegrationPriority, Verification, VerificationType};
use sn_engine::{enqueue, ScheduleOptions};
use sn_events::EventBus;
use sn_hubsoft::HubSoftClient;
use sn_storage::{
    IntegrationRepository, MigrationRunner, RulesRepository, SqliteIntegrationRepository,
    SqliteRulesRepository, SqliteUserRepository, SqliteVerificationRepository, UserRepository,
    VerificationRepository,
};

#[tokio::main]
async fn main() -> Result<()> {
    sn_domain::logging::init_logging();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("");

    match command {
        "migrate" => migrate(args.get(2).map(String::as_str)).await,
        "checkup" => checkup().await,
        "cpf-sweep" => cpf_sweep().await,
        "export" => {
            let dir = args
                .get(2)
                .context("usage: sn-ops export <dir>")?;
            export(Path::new(dir)).await
        }
        "integrity" => integrity().await,
        "queue-stats" => queue_stats().await,
        "ticket-status" => {
            let hubsoft_id = args
                .get(2)
                .context("usage: sn-ops ticket-status <hubsoft_id>")?;
            ticket_status(hubsoft_id).await
        }
        _ => {
            eprintln!(
                "usage: sn-ops <migrate [dir] | checkup | cpf-sweep | export <dir> | integrity | queue-stats | ticket-status <id>>"
            );
            std::process::exit(2);
        }
    }
}

async fn open_pool() -> Result<sqlx::SqlitePool> {
    let config = ConfigLoader::new().load()?;
    sn_storage::connect(&config.database.file).await
}

async fn migrate(dir: Option<&str>) -> Result<()> {
    let pool = open_pool().await?;
    let runner = match dir {
        Some(dir) => MigrationRunner::from_dir(pool, Path::new(dir))?,
        None => MigrationRunner::embedded(pool),
    };
    let applied = runner.run().await?;
    info!(applied, "Migration run finished");
    Ok(())
}

/// Daily subscriber checkup: every active user with a CPF is re-verified
/// upstream. Users without an enabled service get an auto-checkup
/// verification (24 h to confirm). Members who never accepted the rules in
/// time get their removal queued.
async fn checkup() -> Result<()> {
    let config = ConfigLoader::new().load()?;
    if !config.hubsoft.enabled {
        bail!("checkup requires HUBSOFT_ENABLED=true");
    }

    let pool = sn_storage::connect(&config.database.file).await?;
    let users = SqliteUserRepository::new(pool.clone());
    let verifications = SqliteVerificationRepository::new(pool.clone());
    let integrations = SqliteIntegrationRepository::new(pool.clone());
    let rules = SqliteRulesRepository::new(pool.clone());
    let bus = EventBus::new();
    let client = Arc::new(HubSoftClient::new(config.hubsoft.clone())?);

    let subscribers = users.all_active_with_cpf().await?;
    info!(count = subscribers.len(), "Checking subscribers upstream");

    let mut still_active = 0usize;
    let mut needs_verification = 0usize;
    let mut lookup_failures = 0usize;

    for user in subscribers {
        let Some(cpf) = user.cpf.clone() else { continue };
        match client.verify_client_by_cpf(&cpf, false).await {
            Ok(Some(_)) => still_active += 1,
            Ok(None) => {
                needs_verification += 1;
                if let Some(mut pending) = verifications.find_pending_by_user(user.id).await? {
                    pending.cancel("superseded")?;
                    verifications.save(&pending).await?;
                }
                let verification = Verification::start_new(
                    user.id,
                    user.username.clone(),
                    format!("@{}", user.username),
                    VerificationType::AutoCheckup,
                    Some("daily_checkup".into()),
                    Utc::now(),
                );
                verifications.save(&verification).await?;
                info!(user_id = %user.id, "Auto-checkup verification opened");
            }
            Err(e) => {
                lookup_failures += 1;
                warn!(user_id = %user.id, error = %e, "Upstream lookup failed");
            }
        }
    }

    // Rules-acceptance deadline: 24 hours after the prompt.
    let overdue = rules.find_overdue(Utc::now() - Duration::hours(24)).await?;
    for state in &overdue {
        enqueue(
            &integrations,
            &bus,
            IntegrationPayload::MembershipRevocation {
                user_id: state.user_id,
                reason: "Regras do grupo não aceitas no prazo".into(),
            },
            IntegrationPriority::Normal,
            ScheduleOptions::default(),
        )
        .await?;
        rules.remove(state.user_id).await?;
    }

    info!(
        still_active,
        needs_verification,
        lookup_failures,
        rules_overdue = overdue.len(),
        "Checkup finished"
    );
    if lookup_failures > 0 {
        bail!("{lookup_failures} upstream lookups failed");
    }
    Ok(())
}

/// Expires overdue verifications; auto-checkup users get their removal
/// queued for the server's engine.
async fn cpf_sweep() -> Result<()> {
    let pool = open_pool().await?;
    let verifications = SqliteVerificationRepository::new(pool.clone());
    let integrations = SqliteIntegrationRepository::new(pool.clone());
    let bus = EventBus::new();

    let now = Utc::now();
    let expired = verifications.find_expired_pending(now).await?;
    let total = expired.len();

    for mut verification in expired {
        verification.expire(now)?;
        verifications.save(&verification).await?;
        if verification.verification_type == VerificationType::AutoCheckup {
            enqueue(
                &integrations,
                &bus,
                IntegrationPayload::MembershipRevocation {
                    user_id: verification.user_id,
                    reason: "Verificação de CPF expirada".into(),
                },
                IntegrationPriority::Normal,
                ScheduleOptions::default(),
            )
            .await?;
        }
    }

    info!(total, "CPF expiration sweep finished");
    Ok(())
}

async fn export(dir: &Path) -> Result<()> {
    let pool = open_pool().await?;
    std::fs::create_dir_all(dir)?;

    let users = dump(
        &pool,
        "SELECT user_id, username, cpf, client_name, service_name, service_status, is_active, created_at, last_verification FROM users",
        &["user_id", "username", "cpf", "client_name", "service_name", "service_status", "is_active", "created_at", "last_verification"],
    )
    .await?;
    write_json(dir.join("users.json"), &users)?;

    let tickets = dump(
        &pool,
        "SELECT id, user_id, category, affected_game, problem_timing, description, urgency, status, hubsoft_ticket_id, hubsoft_protocol, sync_status, created_at, updated_at FROM support_tickets",
        &["id", "user_id", "category", "affected_game", "problem_timing", "description", "urgency", "status", "hubsoft_ticket_id", "hubsoft_protocol", "sync_status", "created_at", "updated_at"],
    )
    .await?;
    write_json(dir.join("support_tickets.json"), &tickets)?;

    let history = dump(
        &pool,
        "SELECT verification_id, user_id, username, verification_type, status, cpf_masked, success, failure_reason, completed_at, created_at FROM cpf_verification_history",
        &["verification_id", "user_id", "username", "verification_type", "status", "cpf_masked", "success", "failure_reason", "completed_at", "created_at"],
    )
    .await?;
    write_json(dir.join("cpf_verification_history.json"), &history)?;

    info!(
        users = users.len(),
        tickets = tickets.len(),
        history = history.len(),
        dir = %dir.display(),
        "Export finished"
    );
    Ok(())
}

/// Column-generic row dump. SQLite values come back as integer, text or
/// null for every exported column.
async fn dump(
    pool: &sqlx::SqlitePool,
    query: &str,
    columns: &[&str],
) -> Result<Vec<serde_json::Value>> {
    let rows = sqlx::query(query).fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut object = serde_json::Map::new();
        for column in columns {
            let value = if let Ok(v) = row.try_get::<Option<i64>, _>(*column) {
                v.map(serde_json::Value::from)
                    .unwrap_or(serde_json::Value::Null)
            } else if let Ok(v) = row.try_get::<Option<String>, _>(*column) {
                v.map(serde_json::Value::from)
                    .unwrap_or(serde_json::Value::Null)
            } else {
                serde_json::Value::Null
            };
            object.insert(column.to_string(), value);
        }
        out.push(serde_json::Value::Object(object));
    }
    Ok(out)
}

fn write_json(path: std::path::PathBuf, rows: &[serde_json::Value]) -> Result<()> {
    let file = std::fs::File::create(&path)?;
    serde_json::to_writer_pretty(file, rows)?;
    Ok(())
}

/// Store invariant checks. Any violation fails the command.
async fn integrity() -> Result<()> {
    let pool = open_pool().await?;
    let mut violations = Vec::new();

    // One active user per CPF.
    let duplicate_cpfs: i64 = sqlx::query(
        "SELECT COUNT(*) AS n FROM (
            SELECT cpf FROM users WHERE cpf IS NOT NULL AND is_active = 1
            GROUP BY cpf HAVING COUNT(*) > 1
        )",
    )
    .fetch_one(&pool)
    .await?
    .get("n");
    if duplicate_cpfs > 0 {
        violations.push(format!("{duplicate_cpfs} CPF(s) bound to multiple active users"));
    }

    // At most one active ticket per user.
    let multi_active: i64 = sqlx::query(
        "SELECT COUNT(*) AS n FROM (
            SELECT user_id FROM support_tickets
            WHERE status IN ('PENDING', 'OPEN', 'IN_PROGRESS')
            GROUP BY user_id HAVING COUNT(*) > 1
        )",
    )
    .fetch_one(&pool)
    .await?
    .get("n");
    if multi_active > 0 {
        violations.push(format!("{multi_active} user(s) with multiple active tickets"));
    }

    // Tickets referencing missing users.
    let orphan_tickets: i64 = sqlx::query(
        "SELECT COUNT(*) AS n FROM support_tickets t
         LEFT JOIN users u ON u.user_id = t.user_id
         WHERE u.user_id IS NULL",
    )
    .fetch_one(&pool)
    .await?
    .get("n");
    if orphan_tickets > 0 {
        violations.push(format!("{orphan_tickets} ticket(s) referencing missing users"));
    }

    // Upstream-bound tickets must be synced or correlated.
    let bad_sync: i64 = sqlx::query(
        "SELECT COUNT(*) AS n FROM support_tickets
         WHERE hubsoft_ticket_id IS NOT NULL
           AND sync_status NOT IN ('synced', 'correlated')",
    )
    .fetch_one(&pool)
    .await?
    .get("n");
    if bad_sync > 0 {
        violations.push(format!(
            "{bad_sync} ticket(s) with an upstream id but inconsistent sync status"
        ));
    }

    // Attempt budget on integrations.
    let over_budget: i64 = sqlx::query(
        "SELECT COUNT(*) AS n FROM integrations
         WHERE json_array_length(attempts) > max_retries + 1",
    )
    .fetch_one(&pool)
    .await?
    .get("n");
    if over_budget > 0 {
        violations.push(format!("{over_budget} integration(s) over their attempt budget"));
    }

    if violations.is_empty() {
        info!("Integrity check passed");
        Ok(())
    } else {
        for violation in &violations {
            warn!(%violation, "Integrity violation");
        }
        bail!("{} integrity violation(s) found", violations.len());
    }
}

async fn queue_stats() -> Result<()> {
    let pool = open_pool().await?;
    let integrations = SqliteIntegrationRepository::new(pool);
    let counts = integrations.count_by_status(None).await?;

    let mut entries: Vec<(String, i64)> = counts.by_status.into_iter().collect();
    entries.sort();
    if entries.is_empty() {
        println!("queue is empty");
    }
    for (status, count) in entries {
        println!("{status:16} {count}");
    }

    let active = integrations.find_active(None).await?;
    for job in &active {
        println!(
            "active: {} {} attempts={} next={:?}",
            job.id,
            job.integration_type().as_str(),
            job.attempt_count(),
            job.next_attempt_at,
        );
    }

    let failed = integrations.find_failed(10).await?;
    for job in &failed {
        println!(
            "failed: {} {} after {} attempt(s): {}",
            job.id,
            job.integration_type().as_str(),
            job.attempt_count(),
            job.last_error().unwrap_or("unknown"),
        );
    }
    Ok(())
}

/// Fetches one atendimento's upstream status through the paginated listing.
async fn ticket_status(hubsoft_id: &str) -> Result<()> {
    let config = ConfigLoader::new().load()?;
    if !config.hubsoft.enabled {
        bail!("ticket-status requires HUBSOFT_ENABLED=true");
    }
    let client = HubSoftClient::new(config.hubsoft.clone())?;

    match client.get_ticket_status(hubsoft_id).await? {
        Some(atendimento) => {
            println!(
                "id={} protocolo={} status={}",
                hubsoft_id,
                atendimento.protocolo.as_deref().unwrap_or("-"),
                atendimento.status_name().unwrap_or_else(|| "-".into()),
            );
            Ok(())
        }
        None => bail!("atendimento {hubsoft_id} not found upstream"),
    }
}
