//! Sentinela server.
//!
//! One long-running process: the chat adapter (update loop), the integration
//! engine (scheduler + workers), the upstream health monitor, and the
//! periodic sweeps (verification expiry, invite cleanup, admin sync, queue
//! cleanup). Shutdown on SIGINT drains the worker pool within a bounded
//! grace period; anything unfinished is reclaimed by orphan recovery on the
//! next start.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use sn_app::{AccessGate, AdminService, ChatService, InviteService, SupportService, VerificationService};
use sn_config::ConfigLoader;
use sn_domain::events::{HubSoftConnectionLost, HubSoftConnectionRestored, IntegrationCompleted, VerificationExpired};
use sn_engine::{EngineSettings, HealthMonitor, IntegrationEngine, Reconciler};
use sn_events::EventBus;
use sn_hubsoft::{ApiCache, HubSoftClient};
use sn_storage::{
    IntegrationRepository, MigrationRunner, SqliteAdminRepository, SqliteIntegrationRepository,
    SqliteInviteRepository, SqliteTicketRepository, SqliteUserRepository,
    SqliteVerificationRepository,
};
use sn_telegram::{AttachmentUploader, BotAdapter, ChatGroupRevoker, ConversationStore};

mod telegram_api;
mod updates;

use telegram_api::TelegramApi;

#[tokio::main]
async fn main() -> Result<()> {
    sn_domain::logging::init_logging();
    info!("Starting Sentinela server");

    let config = ConfigLoader::new().load()?;

    // Storage
    let pool = sn_storage::connect(&config.database.file).await?;
    MigrationRunner::embedded(pool.clone()).run().await?;

    let users = Arc::new(SqliteUserRepository::new(pool.clone()));
    let tickets = Arc::new(SqliteTicketRepository::new(pool.clone()));
    let verifications = Arc::new(SqliteVerificationRepository::new(pool.clone()));
    let integrations = Arc::new(SqliteIntegrationRepository::new(pool.clone()));
    let invites_repo = Arc::new(SqliteInviteRepository::new(pool.clone()));
    let admins_repo = Arc::new(SqliteAdminRepository::new(pool.clone()));

    // Shared infrastructure
    let bus = Arc::new(EventBus::new());
    let cache = Arc::new(ApiCache::new());
    let client = Arc::new(HubSoftClient::new(config.hubsoft.clone())?);
    let chat: Arc<dyn ChatService> = Arc::new(TelegramApi::new(&config.telegram.token)?);

    // Engine
    let engine = IntegrationEngine::new(
        integrations.clone(),
        tickets.clone(),
        users.clone(),
        client.clone(),
        cache.clone(),
        bus.clone(),
        EngineSettings {
            workers: config.engine.workers,
            poll_interval: Duration::from_millis(config.engine.poll_interval_ms),
            batch_size: config.engine.batch_size,
            hubsoft_enabled: config.hubsoft.enabled,
            health_check_interval: Duration::from_secs(config.engine.health_check_interval_secs),
            shutdown_grace: Duration::from_secs(config.engine.shutdown_grace_secs),
        },
    );
    engine.set_revoker(Arc::new(ChatGroupRevoker::new(
        chat.clone(),
        config.telegram.group_id,
    )));

    // Use cases
    let gate = Arc::new(AccessGate::new(users.clone()));
    let invites = Arc::new(InviteService::new(
        chat.clone(),
        invites_repo.clone(),
        config.telegram.group_id,
        config.telegram.invite_link_member_limit,
        config.telegram.invite_link_expire_time_secs,
    ));
    let verification = Arc::new(VerificationService::new(
        verifications.clone(),
        users.clone(),
        engine.clone(),
        chat.clone(),
        invites.clone(),
        bus.clone(),
        config.telegram.group_id,
    ));
    let support = Arc::new(SupportService::new(
        tickets.clone(),
        gate.clone(),
        engine.clone(),
        bus.clone(),
    ));
    let admin = Arc::new(AdminService::new(
        admins_repo.clone(),
        tickets.clone(),
        users.clone(),
        verifications.clone(),
        integrations.clone(),
        engine.clone(),
        chat.clone(),
        bus.clone(),
        config.telegram.group_id,
        config
            .telegram
            .admin_user_ids
            .iter()
            .copied()
            .map(sn_domain::ChatUserId)
            .collect(),
    ));

    let conversations = Arc::new(ConversationStore::new());
    let adapter = Arc::new(BotAdapter::new(
        chat.clone(),
        gate.clone(),
        support.clone(),
        verification.clone(),
        conversations.clone(),
        config.telegram.group_id,
        config.telegram.support_topic_id,
    ));

    register_event_handlers(
        &bus,
        &chat,
        &client,
        tickets.clone(),
        integrations.clone(),
        verification.clone(),
        config.telegram.admin_user_ids.clone(),
    );

    // Background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Arc::new(Reconciler::new(
        tickets.clone(),
        users.clone(),
        integrations.clone(),
        client.clone(),
        bus.clone(),
    ));
    let monitor = HealthMonitor::new(
        engine.clone(),
        client.clone(),
        integrations.clone(),
        reconciler,
        bus.clone(),
        Duration::from_secs(config.engine.health_check_interval_secs),
    );

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(engine.clone().run(shutdown_rx.clone())));
    tasks.push(tokio::spawn(monitor.run(shutdown_rx.clone())));
    tasks.push(tokio::spawn(updates::run_update_loop(
        Arc::new(TelegramApi::new(&config.telegram.token)?),
        adapter,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_sweeps(
        verification.clone(),
        invites.clone(),
        admin.clone(),
        integrations.clone(),
        verifications.clone(),
        conversations.clone(),
        config.engine.clone(),
        shutdown_rx.clone(),
    )));

    // Admin cache warm-up so authorization works before the first 6h tick.
    if let Err(e) = admin.sync_admins().await {
        warn!(error = %e, "Initial admin sync failed; bootstrap list still applies");
    }

    info!("Sentinela server running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    shutdown_tx.send(true).ok();
    let grace = Duration::from_secs(config.engine.shutdown_grace_secs + 5);
    if tokio::time::timeout(grace, futures_join(tasks)).await.is_err() {
        warn!("Tasks did not drain within grace; exiting anyway");
    }
    info!("Sentinela server stopped");
    Ok(())
}

async fn futures_join(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for task in tasks {
        let _ = task.await;
    }
}

/// Wires the cross-component reactions on the bus.
#[allow(clippy::too_many_arguments)]
fn register_event_handlers(
    bus: &Arc<EventBus>,
    chat: &Arc<dyn ChatService>,
    client: &Arc<HubSoftClient>,
    tickets: Arc<SqliteTicketRepository>,
    integrations: Arc<SqliteIntegrationRepository>,
    verification: Arc<VerificationService>,
    admin_ids: Vec<i64>,
) {
    // Completed chat-side revocation jobs resume their remap.
    {
        let verification = verification.clone();
        let integrations = integrations.clone();
        bus.subscribe("resume-remap", move |event: IntegrationCompleted| {
            let verification = verification.clone();
            let integrations = integrations.clone();
            async move {
                if let Some(job) = integrations.find_by_id(&event.integration_id).await? {
                    verification.resume_remap(&job.metadata).await?;
                }
                Ok(())
            }
        });
    }

    // Synced tickets get their attachments uploaded upstream.
    {
        let uploader = Arc::new(AttachmentUploader::new(
            chat.clone(),
            client.clone(),
            tickets,
        ));
        bus.subscribe("attachment-upload", move |event| {
            let uploader = uploader.clone();
            async move { uploader.on_ticket_synced(event).await }
        });
    }

    // Expired verifications notify the user directly.
    {
        let chat = chat.clone();
        bus.subscribe("expiry-notice", move |event: VerificationExpired| {
            let chat = chat.clone();
            async move {
                let text = sn_telegram::texts::expiration_notice(event.verification_type);
                chat.send_message(event.user_id.0, &text, None, None).await?;
                Ok(())
            }
        });
    }

    // Upstream connectivity changes ping the configured admins.
    {
        let chat = chat.clone();
        let admin_ids = admin_ids.clone();
        bus.subscribe("notify-restored", move |event: HubSoftConnectionRestored| {
            let chat = chat.clone();
            let admin_ids = admin_ids.clone();
            async move {
                let text = format!(
                    "Sistema HubSoft voltou a responder após {}s. {} operação(ões) na fila serão processadas.",
                    event.downtime_seconds, event.pending_operations
                );
                for admin_id in &admin_ids {
                    let _ = chat.send_message(*admin_id, &text, None, None).await;
                }
                Ok(())
            }
        });
    }
    {
        let chat = chat.clone();
        bus.subscribe("notify-lost", move |_: HubSoftConnectionLost| {
            let chat = chat.clone();
            let admin_ids = admin_ids.clone();
            async move {
                let text = "Sistema HubSoft fora do ar. Novos chamados continuam sendo \
                            aceitos e serão sincronizados na volta."
                    .to_string();
                for admin_id in &admin_ids {
                    let _ = chat.send_message(*admin_id, &text, None, None).await;
                }
                Ok(())
            }
        });
    }
}

/// Periodic maintenance: expiry sweep, invite cleanup, admin sync,
/// conversation TTL sweep, queue cleanup.
#[allow(clippy::too_many_arguments)]
async fn run_sweeps(
    verification: Arc<VerificationService>,
    invites: Arc<InviteService>,
    admin: Arc<AdminService>,
    integrations: Arc<SqliteIntegrationRepository>,
    verifications: Arc<SqliteVerificationRepository>,
    conversations: Arc<ConversationStore>,
    engine_config: sn_config::EngineConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut expiry = tokio::time::interval(Duration::from_secs(
        engine_config.expiration_sweep_interval_secs,
    ));
    let mut invites_tick =
        tokio::time::interval(Duration::from_secs(engine_config.invite_cleanup_interval_secs));
    let mut admin_tick =
        tokio::time::interval(Duration::from_secs(engine_config.admin_sync_interval_secs));
    let mut daily = tokio::time::interval(Duration::from_secs(24 * 3600));
    for ticker in [&mut expiry, &mut invites_tick, &mut admin_tick, &mut daily] {
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    }

    loop {
        tokio::select! {
            _ = expiry.tick() => {
                match verification.process_expired_verifications().await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "Expired verifications processed"),
                    Err(e) => error!(error = %e, "Expiration sweep failed"),
                }
                let swept = conversations.sweep_expired();
                if swept > 0 {
                    info!(swept, "Idle conversations dropped");
                }
            }
            _ = invites_tick.tick() => {
                if let Err(e) = invites.cleanup_old(7).await {
                    error!(error = %e, "Invite cleanup failed");
                }
            }
            _ = admin_tick.tick() => {
                match admin.sync_admins().await {
                    Ok(count) => info!(count, "Admin cache refreshed"),
                    Err(e) => error!(error = %e, "Admin sync failed"),
                }
            }
            _ = daily.tick() => {
                let cutoff = chrono::Utc::now() - chrono::Duration::days(7);
                match integrations.cleanup_completed(cutoff, 500).await {
                    Ok(removed) if removed > 0 => info!(removed, "Completed integrations pruned"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Integration cleanup failed"),
                }
                use sn_storage::VerificationRepository;
                match verifications.prune_finished(30).await {
                    Ok(removed) if removed > 0 => info!(removed, "Finished verifications pruned"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Verification prune failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
