//! Admin operations: authorization, assignment, bulk actions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use wiremock::MockServer;

use sn_app::{
    AdminCommandResult, AdminService, BulkAction, ChatAdmin, ChatMemberStatus, ChatService,
    Keyboard,
};
use sn_config::HubSoftConfig;
use sn_domain::{
    AdminEntry, AdminRole, AffectedGame, ChatUserId, NewTicket, ProblemTiming, TicketCategory,
    TicketStatus,
};
use sn_engine::{EngineSettings, IntegrationEngine};
use sn_events::EventBus;
use sn_hubsoft::{ApiCache, HubSoftClient};
use sn_storage::{
    AdminRepository, MigrationRunner, SqliteAdminRepository, SqliteIntegrationRepository,
    SqliteTicketRepository, SqliteUserRepository, SqliteVerificationRepository, TicketRepository,
};

struct StubChat;

#[async_trait]
impl ChatService for StubChat {
    async fn send_message(
        &self,
        _chat_id: i64,
        _text: &str,
        _keyboard: Option<Keyboard>,
        _thread_id: Option<i64>,
    ) -> anyhow::Result<i64> {
        Ok(1)
    }
    async fn edit_message(
        &self,
        _chat_id: i64,
        _message_id: i64,
        _text: &str,
        _keyboard: Option<Keyboard>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
    async fn create_chat_invite_link(
        &self,
        _chat_id: i64,
        _member_limit: u32,
        _name: &str,
    ) -> anyhow::Result<String> {
        Ok("https://chat.example/join/x".into())
    }
    async fn ban_chat_member(&self, _chat_id: i64, _user_id: ChatUserId) -> anyhow::Result<()> {
        Ok(())
    }
    async fn unban_chat_member(&self, _chat_id: i64, _user_id: ChatUserId) -> anyhow::Result<()> {
        Ok(())
    }
    async fn get_chat_administrators(&self, _chat_id: i64) -> anyhow::Result<Vec<ChatAdmin>> {
        Ok(vec![ChatAdmin {
            user_id: ChatUserId(1),
            username: Some("root".into()),
            first_name: "Root".into(),
            last_name: None,
            status: "creator".into(),
        }])
    }
    async fn get_chat_member(
        &self,
        _chat_id: i64,
        _user_id: ChatUserId,
    ) -> anyhow::Result<ChatMemberStatus> {
        Ok(ChatMemberStatus::Member)
    }
    async fn download_file(&self, _file_id: &str) -> anyhow::Result<(String, Vec<u8>)> {
        Ok(("f".into(), vec![]))
    }
}

async fn service() -> (
    AdminService,
    Arc<SqliteTicketRepository>,
    Arc<SqliteAdminRepository>,
    Arc<IntegrationEngine>,
    Arc<SqliteIntegrationRepository>,
) {
    let server = MockServer::start().await;
    let pool = sn_storage::connect_in_memory().await.unwrap();
    MigrationRunner::embedded(pool.clone()).run().await.unwrap();

    let tickets = Arc::new(SqliteTicketRepository::new(pool.clone()));
    let users = Arc::new(SqliteUserRepository::new(pool.clone()));
    let verifications = Arc::new(SqliteVerificationRepository::new(pool.clone()));
    let integrations = Arc::new(SqliteIntegrationRepository::new(pool.clone()));
    let admins = Arc::new(SqliteAdminRepository::new(pool.clone()));
    let bus = Arc::new(EventBus::new());

    let mut config = HubSoftConfig::default();
    config.host = server.uri();
    config.enabled = false;
    let client = Arc::new(HubSoftClient::new(config).unwrap());
    let engine = IntegrationEngine::new(
        integrations.clone(),
        tickets.clone(),
        users.clone(),
        client,
        Arc::new(ApiCache::new()),
        bus.clone(),
        EngineSettings {
            poll_interval: Duration::from_millis(50),
            hubsoft_enabled: false,
            ..Default::default()
        },
    );

    admins
        .replace_all(&[AdminEntry {
            user_id: ChatUserId(42),
            username: Some("mod".into()),
            first_name: "Mod".into(),
            last_name: None,
            role: AdminRole::Administrator,
            detected_at: Utc::now(),
        }])
        .await
        .unwrap();

    let service = AdminService::new(
        admins.clone(),
        tickets.clone(),
        users,
        verifications,
        integrations.clone(),
        engine.clone(),
        Arc::new(StubChat),
        bus,
        -100,
        vec![ChatUserId(7)],
    );
    (service, tickets, admins, engine, integrations)
}

async fn seed_ticket(tickets: &SqliteTicketRepository, user: i64) -> sn_domain::Ticket {
    tickets
        .insert(
            NewTicket::create(
                ChatUserId(user),
                TicketCategory::Connectivity,
                AffectedGame::Valorant,
                ProblemTiming::Now,
                "Ping alto em partidas ranqueadas".into(),
                vec![],
                None,
            )
            .unwrap(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn non_admins_are_forbidden() {
    let (service, _tickets, _, _, _) = service().await;
    let result = service
        .list_tickets(ChatUserId(999), None, 10)
        .await
        .unwrap();
    assert!(matches!(result, AdminCommandResult::Forbidden));
}

#[tokio::test]
async fn configured_bootstrap_admins_are_honored() {
    let (service, _tickets, admins, _, _) = service().await;
    // Not in the detected cache, but configured.
    assert!(!admins.is_admin(ChatUserId(7)).await.unwrap());
    assert!(service.is_admin(ChatUserId(7)).await.unwrap());
}

#[tokio::test]
async fn assign_moves_ticket_to_in_progress() {
    let (service, tickets, _, _, _) = service().await;
    let ticket = seed_ticket(&tickets, 1).await;

    let result = service
        .assign_ticket(ChatUserId(42), ticket.id, "tech-maria", None)
        .await
        .unwrap();
    let AdminCommandResult::Ok(view) = result else {
        panic!("expected assignment, got {result:?}");
    };
    assert_eq!(view.status_name, "Em Andamento");

    let stored = tickets.find_by_id(ticket.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TicketStatus::InProgress);
    assert_eq!(stored.assigned_technician.as_deref(), Some("tech-maria"));
}

#[tokio::test]
async fn illegal_transition_is_rejected_not_fatal() {
    let (service, tickets, _, _, _) = service().await;
    let ticket = seed_ticket(&tickets, 1).await;

    let result = service
        .update_ticket_status(ChatUserId(42), ticket.id, TicketStatus::Closed, None)
        .await
        .unwrap();
    assert!(matches!(result, AdminCommandResult::Rejected(_)));
}

#[tokio::test]
async fn bulk_update_reports_per_item_results() {
    let (service, tickets, _, _, _) = service().await;
    let good = seed_ticket(&tickets, 1).await;
    let missing = sn_domain::TicketId(9999);

    let result = service
        .bulk_update_tickets(
            ChatUserId(42),
            &[good.id, missing],
            BulkAction::UpdateStatus(TicketStatus::Open),
        )
        .await
        .unwrap();
    let AdminCommandResult::Ok(items) = result else {
        panic!("expected bulk result");
    };
    assert_eq!(items.len(), 2);
    assert!(items[0].ok);
    assert!(!items[1].ok);

    // The failing item did not abort the batch.
    let stored = tickets.find_by_id(good.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TicketStatus::Open);
}

#[tokio::test]
async fn queue_management_cancels_and_boosts_jobs() {
    let (service, _tickets, _, engine, integrations) = service().await;
    use sn_domain::{IntegrationPayload, IntegrationPriority, IntegrationStatus, TicketSyncKind};
    use sn_storage::IntegrationRepository;

    let job_id = engine
        .schedule(
            IntegrationPayload::TicketSync {
                ticket_id: sn_domain::TicketId(1),
                sync_type: TicketSyncKind::Create,
            },
            IntegrationPriority::Low,
        )
        .await
        .unwrap();

    let boosted = service
        .boost_integration(ChatUserId(42), &job_id, IntegrationPriority::Urgent, "escalated")
        .await
        .unwrap();
    assert!(matches!(boosted, AdminCommandResult::Ok(())));

    let cancelled = service
        .cancel_integration(ChatUserId(42), &job_id, "operator abort")
        .await
        .unwrap();
    assert!(matches!(cancelled, AdminCommandResult::Ok(())));

    let stored = integrations.find_by_id(&job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, IntegrationStatus::Cancelled);
    assert_eq!(stored.priority, IntegrationPriority::Urgent);

    // Cancelling a finished job is rejected, not fatal.
    let again = service
        .cancel_integration(ChatUserId(42), &job_id, "twice")
        .await
        .unwrap();
    assert!(matches!(again, AdminCommandResult::Rejected(_)));

    // Unknown ids come back as NotFound.
    let missing = service
        .cancel_integration(
            ChatUserId(42),
            &sn_domain::IntegrationId("nope".into()),
            "x",
        )
        .await
        .unwrap();
    assert!(matches!(missing, AdminCommandResult::NotFound));
}
