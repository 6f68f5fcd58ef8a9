//! Use-case level flows: verification, duplicate remapping, intake gating.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sn_app::{
    AccessGate, ChatAdmin, ChatMemberStatus, ChatService, CreateTicketCommand,
    CreateTicketOutcome, InviteService, Keyboard, RemapOutcome, SubmitCpfOutcome, SupportService,
    VerificationService,
};
use sn_config::HubSoftConfig;
use sn_domain::events::{
    CpfDuplicateDetected, CpfValidated, TicketCreated, VerificationCompleted, VerificationFailed,
    VerificationStarted,
};
use sn_domain::{
    AffectedGame, ChatUserId, Cpf, NewTicket, ProblemTiming, TicketCategory, TicketStatus,
    VerificationStatus, VerificationType,
};
use sn_engine::{EngineSettings, IntegrationEngine};
use sn_events::EventBus;
use sn_hubsoft::{ApiCache, HubSoftClient};
use sn_storage::{
    IntegrationRepository, MigrationRunner, SqliteIntegrationRepository, SqliteTicketRepository,
    SqliteUserRepository, SqliteVerificationRepository, TicketRepository, UserRepository,
    VerificationRepository,
};

const GROUP_ID: i64 = -1001234;

#[derive(Default)]
struct MockChat {
    invite_counter: AtomicI64,
    last_invite_member_limit: AtomicI64,
    removed: Mutex<Vec<ChatUserId>>,
    fail_bans: AtomicBool,
}

#[async_trait]
impl ChatService for MockChat {
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
        member_limit: u32,
        _name: &str,
    ) -> anyhow::Result<String> {
        self.last_invite_member_limit
            .store(member_limit as i64, Ordering::SeqCst);
        let n = self.invite_counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("https://chat.example/join/{n}"))
    }

    async fn ban_chat_member(&self, _chat_id: i64, user_id: ChatUserId) -> anyhow::Result<()> {
        if self.fail_bans.load(Ordering::SeqCst) {
            anyhow::bail!("chat unreachable");
        }
        self.removed.lock().push(user_id);
        Ok(())
    }

    async fn unban_chat_member(&self, _chat_id: i64, _user_id: ChatUserId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_chat_administrators(&self, _chat_id: i64) -> anyhow::Result<Vec<ChatAdmin>> {
        Ok(vec![])
    }

    async fn get_chat_member(
        &self,
        _chat_id: i64,
        _user_id: ChatUserId,
    ) -> anyhow::Result<ChatMemberStatus> {
        Ok(ChatMemberStatus::Member)
    }

    async fn download_file(&self, _file_id: &str) -> anyhow::Result<(String, Vec<u8>)> {
        Ok(("file.jpg".into(), vec![0u8; 4]))
    }
}

struct Harness {
    verification: VerificationService,
    support: SupportService,
    users: Arc<SqliteUserRepository>,
    verifications: Arc<SqliteVerificationRepository>,
    tickets: Arc<SqliteTicketRepository>,
    integrations: Arc<SqliteIntegrationRepository>,
    chat: Arc<MockChat>,
    events: Arc<Mutex<Vec<String>>>,
}

async fn harness(server: &MockServer) -> Harness {
    let pool = sn_storage::connect_in_memory().await.unwrap();
    MigrationRunner::embedded(pool.clone()).run().await.unwrap();

    let users = Arc::new(SqliteUserRepository::new(pool.clone()));
    let verifications = Arc::new(SqliteVerificationRepository::new(pool.clone()));
    let tickets = Arc::new(SqliteTicketRepository::new(pool.clone()));
    let integrations = Arc::new(SqliteIntegrationRepository::new(pool.clone()));
    let bus = Arc::new(EventBus::new());
    let chat = Arc::new(MockChat::default());

    let mut config = HubSoftConfig::default();
    config.host = server.uri();
    config.client_id = "cid".into();
    config.client_secret = "s".into();
    config.user = "u".into();
    config.password = "p".into();
    config.enabled = true;
    config.rate_limit_per_sec = 1000;
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
            ..Default::default()
        },
    );

    let invites_repo = Arc::new(sn_storage::SqliteInviteRepository::new(pool.clone()));
    let invites = Arc::new(InviteService::new(
        chat.clone(),
        invites_repo,
        GROUP_ID,
        1,
        3600,
    ));

    let verification = VerificationService::new(
        verifications.clone(),
        users.clone(),
        engine.clone(),
        chat.clone(),
        invites,
        bus.clone(),
        GROUP_ID,
    );

    let gate = Arc::new(AccessGate::new(users.clone()));
    let support = SupportService::new(tickets.clone(), gate, engine, bus.clone());

    // Event order recorder.
    let events = Arc::new(Mutex::new(Vec::new()));
    macro_rules! record {
        ($ty:ty, $name:expr) => {{
            let events = Arc::clone(&events);
            bus.subscribe($name, move |_: $ty| {
                let events = Arc::clone(&events);
                async move {
                    events.lock().push($name.to_string());
                    Ok(())
                }
            });
        }};
    }
    record!(VerificationStarted, "VerificationStarted");
    record!(VerificationCompleted, "VerificationCompleted");
    record!(VerificationFailed, "VerificationFailed");
    record!(CpfValidated, "CPFValidated");
    record!(CpfDuplicateDetected, "CPFDuplicateDetected");
    record!(TicketCreated, "TicketCreated");

    Harness {
        verification,
        support,
        users,
        verifications,
        tickets,
        integrations,
        chat,
        events,
    }
}

async fn mount_upstream_client(server: &MockServer, name: &str, plan: &str) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "tok",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/integracao/cliente"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "success",
            "clientes": [{
                "nome_razaosocial": name,
                "servicos": [{"id": 77, "nome": plan, "status": "servico_habilitado", "plano": plan}]
            }]
        })))
        .mount(server)
        .await;
}

fn position(events: &[String], name: &str) -> usize {
    events
        .iter()
        .position(|e| e == name)
        .unwrap_or_else(|| panic!("event {name} not published: {events:?}"))
}

#[tokio::test]
async fn happy_path_verification_issues_invite() {
    let server = MockServer::start().await;
    mount_upstream_client(&server, "Alice", "Gamer 500").await;
    let h = harness(&server).await;

    h.verification
        .start_verification(
            ChatUserId(7001),
            "alice",
            "@alice",
            VerificationType::InitialRegistration,
            Some("start_command"),
        )
        .await
        .unwrap();

    let before = Utc::now();
    let outcome = h
        .verification
        .submit_cpf(ChatUserId(7001), "11144477735")
        .await
        .unwrap();

    let SubmitCpfOutcome::Completed { client, invite } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(client.name, "Alice");

    let invite = invite.expect("invite issued");
    assert_eq!(h.chat.last_invite_member_limit.load(Ordering::SeqCst), 1);
    let lifetime = invite.expires_at - invite.created_at;
    assert_eq!(lifetime, chrono::Duration::seconds(3600));
    assert!(invite.is_valid(before));

    let user = h.users.find_by_id(ChatUserId(7001)).await.unwrap().unwrap();
    assert_eq!(user.cpf, Some(Cpf::parse("11144477735").unwrap()));
    assert_eq!(user.client_name.as_deref(), Some("Alice"));

    let events = h.events.lock().clone();
    let started = position(&events, "VerificationStarted");
    let completed = position(&events, "VerificationCompleted");
    let validated = position(&events, "CPFValidated");
    assert!(started < completed && completed < validated);
}

#[tokio::test]
async fn three_invalid_attempts_exhaust_the_verification() {
    let server = MockServer::start().await;
    let h = harness(&server).await;
    let user = ChatUserId(7002);

    h.verification
        .start_verification(user, "bob", "@bob", VerificationType::SupportRequest, None)
        .await
        .unwrap();

    for round in 1..=2 {
        let outcome = h.verification.submit_cpf(user, "00000000000").await.unwrap();
        let SubmitCpfOutcome::InvalidFormat {
            attempts_left,
            exhausted,
        } = outcome
        else {
            panic!("expected invalid format");
        };
        assert_eq!(attempts_left, 3 - round);
        assert!(!exhausted);
    }

    let outcome = h.verification.submit_cpf(user, "00000000000").await.unwrap();
    assert!(matches!(
        outcome,
        SubmitCpfOutcome::InvalidFormat {
            attempts_left: 0,
            exhausted: true
        }
    ));

    // No binding was written and the verification is terminal.
    assert!(h.users.find_by_id(user).await.unwrap().is_none());
    assert!(h.verifications.find_pending_by_user(user).await.unwrap().is_none());

    let failed_events = h
        .events
        .lock()
        .iter()
        .filter(|e| e.as_str() == "VerificationFailed")
        .count();
    assert_eq!(failed_events, 1);
}

#[tokio::test]
async fn duplicate_cpf_is_detected_and_remapped() {
    let server = MockServer::start().await;
    mount_upstream_client(&server, "Alice", "Gamer 500").await;
    let h = harness(&server).await;
    let cpf = Cpf::parse("11144477735").unwrap();

    h.users
        .bind_cpf(ChatUserId(8001), "old_account", &cpf, None, None, None)
        .await
        .unwrap();

    h.verification
        .start_verification(
            ChatUserId(8002),
            "new_account",
            "@new_account",
            VerificationType::InitialRegistration,
            None,
        )
        .await
        .unwrap();

    let outcome = h
        .verification
        .submit_cpf(ChatUserId(8002), "111.444.777-35")
        .await
        .unwrap();
    let SubmitCpfOutcome::Conflict {
        verification_id,
        existing_user_id,
        ..
    } = outcome
    else {
        panic!("expected conflict, got {outcome:?}");
    };
    assert_eq!(existing_user_id, ChatUserId(8001));
    assert!(h
        .events
        .lock()
        .iter()
        .any(|e| e == "CPFDuplicateDetected"));

    // Still in progress, nothing bound yet.
    let pending = h
        .verifications
        .find_pending_by_user(ChatUserId(8002))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.status, VerificationStatus::InProgress);
    assert_eq!(
        h.users.find_active_by_cpf(&cpf).await.unwrap().unwrap().id,
        ChatUserId(8001)
    );

    let outcome = h
        .verification
        .resolve_duplicate_conflict(&verification_id, ChatUserId(8002), &[ChatUserId(8001)])
        .await
        .unwrap();
    let RemapOutcome::Completed { invite } = outcome else {
        panic!("expected completed remap, got {outcome:?}");
    };
    assert!(invite.is_some());

    // Loser removed from the group, binding transferred, one active user
    // per CPF preserved.
    assert_eq!(*h.chat.removed.lock(), vec![ChatUserId(8001)]);
    let winner = h.users.find_active_by_cpf(&cpf).await.unwrap().unwrap();
    assert_eq!(winner.id, ChatUserId(8002));
    let loser = h.users.find_by_id(ChatUserId(8001)).await.unwrap().unwrap();
    assert!(!loser.is_active);

    let resolved = h
        .verifications
        .find_by_id(&verification_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.status, VerificationStatus::Completed);
}

#[tokio::test]
async fn failed_revocation_queues_retry_and_keeps_verification_open() {
    let server = MockServer::start().await;
    mount_upstream_client(&server, "Alice", "Gamer 500").await;
    let h = harness(&server).await;
    let cpf = Cpf::parse("11144477735").unwrap();

    h.users
        .bind_cpf(ChatUserId(8001), "old", &cpf, None, None, None)
        .await
        .unwrap();
    h.verification
        .start_verification(
            ChatUserId(8002),
            "new",
            "@new",
            VerificationType::InitialRegistration,
            None,
        )
        .await
        .unwrap();
    let SubmitCpfOutcome::Conflict { verification_id, .. } = h
        .verification
        .submit_cpf(ChatUserId(8002), "11144477735")
        .await
        .unwrap()
    else {
        panic!("expected conflict");
    };

    h.chat.fail_bans.store(true, Ordering::SeqCst);
    let outcome = h
        .verification
        .resolve_duplicate_conflict(&verification_id, ChatUserId(8002), &[ChatUserId(8001)])
        .await
        .unwrap();
    let RemapOutcome::RevocationPending { integration_id } = outcome else {
        panic!("expected pending revocation, got {outcome:?}");
    };

    let job = h
        .integrations
        .find_by_id(&integration_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        job.metadata.get("action"),
        Some(&serde_json::json!("membership_revocation"))
    );

    // Verification untouched until the job lands.
    let pending = h
        .verifications
        .find_by_id(&verification_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.status, VerificationStatus::InProgress);

    // Chat recovers; the completed job's handler resumes the remap.
    h.chat.fail_bans.store(false, Ordering::SeqCst);
    h.verification.resume_remap(&job.metadata).await.unwrap();

    let resolved = h
        .verifications
        .find_by_id(&verification_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.status, VerificationStatus::Completed);
    assert_eq!(
        h.users.find_active_by_cpf(&cpf).await.unwrap().unwrap().id,
        ChatUserId(8002)
    );
}

#[tokio::test]
async fn active_ticket_blocks_new_intake() {
    let server = MockServer::start().await;
    let h = harness(&server).await;
    let user = ChatUserId(7001);

    h.users
        .bind_cpf(user, "alice", &Cpf::parse("11144477735").unwrap(), None, None, None)
        .await
        .unwrap();

    let mut existing = h
        .tickets
        .insert(
            NewTicket::create(
                user,
                TicketCategory::Performance,
                AffectedGame::Cs2,
                ProblemTiming::ThisWeek,
                "FPS caiu bastante em todos os mapas".into(),
                vec![],
                None,
            )
            .unwrap(),
        )
        .await
        .unwrap();
    existing.change_status(TicketStatus::Open, None).unwrap();
    h.tickets.save(&mut existing).await.unwrap();

    let outcome = h
        .support
        .create_ticket(CreateTicketCommand {
            user_id: user,
            category: TicketCategory::Connectivity,
            game: AffectedGame::Valorant,
            timing: ProblemTiming::Now,
            description: "Ping muito alto nas partidas ranqueadas".into(),
            attachments: vec![],
            thread_id: None,
        })
        .await
        .unwrap();

    let CreateTicketOutcome::ActiveTicketExists {
        local_protocol,
        status_name,
        ..
    } = outcome
    else {
        panic!("expected active-ticket refusal, got {outcome:?}");
    };
    assert_eq!(local_protocol, "LOC000001");
    assert_eq!(status_name, "Em Análise");

    // No second ticket row, no TicketCreated event.
    assert_eq!(h.tickets.find_by_user(user, 10).await.unwrap().len(), 1);
    assert!(!h.events.lock().iter().any(|e| e == "TicketCreated"));
}

#[tokio::test]
async fn unverified_user_is_redirected_to_verification() {
    let server = MockServer::start().await;
    let h = harness(&server).await;

    let outcome = h
        .support
        .create_ticket(CreateTicketCommand {
            user_id: ChatUserId(999),
            category: TicketCategory::Others,
            game: AffectedGame::AllGames,
            timing: ProblemTiming::Always,
            description: "Não consigo abrir chamado algum".into(),
            attachments: vec![],
            thread_id: None,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, CreateTicketOutcome::NotVerified));
}
