//! Per-type execution of integration jobs.
//!
//! Each run produces exactly one attempt on the aggregate. Success routes
//! through `complete_with_success`, failures through the retry policy; 429s
//! additionally pause engine dispatch for the reported reset window.

use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use sn_domain::events::HubSoftRateLimitHit;
use sn_domain::{
    Cpf, IntegrationId, IntegrationPayload, IntegrationPriority, IntegrationRequest,
    IntegrationStatus, SyncStatus, Ticket, TicketId, TicketSyncKind,
};
use sn_hubsoft::{CacheCategory, ClientInfo, CreateAtendimentoRequest, HubSoftError, NEGATIVE_TTL};

use crate::{enqueue, EngineError, IntegrationEngine, ScheduleOptions};

const BULK_WAIT_POLL: Duration = Duration::from_secs(2);
const BULK_WAIT_CAP: Duration = Duration::from_secs(3600);

pub(crate) enum Outcome {
    Completed,
    Retrying(EngineError),
    Failed(EngineError),
}

pub(crate) async fn execute(engine: &IntegrationEngine, job: &mut IntegrationRequest) -> Outcome {
    let payload = job.payload.clone();
    let job_id = job.id.clone();
    let priority = job.priority;
    let metadata = job.metadata.clone();
    let started = Instant::now();

    let result = run_payload(engine, payload, &job_id, priority, &metadata).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(response) => {
            if let Err(e) = job.record_attempt(true, None, Some(response), Some(elapsed_ms)) {
                return Outcome::Failed(e.into());
            }
            Outcome::Completed
        }
        Err(EngineError::Upstream(HubSoftError::RateLimited { retry_after_secs })) => {
            let reset = Duration::from_secs(retry_after_secs);
            engine.pause_dispatch_for(reset);
            engine
                .bus
                .publish(&HubSoftRateLimitHit {
                    reset_after_seconds: retry_after_secs,
                    affected_operations: 1,
                })
                .await;

            let error = EngineError::Upstream(HubSoftError::RateLimited { retry_after_secs });
            if let Err(e) = job.record_attempt_rate_limited(
                chrono::Duration::seconds(retry_after_secs as i64),
                "HTTP 429: rate limit",
                Some(elapsed_ms),
            ) {
                return Outcome::Failed(e.into());
            }
            match job.status {
                IntegrationStatus::RetryScheduled => Outcome::Retrying(error),
                _ => Outcome::Failed(error),
            }
        }
        Err(error) => {
            if let Err(e) =
                job.record_attempt(false, Some(error.to_string()), None, Some(elapsed_ms))
            {
                return Outcome::Failed(e.into());
            }
            match job.status {
                IntegrationStatus::RetryScheduled => Outcome::Retrying(error),
                _ => Outcome::Failed(error),
            }
        }
    }
}

async fn run_payload(
    engine: &IntegrationEngine,
    payload: IntegrationPayload,
    job_id: &IntegrationId,
    priority: IntegrationPriority,
    metadata: &serde_json::Map<String, serde_json::Value>,
) -> Result<serde_json::Value, EngineError> {
    let offline_recovery =
        metadata.get("provenance").and_then(|v| v.as_str()) == Some("offline_recovery");
    match payload {
        IntegrationPayload::TicketSync {
            ticket_id,
            sync_type,
        } => run_ticket_sync(engine, ticket_id, sync_type, offline_recovery).await,
        IntegrationPayload::UserVerification {
            cpf,
            include_contracts,
            cache_ttl_secs,
            force_refresh,
        } => run_user_verification(engine, cpf, include_contracts, cache_ttl_secs, force_refresh).await,
        IntegrationPayload::ClientDataFetch {
            cpf,
            include_tickets,
            include_billing,
        } => run_client_data_fetch(engine, cpf, include_tickets, include_billing).await,
        IntegrationPayload::StatusUpdate {
            ticket_id,
            new_status,
        } => run_status_update(engine, ticket_id, new_status).await,
        IntegrationPayload::MembershipRevocation { user_id, reason } => {
            run_membership_revocation(engine, user_id, &reason).await
        }
        IntegrationPayload::BulkSync {
            ticket_ids,
            batch_size,
            delay_between_batches_secs,
        } => {
            run_bulk_sync(
                engine,
                job_id,
                priority,
                ticket_ids,
                batch_size,
                delay_between_batches_secs,
            )
            .await
        }
    }
}

// ============================================================================
// TICKET_SYNC
// ============================================================================

async fn run_ticket_sync(
    engine: &IntegrationEngine,
    ticket_id: TicketId,
    sync_type: TicketSyncKind,
    offline_recovery: bool,
) -> Result<serde_json::Value, EngineError> {
    let mut ticket = engine
        .tickets
        .find_by_id(ticket_id)
        .await?
        .ok_or_else(|| EngineError::Storage(anyhow::anyhow!("ticket {ticket_id} missing")))?;

    match sync_type {
        TicketSyncKind::Create => {
            let user = engine
                .users
                .find_by_id(ticket.user_id)
                .await?
                .ok_or_else(|| {
                    EngineError::Storage(anyhow::anyhow!("user {} missing", ticket.user_id))
                })?;
            let cpf = user.cpf.clone().ok_or_else(|| {
                EngineError::Storage(anyhow::anyhow!("user {} has no CPF", user.id))
            })?;

            let info = lookup_client(engine, &cpf, false).await?.ok_or_else(|| {
                EngineError::Upstream(HubSoftError::NotFound)
            })?;
            let id_cliente_servico = info.id_cliente_servico.ok_or_else(|| {
                EngineError::Upstream(HubSoftError::Schema("client without service id".into()))
            })?;

            let request = CreateAtendimentoRequest {
                id_cliente_servico,
                id_tipo_atendimento: engine.client.config().tipo_atendimento_gaming,
                id_atendimento_status: engine.client.config().status_atendimento_aberto,
                descricao: format_ticket_description(&ticket, &info),
                nome: info.name.clone(),
                telefone: sanitize_phone(info.phone.as_deref()),
            };

            let created = engine.client.create_ticket(&request).await?;
            ticket.attach_hubsoft(
                created.hubsoft_id.clone(),
                created.protocol.clone(),
                SyncStatus::Synced,
                TicketSyncKind::Create,
            );
            engine.tickets.save(&mut ticket).await?;
            engine.bus.publish_many(ticket.take_events()).await;

            if offline_recovery {
                let note = format!(
                    "SINCRONIZAÇÃO AUTOMÁTICA:\n\n\
                     Este atendimento foi criado offline durante indisponibilidade do sistema.\n\n\
                     - Protocolo local original: {}\n\
                     - Criado em: {}\n\
                     - Sincronizado em: {}\n\n\
                     Dados preservados integralmente na sincronização.",
                    ticket.local_protocol(),
                    ticket.created_at.format("%d/%m/%Y às %H:%M"),
                    Utc::now().format("%d/%m/%Y às %H:%M"),
                );
                if let Err(e) = engine
                    .client
                    .add_message_to_atendimento(&created.hubsoft_id, &note)
                    .await
                {
                    warn!(hubsoft_id = %created.hubsoft_id, error = %e, "Provenance note failed");
                }
            }

            info!(ticket_id = %ticket_id, hubsoft_id = %created.hubsoft_id, "Ticket synced upstream");
            Ok(created.raw)
        }
        TicketSyncKind::Update => {
            let hubsoft_id = require_hubsoft_id(&ticket)?;
            let note = format!(
                "Atualização do ticket {}:\n{}",
                ticket.local_protocol(),
                ticket.description
            );
            engine
                .client
                .add_message_to_atendimento(&hubsoft_id, &note)
                .await?;
            Ok(json!({ "updated": true, "hubsoft_id": hubsoft_id }))
        }
        TicketSyncKind::StatusChange => {
            let hubsoft_id = require_hubsoft_id(&ticket)?;
            let note = format!(
                "Status do ticket {} alterado para: {}",
                ticket.local_protocol(),
                ticket.status.display_pt()
            );
            engine
                .client
                .update_ticket_status(&hubsoft_id, &note)
                .await?;
            Ok(json!({ "status_pushed": ticket.status.as_str(), "hubsoft_id": hubsoft_id }))
        }
    }
}

fn require_hubsoft_id(ticket: &Ticket) -> Result<String, EngineError> {
    ticket.hubsoft_ticket_id.clone().ok_or_else(|| {
        EngineError::Storage(anyhow::anyhow!(
            "ticket {} has no upstream binding",
            ticket.id
        ))
    })
}

// ============================================================================
// USER_VERIFICATION / CLIENT_DATA_FETCH
// ============================================================================

/// Cache-aware client lookup shared by every executor path.
async fn lookup_client(
    engine: &IntegrationEngine,
    cpf: &Cpf,
    force_refresh: bool,
) -> Result<Option<ClientInfo>, EngineError> {
    if !force_refresh {
        if let Some(hit) = engine.cache.get(CacheCategory::ClientData, cpf.as_str()) {
            debug!(cpf = %cpf.masked(), "Client lookup served from cache");
            let info = serde_json::from_value(hit)
                .map_err(|e| HubSoftError::Schema(format!("cached client data: {e}")))?;
            return Ok(Some(info));
        }
    }

    let info = engine.client.verify_client_by_cpf(cpf, true).await?;
    match &info {
        Some(info) => {
            let value = serde_json::to_value(info)
                .map_err(|e| HubSoftError::Schema(e.to_string()))?;
            engine
                .cache
                .put(CacheCategory::ClientData, cpf.as_str(), value, None);
            engine
                .cache
                .put(CacheCategory::ContractStatus, cpf.as_str(), json!(true), None);
        }
        None => {
            engine.cache.put(
                CacheCategory::ContractStatus,
                cpf.as_str(),
                json!(false),
                Some(NEGATIVE_TTL),
            );
        }
    }
    Ok(info)
}

async fn run_user_verification(
    engine: &IntegrationEngine,
    cpf: Cpf,
    _include_contracts: bool,
    cache_ttl_secs: Option<u64>,
    force_refresh: bool,
) -> Result<serde_json::Value, EngineError> {
    let info = lookup_client(engine, &cpf, force_refresh).await?;
    match info {
        Some(info) => {
            let value =
                serde_json::to_value(&info).map_err(|e| HubSoftError::Schema(e.to_string()))?;
            if let Some(ttl) = cache_ttl_secs {
                engine.cache.put(
                    CacheCategory::ClientData,
                    cpf.as_str(),
                    value.clone(),
                    Some(Duration::from_secs(ttl)),
                );
            }
            Ok(value)
        }
        None => Ok(serde_json::Value::Null),
    }
}

async fn run_client_data_fetch(
    engine: &IntegrationEngine,
    cpf: Cpf,
    include_tickets: bool,
    _include_billing: bool,
) -> Result<serde_json::Value, EngineError> {
    let client = lookup_client(engine, &cpf, false).await?;

    let tickets = if include_tickets {
        Some(
            engine
                .client
                .search_tickets_by_cpf(&cpf, false, None)
                .await?,
        )
    } else {
        None
    };

    let composite = json!({
        "client": client,
        "tickets": tickets,
    });
    engine.cache.put(
        CacheCategory::ServiceData,
        cpf.as_str(),
        composite.clone(),
        None,
    );
    Ok(composite)
}

// ============================================================================
// STATUS_UPDATE
// ============================================================================

async fn run_status_update(
    engine: &IntegrationEngine,
    ticket_id: TicketId,
    new_status: sn_domain::TicketStatus,
) -> Result<serde_json::Value, EngineError> {
    let ticket = engine
        .tickets
        .find_by_id(ticket_id)
        .await?
        .ok_or_else(|| EngineError::Storage(anyhow::anyhow!("ticket {ticket_id} missing")))?;
    let hubsoft_id = require_hubsoft_id(&ticket)?;

    let note = format!(
        "Status do ticket {} alterado para: {}",
        ticket.local_protocol(),
        new_status.display_pt()
    );
    engine
        .client
        .update_ticket_status(&hubsoft_id, &note)
        .await?;
    Ok(json!({ "hubsoft_id": hubsoft_id, "status": new_status.as_str() }))
}

async fn run_membership_revocation(
    engine: &IntegrationEngine,
    user_id: sn_domain::ChatUserId,
    reason: &str,
) -> Result<serde_json::Value, EngineError> {
    let revoker = engine.revoker.read().clone();
    let Some(revoker) = revoker else {
        // Retryable: the revoker appears once wiring finishes.
        return Err(EngineError::Storage(anyhow::anyhow!(
            "chat connection error: no revoker configured"
        )));
    };
    revoker
        .revoke(user_id, reason)
        .await
        .map_err(|e| EngineError::Storage(anyhow::anyhow!("chat connection error: {e}")))?;
    Ok(json!({ "revoked_user_id": user_id.0 }))
}

// ============================================================================
// BULK_SYNC
// ============================================================================

async fn run_bulk_sync(
    engine: &IntegrationEngine,
    job_id: &IntegrationId,
    priority: IntegrationPriority,
    ticket_ids: Vec<TicketId>,
    batch_size: usize,
    delay_between_batches_secs: u64,
) -> Result<serde_json::Value, EngineError> {
    let total = ticket_ids.len();
    let started = Instant::now();
    info!(batch_id = %job_id, total, batch_size, "Bulk sync started");

    for (index, chunk) in ticket_ids.chunks(batch_size.max(1)).enumerate() {
        // Respect an active rate-limit pause before feeding the next chunk.
        while engine.is_dispatch_paused() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        for ticket_id in chunk {
            let sync_type = match engine.tickets.find_by_id(*ticket_id).await? {
                Some(ticket) if ticket.hubsoft_ticket_id.is_some() => TicketSyncKind::Update,
                Some(_) => TicketSyncKind::Create,
                None => {
                    warn!(ticket_id = %ticket_id, "Bulk sync skipping missing ticket");
                    continue;
                }
            };
            enqueue(
                engine.integrations.as_ref(),
                &engine.bus,
                IntegrationPayload::TicketSync {
                    ticket_id: *ticket_id,
                    sync_type,
                },
                priority,
                ScheduleOptions {
                    metadata: vec![("bulk_batch_id".into(), json!(job_id.0.clone()))],
                    ..Default::default()
                },
            )
            .await?;
        }

        wait_for_chunk(engine, job_id).await?;

        debug!(batch_id = %job_id, chunk = index, "Bulk sync chunk finished");
        if delay_between_batches_secs > 0 {
            tokio::time::sleep(Duration::from_secs(delay_between_batches_secs)).await;
        }
    }

    let counts = sub_job_counts(engine, job_id).await?;
    let summary = json!({
        "total": total,
        "successful": counts.0,
        "failed": counts.1,
    });
    engine
        .bus
        .publish(&sn_domain::events::HubSoftBulkSyncCompleted {
            batch_id: job_id.clone(),
            total,
            successful: counts.0,
            failed: counts.1,
            duration_seconds: started.elapsed().as_secs(),
        })
        .await;
    info!(batch_id = %job_id, successful = counts.0, failed = counts.1, "Bulk sync completed");
    Ok(summary)
}

/// Blocks until every sub-job of this batch reaches a terminal status.
/// Retry-scheduled sub-jobs keep the wait alive; the cap guards against a
/// stalled queue.
async fn wait_for_chunk(
    engine: &IntegrationEngine,
    batch_id: &IntegrationId,
) -> Result<(), EngineError> {
    let deadline = Instant::now() + BULK_WAIT_CAP;
    loop {
        let sub_jobs = engine
            .integrations
            .find_by_metadata("bulk_batch_id", &batch_id.0, None)
            .await?;
        let open = sub_jobs.iter().filter(|j| !j.status.is_terminal()).count();
        if open == 0 {
            return Ok(());
        }
        if Instant::now() > deadline {
            return Err(EngineError::Storage(anyhow::anyhow!(
                "bulk batch {batch_id} stalled with {open} open sub-jobs"
            )));
        }
        tokio::time::sleep(BULK_WAIT_POLL).await;
    }
}

async fn sub_job_counts(
    engine: &IntegrationEngine,
    batch_id: &IntegrationId,
) -> Result<(usize, usize), EngineError> {
    let sub_jobs = engine
        .integrations
        .find_by_metadata("bulk_batch_id", &batch_id.0, None)
        .await?;
    let successful = sub_jobs
        .iter()
        .filter(|j| j.status == IntegrationStatus::Completed)
        .count();
    let failed = sub_jobs.len() - successful;
    Ok((successful, failed))
}

// ============================================================================
// Formatting
// ============================================================================

pub(crate) fn format_ticket_description(ticket: &Ticket, client: &ClientInfo) -> String {
    let now = Utc::now().format("%d/%m/%Y às %H:%M");
    let mut description = format!(
        "PROBLEMA RELATADO PELO CLIENTE:\n\"{}\"\n\n\
         INFORMAÇÕES DO ATENDIMENTO:\n\
         - Categoria: {} | Jogo: {}\n\
         - Quando começou: {} | Urgência: {}\n\
         - Cliente: {}\n",
        ticket.description,
        ticket.category.label_pt(),
        ticket.game.label_pt(),
        ticket.timing.label_pt(),
        ticket.urgency.as_str(),
        client.name,
    );
    if !ticket.attachments.is_empty() {
        description.push_str(&format!(
            "- Anexos: {} arquivo(s) enviados pelo cliente\n",
            ticket.attachments.len()
        ));
    }
    description.push_str(&format!(
        "\nORIGEM: Assistente Sentinela ({} — protocolo local {})",
        now,
        ticket.local_protocol()
    ));
    description
}

pub(crate) fn sanitize_phone(phone: Option<&str>) -> String {
    let digits: String = phone
        .unwrap_or("11999999999")
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        "11999999999".to_string()
    } else {
        digits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sn_domain::{AffectedGame, ChatUserId, NewTicket, ProblemTiming, TicketCategory};

    fn ticket() -> Ticket {
        let new = NewTicket::create(
            ChatUserId(1),
            TicketCategory::Connectivity,
            AffectedGame::Valorant,
            ProblemTiming::Now,
            "Ping alto em Valorant desde ontem".into(),
            vec!["file-a".into()],
            None,
        )
        .unwrap();
        let now = Utc::now();
        Ticket::from_parts(TicketId(12), new, now, now, 1)
    }

    fn client() -> ClientInfo {
        ClientInfo {
            name: "Alice".into(),
            phone: Some("+55 (11) 99999-0000".into()),
            id_cliente_servico: Some(77),
            service_name: Some("Gamer 500".into()),
            service_status: Some("servico_habilitado".into()),
            services: vec![],
        }
    }

    #[test]
    fn description_carries_protocol_and_category() {
        let text = format_ticket_description(&ticket(), &client());
        assert!(text.contains("LOC000012"));
        assert!(text.contains("Conectividade/Ping"));
        assert!(text.contains("Valorant"));
        assert!(text.contains("1 arquivo(s)"));
        assert!(text.contains("Alice"));
    }

    #[test]
    fn phone_sanitization_strips_formatting() {
        assert_eq!(sanitize_phone(Some("+55 (11) 99999-0000")), "5511999990000");
        assert_eq!(sanitize_phone(None), "11999999999");
        assert_eq!(sanitize_phone(Some("---")), "11999999999");
    }
}
