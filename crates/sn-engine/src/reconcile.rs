//! Offline-ticket reconciliation.
//!
//! When the upstream comes back after downtime, every locally-created
//! unsynced ticket is either correlated to an atendimento the customer
//! already opened by other means, or pushed upstream as a fresh create job.
//! Correlation matches on the same CPF, creation times within ±24 h, and
//! Jaccard similarity of the whitespace-tokenized descriptions of at least
//! 0.30. After reconciliation, the statuses of all synced active tickets
//! are refreshed from a single paginated listing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use tracing::{debug, info, warn};

use sn_domain::{
    IntegrationPayload, IntegrationPriority, SyncStatus, Ticket, TicketStatus, TicketSyncKind,
};
use sn_events::EventBus;
use sn_hubsoft::{is_success, Atendimento, HubSoftClient, MAX_STATUS_PAGES, STATUS_PAGE_SIZE};
use sn_storage::{IntegrationRepository, TicketRepository, UserRepository};

use crate::{enqueue, EngineError, ScheduleOptions};

pub const CORRELATION_THRESHOLD: f64 = 0.30;
const CORRELATION_WINDOW_HOURS: i64 = 24;

/// Jaccard similarity over lowercased whitespace tokens.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let tokens_a: std::collections::HashSet<String> =
        a.to_lowercase().split_whitespace().map(String::from).collect();
    let tokens_b: std::collections::HashSet<String> =
        b.to_lowercase().split_whitespace().map(String::from).collect();

    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 0.0;
    }
    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    intersection as f64 / union as f64
}

/// Upstream timestamps arrive as `YYYY-MM-DD HH:MM:SS` or RFC 3339.
fn parse_upstream_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub correlated: usize,
    pub scheduled_for_create: usize,
    pub skipped: usize,
}

pub struct Reconciler {
    tickets: Arc<dyn TicketRepository>,
    users: Arc<dyn UserRepository>,
    integrations: Arc<dyn IntegrationRepository>,
    client: Arc<HubSoftClient>,
    bus: Arc<EventBus>,
}

impl Reconciler {
    pub fn new(
        tickets: Arc<dyn TicketRepository>,
        users: Arc<dyn UserRepository>,
        integrations: Arc<dyn IntegrationRepository>,
        client: Arc<HubSoftClient>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            tickets,
            users,
            integrations,
            client,
            bus,
        }
    }

    /// Runs the full recovery: correlate-or-create for every offline
    /// ticket, then a bulk status refresh.
    pub async fn run_recovery(&self) -> Result<ReconcileReport, EngineError> {
        let report = self.reconcile_offline_tickets().await?;
        if let Err(e) = self.sync_all_active_tickets_status().await {
            warn!(error = %e, "Active ticket status refresh failed");
        }
        Ok(report)
    }

    pub async fn reconcile_offline_tickets(&self) -> Result<ReconcileReport, EngineError> {
        let offline = self.tickets.find_offline_tickets().await?;
        let mut report = ReconcileReport {
            scanned: offline.len(),
            ..Default::default()
        };
        if offline.is_empty() {
            return Ok(report);
        }
        info!(count = offline.len(), "Reconciling offline tickets");

        for mut ticket in offline {
            match self.reconcile_one(&mut ticket).await {
                Ok(true) => report.correlated += 1,
                Ok(false) => report.scheduled_for_create += 1,
                Err(e) => {
                    report.skipped += 1;
                    warn!(ticket_id = %ticket.id, error = %e, "Skipped offline ticket");
                }
            }
        }

        info!(
            correlated = report.correlated,
            created = report.scheduled_for_create,
            skipped = report.skipped,
            "Offline reconciliation finished"
        );
        Ok(report)
    }

    /// Returns true when the ticket was correlated to an existing
    /// atendimento, false when a fresh create job was scheduled.
    async fn reconcile_one(&self, ticket: &mut Ticket) -> Result<bool, EngineError> {
        let user = self
            .users
            .find_by_id(ticket.user_id)
            .await?
            .ok_or_else(|| EngineError::Storage(anyhow::anyhow!("user {} missing", ticket.user_id)))?;
        let cpf = user
            .cpf
            .ok_or_else(|| EngineError::Storage(anyhow::anyhow!("user {} has no CPF", user.id)))?;

        let candidates = self.client.search_tickets_by_cpf(&cpf, true, None).await?;
        if let Some(candidate) = find_correlation_candidate(ticket, &candidates) {
            let hubsoft_id = candidate
                .upstream_id()
                .ok_or_else(|| EngineError::Storage(anyhow::anyhow!("candidate without id")))?;

            ticket.attach_hubsoft(
                hubsoft_id.clone(),
                candidate.protocolo.clone(),
                SyncStatus::Correlated,
                TicketSyncKind::Update,
            );
            self.tickets.save(ticket).await?;
            self.bus.publish_many(ticket.take_events()).await;

            let note = format!(
                "CORRELAÇÃO AUTOMÁTICA:\n\n\
                 Este atendimento foi correlacionado com um ticket local criado offline.\n\n\
                 - Protocolo local: {}\n\
                 - Criado offline em: {}\n\
                 - Correlacionado em: {}\n\n\
                 Dados do ticket local preservados.",
                ticket.local_protocol(),
                ticket.created_at.format("%d/%m/%Y às %H:%M"),
                Utc::now().format("%d/%m/%Y às %H:%M"),
            );
            if let Err(e) = self
                .client
                .add_message_to_atendimento(&hubsoft_id, &note)
                .await
            {
                warn!(hubsoft_id = %hubsoft_id, error = %e, "Correlation note failed");
            }

            info!(ticket_id = %ticket.id, hubsoft_id = %hubsoft_id, "Offline ticket correlated");
            Ok(true)
        } else {
            enqueue(
                self.integrations.as_ref(),
                &self.bus,
                IntegrationPayload::TicketSync {
                    ticket_id: ticket.id,
                    sync_type: TicketSyncKind::Create,
                },
                IntegrationPriority::High,
                ScheduleOptions {
                    metadata: vec![("provenance".into(), serde_json::json!("offline_recovery"))],
                    ..Default::default()
                },
            )
            .await?;
            debug!(ticket_id = %ticket.id, "Offline ticket scheduled for upstream create");
            Ok(false)
        }
    }

    /// Refreshes local status for every active synced ticket from at most
    /// ten pages of one hundred atendimentos, instead of one read per
    /// ticket.
    pub async fn sync_all_active_tickets_status(&self) -> Result<usize, EngineError> {
        let active = self.tickets.find_active_with_hubsoft_id().await?;
        if active.is_empty() {
            return Ok(0);
        }

        let wanted: HashMap<String, Ticket> = active
            .into_iter()
            .filter_map(|t| t.hubsoft_ticket_id.clone().map(|id| (id, t)))
            .collect();

        let mut found: HashMap<String, Atendimento> = HashMap::new();
        for pagina in 0..MAX_STATUS_PAGES {
            let page = self
                .client
                .list_atendimentos_paginated(pagina, STATUS_PAGE_SIZE, None, None, None)
                .await?;
            if !is_success(page.status.as_deref()) || page.atendimentos.is_empty() {
                break;
            }
            for atendimento in page.atendimentos {
                if let Some(id) = atendimento.upstream_id() {
                    if wanted.contains_key(&id) {
                        found.insert(id, atendimento);
                    }
                }
            }
            if found.len() >= wanted.len() {
                break;
            }
        }

        let mut updated = 0;
        for (hubsoft_id, mut ticket) in wanted {
            let Some(atendimento) = found.get(&hubsoft_id) else {
                debug!(hubsoft_id = %hubsoft_id, "Active ticket absent from upstream listing");
                continue;
            };
            let Some(status_name) = atendimento.status_name() else {
                continue;
            };
            let Some(next) = map_upstream_status(&status_name) else {
                continue;
            };
            if next == ticket.status || !ticket.status.can_transition_to(next) {
                continue;
            }
            ticket.change_status(next, None)?;
            self.tickets.save(&mut ticket).await?;
            self.bus.publish_many(ticket.take_events()).await;
            updated += 1;
        }

        info!(updated, "Active ticket statuses refreshed");
        Ok(updated)
    }
}

/// Candidate filter: same-CPF atendimentos created within the window whose
/// description clears the similarity threshold. Ties go to the most similar.
pub fn find_correlation_candidate<'a>(
    ticket: &Ticket,
    candidates: &'a [Atendimento],
) -> Option<&'a Atendimento> {
    let window = Duration::hours(CORRELATION_WINDOW_HOURS);
    candidates
        .iter()
        .filter_map(|candidate| {
            if let Some(raw) = candidate.data_cadastro.as_deref() {
                let created = parse_upstream_time(raw)?;
                let gap = (ticket.created_at - created).abs();
                if gap > window {
                    return None;
                }
            }
            let similarity =
                jaccard_similarity(&ticket.description, &candidate.full_description());
            if similarity >= CORRELATION_THRESHOLD {
                Some((candidate, similarity))
            } else {
                None
            }
        })
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(candidate, _)| candidate)
}

fn map_upstream_status(status_name: &str) -> Option<TicketStatus> {
    match status_name.trim() {
        "Pendente" | "Aguardando Análise" => Some(TicketStatus::Open),
        "Em Andamento" => Some(TicketStatus::InProgress),
        "Resolvido" => Some(TicketStatus::Resolved),
        "Fechado" => Some(TicketStatus::Closed),
        "Cancelado" => Some(TicketStatus::Cancelled),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sn_domain::{AffectedGame, ChatUserId, NewTicket, ProblemTiming, TicketCategory, TicketId};

    fn ticket(description: &str) -> Ticket {
        let new = NewTicket::create(
            ChatUserId(1),
            TicketCategory::Connectivity,
            AffectedGame::Valorant,
            ProblemTiming::Yesterday,
            description.to_string(),
            vec![],
            None,
        )
        .unwrap();
        let now = Utc::now();
        Ticket::from_parts(TicketId(1), new, now, now, 1)
    }

    fn atendimento(id: i64, descricao: &str, created: DateTime<Utc>) -> Atendimento {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "protocolo": format!("P{id}"),
            "descricao": descricao,
            "data_cadastro": created.format("%Y-%m-%d %H:%M:%S").to_string(),
        }))
        .unwrap()
    }

    #[test]
    fn jaccard_of_identical_strings_is_one() {
        assert_eq!(jaccard_similarity("ping alto valorant", "ping alto valorant"), 1.0);
    }

    #[test]
    fn jaccard_of_disjoint_strings_is_zero() {
        assert_eq!(jaccard_similarity("abc def", "ghi jkl"), 0.0);
        assert_eq!(jaccard_similarity("", ""), 0.0);
    }

    #[test]
    fn jaccard_is_case_insensitive() {
        assert_eq!(jaccard_similarity("Ping Alto", "ping alto"), 1.0);
    }

    #[test]
    fn similar_recent_ticket_is_correlated() {
        let local = ticket("Ping alto em Valorant ontem à noite");
        let upstream = atendimento(
            9,
            "Ping alto Valorant ontem",
            Utc::now() - Duration::hours(3),
        );
        let candidates = vec![upstream];
        let found = find_correlation_candidate(&local, &candidates).unwrap();
        assert_eq!(found.upstream_id().as_deref(), Some("9"));
    }

    #[test]
    fn old_candidates_are_ignored() {
        let local = ticket("Ping alto em Valorant ontem à noite");
        let upstream = atendimento(
            9,
            "Ping alto em Valorant ontem à noite",
            Utc::now() - Duration::hours(30),
        );
        assert!(find_correlation_candidate(&local, &[upstream]).is_none());
    }

    #[test]
    fn dissimilar_candidates_are_ignored() {
        let local = ticket("Ping alto em Valorant ontem à noite");
        let upstream = atendimento(
            9,
            "Fatura em duplicidade no boleto do mês",
            Utc::now() - Duration::hours(1),
        );
        assert!(find_correlation_candidate(&local, &[upstream]).is_none());
    }

    #[test]
    fn most_similar_candidate_wins() {
        let local = ticket("Ping alto em Valorant ontem à noite");
        let weak = atendimento(1, "ping valorant problema conexão", Utc::now());
        let strong = atendimento(2, "ping alto em valorant ontem à noite", Utc::now());
        let candidates = [weak, strong];
        let found = find_correlation_candidate(&local, &candidates).unwrap();
        assert_eq!(found.upstream_id().as_deref(), Some("2"));
    }

    #[test]
    fn upstream_time_formats_parse() {
        assert!(parse_upstream_time("2024-08-01 10:30:00").is_some());
        assert!(parse_upstream_time("2024-08-01T10:30:00Z").is_some());
        assert!(parse_upstream_time("yesterday").is_none());
    }
}
