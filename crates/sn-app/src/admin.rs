//! Admin operations: listing, assignment, status changes, bans, stats and
//! bulk actions. Every command authorizes against the admin cache first;
//! unauthorized callers get a typed `Forbidden`, not an error.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use sn_domain::{
    AdminEntry, AdminRole, ChatUserId, IntegrationPayload, IntegrationPriority, TicketId,
    TicketStatus, TicketSyncKind,
};
use sn_engine::IntegrationEngine;
use sn_events::EventBus;
use sn_storage::{AdminRepository, IntegrationRepository, TicketRepository, UserRepository};

use crate::chat::ChatService;
use crate::support::TicketView;

#[derive(Debug)]
pub enum AdminCommandResult<T> {
    Ok(T),
    Forbidden,
    NotFound,
    Rejected(String),
}

#[derive(Debug, Clone)]
pub enum BulkAction {
    UpdateStatus(TicketStatus),
    Assign(String),
    Cancel,
}

#[derive(Debug, Clone)]
pub struct BulkItemResult {
    pub ticket_id: TicketId,
    pub ok: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SystemStats {
    pub active_users: i64,
    pub tickets_pending: i64,
    pub tickets_open: i64,
    pub tickets_in_progress: i64,
    pub tickets_resolved: i64,
    pub tickets_created_in_range: i64,
    pub verifications_succeeded: i64,
    pub verifications_failed: i64,
    pub integrations_by_status: Vec<(String, i64)>,
}

pub struct AdminService {
    admins: Arc<dyn AdminRepository>,
    tickets: Arc<dyn TicketRepository>,
    users: Arc<dyn UserRepository>,
    verifications: Arc<dyn sn_storage::VerificationRepository>,
    integrations: Arc<dyn IntegrationRepository>,
    engine: Arc<IntegrationEngine>,
    chat: Arc<dyn ChatService>,
    bus: Arc<EventBus>,
    group_id: i64,
    /// Bootstrap admins from configuration, unioned with the detected set.
    configured_admin_ids: Vec<ChatUserId>,
}

impl AdminService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        admins: Arc<dyn AdminRepository>,
        tickets: Arc<dyn TicketRepository>,
        users: Arc<dyn UserRepository>,
        verifications: Arc<dyn sn_storage::VerificationRepository>,
        integrations: Arc<dyn IntegrationRepository>,
        engine: Arc<IntegrationEngine>,
        chat: Arc<dyn ChatService>,
        bus: Arc<EventBus>,
        group_id: i64,
        configured_admin_ids: Vec<ChatUserId>,
    ) -> Self {
        Self {
            admins,
            tickets,
            users,
            verifications,
            integrations,
            engine,
            chat,
            bus,
            group_id,
            configured_admin_ids,
        }
    }

    /// Effective admin set: chat-detected union configured bootstrap list.
    pub async fn is_admin(&self, user_id: ChatUserId) -> Result<bool> {
        if self.configured_admin_ids.contains(&user_id) {
            if !self.admins.is_admin(user_id).await? {
                warn!(user_id = %user_id, "Configured admin absent from chat-detected set");
            }
            return Ok(true);
        }
        self.admins.is_admin(user_id).await
    }

    /// Refreshes the admin cache from the chat service. Runs every six
    /// hours and on demand.
    pub async fn sync_admins(&self) -> Result<usize> {
        let detected = self.chat.get_chat_administrators(self.group_id).await?;
        let now = Utc::now();
        let entries: Vec<AdminEntry> = detected
            .into_iter()
            .filter_map(|admin| {
                let role = AdminRole::from_str(&admin.status)?;
                Some(AdminEntry {
                    user_id: admin.user_id,
                    username: admin.username,
                    first_name: admin.first_name,
                    last_name: admin.last_name,
                    role,
                    detected_at: now,
                })
            })
            .collect();

        for configured in &self.configured_admin_ids {
            if !entries.iter().any(|e| e.user_id == *configured) {
                warn!(user_id = %configured, "Configured admin not detected in chat");
            }
        }

        let count = entries.len();
        self.admins.replace_all(&entries).await?;
        Ok(count)
    }

    pub async fn list_tickets(
        &self,
        admin_user_id: ChatUserId,
        filter: Option<TicketStatus>,
        limit: u32,
    ) -> Result<AdminCommandResult<Vec<TicketView>>> {
        if !self.is_admin(admin_user_id).await? {
            return Ok(AdminCommandResult::Forbidden);
        }
        let now = Utc::now();
        let tickets = self.tickets.find_recent(filter, limit).await?;
        Ok(AdminCommandResult::Ok(
            tickets.iter().map(|t| project(t, now)).collect(),
        ))
    }

    pub async fn assign_ticket(
        &self,
        admin_user_id: ChatUserId,
        ticket_id: TicketId,
        technician: &str,
        _notes: Option<&str>,
    ) -> Result<AdminCommandResult<TicketView>> {
        if !self.is_admin(admin_user_id).await? {
            return Ok(AdminCommandResult::Forbidden);
        }
        let Some(mut ticket) = self.tickets.find_by_id(ticket_id).await? else {
            return Ok(AdminCommandResult::NotFound);
        };

        if let Err(e) = ticket.assign(technician, admin_user_id) {
            return Ok(AdminCommandResult::Rejected(e.to_string()));
        }
        self.tickets.save(&mut ticket).await?;
        self.bus.publish_many(ticket.take_events()).await;
        self.push_status_upstream(&ticket).await;

        info!(ticket_id = %ticket_id, technician, "Ticket assigned");
        Ok(AdminCommandResult::Ok(project(&ticket, Utc::now())))
    }

    pub async fn update_ticket_status(
        &self,
        admin_user_id: ChatUserId,
        ticket_id: TicketId,
        new_status: TicketStatus,
        _reason: Option<&str>,
    ) -> Result<AdminCommandResult<TicketView>> {
        if !self.is_admin(admin_user_id).await? {
            return Ok(AdminCommandResult::Forbidden);
        }
        let Some(mut ticket) = self.tickets.find_by_id(ticket_id).await? else {
            return Ok(AdminCommandResult::NotFound);
        };

        if let Err(e) = ticket.change_status(new_status, Some(admin_user_id)) {
            return Ok(AdminCommandResult::Rejected(e.to_string()));
        }
        self.tickets.save(&mut ticket).await?;
        self.bus.publish_many(ticket.take_events()).await;
        self.push_status_upstream(&ticket).await;

        Ok(AdminCommandResult::Ok(project(&ticket, Utc::now())))
    }

    pub async fn ban_user(
        &self,
        admin_user_id: ChatUserId,
        target: ChatUserId,
        reason: &str,
    ) -> Result<AdminCommandResult<()>> {
        if !self.is_admin(admin_user_id).await? {
            return Ok(AdminCommandResult::Forbidden);
        }
        self.chat.ban_chat_member(self.group_id, target).await?;
        self.users.deactivate(target).await?;
        info!(target = %target, reason, "User banned");
        Ok(AdminCommandResult::Ok(()))
    }

    pub async fn get_system_stats(
        &self,
        admin_user_id: ChatUserId,
        since: Option<DateTime<Utc>>,
        _include_details: bool,
    ) -> Result<AdminCommandResult<SystemStats>> {
        if !self.is_admin(admin_user_id).await? {
            return Ok(AdminCommandResult::Forbidden);
        }

        let range_start = since.unwrap_or_else(|| Utc::now() - chrono::Duration::hours(24));
        let (verifications_succeeded, verifications_failed) =
            self.verifications.count_history_since(range_start).await?;
        let integration_counts = self.integrations.count_by_status(since).await?;

        let stats = SystemStats {
            active_users: self.users.count_active().await?,
            tickets_pending: self.tickets.count_by_status(TicketStatus::Pending).await?,
            tickets_open: self.tickets.count_by_status(TicketStatus::Open).await?,
            tickets_in_progress: self
                .tickets
                .count_by_status(TicketStatus::InProgress)
                .await?,
            tickets_resolved: self.tickets.count_by_status(TicketStatus::Resolved).await?,
            tickets_created_in_range: self.tickets.count_created_since(range_start).await?,
            verifications_succeeded,
            verifications_failed,
            integrations_by_status: {
                let mut counts: Vec<(String, i64)> =
                    integration_counts.by_status.into_iter().collect();
                counts.sort();
                counts
            },
        };
        Ok(AdminCommandResult::Ok(stats))
    }

    /// Items are processed independently; one failure never aborts the
    /// batch.
    pub async fn bulk_update_tickets(
        &self,
        admin_user_id: ChatUserId,
        ticket_ids: &[TicketId],
        action: BulkAction,
    ) -> Result<AdminCommandResult<Vec<BulkItemResult>>> {
        if !self.is_admin(admin_user_id).await? {
            return Ok(AdminCommandResult::Forbidden);
        }

        let mut results = Vec::with_capacity(ticket_ids.len());
        for ticket_id in ticket_ids {
            let result = match &action {
                BulkAction::UpdateStatus(status) => {
                    self.update_ticket_status(admin_user_id, *ticket_id, *status, None)
                        .await
                }
                BulkAction::Assign(technician) => {
                    self.assign_ticket(admin_user_id, *ticket_id, technician, None)
                        .await
                }
                BulkAction::Cancel => {
                    self.update_ticket_status(
                        admin_user_id,
                        *ticket_id,
                        TicketStatus::Cancelled,
                        None,
                    )
                    .await
                }
            };

            results.push(match result {
                Ok(AdminCommandResult::Ok(_)) => BulkItemResult {
                    ticket_id: *ticket_id,
                    ok: true,
                    message: None,
                },
                Ok(AdminCommandResult::NotFound) => BulkItemResult {
                    ticket_id: *ticket_id,
                    ok: false,
                    message: Some("ticket não encontrado".into()),
                },
                Ok(AdminCommandResult::Rejected(message)) => BulkItemResult {
                    ticket_id: *ticket_id,
                    ok: false,
                    message: Some(message),
                },
                Ok(AdminCommandResult::Forbidden) => BulkItemResult {
                    ticket_id: *ticket_id,
                    ok: false,
                    message: Some("não autorizado".into()),
                },
                Err(e) => BulkItemResult {
                    ticket_id: *ticket_id,
                    ok: false,
                    message: Some(e.to_string()),
                },
            });
        }
        Ok(AdminCommandResult::Ok(results))
    }

    /// Cancels a queued or running integration job. The job's in-flight
    /// attempt, if any, finishes but its result is discarded.
    pub async fn cancel_integration(
        &self,
        admin_user_id: ChatUserId,
        integration_id: &sn_domain::IntegrationId,
        reason: &str,
    ) -> Result<AdminCommandResult<()>> {
        if !self.is_admin(admin_user_id).await? {
            return Ok(AdminCommandResult::Forbidden);
        }
        match self.engine.cancel(integration_id, reason).await {
            Ok(()) => Ok(AdminCommandResult::Ok(())),
            Err(sn_engine::EngineError::NotFound(_)) => Ok(AdminCommandResult::NotFound),
            Err(sn_engine::EngineError::Domain(e)) => Ok(AdminCommandResult::Rejected(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Bumps a queued job's priority (operator escalation).
    pub async fn boost_integration(
        &self,
        admin_user_id: ChatUserId,
        integration_id: &sn_domain::IntegrationId,
        priority: sn_domain::IntegrationPriority,
        reason: &str,
    ) -> Result<AdminCommandResult<()>> {
        if !self.is_admin(admin_user_id).await? {
            return Ok(AdminCommandResult::Forbidden);
        }
        match self.engine.update_priority(integration_id, priority, reason).await {
            Ok(()) => Ok(AdminCommandResult::Ok(())),
            Err(sn_engine::EngineError::NotFound(_)) => Ok(AdminCommandResult::NotFound),
            Err(sn_engine::EngineError::Domain(e)) => Ok(AdminCommandResult::Rejected(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Synced tickets get their admin-made changes pushed upstream through
    /// the queue; failures only log.
    async fn push_status_upstream(&self, ticket: &sn_domain::Ticket) {
        if ticket.hubsoft_ticket_id.is_none() {
            return;
        }
        if let Err(e) = self
            .engine
            .schedule(
                IntegrationPayload::TicketSync {
                    ticket_id: ticket.id,
                    sync_type: TicketSyncKind::StatusChange,
                },
                IntegrationPriority::Normal,
            )
            .await
        {
            warn!(ticket_id = %ticket.id, error = %e, "Status push enqueue failed");
        }
    }
}

fn project(ticket: &sn_domain::Ticket, now: DateTime<Utc>) -> TicketView {
    TicketView {
        ticket_id: ticket.id,
        protocol: ticket.display_protocol(),
        category_label: ticket.category.label_pt().to_string(),
        game_label: ticket.game.label_pt(),
        status_name: ticket.status.display_pt().to_string(),
        urgency: ticket.urgency,
        days_open: ticket.days_open(now),
        created_at: ticket.created_at,
    }
}
