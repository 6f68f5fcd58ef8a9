//! Support intake and ticket lifecycle.
//!
//! The conversation itself is the adapter's problem; this service receives
//! only the completed command, enforces the access gate and the one-active-
//! ticket rule, persists the aggregate, and routes the sync job through the
//! engine.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use sn_domain::events::TicketCreated;
use sn_domain::{
    AffectedGame, ChatUserId, IntegrationPayload, IntegrationPriority, NewTicket, ProblemTiming,
    Ticket, TicketCategory, TicketId, TicketSyncKind, Urgency,
};
use sn_engine::IntegrationEngine;
use sn_events::EventBus;
use sn_storage::TicketRepository;

use crate::access::AccessGate;

#[derive(Debug, Clone)]
pub struct CreateTicketCommand {
    pub user_id: ChatUserId,
    pub category: TicketCategory,
    pub game: AffectedGame,
    pub timing: ProblemTiming,
    pub description: String,
    pub attachments: Vec<String>,
    pub thread_id: Option<i64>,
}

#[derive(Debug)]
pub enum CreateTicketOutcome {
    Created {
        ticket_id: TicketId,
        local_protocol: String,
        /// Best-known upstream protocol; `None` until the sync job lands.
        hubsoft_protocol: Option<String>,
        /// True when the sync job could not even be queued.
        sync_deferred: bool,
    },
    /// The active-ticket invariant refused the intake.
    ActiveTicketExists {
        local_protocol: String,
        category_label: String,
        status_name: String,
    },
    NotVerified,
    InvalidDescription {
        message: String,
    },
}

/// Read model for ticket listings.
#[derive(Debug, Clone)]
pub struct TicketView {
    pub ticket_id: TicketId,
    pub protocol: String,
    pub category_label: String,
    pub game_label: String,
    pub status_name: String,
    pub urgency: Urgency,
    pub days_open: i64,
    pub created_at: chrono::DateTime<Utc>,
}

impl TicketView {
    fn project(ticket: &Ticket, now: chrono::DateTime<Utc>) -> Self {
        Self {
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
}

pub struct SupportService {
    tickets: Arc<dyn TicketRepository>,
    gate: Arc<AccessGate>,
    engine: Arc<IntegrationEngine>,
    bus: Arc<EventBus>,
}

impl SupportService {
    pub fn new(
        tickets: Arc<dyn TicketRepository>,
        gate: Arc<AccessGate>,
        engine: Arc<IntegrationEngine>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            tickets,
            gate,
            engine,
            bus,
        }
    }

    /// Pre-intake check used by the adapter before opening the form: either
    /// the user may proceed, or the blocking condition to report.
    pub async fn check_intake_allowed(
        &self,
        user_id: ChatUserId,
    ) -> Result<Option<CreateTicketOutcome>> {
        if self.gate.verified_user(user_id).await?.is_none() {
            return Ok(Some(CreateTicketOutcome::NotVerified));
        }
        if let Some(active) = self.tickets.find_active_by_user(user_id).await? {
            return Ok(Some(active_ticket_outcome(&active)));
        }
        Ok(None)
    }

    pub async fn create_ticket(&self, command: CreateTicketCommand) -> Result<CreateTicketOutcome> {
        if self.gate.verified_user(command.user_id).await?.is_none() {
            return Ok(CreateTicketOutcome::NotVerified);
        }

        // Active-ticket invariant, re-checked at submission time.
        if let Some(active) = self.tickets.find_active_by_user(command.user_id).await? {
            info!(user_id = %command.user_id, active = %active.id, "Intake refused: active ticket");
            return Ok(active_ticket_outcome(&active));
        }

        let new = match NewTicket::create(
            command.user_id,
            command.category,
            command.game,
            command.timing,
            command.description,
            command.attachments,
            command.thread_id,
        ) {
            Ok(new) => new,
            Err(e) => {
                return Ok(CreateTicketOutcome::InvalidDescription {
                    message: e.to_string(),
                })
            }
        };

        let ticket = self.tickets.insert(new).await?;
        self.bus
            .publish(&TicketCreated {
                ticket_id: ticket.id,
                user_id: ticket.user_id,
                category: ticket.category,
                urgency: ticket.urgency,
                local_protocol: ticket.local_protocol().to_string(),
            })
            .await;

        // Healthy upstream gets the sync at HIGH priority; a down upstream
        // still gets the job, which queues until recovery.
        let priority = if self.engine.is_upstream_healthy() {
            IntegrationPriority::High
        } else {
            IntegrationPriority::Normal
        };
        let sync_deferred = match self
            .engine
            .schedule(
                IntegrationPayload::TicketSync {
                    ticket_id: ticket.id,
                    sync_type: TicketSyncKind::Create,
                },
                priority,
            )
            .await
        {
            Ok(_) => false,
            Err(e) => {
                warn!(ticket_id = %ticket.id, error = %e, "Sync enqueue failed; ticket stays local");
                true
            }
        };

        info!(ticket_id = %ticket.id, protocol = %ticket.local_protocol(), "Ticket created");
        Ok(CreateTicketOutcome::Created {
            ticket_id: ticket.id,
            local_protocol: ticket.local_protocol().to_string(),
            hubsoft_protocol: None,
            sync_deferred,
        })
    }

    pub async fn list_tickets(&self, user_id: ChatUserId, limit: u32) -> Result<Vec<TicketView>> {
        let now = Utc::now();
        Ok(self
            .tickets
            .find_by_user(user_id, limit)
            .await?
            .iter()
            .map(|t| TicketView::project(t, now))
            .collect())
    }

    pub async fn get_active_ticket(&self, user_id: ChatUserId) -> Result<Option<TicketView>> {
        let now = Utc::now();
        Ok(self
            .tickets
            .find_active_by_user(user_id)
            .await?
            .map(|t| TicketView::project(&t, now)))
    }
}

fn active_ticket_outcome(active: &Ticket) -> CreateTicketOutcome {
    CreateTicketOutcome::ActiveTicketExists {
        local_protocol: active.local_protocol().to_string(),
        category_label: active.category.label_pt().to_string(),
        status_name: active.status.display_pt().to_string(),
    }
}
