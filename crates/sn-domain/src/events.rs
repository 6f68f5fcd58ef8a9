//! Domain event catalogue.
//!
//! Events are plain structs published through the `sn-events` bus after the
//! corresponding write has been made durable (write-ahead-then-publish).
//! Aggregates queue them internally; callers drain with `take_events()`.

use chrono::{DateTime, Utc};

use crate::integration::{IntegrationId, IntegrationPriority, IntegrationType, TicketSyncKind};
use crate::ticket::{TicketCategory, TicketStatus, Urgency};
use crate::user::ChatUserId;
use crate::verification::{VerificationId, VerificationType};
use crate::TicketId;

// ============================================================================
// Ticket events
// ============================================================================

#[derive(Debug, Clone)]
pub struct TicketCreated {
    pub ticket_id: TicketId,
    pub user_id: ChatUserId,
    pub category: TicketCategory,
    pub urgency: Urgency,
    pub local_protocol: String,
}

#[derive(Debug, Clone)]
pub struct TicketAssigned {
    pub ticket_id: TicketId,
    pub technician: String,
    pub by_admin: ChatUserId,
}

#[derive(Debug, Clone)]
pub struct TicketStatusChanged {
    pub ticket_id: TicketId,
    pub from: TicketStatus,
    pub to: TicketStatus,
    pub by: Option<ChatUserId>,
}

#[derive(Debug, Clone)]
pub struct HubSoftTicketSynced {
    pub ticket_id: TicketId,
    pub hubsoft_ticket_id: String,
    pub hubsoft_protocol: Option<String>,
    pub sync_kind: TicketSyncKind,
}

// ============================================================================
// Verification events
// ============================================================================

#[derive(Debug, Clone)]
pub struct VerificationStarted {
    pub verification_id: VerificationId,
    pub user_id: ChatUserId,
    pub verification_type: VerificationType,
}

#[derive(Debug, Clone)]
pub struct VerificationAttemptMade {
    pub verification_id: VerificationId,
    pub user_id: ChatUserId,
    pub attempt_number: u32,
    pub success: bool,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerificationCompleted {
    pub verification_id: VerificationId,
    pub user_id: ChatUserId,
    pub cpf_masked: String,
}

#[derive(Debug, Clone)]
pub struct VerificationFailed {
    pub verification_id: VerificationId,
    pub user_id: ChatUserId,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct VerificationExpired {
    pub verification_id: VerificationId,
    pub user_id: ChatUserId,
    pub verification_type: VerificationType,
}

#[derive(Debug, Clone)]
pub struct VerificationCancelled {
    pub verification_id: VerificationId,
    pub user_id: ChatUserId,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CpfValidated {
    pub user_id: ChatUserId,
    pub cpf_masked: String,
    pub client_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CpfDuplicateDetected {
    pub verification_id: VerificationId,
    pub user_id: ChatUserId,
    pub existing_user_id: ChatUserId,
    pub cpf_masked: String,
}

#[derive(Debug, Clone)]
pub struct CpfRemapped {
    pub old_user_id: ChatUserId,
    pub new_user_id: ChatUserId,
    pub cpf_masked: String,
    pub reason: String,
}

// ============================================================================
// Integration events
// ============================================================================

#[derive(Debug, Clone)]
pub struct IntegrationScheduled {
    pub integration_id: IntegrationId,
    pub integration_type: IntegrationType,
    pub priority: IntegrationPriority,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IntegrationStarted {
    pub integration_id: IntegrationId,
    pub integration_type: IntegrationType,
    pub attempt_number: u32,
}

#[derive(Debug, Clone)]
pub struct IntegrationAttemptMade {
    pub integration_id: IntegrationId,
    pub integration_type: IntegrationType,
    pub attempt_number: u32,
    pub success: bool,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct IntegrationCompleted {
    pub integration_id: IntegrationId,
    pub integration_type: IntegrationType,
    pub total_attempts: u32,
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct IntegrationFailed {
    pub integration_id: IntegrationId,
    pub integration_type: IntegrationType,
    pub total_attempts: u32,
    pub final_error: String,
}

#[derive(Debug, Clone)]
pub struct IntegrationRetryScheduled {
    pub integration_id: IntegrationId,
    pub integration_type: IntegrationType,
    pub attempt_number: u32,
    pub retry_delay_seconds: u64,
    pub error_message: String,
}

#[derive(Debug, Clone)]
pub struct IntegrationCancelled {
    pub integration_id: IntegrationId,
    pub integration_type: IntegrationType,
    pub reason: String,
    pub attempts_made: u32,
}

#[derive(Debug, Clone)]
pub struct IntegrationPriorityChanged {
    pub integration_id: IntegrationId,
    pub old_priority: IntegrationPriority,
    pub new_priority: IntegrationPriority,
    pub reason: String,
}

// ============================================================================
// Upstream connectivity events
// ============================================================================

#[derive(Debug, Clone)]
pub struct HubSoftRateLimitHit {
    pub reset_after_seconds: u64,
    pub affected_operations: u32,
}

#[derive(Debug, Clone)]
pub struct HubSoftConnectionRestored {
    pub downtime_seconds: u64,
    pub pending_operations: u64,
}

#[derive(Debug, Clone)]
pub struct HubSoftConnectionLost {
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HubSoftBulkSyncCompleted {
    pub batch_id: IntegrationId,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration_seconds: u64,
}

/// Closed set of everything the system publishes. Aggregates queue these;
/// the bus fans each variant out to the handlers registered for its
/// concrete event type.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    TicketCreated(TicketCreated),
    TicketAssigned(TicketAssigned),
    TicketStatusChanged(TicketStatusChanged),
    HubSoftTicketSynced(HubSoftTicketSynced),
    VerificationStarted(VerificationStarted),
    VerificationAttemptMade(VerificationAttemptMade),
    VerificationCompleted(VerificationCompleted),
    VerificationFailed(VerificationFailed),
    VerificationExpired(VerificationExpired),
    VerificationCancelled(VerificationCancelled),
    CpfValidated(CpfValidated),
    CpfDuplicateDetected(CpfDuplicateDetected),
    CpfRemapped(CpfRemapped),
    IntegrationScheduled(IntegrationScheduled),
    IntegrationStarted(IntegrationStarted),
    IntegrationAttemptMade(IntegrationAttemptMade),
    IntegrationCompleted(IntegrationCompleted),
    IntegrationFailed(IntegrationFailed),
    IntegrationRetryScheduled(IntegrationRetryScheduled),
    IntegrationCancelled(IntegrationCancelled),
    IntegrationPriorityChanged(IntegrationPriorityChanged),
    HubSoftRateLimitHit(HubSoftRateLimitHit),
    HubSoftConnectionRestored(HubSoftConnectionRestored),
    HubSoftConnectionLost(HubSoftConnectionLost),
    HubSoftBulkSyncCompleted(HubSoftBulkSyncCompleted),
}

impl DomainEvent {
    /// Short name for logs and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::TicketCreated(_) => "TicketCreated",
            DomainEvent::TicketAssigned(_) => "TicketAssigned",
            DomainEvent::TicketStatusChanged(_) => "TicketStatusChanged",
            DomainEvent::HubSoftTicketSynced(_) => "HubSoftTicketSynced",
            DomainEvent::VerificationStarted(_) => "VerificationStarted",
            DomainEvent::VerificationAttemptMade(_) => "VerificationAttemptMade",
            DomainEvent::VerificationCompleted(_) => "VerificationCompleted",
            DomainEvent::VerificationFailed(_) => "VerificationFailed",
            DomainEvent::VerificationExpired(_) => "VerificationExpired",
            DomainEvent::VerificationCancelled(_) => "VerificationCancelled",
            DomainEvent::CpfValidated(_) => "CPFValidated",
            DomainEvent::CpfDuplicateDetected(_) => "CPFDuplicateDetected",
            DomainEvent::CpfRemapped(_) => "CPFRemapped",
            DomainEvent::IntegrationScheduled(_) => "IntegrationScheduled",
            DomainEvent::IntegrationStarted(_) => "IntegrationStarted",
            DomainEvent::IntegrationAttemptMade(_) => "IntegrationAttemptMade",
            DomainEvent::IntegrationCompleted(_) => "IntegrationCompleted",
            DomainEvent::IntegrationFailed(_) => "IntegrationFailed",
            DomainEvent::IntegrationRetryScheduled(_) => "IntegrationRetryScheduled",
            DomainEvent::IntegrationCancelled(_) => "IntegrationCancelled",
            DomainEvent::IntegrationPriorityChanged(_) => "IntegrationPriorityChanged",
            DomainEvent::HubSoftRateLimitHit(_) => "HubSoftRateLimitHit",
            DomainEvent::HubSoftConnectionRestored(_) => "HubSoftConnectionRestored",
            DomainEvent::HubSoftConnectionLost(_) => "HubSoftConnectionLost",
            DomainEvent::HubSoftBulkSyncCompleted(_) => "HubSoftBulkSyncCompleted",
        }
    }
}
