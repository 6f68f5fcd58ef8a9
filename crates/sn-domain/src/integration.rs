use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::cpf::Cpf;
use crate::error::DomainError;
use crate::events::{
    DomainEvent, IntegrationAttemptMade, IntegrationCancelled, IntegrationCompleted,
    IntegrationFailed, IntegrationPriorityChanged, IntegrationRetryScheduled,
    IntegrationScheduled, IntegrationStarted,
};
use crate::ticket::TicketStatus;
use crate::TicketId;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

const BASE_RETRY_DELAY_SECS: u64 = 60;
const MAX_RETRY_DELAY_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntegrationId(pub String);

impl IntegrationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for IntegrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationType {
    TicketSync,
    UserVerification,
    ClientDataFetch,
    StatusUpdate,
    BulkSync,
}

impl IntegrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationType::TicketSync => "ticket_sync",
            IntegrationType::UserVerification => "user_verification",
            IntegrationType::ClientDataFetch => "client_data_fetch",
            IntegrationType::StatusUpdate => "status_update",
            IntegrationType::BulkSync => "bulk_sync",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ticket_sync" => Some(IntegrationType::TicketSync),
            "user_verification" => Some(IntegrationType::UserVerification),
            "client_data_fetch" => Some(IntegrationType::ClientDataFetch),
            "status_update" => Some(IntegrationType::StatusUpdate),
            "bulk_sync" => Some(IntegrationType::BulkSync),
            _ => None,
        }
    }
}

/// Queue ordering is priority first, then scheduled time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl IntegrationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationPriority::Low => "low",
            IntegrationPriority::Normal => "normal",
            IntegrationPriority::High => "high",
            IntegrationPriority::Urgent => "urgent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(IntegrationPriority::Low),
            "normal" => Some(IntegrationPriority::Normal),
            "high" => Some(IntegrationPriority::High),
            "urgent" => Some(IntegrationPriority::Urgent),
            _ => None,
        }
    }

    /// Numeric rank for priority-then-time SQL ordering (higher runs first).
    pub fn rank(&self) -> i64 {
        match self {
            IntegrationPriority::Low => 0,
            IntegrationPriority::Normal => 1,
            IntegrationPriority::High => 2,
            IntegrationPriority::Urgent => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RetryScheduled,
    Cancelled,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationStatus::Pending => "PENDING",
            IntegrationStatus::InProgress => "IN_PROGRESS",
            IntegrationStatus::Completed => "COMPLETED",
            IntegrationStatus::Failed => "FAILED",
            IntegrationStatus::RetryScheduled => "RETRY_SCHEDULED",
            IntegrationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(IntegrationStatus::Pending),
            "IN_PROGRESS" => Some(IntegrationStatus::InProgress),
            "COMPLETED" => Some(IntegrationStatus::Completed),
            "FAILED" => Some(IntegrationStatus::Failed),
            "RETRY_SCHEDULED" => Some(IntegrationStatus::RetryScheduled),
            "CANCELLED" => Some(IntegrationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntegrationStatus::Completed | IntegrationStatus::Failed | IntegrationStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketSyncKind {
    Create,
    Update,
    StatusChange,
}

impl TicketSyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketSyncKind::Create => "create",
            TicketSyncKind::Update => "update",
            TicketSyncKind::StatusChange => "status_change",
        }
    }
}

/// Typed job payload, one variant per integration type. The untyped JSON
/// form exists only at the storage boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntegrationPayload {
    TicketSync {
        ticket_id: TicketId,
        sync_type: TicketSyncKind,
    },
    UserVerification {
        cpf: Cpf,
        include_contracts: bool,
        #[serde(default)]
        cache_ttl_secs: Option<u64>,
        #[serde(default)]
        force_refresh: bool,
    },
    ClientDataFetch {
        cpf: Cpf,
        #[serde(default)]
        include_tickets: bool,
        #[serde(default)]
        include_billing: bool,
    },
    StatusUpdate {
        ticket_id: TicketId,
        new_status: TicketStatus,
    },
    /// Chat-side membership revocation retried through the queue when the
    /// chat service is unavailable. Not an upstream call; grouped with
    /// STATUS_UPDATE for queue accounting.
    MembershipRevocation {
        user_id: crate::user::ChatUserId,
        reason: String,
    },
    BulkSync {
        ticket_ids: Vec<TicketId>,
        batch_size: usize,
        delay_between_batches_secs: u64,
    },
}

impl IntegrationPayload {
    pub fn kind(&self) -> IntegrationType {
        match self {
            IntegrationPayload::TicketSync { .. } => IntegrationType::TicketSync,
            IntegrationPayload::UserVerification { .. } => IntegrationType::UserVerification,
            IntegrationPayload::ClientDataFetch { .. } => IntegrationType::ClientDataFetch,
            IntegrationPayload::StatusUpdate { .. } => IntegrationType::StatusUpdate,
            IntegrationPayload::MembershipRevocation { .. } => IntegrationType::StatusUpdate,
            IntegrationPayload::BulkSync { .. } => IntegrationType::BulkSync,
        }
    }

    /// Schedule-time validation, before anything is persisted.
    pub fn validate(&self) -> Result<(), DomainError> {
        match self {
            IntegrationPayload::BulkSync {
                ticket_ids,
                batch_size,
                ..
            } => {
                if ticket_ids.is_empty() {
                    return Err(DomainError::InvalidValue("bulk sync with no tickets".into()));
                }
                if *batch_size == 0 {
                    return Err(DomainError::InvalidValue("bulk sync batch size of zero".into()));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// One execution attempt against the upstream API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationAttempt {
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
    pub response_data: Option<serde_json::Value>,
    pub duration_ms: Option<u64>,
}

/// Exponential backoff, saturating at one hour. Never zero.
pub fn retry_delay_secs(attempt_count: u32) -> u64 {
    let factor = 1u64 << attempt_count.min(6);
    (BASE_RETRY_DELAY_SECS.saturating_mul(factor)).min(MAX_RETRY_DELAY_SECS)
}

/// Durable integration job aggregate. The engine owns scheduling and
/// execution; this type owns the state machine and attempt history.
#[derive(Debug, Clone)]
pub struct IntegrationRequest {
    pub id: IntegrationId,
    pub payload: IntegrationPayload,
    pub priority: IntegrationPriority,
    pub status: IntegrationStatus,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub attempts: Vec<IntegrationAttempt>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub hubsoft_response: Option<serde_json::Value>,
    pub error_details: Option<serde_json::Value>,
    events: Vec<DomainEvent>,
}

impl IntegrationRequest {
    pub fn new(payload: IntegrationPayload, priority: IntegrationPriority) -> Result<Self, DomainError> {
        payload.validate()?;
        // Bulk jobs legitimately run for many minutes (chunk waits, rate
        // limit pauses); orphan detection keys off this timeout.
        let timeout_seconds = match &payload {
            IntegrationPayload::BulkSync { .. } => 2 * 3600,
            _ => DEFAULT_TIMEOUT_SECONDS,
        };
        Ok(Self {
            id: IntegrationId::generate(),
            payload,
            priority,
            status: IntegrationStatus::Pending,
            metadata: serde_json::Map::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_seconds,
            attempts: Vec::new(),
            scheduled_at: None,
            next_attempt_at: None,
            started_at: None,
            completed_at: None,
            hubsoft_response: None,
            error_details: None,
            events: Vec::new(),
        })
    }

    /// Rehydrate from storage without touching the event queue.
    #[allow(clippy::too_many_arguments)]
    pub fn rehydrate(
        id: IntegrationId,
        payload: IntegrationPayload,
        priority: IntegrationPriority,
        status: IntegrationStatus,
        metadata: serde_json::Map<String, serde_json::Value>,
        max_retries: u32,
        timeout_seconds: u64,
        attempts: Vec<IntegrationAttempt>,
        scheduled_at: Option<DateTime<Utc>>,
        next_attempt_at: Option<DateTime<Utc>>,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        hubsoft_response: Option<serde_json::Value>,
        error_details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id,
            payload,
            priority,
            status,
            metadata,
            max_retries,
            timeout_seconds,
            attempts,
            scheduled_at,
            next_attempt_at,
            started_at,
            completed_at,
            hubsoft_response,
            error_details,
            events: Vec::new(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn integration_type(&self) -> IntegrationType {
        self.payload.kind()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn can_retry(&self) -> bool {
        matches!(
            self.status,
            IntegrationStatus::Failed | IntegrationStatus::RetryScheduled
        ) && self.attempt_count() < self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::seconds(retry_delay_secs(self.attempt_count()) as i64)
    }

    pub fn schedule(&mut self, at: Option<DateTime<Utc>>) -> Result<(), DomainError> {
        if self.status != IntegrationStatus::Pending {
            return Err(DomainError::IllegalState(format!(
                "cannot schedule integration in status {}",
                self.status.as_str()
            )));
        }
        let scheduled_at = at.unwrap_or_else(Utc::now);
        self.scheduled_at = Some(scheduled_at);
        self.next_attempt_at = Some(scheduled_at);
        self.events
            .push(DomainEvent::IntegrationScheduled(IntegrationScheduled {
                integration_id: self.id.clone(),
                integration_type: self.integration_type(),
                priority: self.priority,
                scheduled_at,
            }));
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), DomainError> {
        if !matches!(
            self.status,
            IntegrationStatus::Pending | IntegrationStatus::RetryScheduled
        ) {
            return Err(DomainError::IllegalState(format!(
                "cannot start integration in status {}",
                self.status.as_str()
            )));
        }
        self.status = IntegrationStatus::InProgress;
        self.started_at = Some(Utc::now());
        self.events
            .push(DomainEvent::IntegrationStarted(IntegrationStarted {
                integration_id: self.id.clone(),
                integration_type: self.integration_type(),
                attempt_number: self.attempt_count() + 1,
            }));
        Ok(())
    }

    /// Appends an attempt and advances the state machine: success completes,
    /// failure classifies the error and either schedules a retry or fails
    /// terminally.
    pub fn record_attempt(
        &mut self,
        success: bool,
        error_message: Option<String>,
        response_data: Option<serde_json::Value>,
        duration_ms: Option<u64>,
    ) -> Result<(), DomainError> {
        if self.status != IntegrationStatus::InProgress {
            return Err(DomainError::IllegalState(format!(
                "cannot record attempt in status {}",
                self.status.as_str()
            )));
        }
        if self.attempt_count() > self.max_retries {
            return Err(DomainError::IllegalState("attempt budget exhausted".into()));
        }

        self.attempts.push(IntegrationAttempt {
            attempted_at: Utc::now(),
            success,
            error_message: error_message.clone(),
            response_data: response_data.clone(),
            duration_ms,
        });
        self.events
            .push(DomainEvent::IntegrationAttemptMade(IntegrationAttemptMade {
                integration_id: self.id.clone(),
                integration_type: self.integration_type(),
                attempt_number: self.attempt_count(),
                success,
                error_message: error_message.clone(),
                duration_ms,
            }));

        if success {
            self.complete_with_success(response_data.unwrap_or(serde_json::Value::Null))
        } else {
            let message = error_message.unwrap_or_else(|| "unknown error".to_string());
            let retryable = is_retryable_error(&message);
            self.fail(&message, None, retryable)
        }
    }

    pub fn complete_with_success(&mut self, response: serde_json::Value) -> Result<(), DomainError> {
        if self.status != IntegrationStatus::InProgress {
            return Err(DomainError::IllegalState(format!(
                "cannot complete integration in status {}",
                self.status.as_str()
            )));
        }
        self.status = IntegrationStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.next_attempt_at = None;
        self.hubsoft_response = Some(response);
        self.events
            .push(DomainEvent::IntegrationCompleted(IntegrationCompleted {
                integration_id: self.id.clone(),
                integration_type: self.integration_type(),
                total_attempts: self.attempt_count(),
                duration_seconds: self.total_duration_secs(),
            }));
        Ok(())
    }

    /// Terminal failure, or a scheduled retry when the error is retryable
    /// and budget remains.
    pub fn fail(
        &mut self,
        error_message: &str,
        error_details: Option<serde_json::Value>,
        retryable: bool,
    ) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::IllegalState(format!(
                "cannot fail integration in terminal status {}",
                self.status.as_str()
            )));
        }

        if retryable && self.attempt_count() < self.max_retries {
            let delay = self.retry_delay();
            self.status = IntegrationStatus::RetryScheduled;
            self.next_attempt_at = Some(Utc::now() + delay);
            self.events
                .push(DomainEvent::IntegrationRetryScheduled(IntegrationRetryScheduled {
                    integration_id: self.id.clone(),
                    integration_type: self.integration_type(),
                    attempt_number: self.attempt_count(),
                    retry_delay_seconds: delay.num_seconds() as u64,
                    error_message: error_message.to_string(),
                }));
        } else {
            self.status = IntegrationStatus::Failed;
            self.completed_at = Some(Utc::now());
            self.next_attempt_at = None;
            self.error_details = error_details;
            self.events
                .push(DomainEvent::IntegrationFailed(IntegrationFailed {
                    integration_id: self.id.clone(),
                    integration_type: self.integration_type(),
                    total_attempts: self.attempt_count(),
                    final_error: error_message.to_string(),
                }));
        }
        Ok(())
    }

    /// Records a 429 attempt. The retry lands after the upstream-reported
    /// reset window instead of the exponential backoff.
    pub fn record_attempt_rate_limited(
        &mut self,
        reset: Duration,
        error_message: &str,
        duration_ms: Option<u64>,
    ) -> Result<(), DomainError> {
        if self.status != IntegrationStatus::InProgress {
            return Err(DomainError::IllegalState(format!(
                "cannot record attempt in status {}",
                self.status.as_str()
            )));
        }
        self.attempts.push(IntegrationAttempt {
            attempted_at: Utc::now(),
            success: false,
            error_message: Some(error_message.to_string()),
            response_data: None,
            duration_ms,
        });
        self.events
            .push(DomainEvent::IntegrationAttemptMade(IntegrationAttemptMade {
                integration_id: self.id.clone(),
                integration_type: self.integration_type(),
                attempt_number: self.attempt_count(),
                success: false,
                error_message: Some(error_message.to_string()),
                duration_ms,
            }));
        self.retry_after(reset, error_message)
    }

    /// Rate-limited attempts retry after the upstream-reported reset window
    /// instead of the exponential backoff.
    pub fn retry_after(&mut self, reset: Duration, error_message: &str) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::IllegalState(
                "cannot reschedule a finished integration".into(),
            ));
        }
        if self.attempt_count() >= self.max_retries {
            return self.fail(error_message, None, false);
        }
        self.status = IntegrationStatus::RetryScheduled;
        self.next_attempt_at = Some(Utc::now() + reset);
        self.events
            .push(DomainEvent::IntegrationRetryScheduled(IntegrationRetryScheduled {
                integration_id: self.id.clone(),
                integration_type: self.integration_type(),
                attempt_number: self.attempt_count(),
                retry_delay_seconds: reset.num_seconds().max(0) as u64,
                error_message: error_message.to_string(),
            }));
        Ok(())
    }

    pub fn cancel(&mut self, reason: &str) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::IllegalState(
                "cannot cancel a finished integration".into(),
            ));
        }
        self.status = IntegrationStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.next_attempt_at = None;
        self.events
            .push(DomainEvent::IntegrationCancelled(IntegrationCancelled {
                integration_id: self.id.clone(),
                integration_type: self.integration_type(),
                reason: reason.to_string(),
                attempts_made: self.attempt_count(),
            }));
        Ok(())
    }

    /// Priority changes are forbidden after termination and never reset the
    /// attempt count.
    pub fn update_priority(
        &mut self,
        new_priority: IntegrationPriority,
        reason: &str,
    ) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::IllegalState(
                "cannot change priority of a finished integration".into(),
            ));
        }
        let old = self.priority;
        self.priority = new_priority;
        self.events
            .push(DomainEvent::IntegrationPriorityChanged(IntegrationPriorityChanged {
                integration_id: self.id.clone(),
                old_priority: old,
                new_priority,
                reason: reason.to_string(),
            }));
        Ok(())
    }

    pub fn last_error(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find(|a| !a.success)
            .and_then(|a| a.error_message.as_deref())
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    fn total_duration_secs(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds().max(0) as u64),
            _ => None,
        }
    }
}

/// Keyword classification of attempt errors, for callers that only have a
/// message. Typed upstream errors are classified before they get here.
pub fn is_retryable_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    const RETRYABLE: &[&str] = &[
        "timeout",
        "connection",
        "rate limit",
        "server error",
        "temporary_unavailable",
        "503",
        "502",
        "504",
    ];
    RETRYABLE.iter().any(|pattern| lower.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request() -> IntegrationRequest {
        IntegrationRequest::new(
            IntegrationPayload::TicketSync {
                ticket_id: TicketId(1),
                sync_type: TicketSyncKind::Create,
            },
            IntegrationPriority::High,
        )
        .unwrap()
    }

    #[test]
    fn schedule_then_start_then_success() {
        let mut r = request();
        r.schedule(None).unwrap();
        assert!(r.scheduled_at.is_some());
        r.start().unwrap();
        assert_eq!(r.status, IntegrationStatus::InProgress);

        r.record_attempt(true, None, Some(serde_json::json!({"id": 9})), Some(120))
            .unwrap();
        assert_eq!(r.status, IntegrationStatus::Completed);
        assert_eq!(r.attempt_count(), 1);
        assert!(r.attempts.last().unwrap().success);
    }

    #[test]
    fn schedule_rejected_outside_pending() {
        let mut r = request();
        r.schedule(None).unwrap();
        r.start().unwrap();
        assert!(r.schedule(None).is_err());
    }

    #[test]
    fn retryable_failure_schedules_retry() {
        let mut r = request();
        r.schedule(None).unwrap();
        r.start().unwrap();
        r.record_attempt(false, Some("connection refused".into()), None, None)
            .unwrap();
        assert_eq!(r.status, IntegrationStatus::RetryScheduled);
        assert!(r.next_attempt_at.is_some());
        assert!(r.can_retry());
    }

    #[test]
    fn non_retryable_failure_terminates() {
        let mut r = request();
        r.schedule(None).unwrap();
        r.start().unwrap();
        r.record_attempt(false, Some("HTTP 404: not found".into()), None, None)
            .unwrap();
        assert_eq!(r.status, IntegrationStatus::Failed);
        assert!(!r.can_retry());
    }

    #[test]
    fn exhausted_retries_terminate() {
        let mut r = request();
        r.schedule(None).unwrap();
        for _ in 0..3 {
            r.start().unwrap();
            r.record_attempt(false, Some("timeout".into()), None, None)
                .unwrap();
        }
        assert_eq!(r.status, IntegrationStatus::Failed);
        assert_eq!(r.attempt_count(), 3);
        assert!(!r.can_retry());
        assert!(r.attempts.len() as u32 <= r.max_retries + 1);
    }

    #[test]
    fn terminal_statuses_reject_mutation() {
        let mut r = request();
        r.schedule(None).unwrap();
        r.start().unwrap();
        r.record_attempt(true, None, None, None).unwrap();
        assert!(r.cancel("nope").is_err());
        assert!(r.update_priority(IntegrationPriority::Urgent, "late").is_err());
        assert!(r.fail("late", None, true).is_err());
    }

    #[test]
    fn priority_upgrade_keeps_attempts() {
        let mut r = request();
        r.schedule(None).unwrap();
        r.start().unwrap();
        r.record_attempt(false, Some("timeout".into()), None, None)
            .unwrap();
        let attempts = r.attempt_count();
        r.update_priority(IntegrationPriority::Urgent, "operator bump").unwrap();
        assert_eq!(r.attempt_count(), attempts);
        assert_eq!(r.priority, IntegrationPriority::Urgent);
    }

    #[test]
    fn rate_limited_retry_uses_reset_window() {
        let mut r = request();
        r.schedule(None).unwrap();
        r.start().unwrap();
        r.attempts.push(IntegrationAttempt {
            attempted_at: Utc::now(),
            success: false,
            error_message: Some("HTTP 429".into()),
            response_data: None,
            duration_ms: None,
        });
        r.retry_after(Duration::seconds(60), "HTTP 429").unwrap();
        assert_eq!(r.status, IntegrationStatus::RetryScheduled);
        let delay = r.next_attempt_at.unwrap() - Utc::now();
        assert!(delay <= Duration::seconds(60));
    }

    #[test]
    fn bulk_payload_validation() {
        assert!(IntegrationRequest::new(
            IntegrationPayload::BulkSync {
                ticket_ids: vec![],
                batch_size: 10,
                delay_between_batches_secs: 2,
            },
            IntegrationPriority::Normal,
        )
        .is_err());
    }

    #[test]
    fn payload_round_trips_through_json() {
        let payload = IntegrationPayload::UserVerification {
            cpf: Cpf::parse("11144477735").unwrap(),
            include_contracts: true,
            cache_ttl_secs: Some(600),
            force_refresh: false,
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: IntegrationPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.kind(), IntegrationType::UserVerification);
    }

    proptest! {
        // Backoff law: min(60 * 2^k, 3600), never zero, never above an hour.
        #[test]
        fn retry_delay_law(k in 0u32..100) {
            let delay = retry_delay_secs(k);
            prop_assert!(delay >= 60);
            prop_assert!(delay <= 3600);
            let expected = if k >= 6 { 3600 } else { 60 * (1u64 << k) };
            prop_assert_eq!(delay, expected);
        }
    }
}
