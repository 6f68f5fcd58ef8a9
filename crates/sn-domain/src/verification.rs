use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::cpf::Cpf;
use crate::error::DomainError;
use crate::events::{
    DomainEvent, VerificationAttemptMade, VerificationCancelled, VerificationCompleted,
    VerificationExpired, VerificationFailed, VerificationStarted,
};
use crate::user::ChatUserId;

pub const MAX_VERIFICATION_ATTEMPTS: u32 = 3;
const EXPIRY_HOURS: i64 = 24;

/// Identity-check request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerificationId(pub String);

impl VerificationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for VerificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    AutoCheckup,
    SupportRequest,
    InitialRegistration,
}

impl VerificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationType::AutoCheckup => "auto_checkup",
            VerificationType::SupportRequest => "support_request",
            VerificationType::InitialRegistration => "initial_registration",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "auto_checkup" => Some(VerificationType::AutoCheckup),
            "support_request" => Some(VerificationType::SupportRequest),
            "initial_registration" => Some(VerificationType::InitialRegistration),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "PENDING",
            VerificationStatus::InProgress => "IN_PROGRESS",
            VerificationStatus::Completed => "COMPLETED",
            VerificationStatus::Failed => "FAILED",
            VerificationStatus::Expired => "EXPIRED",
            VerificationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(VerificationStatus::Pending),
            "IN_PROGRESS" => Some(VerificationStatus::InProgress),
            "COMPLETED" => Some(VerificationStatus::Completed),
            "FAILED" => Some(VerificationStatus::Failed),
            "EXPIRED" => Some(VerificationStatus::Expired),
            "CANCELLED" => Some(VerificationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerificationStatus::Completed
                | VerificationStatus::Failed
                | VerificationStatus::Expired
                | VerificationStatus::Cancelled
        )
    }
}

/// Per-user identity-check lifecycle. At most one non-terminal verification
/// exists per user; terminal states are immutable.
#[derive(Debug, Clone)]
pub struct Verification {
    pub id: VerificationId,
    pub user_id: ChatUserId,
    pub username: String,
    pub user_mention: String,
    pub verification_type: VerificationType,
    pub source_action: Option<String>,
    pub status: VerificationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub cpf_verified: Option<Cpf>,
    pub client_data: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    events: Vec<DomainEvent>,
}

impl Verification {
    pub fn start_new(
        user_id: ChatUserId,
        username: String,
        user_mention: String,
        verification_type: VerificationType,
        source_action: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = VerificationId::generate();
        let mut v = Self {
            id: id.clone(),
            user_id,
            username,
            user_mention,
            verification_type,
            source_action,
            status: VerificationStatus::Pending,
            created_at: now,
            expires_at: now + Duration::hours(EXPIRY_HOURS),
            started_at: None,
            completed_at: None,
            attempt_count: 0,
            max_attempts: MAX_VERIFICATION_ATTEMPTS,
            cpf_verified: None,
            client_data: None,
            failure_reason: None,
            events: Vec::new(),
        };
        v.events
            .push(DomainEvent::VerificationStarted(VerificationStarted {
                verification_id: id,
                user_id,
                verification_type,
            }));
        v
    }

    /// Rehydrate from storage without touching the event queue.
    #[allow(clippy::too_many_arguments)]
    pub fn rehydrate(
        id: VerificationId,
        user_id: ChatUserId,
        username: String,
        user_mention: String,
        verification_type: VerificationType,
        source_action: Option<String>,
        status: VerificationStatus,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        attempt_count: u32,
        cpf_verified: Option<Cpf>,
        client_data: Option<serde_json::Value>,
        failure_reason: Option<String>,
    ) -> Self {
        Self {
            id,
            user_id,
            username,
            user_mention,
            verification_type,
            source_action,
            status,
            created_at,
            expires_at,
            started_at,
            completed_at,
            attempt_count,
            max_attempts: MAX_VERIFICATION_ATTEMPTS,
            cpf_verified,
            client_data,
            failure_reason,
            events: Vec::new(),
        }
    }

    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    pub fn start(&mut self) -> Result<(), DomainError> {
        if self.status != VerificationStatus::Pending {
            return Err(DomainError::IllegalState(format!(
                "cannot start verification in status {}",
                self.status.as_str()
            )));
        }
        self.status = VerificationStatus::InProgress;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Records one attempt. A successful attempt needs the verified CPF and
    /// client snapshot and completes the verification; an exhausted failed
    /// attempt terminates it.
    pub fn record_attempt(
        &mut self,
        success: bool,
        cpf: Option<Cpf>,
        client_data: Option<serde_json::Value>,
        failure_reason: Option<String>,
    ) -> Result<(), DomainError> {
        self.ensure_not_terminal("record attempt on")?;
        if self.status == VerificationStatus::Pending {
            self.start()?;
        }
        if self.attempt_count >= self.max_attempts {
            return Err(DomainError::IllegalState("attempt budget exhausted".into()));
        }

        self.attempt_count += 1;
        self.events
            .push(DomainEvent::VerificationAttemptMade(VerificationAttemptMade {
                verification_id: self.id.clone(),
                user_id: self.user_id,
                attempt_number: self.attempt_count,
                success,
                failure_reason: failure_reason.clone(),
            }));

        if success {
            let cpf = cpf.ok_or_else(|| {
                DomainError::IllegalState("successful attempt without a verified CPF".into())
            })?;
            self.complete_with_success(cpf, client_data)
        } else if self.attempt_count >= self.max_attempts {
            self.fail("attempts_exhausted")
        } else {
            Ok(())
        }
    }

    /// Holds the CPF that triggered a duplicate-binding conflict while the
    /// verification waits for the user's resolution choice. Not a terminal
    /// transition; the verification stays IN_PROGRESS.
    pub fn record_conflict(&mut self, cpf: Cpf) -> Result<(), DomainError> {
        self.ensure_not_terminal("record conflict on")?;
        if self.status == VerificationStatus::Pending {
            self.start()?;
        }
        self.cpf_verified = Some(cpf);
        Ok(())
    }

    pub fn complete_with_success(
        &mut self,
        cpf: Cpf,
        client_data: Option<serde_json::Value>,
    ) -> Result<(), DomainError> {
        self.ensure_not_terminal("complete")?;
        self.status = VerificationStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.cpf_verified = Some(cpf.clone());
        self.client_data = client_data;
        self.events
            .push(DomainEvent::VerificationCompleted(VerificationCompleted {
                verification_id: self.id.clone(),
                user_id: self.user_id,
                cpf_masked: cpf.masked(),
            }));
        Ok(())
    }

    pub fn fail(&mut self, reason: &str) -> Result<(), DomainError> {
        self.ensure_not_terminal("fail")?;
        self.status = VerificationStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.failure_reason = Some(reason.to_string());
        self.events
            .push(DomainEvent::VerificationFailed(VerificationFailed {
                verification_id: self.id.clone(),
                user_id: self.user_id,
                reason: reason.to_string(),
            }));
        Ok(())
    }

    /// Expires the verification. A no-op error before the deadline.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.ensure_not_terminal("expire")?;
        if now < self.expires_at {
            return Err(DomainError::IllegalState(
                "verification has not reached its deadline".into(),
            ));
        }
        self.status = VerificationStatus::Expired;
        self.completed_at = Some(now);
        self.events
            .push(DomainEvent::VerificationExpired(VerificationExpired {
                verification_id: self.id.clone(),
                user_id: self.user_id,
                verification_type: self.verification_type,
            }));
        Ok(())
    }

    pub fn cancel(&mut self, reason: &str) -> Result<(), DomainError> {
        self.ensure_not_terminal("cancel")?;
        self.status = VerificationStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.failure_reason = Some(reason.to_string());
        self.events
            .push(DomainEvent::VerificationCancelled(VerificationCancelled {
                verification_id: self.id.clone(),
                user_id: self.user_id,
                reason: reason.to_string(),
            }));
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    fn ensure_not_terminal(&self, action: &str) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::IllegalState(format!(
                "cannot {action} verification in terminal status {}",
                self.status.as_str()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verification() -> Verification {
        Verification::start_new(
            ChatUserId(7001),
            "alice".into(),
            "@alice".into(),
            VerificationType::InitialRegistration,
            None,
            Utc::now(),
        )
    }

    #[test]
    fn start_new_is_pending_with_24h_deadline() {
        let now = Utc::now();
        let mut v = Verification::start_new(
            ChatUserId(1),
            "u".into(),
            "@u".into(),
            VerificationType::AutoCheckup,
            Some("daily_checkup".into()),
            now,
        );
        assert_eq!(v.status, VerificationStatus::Pending);
        assert_eq!(v.expires_at, now + Duration::hours(24));
        assert!(matches!(
            v.take_events().as_slice(),
            [DomainEvent::VerificationStarted(_)]
        ));
    }

    #[test]
    fn successful_attempt_completes() {
        let mut v = verification();
        v.take_events();
        let cpf = Cpf::parse("11144477735").unwrap();
        v.record_attempt(true, Some(cpf.clone()), None, None).unwrap();
        assert_eq!(v.status, VerificationStatus::Completed);
        assert_eq!(v.cpf_verified, Some(cpf));

        let events = v.take_events();
        assert!(matches!(events[0], DomainEvent::VerificationAttemptMade(_)));
        assert!(matches!(events[1], DomainEvent::VerificationCompleted(_)));
    }

    #[test]
    fn third_failed_attempt_exhausts() {
        let mut v = verification();
        v.take_events();
        for _ in 0..2 {
            v.record_attempt(false, None, None, Some("invalid_cpf_format".into()))
                .unwrap();
            assert_eq!(v.status, VerificationStatus::InProgress);
        }
        v.record_attempt(false, None, None, Some("invalid_cpf_format".into()))
            .unwrap();
        assert_eq!(v.status, VerificationStatus::Failed);
        assert_eq!(v.failure_reason.as_deref(), Some("attempts_exhausted"));

        let failed: Vec<_> = v
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, DomainEvent::VerificationFailed(_)))
            .collect();
        assert_eq!(failed.len(), 1);
    }

    #[test]
    fn terminal_states_are_immutable() {
        let mut v = verification();
        v.fail("cpf_not_found").unwrap();
        assert!(v.record_attempt(false, None, None, None).is_err());
        assert!(v.cancel("later").is_err());
        assert!(v.expire(Utc::now() + Duration::hours(48)).is_err());
        assert!(v
            .complete_with_success(Cpf::parse("11144477735").unwrap(), None)
            .is_err());
    }

    #[test]
    fn expire_only_after_deadline() {
        let mut v = verification();
        assert!(v.expire(Utc::now()).is_err());
        assert!(v.expire(v.expires_at + Duration::seconds(1)).is_ok());
        assert_eq!(v.status, VerificationStatus::Expired);
    }

    #[test]
    fn cancel_records_reason() {
        let mut v = verification();
        v.cancel("superseded").unwrap();
        assert_eq!(v.status, VerificationStatus::Cancelled);
        assert_eq!(v.failure_reason.as_deref(), Some("superseded"));
    }
}
