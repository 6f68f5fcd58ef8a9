//! Core domain for Sentinela: typed identifiers, the ticket, verification
//! and integration aggregates, and the domain event catalogue.
//!
//! This crate is persistence-free. Repositories live in `sn-storage`, the
//! event bus in `sn-events`.

pub mod cpf;
pub mod error;
pub mod events;
pub mod integration;
pub mod invite;
pub mod logging;
pub mod protocol;
pub mod ticket;
pub mod user;
pub mod verification;

pub use cpf::{mask_cpf, Cpf};
pub use error::DomainError;
pub use events::DomainEvent;
pub use integration::{
    IntegrationAttempt, IntegrationId, IntegrationPayload, IntegrationPriority,
    IntegrationRequest, IntegrationStatus, IntegrationType, TicketSyncKind,
};
pub use invite::GroupInvite;
pub use protocol::Protocol;
pub use ticket::{
    AffectedGame, NewTicket, ProblemTiming, SyncStatus, Ticket, TicketCategory, TicketStatus,
    Urgency, MAX_ATTACHMENTS,
};
pub use user::{AdminEntry, AdminRole, ChatUserId, User};
pub use verification::{
    Verification, VerificationId, VerificationStatus, VerificationType, MAX_VERIFICATION_ATTEMPTS,
};

/// Locally generated ticket identifier (SQLite rowid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub i64);

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
