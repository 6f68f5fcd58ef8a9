use crate::ticket::TicketStatus;

/// Errors raised by aggregates and value-type constructors.
///
/// Use cases translate these into user-facing results; only storage and
/// illegal-state problems are allowed to propagate as hard errors.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("illegal ticket transition: {from:?} -> {to:?}")]
    IllegalTransition { from: TicketStatus, to: TicketStatus },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("description must have between {min} and {max} characters, got {len}")]
    DescriptionOutOfBounds { len: usize, min: usize, max: usize },

    #[error("attachment limit exceeded (max {max})")]
    AttachmentLimitExceeded { max: usize },
}

pub type Result<T> = std::result::Result<T, DomainError>;
