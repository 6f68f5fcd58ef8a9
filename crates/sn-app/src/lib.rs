//! Application layer: the use cases behind the chat adapter.
//!
//! Conflicts and gate refusals are returned as typed outcome variants, not
//! errors; hard errors are reserved for storage failures and programming
//! mistakes. Every use case publishes its domain events only after the
//! corresponding write is durable.

pub mod access;
pub mod admin;
pub mod chat;
pub mod invites;
pub mod support;
pub mod verification;

pub use access::AccessGate;
pub use admin::{AdminCommandResult, AdminService, BulkAction, BulkItemResult, SystemStats};
pub use chat::{Button, ChatAdmin, ChatMemberStatus, ChatService, Keyboard};
pub use invites::InviteService;
pub use support::{
    CreateTicketCommand, CreateTicketOutcome, SupportService, TicketView,
};
pub use verification::{RemapOutcome, SubmitCpfOutcome, VerificationService};
