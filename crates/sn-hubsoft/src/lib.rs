//! HubSoft integration surface: the typed REST client, the process-wide
//! OAuth token cache, and the TTL lookup cache. Constructed once at startup
//! and handed around by `Arc` — no globals.

pub mod cache;
pub mod client;
pub mod error;
pub mod token;
pub mod types;

pub use cache::{ApiCache, CacheCategory, CacheStats, NEGATIVE_TTL};
pub use client::{CreatedTicket, HubSoftClient, MAX_STATUS_PAGES, STATUS_PAGE_SIZE};
pub use error::HubSoftError;
pub use token::TokenManager;
pub use types::{
    is_success, Atendimento, ClientInfo, CreateAtendimentoRequest, PaginatedAtendimentos,
    ServiceInfo,
};
