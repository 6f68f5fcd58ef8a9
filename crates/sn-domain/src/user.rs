use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cpf::Cpf;

/// Stable external account id from the chat system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatUserId(pub i64);

impl std::fmt::Display for ChatUserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chat account known to the system. May exist without a CPF until the
/// first verification completes. At most one active user per CPF.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: ChatUserId,
    pub username: String,
    pub cpf: Option<Cpf>,
    pub client_name: Option<String>,
    pub service_name: Option<String>,
    pub service_status: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_verification: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_verified(&self) -> bool {
        self.is_active && self.cpf.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminRole {
    Owner,
    Administrator,
}

impl AdminRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminRole::Owner => "owner",
            AdminRole::Administrator => "administrator",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" | "creator" => Some(AdminRole::Owner),
            "administrator" => Some(AdminRole::Administrator),
            _ => None,
        }
    }
}

/// Entry in the administrator cache, refreshed from the chat service.
#[derive(Debug, Clone, PartialEq)]
pub struct AdminEntry {
    pub user_id: ChatUserId,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub role: AdminRole,
    pub detected_at: DateTime<Utc>,
}
