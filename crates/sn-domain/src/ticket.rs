use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::events::{DomainEvent, HubSoftTicketSynced, TicketAssigned, TicketStatusChanged};
use crate::integration::TicketSyncKind;
use crate::protocol::Protocol;
use crate::user::ChatUserId;
use crate::TicketId;

pub const MAX_ATTACHMENTS: usize = 3;
pub const DESCRIPTION_MIN: usize = 10;
pub const DESCRIPTION_MAX: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketCategory {
    Connectivity,
    Performance,
    GameIssues,
    Configuration,
    Others,
}

impl TicketCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketCategory::Connectivity => "connectivity",
            TicketCategory::Performance => "performance",
            TicketCategory::GameIssues => "game_issues",
            TicketCategory::Configuration => "configuration",
            TicketCategory::Others => "others",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "connectivity" => Some(TicketCategory::Connectivity),
            "performance" => Some(TicketCategory::Performance),
            "game_issues" => Some(TicketCategory::GameIssues),
            "configuration" => Some(TicketCategory::Configuration),
            "others" => Some(TicketCategory::Others),
            _ => None,
        }
    }

    pub fn label_pt(&self) -> &'static str {
        match self {
            TicketCategory::Connectivity => "Conectividade/Ping",
            TicketCategory::Performance => "Performance em Jogos",
            TicketCategory::GameIssues => "Problema em Jogo",
            TicketCategory::Configuration => "Configuração/Otimização",
            TicketCategory::Others => "Outro",
        }
    }
}

/// Game reported in the intake form. Free text is allowed through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffectedGame {
    Valorant,
    Cs2,
    Lol,
    Fortnite,
    Apex,
    Overwatch,
    MobileLegends,
    Dota2,
    AllGames,
    Other(String),
}

impl AffectedGame {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "valorant" => Some(AffectedGame::Valorant),
            "cs2" => Some(AffectedGame::Cs2),
            "lol" => Some(AffectedGame::Lol),
            "fortnite" => Some(AffectedGame::Fortnite),
            "apex" => Some(AffectedGame::Apex),
            "overwatch" => Some(AffectedGame::Overwatch),
            "mobile_legends" => Some(AffectedGame::MobileLegends),
            "dota2" => Some(AffectedGame::Dota2),
            "all_games" => Some(AffectedGame::AllGames),
            _ => None,
        }
    }

    pub fn as_key(&self) -> &str {
        match self {
            AffectedGame::Valorant => "valorant",
            AffectedGame::Cs2 => "cs2",
            AffectedGame::Lol => "lol",
            AffectedGame::Fortnite => "fortnite",
            AffectedGame::Apex => "apex",
            AffectedGame::Overwatch => "overwatch",
            AffectedGame::MobileLegends => "mobile_legends",
            AffectedGame::Dota2 => "dota2",
            AffectedGame::AllGames => "all_games",
            AffectedGame::Other(name) => name,
        }
    }

    pub fn label_pt(&self) -> String {
        match self {
            AffectedGame::Valorant => "Valorant".into(),
            AffectedGame::Cs2 => "Counter-Strike 2".into(),
            AffectedGame::Lol => "League of Legends".into(),
            AffectedGame::Fortnite => "Fortnite".into(),
            AffectedGame::Apex => "Apex Legends".into(),
            AffectedGame::Overwatch => "Overwatch 2".into(),
            AffectedGame::MobileLegends => "Mobile Legends".into(),
            AffectedGame::Dota2 => "Dota 2".into(),
            AffectedGame::AllGames => "Múltiplos Jogos".into(),
            AffectedGame::Other(name) => name.clone(),
        }
    }

    /// Competitive titles get bumped urgency on connectivity/performance
    /// problems.
    pub fn is_competitive(&self) -> bool {
        matches!(
            self,
            AffectedGame::Valorant
                | AffectedGame::Cs2
                | AffectedGame::Lol
                | AffectedGame::Overwatch
                | AffectedGame::Dota2
                | AffectedGame::Apex
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemTiming {
    Now,
    Yesterday,
    ThisWeek,
    LastWeek,
    LongTime,
    Always,
}

impl ProblemTiming {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemTiming::Now => "now",
            ProblemTiming::Yesterday => "yesterday",
            ProblemTiming::ThisWeek => "this_week",
            ProblemTiming::LastWeek => "last_week",
            ProblemTiming::LongTime => "long_time",
            ProblemTiming::Always => "always",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "now" => Some(ProblemTiming::Now),
            "yesterday" => Some(ProblemTiming::Yesterday),
            "this_week" => Some(ProblemTiming::ThisWeek),
            "last_week" => Some(ProblemTiming::LastWeek),
            "long_time" => Some(ProblemTiming::LongTime),
            "always" => Some(ProblemTiming::Always),
            _ => None,
        }
    }

    pub fn label_pt(&self) -> &'static str {
        match self {
            ProblemTiming::Now => "Agora mesmo",
            ProblemTiming::Yesterday => "Ontem",
            ProblemTiming::ThisWeek => "Esta semana",
            ProblemTiming::LastWeek => "Semana passada",
            ProblemTiming::LongTime => "Há mais tempo",
            ProblemTiming::Always => "Sempre foi assim",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Normal,
    Medium,
    High,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Normal => "normal",
            Urgency::Medium => "medium",
            Urgency::High => "high",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Urgency::Normal),
            "medium" => Some(Urgency::Medium),
            "high" => Some(Urgency::High),
            _ => None,
        }
    }

    /// Derivation rule: competitive connectivity problems are high,
    /// competitive performance problems are medium, everything else normal.
    pub fn derive(category: TicketCategory, game: &AffectedGame) -> Self {
        match category {
            TicketCategory::Connectivity if game.is_competitive() => Urgency::High,
            TicketCategory::Performance if game.is_competitive() => Urgency::Medium,
            _ => Urgency::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Pending,
    Open,
    InProgress,
    Resolved,
    Closed,
    Cancelled,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Pending => "PENDING",
            TicketStatus::Open => "OPEN",
            TicketStatus::InProgress => "IN_PROGRESS",
            TicketStatus::Resolved => "RESOLVED",
            TicketStatus::Closed => "CLOSED",
            TicketStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TicketStatus::Pending),
            "OPEN" => Some(TicketStatus::Open),
            "IN_PROGRESS" => Some(TicketStatus::InProgress),
            "RESOLVED" => Some(TicketStatus::Resolved),
            "CLOSED" => Some(TicketStatus::Closed),
            "CANCELLED" => Some(TicketStatus::Cancelled),
            _ => None,
        }
    }

    /// User-facing Portuguese name.
    pub fn display_pt(&self) -> &'static str {
        match self {
            TicketStatus::Pending => "Pendente",
            TicketStatus::Open => "Em Análise",
            TicketStatus::InProgress => "Em Andamento",
            TicketStatus::Resolved => "Resolvido",
            TicketStatus::Closed => "Fechado",
            TicketStatus::Cancelled => "Cancelado",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStatus::Closed | TicketStatus::Cancelled)
    }

    /// A user may hold at most one ticket in an active status.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TicketStatus::Pending | TicketStatus::Open | TicketStatus::InProgress
        )
    }

    /// The full transition table. Every status change goes through here.
    pub fn can_transition_to(&self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        matches!(
            (self, next),
            (Pending, Open)
                | (Pending, Cancelled)
                | (Open, InProgress)
                | (Open, Resolved)
                | (Open, Cancelled)
                | (InProgress, Resolved)
                | (InProgress, Open)
                | (InProgress, Cancelled)
                | (Resolved, Closed)
                | (Resolved, Open)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Correlated,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Correlated => "correlated",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "correlated" => Some(SyncStatus::Correlated),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// A ticket validated and ready for insertion. The repository assigns the id
/// and returns the full [`Ticket`].
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub user_id: ChatUserId,
    pub category: TicketCategory,
    pub game: AffectedGame,
    pub timing: ProblemTiming,
    pub description: String,
    pub attachments: Vec<String>,
    pub thread_id: Option<i64>,
    pub urgency: Urgency,
    pub status: TicketStatus,
    pub sync_status: SyncStatus,
}

impl NewTicket {
    pub fn create(
        user_id: ChatUserId,
        category: TicketCategory,
        game: AffectedGame,
        timing: ProblemTiming,
        description: String,
        attachments: Vec<String>,
        thread_id: Option<i64>,
    ) -> Result<Self, DomainError> {
        let len = description.chars().count();
        if len < DESCRIPTION_MIN || len > DESCRIPTION_MAX {
            return Err(DomainError::DescriptionOutOfBounds {
                len,
                min: DESCRIPTION_MIN,
                max: DESCRIPTION_MAX,
            });
        }
        if attachments.len() > MAX_ATTACHMENTS {
            return Err(DomainError::AttachmentLimitExceeded { max: MAX_ATTACHMENTS });
        }

        let urgency = Urgency::derive(category, &game);
        Ok(Self {
            user_id,
            category,
            game,
            timing,
            description,
            attachments,
            thread_id,
            urgency,
            status: TicketStatus::Pending,
            sync_status: SyncStatus::Pending,
        })
    }
}

/// Support ticket aggregate. Mutations validate the status machine and queue
/// domain events; callers persist first, then drain [`Ticket::take_events`].
#[derive(Debug, Clone)]
pub struct Ticket {
    pub id: TicketId,
    pub user_id: ChatUserId,
    pub category: TicketCategory,
    pub game: AffectedGame,
    pub timing: ProblemTiming,
    pub description: String,
    pub attachments: Vec<String>,
    pub thread_id: Option<i64>,
    pub urgency: Urgency,
    pub status: TicketStatus,
    pub hubsoft_ticket_id: Option<String>,
    pub hubsoft_protocol: Option<String>,
    pub sync_status: SyncStatus,
    pub assigned_technician: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency version; bumped by the repository on save.
    pub version: i64,
    events: Vec<DomainEvent>,
}

impl Ticket {
    pub fn from_parts(
        id: TicketId,
        new: NewTicket,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        version: i64,
    ) -> Self {
        Self {
            id,
            user_id: new.user_id,
            category: new.category,
            game: new.game,
            timing: new.timing,
            description: new.description,
            attachments: new.attachments,
            thread_id: new.thread_id,
            urgency: new.urgency,
            status: new.status,
            hubsoft_ticket_id: None,
            hubsoft_protocol: None,
            sync_status: new.sync_status,
            assigned_technician: None,
            created_at,
            updated_at,
            version,
            events: Vec::new(),
        }
    }

    /// Rehydrate from storage without touching the event queue.
    #[allow(clippy::too_many_arguments)]
    pub fn rehydrate(
        id: TicketId,
        user_id: ChatUserId,
        category: TicketCategory,
        game: AffectedGame,
        timing: ProblemTiming,
        description: String,
        attachments: Vec<String>,
        thread_id: Option<i64>,
        urgency: Urgency,
        status: TicketStatus,
        hubsoft_ticket_id: Option<String>,
        hubsoft_protocol: Option<String>,
        sync_status: SyncStatus,
        assigned_technician: Option<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        version: i64,
    ) -> Self {
        Self {
            id,
            user_id,
            category,
            game,
            timing,
            description,
            attachments,
            thread_id,
            urgency,
            status,
            hubsoft_ticket_id,
            hubsoft_protocol,
            sync_status,
            assigned_technician,
            created_at,
            updated_at,
            version,
            events: Vec::new(),
        }
    }

    pub fn local_protocol(&self) -> Protocol {
        Protocol::local(self.id)
    }

    /// The protocol shown to the user: upstream once synced, local otherwise.
    pub fn display_protocol(&self) -> String {
        match &self.hubsoft_protocol {
            Some(p) => p.clone(),
            None => self.local_protocol().to_string(),
        }
    }

    /// Assigns a technician and moves the ticket to IN_PROGRESS.
    pub fn assign(&mut self, technician: &str, by_admin: ChatUserId) -> Result<(), DomainError> {
        if !matches!(self.status, TicketStatus::Pending | TicketStatus::Open) {
            return Err(DomainError::IllegalState(format!(
                "cannot assign ticket in status {}",
                self.status.as_str()
            )));
        }
        let from = self.status;
        self.status = TicketStatus::InProgress;
        self.assigned_technician = Some(technician.to_string());
        self.touch();
        self.events.push(DomainEvent::TicketAssigned(TicketAssigned {
            ticket_id: self.id,
            technician: technician.to_string(),
            by_admin,
        }));
        self.events
            .push(DomainEvent::TicketStatusChanged(TicketStatusChanged {
                ticket_id: self.id,
                from,
                to: TicketStatus::InProgress,
                by: Some(by_admin),
            }));
        Ok(())
    }

    pub fn change_status(
        &mut self,
        next: TicketStatus,
        by: Option<ChatUserId>,
    ) -> Result<(), DomainError> {
        if next == self.status {
            return Err(DomainError::IllegalState(format!(
                "ticket already in status {}",
                next.as_str()
            )));
        }
        if !self.status.can_transition_to(next) {
            return Err(DomainError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        let from = self.status;
        self.status = next;
        self.touch();
        self.events
            .push(DomainEvent::TicketStatusChanged(TicketStatusChanged {
                ticket_id: self.id,
                from,
                to: next,
                by,
            }));
        Ok(())
    }

    /// Admins may override the derived urgency.
    pub fn override_urgency(&mut self, urgency: Urgency) {
        self.urgency = urgency;
        self.touch();
    }

    /// Binds this ticket to its upstream atendimento.
    pub fn attach_hubsoft(
        &mut self,
        hubsoft_ticket_id: String,
        hubsoft_protocol: Option<String>,
        sync_status: SyncStatus,
        sync_kind: TicketSyncKind,
    ) {
        self.hubsoft_ticket_id = Some(hubsoft_ticket_id.clone());
        self.hubsoft_protocol = hubsoft_protocol.clone();
        self.sync_status = sync_status;
        self.touch();
        self.events
            .push(DomainEvent::HubSoftTicketSynced(HubSoftTicketSynced {
                ticket_id: self.id,
                hubsoft_ticket_id,
                hubsoft_protocol,
                sync_kind,
            }));
    }

    pub fn mark_sync_failed(&mut self) {
        self.sync_status = SyncStatus::Failed;
        self.touch();
    }

    pub fn days_open(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
