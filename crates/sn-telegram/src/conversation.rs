//! Per-user support intake conversation state.
//!
//! Held in memory with a short TTL; the domain only ever sees the completed
//! command. Abandoned conversations are swept, not persisted.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use sn_app::CreateTicketCommand;
use sn_domain::{
    AffectedGame, ChatUserId, ProblemTiming, TicketCategory, MAX_ATTACHMENTS,
};

pub const DESCRIPTION_MIN: usize = 10;
pub const DESCRIPTION_MAX: usize = 500;
const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStep {
    Category,
    Game,
    /// Free-text game name after picking "other".
    GameFreeText,
    Timing,
    Description,
    Attachments,
    Confirmation,
}

#[derive(Debug, Clone)]
pub struct ConversationState {
    pub step: ConversationStep,
    pub category: Option<TicketCategory>,
    pub game: Option<AffectedGame>,
    pub timing: Option<ProblemTiming>,
    pub description: Option<String>,
    pub attachments: Vec<String>,
    pub thread_id: Option<i64>,
    updated_at: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StepError {
    UnknownOption,
    DescriptionTooShort { min: usize },
    AttachmentLimit { max: usize },
    WrongStep,
}

impl ConversationState {
    fn new(thread_id: Option<i64>) -> Self {
        Self {
            step: ConversationStep::Category,
            category: None,
            game: None,
            timing: None,
            description: None,
            attachments: Vec::new(),
            thread_id,
            updated_at: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Instant::now();
    }

    pub fn apply_category(&mut self, key: &str) -> Result<(), StepError> {
        if self.step != ConversationStep::Category {
            return Err(StepError::WrongStep);
        }
        let category = TicketCategory::from_str(key).ok_or(StepError::UnknownOption)?;
        self.category = Some(category);
        self.step = ConversationStep::Game;
        self.touch();
        Ok(())
    }

    pub fn apply_game_choice(&mut self, key: &str) -> Result<(), StepError> {
        if self.step != ConversationStep::Game {
            return Err(StepError::WrongStep);
        }
        if key == "other_game" {
            self.step = ConversationStep::GameFreeText;
            self.touch();
            return Ok(());
        }
        let game = AffectedGame::from_key(key).ok_or(StepError::UnknownOption)?;
        self.game = Some(game);
        self.step = ConversationStep::Timing;
        self.touch();
        Ok(())
    }

    pub fn apply_game_free_text(&mut self, name: &str) -> Result<(), StepError> {
        if self.step != ConversationStep::GameFreeText {
            return Err(StepError::WrongStep);
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(StepError::UnknownOption);
        }
        self.game = Some(AffectedGame::Other(name.to_string()));
        self.step = ConversationStep::Timing;
        self.touch();
        Ok(())
    }

    pub fn apply_timing(&mut self, key: &str) -> Result<(), StepError> {
        if self.step != ConversationStep::Timing {
            return Err(StepError::WrongStep);
        }
        let timing = ProblemTiming::from_str(key).ok_or(StepError::UnknownOption)?;
        self.timing = Some(timing);
        self.step = ConversationStep::Description;
        self.touch();
        Ok(())
    }

    /// Short input is an error; long input is truncated with an ellipsis.
    pub fn apply_description(&mut self, text: &str) -> Result<(), StepError> {
        if self.step != ConversationStep::Description {
            return Err(StepError::WrongStep);
        }
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.chars().count() < DESCRIPTION_MIN {
            return Err(StepError::DescriptionTooShort {
                min: DESCRIPTION_MIN,
            });
        }
        let description = if collapsed.chars().count() > DESCRIPTION_MAX {
            let truncated: String = collapsed.chars().take(DESCRIPTION_MAX - 3).collect();
            format!("{truncated}...")
        } else {
            collapsed
        };
        self.description = Some(description);
        self.step = ConversationStep::Attachments;
        self.touch();
        Ok(())
    }

    pub fn add_attachment(&mut self, file_id: &str) -> Result<usize, StepError> {
        if self.step != ConversationStep::Attachments {
            return Err(StepError::WrongStep);
        }
        if self.attachments.len() >= MAX_ATTACHMENTS {
            return Err(StepError::AttachmentLimit {
                max: MAX_ATTACHMENTS,
            });
        }
        self.attachments.push(file_id.to_string());
        self.touch();
        Ok(self.attachments.len())
    }

    pub fn finish_attachments(&mut self) -> Result<(), StepError> {
        if self.step != ConversationStep::Attachments {
            return Err(StepError::WrongStep);
        }
        self.step = ConversationStep::Confirmation;
        self.touch();
        Ok(())
    }

    /// Jump back for `edit{field}` from the confirmation screen.
    pub fn edit(&mut self, step: ConversationStep) -> Result<(), StepError> {
        if self.step != ConversationStep::Confirmation {
            return Err(StepError::WrongStep);
        }
        self.step = step;
        self.touch();
        Ok(())
    }

    /// Only a fully-filled confirmation state becomes a command.
    pub fn to_command(&self, user_id: ChatUserId) -> Option<CreateTicketCommand> {
        if self.step != ConversationStep::Confirmation {
            return None;
        }
        Some(CreateTicketCommand {
            user_id,
            category: self.category?,
            game: self.game.clone()?,
            timing: self.timing?,
            description: self.description.clone()?,
            attachments: self.attachments.clone(),
            thread_id: self.thread_id,
        })
    }
}

/// In-memory conversation store keyed by chat user.
pub struct ConversationStore {
    states: DashMap<ChatUserId, ConversationState>,
    ttl: Duration,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            states: DashMap::new(),
            ttl,
        }
    }

    pub fn start(&self, user_id: ChatUserId, thread_id: Option<i64>) -> ConversationState {
        let state = ConversationState::new(thread_id);
        self.states.insert(user_id, state.clone());
        state
    }

    pub fn get(&self, user_id: ChatUserId) -> Option<ConversationState> {
        let entry = self.states.get(&user_id)?;
        if entry.updated_at.elapsed() > self.ttl {
            drop(entry);
            self.states.remove(&user_id);
            return None;
        }
        Some(entry.clone())
    }

    /// Applies `f` to the live state, storing the result.
    pub fn update<T>(
        &self,
        user_id: ChatUserId,
        f: impl FnOnce(&mut ConversationState) -> T,
    ) -> Option<T> {
        let mut entry = self.states.get_mut(&user_id)?;
        if entry.updated_at.elapsed() > self.ttl {
            drop(entry);
            self.states.remove(&user_id);
            return None;
        }
        Some(f(&mut entry))
    }

    pub fn remove(&self, user_id: ChatUserId) {
        self.states.remove(&user_id);
    }

    /// Drops conversations idle past the TTL. Returns the count removed.
    pub fn sweep_expired(&self) -> usize {
        let expired: Vec<ChatUserId> = self
            .states
            .iter()
            .filter(|entry| entry.updated_at.elapsed() > self.ttl)
            .map(|entry| *entry.key())
            .collect();
        for user_id in &expired {
            self.states.remove(user_id);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_state() -> ConversationState {
        let mut state = ConversationState::new(Some(148));
        state.apply_category("connectivity").unwrap();
        state.apply_game_choice("valorant").unwrap();
        state.apply_timing("now").unwrap();
        state
            .apply_description("Ping alto em todas as partidas ranqueadas")
            .unwrap();
        state.finish_attachments().unwrap();
        state
    }

    #[test]
    fn full_flow_produces_a_command() {
        let state = filled_state();
        let command = state.to_command(ChatUserId(7)).unwrap();
        assert_eq!(command.category, TicketCategory::Connectivity);
        assert_eq!(command.game, AffectedGame::Valorant);
        assert_eq!(command.timing, ProblemTiming::Now);
        assert_eq!(command.thread_id, Some(148));
    }

    #[test]
    fn steps_enforce_order() {
        let mut state = ConversationState::new(None);
        assert_eq!(state.apply_timing("now"), Err(StepError::WrongStep));
        assert_eq!(
            state.apply_description("uma descrição válida"),
            Err(StepError::WrongStep)
        );
        state.apply_category("performance").unwrap();
        assert_eq!(state.apply_category("others"), Err(StepError::WrongStep));
    }

    #[test]
    fn unknown_options_are_rejected() {
        let mut state = ConversationState::new(None);
        assert_eq!(state.apply_category("equipment"), Err(StepError::UnknownOption));
        state.apply_category("others").unwrap();
        assert_eq!(state.apply_game_choice("chess"), Err(StepError::UnknownOption));
    }

    #[test]
    fn other_game_requires_free_text() {
        let mut state = ConversationState::new(None);
        state.apply_category("game_issues").unwrap();
        state.apply_game_choice("other_game").unwrap();
        assert_eq!(state.step, ConversationStep::GameFreeText);
        assert_eq!(state.apply_game_free_text("   "), Err(StepError::UnknownOption));
        state.apply_game_free_text("Rocket League").unwrap();
        assert_eq!(state.game, Some(AffectedGame::Other("Rocket League".into())));
        assert_eq!(state.step, ConversationStep::Timing);
    }

    #[test]
    fn short_description_is_an_error() {
        let mut state = ConversationState::new(None);
        state.apply_category("others").unwrap();
        state.apply_game_choice("all_games").unwrap();
        state.apply_timing("always").unwrap();
        assert_eq!(
            state.apply_description("curto"),
            Err(StepError::DescriptionTooShort { min: 10 })
        );
    }

    #[test]
    fn long_description_is_truncated_with_ellipsis() {
        let mut state = ConversationState::new(None);
        state.apply_category("others").unwrap();
        state.apply_game_choice("all_games").unwrap();
        state.apply_timing("always").unwrap();
        state.apply_description(&"x".repeat(600)).unwrap();

        let description = state.description.unwrap();
        assert_eq!(description.chars().count(), DESCRIPTION_MAX);
        assert!(description.ends_with("..."));
    }

    #[test]
    fn attachments_cap_at_three() {
        let mut state = filled_state();
        state.edit(ConversationStep::Attachments).unwrap();
        for n in 1..=3 {
            assert_eq!(state.add_attachment(&format!("file-{n}")), Ok(n));
        }
        assert_eq!(
            state.add_attachment("file-4"),
            Err(StepError::AttachmentLimit { max: 3 })
        );
    }

    #[test]
    fn store_expires_idle_conversations() {
        let store = ConversationStore::with_ttl(Duration::from_millis(10));
        store.start(ChatUserId(1), None);
        assert!(store.get(ChatUserId(1)).is_some());

        std::thread::sleep(Duration::from_millis(25));
        assert!(store.get(ChatUserId(1)).is_none());
        assert_eq!(store.sweep_expired(), 0);
    }

    #[test]
    fn incomplete_state_is_not_a_command() {
        let mut state = ConversationState::new(None);
        state.apply_category("others").unwrap();
        assert!(state.to_command(ChatUserId(1)).is_none());
    }
}
