//! Chat update handling: commands, callbacks and free text routed into the
//! use cases, replies rendered from `texts`.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use sn_app::{
    AccessGate, Button, ChatService, CreateTicketOutcome, Keyboard, SubmitCpfOutcome,
    SupportService, VerificationService,
};
use sn_domain::{ChatUserId, VerificationType};

use crate::conversation::{ConversationStep, ConversationStore, StepError};
use crate::texts;

const CATEGORY_OPTIONS: &[(&str, &str)] = &[
    ("connectivity", "Conectividade/Ping"),
    ("performance", "Performance em Jogos"),
    ("game_issues", "Problema em Jogo"),
    ("configuration", "Configuração/Otimização"),
    ("others", "Outro"),
];

const GAME_OPTIONS: &[(&str, &str)] = &[
    ("valorant", "Valorant"),
    ("cs2", "CS2"),
    ("lol", "League of Legends"),
    ("fortnite", "Fortnite"),
    ("apex", "Apex Legends"),
    ("overwatch", "Overwatch 2"),
    ("mobile_legends", "Mobile Legends"),
    ("dota2", "Dota 2"),
    ("all_games", "Todos os jogos"),
    ("other_game", "Outro jogo"),
];

const TIMING_OPTIONS: &[(&str, &str)] = &[
    ("now", "Agora mesmo / Hoje"),
    ("yesterday", "Ontem"),
    ("this_week", "Esta semana"),
    ("last_week", "Semana passada"),
    ("long_time", "Há mais tempo"),
    ("always", "Sempre foi assim"),
];

pub struct BotAdapter {
    chat: Arc<dyn ChatService>,
    gate: Arc<AccessGate>,
    support: Arc<SupportService>,
    verification: Arc<VerificationService>,
    conversations: Arc<ConversationStore>,
    group_id: i64,
    support_topic_id: Option<i64>,
}

impl BotAdapter {
    pub fn new(
        chat: Arc<dyn ChatService>,
        gate: Arc<AccessGate>,
        support: Arc<SupportService>,
        verification: Arc<VerificationService>,
        conversations: Arc<ConversationStore>,
        group_id: i64,
        support_topic_id: Option<i64>,
    ) -> Self {
        Self {
            chat,
            gate,
            support,
            verification,
            conversations,
            group_id,
            support_topic_id,
        }
    }

    /// `/start` — registration entry point.
    pub async fn handle_start(&self, user_id: ChatUserId, username: &str) -> Result<()> {
        if self.gate.verified_user(user_id).await?.is_some() {
            self.send(user_id, "Seu cadastro já está confirmado. Use /suporte quando precisar de ajuda.", None)
                .await;
            return Ok(());
        }
        self.verification
            .start_verification(
                user_id,
                username,
                &format!("@{username}"),
                VerificationType::InitialRegistration,
                Some("start_command"),
            )
            .await?;
        self.send(
            user_id,
            &texts::verification_request(VerificationType::InitialRegistration),
            None,
        )
        .await;
        Ok(())
    }

    /// `/suporte` — support intake entry point.
    pub async fn handle_support(&self, user_id: ChatUserId, username: &str) -> Result<()> {
        let Some(user) = self.gate.verified_user(user_id).await? else {
            // Redirect into verification before any intake.
            self.verification
                .start_verification(
                    user_id,
                    username,
                    &format!("@{username}"),
                    VerificationType::SupportRequest,
                    Some("support_command"),
                )
                .await?;
            self.send(
                user_id,
                &texts::verification_request(VerificationType::SupportRequest),
                None,
            )
            .await;
            return Ok(());
        };

        // Support is for group members; `restricted` (muted) still counts.
        match self.chat.get_chat_member(self.group_id, user_id).await {
            Ok(status) if !status.is_in_group() => {
                self.send(
                    user_id,
                    "Você precisa estar no grupo para abrir chamados. Use /start para receber um novo convite.",
                    None,
                )
                .await;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                // Membership lookup failing is not a reason to block support.
                warn!(user_id = %user_id, error = %e, "Membership check failed");
            }
        }

        if let Some(block) = self.support.check_intake_allowed(user_id).await? {
            self.send(user_id, &texts::ticket_outcome(&block), None).await;
            return Ok(());
        }

        self.conversations.start(user_id, self.support_topic_id);
        let welcome = texts::intake_welcome(
            user.client_name.as_deref().unwrap_or("cliente"),
            user.service_name.as_deref().unwrap_or("seu plano"),
        );
        self.send(user_id, &welcome, Some(keyboard_from(CATEGORY_OPTIONS, "support_")))
            .await;
        Ok(())
    }

    /// `/meus_chamados` — ticket listing.
    pub async fn handle_list_tickets(&self, user_id: ChatUserId) -> Result<()> {
        let tickets = self.support.list_tickets(user_id, 10).await?;
        self.send(user_id, &texts::ticket_list(&tickets), None).await;
        Ok(())
    }

    /// Inline-button presses.
    pub async fn handle_callback(&self, user_id: ChatUserId, data: &str) -> Result<()> {
        if let Some(action) = data.strip_prefix("support_") {
            return self.handle_support_callback(user_id, action).await;
        }
        if let Some(payload) = data.strip_prefix("cpf_resolve_") {
            return self.handle_conflict_resolution(user_id, payload).await;
        }
        debug!(user_id = %user_id, data, "Unhandled callback");
        Ok(())
    }

    async fn handle_support_callback(&self, user_id: ChatUserId, action: &str) -> Result<()> {
        if action == "cancel" {
            self.conversations.remove(user_id);
            self.send(user_id, texts::intake_cancelled(), None).await;
            return Ok(());
        }

        let Some(state) = self.conversations.get(user_id) else {
            debug!(user_id = %user_id, "Callback without active conversation");
            return Ok(());
        };

        match state.step {
            ConversationStep::Category => {
                let applied = self
                    .conversations
                    .update(user_id, |s| s.apply_category(action));
                if matches!(applied, Some(Ok(()))) {
                    self.send(user_id, texts::ask_game(), Some(keyboard_pairs(GAME_OPTIONS, "support_")))
                        .await;
                }
            }
            ConversationStep::Game => {
                let applied = self
                    .conversations
                    .update(user_id, |s| s.apply_game_choice(action));
                match applied {
                    Some(Ok(())) if action == "other_game" => {
                        self.send(user_id, texts::ask_game_name(), None).await;
                    }
                    Some(Ok(())) => {
                        self.send(user_id, texts::ask_timing(), Some(keyboard_from(TIMING_OPTIONS, "support_")))
                            .await;
                    }
                    _ => {}
                }
            }
            ConversationStep::Timing => {
                let applied = self.conversations.update(user_id, |s| s.apply_timing(action));
                if matches!(applied, Some(Ok(()))) {
                    self.send(user_id, texts::ask_description(), None).await;
                }
            }
            ConversationStep::Attachments if action == "attachments_done" => {
                self.conversations
                    .update(user_id, |s| s.finish_attachments());
                self.send_confirmation(user_id).await?;
            }
            ConversationStep::Confirmation => {
                self.handle_confirmation_action(user_id, action).await?;
            }
            _ => {
                debug!(user_id = %user_id, action, step = ?state.step, "Callback out of step");
            }
        }
        Ok(())
    }

    async fn handle_confirmation_action(&self, user_id: ChatUserId, action: &str) -> Result<()> {
        match action {
            "confirm" => {
                let command = self
                    .conversations
                    .get(user_id)
                    .and_then(|s| s.to_command(user_id));
                let Some(command) = command else {
                    self.send(user_id, texts::intake_cancelled(), None).await;
                    self.conversations.remove(user_id);
                    return Ok(());
                };

                let outcome = self.support.create_ticket(command).await?;
                if matches!(outcome, CreateTicketOutcome::Created { .. }) {
                    self.conversations.remove(user_id);
                    info!(user_id = %user_id, "Intake submitted");
                }
                self.send(user_id, &texts::ticket_outcome(&outcome), None).await;
            }
            "edit_category" => {
                self.conversations
                    .update(user_id, |s| s.edit(ConversationStep::Category));
                self.send(user_id, "Qual o tipo do problema?", Some(keyboard_from(CATEGORY_OPTIONS, "support_")))
                    .await;
            }
            "edit_description" => {
                self.conversations
                    .update(user_id, |s| s.edit(ConversationStep::Description));
                self.send(user_id, texts::ask_description(), None).await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_conflict_resolution(&self, user_id: ChatUserId, payload: &str) -> Result<()> {
        // Payload: "<verification_id>:<loser_id>"
        let Some((verification_id, loser)) = payload.split_once(':') else {
            return Ok(());
        };
        let Ok(loser_id) = loser.parse::<i64>() else {
            return Ok(());
        };

        let outcome = self
            .verification
            .resolve_duplicate_conflict(
                &sn_domain::VerificationId(verification_id.to_string()),
                user_id,
                &[ChatUserId(loser_id)],
            )
            .await?;

        let text = match outcome {
            sn_app::RemapOutcome::Completed { invite } => {
                let mut text = String::from(
                    "Transferência concluída. Este CPF agora está vinculado a esta conta.",
                );
                if let Some(invite) = invite {
                    text.push_str(&format!("\n\nSeu novo convite de acesso:\n{}", invite.invite_url));
                }
                text
            }
            sn_app::RemapOutcome::RevocationPending { .. } => {
                "Estamos finalizando a transferência. Você receberá a confirmação em instantes."
                    .to_string()
            }
            sn_app::RemapOutcome::NotAuthorized => {
                "Apenas a conta que iniciou a verificação pode confirmar a transferência.".to_string()
            }
            _ => "Não encontrei uma verificação em aberto para esta transferência. Use /start para recomeçar.".to_string(),
        };
        self.send(user_id, &text, None).await;
        Ok(())
    }

    /// Free text in a private chat: either a CPF for a pending verification
    /// or conversation input.
    pub async fn handle_text(&self, user_id: ChatUserId, text: &str) -> Result<()> {
        if let Some(state) = self.conversations.get(user_id) {
            match state.step {
                ConversationStep::GameFreeText => {
                    let applied = self
                        .conversations
                        .update(user_id, |s| s.apply_game_free_text(text));
                    if matches!(applied, Some(Ok(()))) {
                        self.send(user_id, texts::ask_timing(), Some(keyboard_from(TIMING_OPTIONS, "support_")))
                            .await;
                    }
                    return Ok(());
                }
                ConversationStep::Description => {
                    let applied = self
                        .conversations
                        .update(user_id, |s| s.apply_description(text));
                    match applied {
                        Some(Ok(())) => {
                            let keyboard = Keyboard(vec![vec![Button::new(
                                "Continuar",
                                "support_attachments_done",
                            )]]);
                            self.send(user_id, texts::ask_attachments(), Some(keyboard)).await;
                        }
                        Some(Err(StepError::DescriptionTooShort { .. })) => {
                            self.send(user_id, texts::description_too_short(), None).await;
                        }
                        _ => {}
                    }
                    return Ok(());
                }
                _ => {}
            }
        }

        // Outside a conversation, digits are treated as a CPF submission.
        let outcome = self.verification.submit_cpf(user_id, text).await?;
        if matches!(outcome, SubmitCpfOutcome::NoPendingVerification)
            && !text.chars().any(|c| c.is_ascii_digit())
        {
            return Ok(());
        }

        let keyboard = match &outcome {
            SubmitCpfOutcome::Conflict {
                verification_id,
                existing_user_id,
                ..
            } => Some(Keyboard(vec![vec![Button::new(
                "Transferir para esta conta",
                format!("cpf_resolve_{}:{}", verification_id.0, existing_user_id.0),
            )]])),
            _ => None,
        };
        self.send(user_id, &texts::submit_outcome(&outcome), keyboard).await;
        Ok(())
    }

    /// Attachment uploads during the intake.
    pub async fn handle_attachment(&self, user_id: ChatUserId, file_id: &str) -> Result<()> {
        let Some(state) = self.conversations.get(user_id) else {
            return Ok(());
        };
        if state.step != ConversationStep::Attachments {
            return Ok(());
        }
        let added = self
            .conversations
            .update(user_id, |s| s.add_attachment(file_id));
        match added {
            Some(Ok(count)) => {
                self.send(user_id, &format!("Anexo {count}/3 recebido."), None).await;
            }
            Some(Err(StepError::AttachmentLimit { max })) => {
                self.send(
                    user_id,
                    &format!("Limite de {max} anexos atingido. Toque em Continuar."),
                    None,
                )
                .await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn send_confirmation(&self, user_id: ChatUserId) -> Result<()> {
        let Some(state) = self.conversations.get(user_id) else {
            return Ok(());
        };
        let user = self.gate.verified_user(user_id).await?;
        let client_name = user
            .as_ref()
            .and_then(|u| u.client_name.clone())
            .unwrap_or_else(|| "Cliente".to_string());

        let summary = texts::confirmation_summary(
            &client_name,
            state.category.map(|c| c.label_pt()).unwrap_or("—"),
            &state.game.as_ref().map(|g| g.label_pt()).unwrap_or_default(),
            state.timing.map(|t| t.label_pt()).unwrap_or("—"),
            state.description.as_deref().unwrap_or("—"),
            state.attachments.len(),
        );
        let keyboard = Keyboard(vec![
            vec![Button::new("CONFIRMAR E CRIAR ATENDIMENTO", "support_confirm")],
            vec![Button::new("Revisar categoria", "support_edit_category")],
            vec![Button::new("Revisar descrição", "support_edit_description")],
            vec![Button::new("CANCELAR", "support_cancel")],
        ]);
        self.send(user_id, &summary, Some(keyboard)).await;
        Ok(())
    }

    async fn send(&self, user_id: ChatUserId, text: &str, keyboard: Option<Keyboard>) {
        if let Err(e) = self.chat.send_message(user_id.0, text, keyboard, None).await {
            warn!(user_id = %user_id, error = %e, "Failed to send chat message");
        }
    }
}

fn keyboard_from(options: &[(&str, &str)], prefix: &str) -> Keyboard {
    Keyboard(
        options
            .iter()
            .map(|(key, label)| vec![Button::new(*label, format!("{prefix}{key}"))])
            .collect(),
    )
}

/// Two buttons per row for the long game list.
fn keyboard_pairs(options: &[(&str, &str)], prefix: &str) -> Keyboard {
    let mut rows = Vec::new();
    for pair in options.chunks(2) {
        rows.push(
            pair.iter()
                .map(|(key, label)| Button::new(*label, format!("{prefix}{key}")))
                .collect(),
        );
    }
    Keyboard(rows)
}
