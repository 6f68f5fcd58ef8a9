//! CPF verification lifecycle orchestration.
//!
//! Identity checks, duplicate-binding conflict resolution with remapping,
//! and the 24-hour expiration sweep. Upstream lookups ride through the
//! integration engine so they share its cache and attempt history.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use sn_domain::events::{CpfDuplicateDetected, CpfRemapped, CpfValidated};
use sn_domain::{
    ChatUserId, Cpf, GroupInvite, IntegrationId, IntegrationPayload, IntegrationPriority,
    Verification, VerificationId, VerificationStatus, VerificationType,
};
use sn_engine::{IntegrationEngine, ScheduleOptions};
use sn_events::EventBus;
use sn_hubsoft::ClientInfo;
use sn_storage::{UserRepository, VerificationRepository};

use crate::chat::{remove_from_group, ChatService};
use crate::invites::InviteService;

#[derive(Debug)]
pub enum SubmitCpfOutcome {
    NoPendingVerification,
    InvalidFormat {
        attempts_left: u32,
        exhausted: bool,
    },
    NotFound {
        attempts_left: u32,
        exhausted: bool,
    },
    /// The upstream lookup could not run; no attempt is consumed.
    UpstreamUnavailable,
    Conflict {
        verification_id: VerificationId,
        existing_user_id: ChatUserId,
        existing_username: Option<String>,
    },
    Completed {
        client: ClientInfo,
        invite: Option<GroupInvite>,
    },
}

#[derive(Debug)]
pub enum RemapOutcome {
    VerificationNotFound,
    /// The caller is not the verification's owner.
    NotAuthorized,
    NoConflictRecorded,
    /// Chat-side revocation failed; a retryable job now owns it and the
    /// verification stays IN_PROGRESS until it lands.
    RevocationPending { integration_id: IntegrationId },
    Completed { invite: Option<GroupInvite> },
}

pub struct VerificationService {
    verifications: Arc<dyn VerificationRepository>,
    users: Arc<dyn UserRepository>,
    engine: Arc<IntegrationEngine>,
    chat: Arc<dyn ChatService>,
    invites: Arc<InviteService>,
    bus: Arc<EventBus>,
    group_id: i64,
}

impl VerificationService {
    pub fn new(
        verifications: Arc<dyn VerificationRepository>,
        users: Arc<dyn UserRepository>,
        engine: Arc<IntegrationEngine>,
        chat: Arc<dyn ChatService>,
        invites: Arc<InviteService>,
        bus: Arc<EventBus>,
        group_id: i64,
    ) -> Self {
        Self {
            verifications,
            users,
            engine,
            chat,
            invites,
            bus,
            group_id,
        }
    }

    /// Opens a fresh verification for the user, superseding any live one.
    pub async fn start_verification(
        &self,
        user_id: ChatUserId,
        username: &str,
        user_mention: &str,
        verification_type: VerificationType,
        source_action: Option<&str>,
    ) -> Result<VerificationId> {
        if let Some(mut existing) = self.verifications.find_pending_by_user(user_id).await? {
            existing.cancel("superseded")?;
            self.verifications.save(&existing).await?;
            self.bus.publish_many(existing.take_events()).await;
        }

        let mut verification = Verification::start_new(
            user_id,
            username.to_string(),
            user_mention.to_string(),
            verification_type,
            source_action.map(String::from),
            Utc::now(),
        );
        self.verifications.save(&verification).await?;
        let id = verification.id.clone();
        self.bus.publish_many(verification.take_events()).await;

        info!(user_id = %user_id, verification_id = %id, kind = verification_type.as_str(), "Verification started");
        Ok(id)
    }

    /// Processes a CPF the user typed in.
    pub async fn submit_cpf(
        &self,
        user_id: ChatUserId,
        raw_cpf: &str,
    ) -> Result<SubmitCpfOutcome> {
        let Some(mut verification) = self.verifications.find_pending_by_user(user_id).await?
        else {
            return Ok(SubmitCpfOutcome::NoPendingVerification);
        };

        let cpf = match Cpf::parse(raw_cpf) {
            Ok(cpf) => cpf,
            Err(_) => {
                verification.record_attempt(
                    false,
                    None,
                    None,
                    Some("invalid_cpf_format".into()),
                )?;
                self.verifications.save(&verification).await?;
                self.bus.publish_many(verification.take_events()).await;
                return Ok(SubmitCpfOutcome::InvalidFormat {
                    attempts_left: verification.attempts_left(),
                    exhausted: verification.status == VerificationStatus::Failed,
                });
            }
        };

        let client = match self.engine.run_user_verification(cpf.clone(), false).await {
            Ok(client) => client,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Upstream verification unavailable");
                return Ok(SubmitCpfOutcome::UpstreamUnavailable);
            }
        };

        let Some(client) = client else {
            verification.record_attempt(false, None, None, Some("cpf_not_found".into()))?;
            self.verifications.save(&verification).await?;
            self.bus.publish_many(verification.take_events()).await;
            return Ok(SubmitCpfOutcome::NotFound {
                attempts_left: verification.attempts_left(),
                exhausted: verification.status == VerificationStatus::Failed,
            });
        };

        // Duplicate-binding check: the CPF may already belong to another
        // active chat account.
        if let Some(existing) = self.users.find_active_by_cpf(&cpf).await? {
            if existing.id != user_id {
                verification.record_conflict(cpf.clone())?;
                self.verifications.save(&verification).await?;
                self.bus
                    .publish(&CpfDuplicateDetected {
                        verification_id: verification.id.clone(),
                        user_id,
                        existing_user_id: existing.id,
                        cpf_masked: cpf.masked(),
                    })
                    .await;
                info!(user_id = %user_id, existing = %existing.id, "Duplicate CPF binding detected");
                return Ok(SubmitCpfOutcome::Conflict {
                    verification_id: verification.id.clone(),
                    existing_user_id: existing.id,
                    existing_username: Some(existing.username),
                });
            }
        }

        self.bind_and_complete(&mut verification, user_id, cpf, client)
            .await
    }

    async fn bind_and_complete(
        &self,
        verification: &mut Verification,
        user_id: ChatUserId,
        cpf: Cpf,
        client: ClientInfo,
    ) -> Result<SubmitCpfOutcome> {
        self.users
            .bind_cpf(
                user_id,
                &verification.username,
                &cpf,
                Some(&client.name),
                client.plan_name().as_deref(),
                client.service_status.as_deref(),
            )
            .await?;

        let client_json = serde_json::to_value(&client)?;
        verification.record_attempt(true, Some(cpf.clone()), Some(client_json), None)?;
        self.verifications.save(verification).await?;
        self.bus.publish_many(verification.take_events()).await;
        self.bus
            .publish(&CpfValidated {
                user_id,
                cpf_masked: cpf.masked(),
                client_name: Some(client.name.clone()),
            })
            .await;

        let invite = if verification.verification_type != VerificationType::AutoCheckup {
            match self
                .invites
                .issue(user_id, cpf, Some(client.name.clone()), client.plan_name())
                .await
            {
                Ok(invite) => Some(invite),
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Invite issuing failed");
                    None
                }
            }
        } else {
            None
        };

        info!(user_id = %user_id, "Verification completed");
        Ok(SubmitCpfOutcome::Completed { client, invite })
    }

    /// Resolves a duplicate-CPF conflict in favor of `primary_user_id`:
    /// revokes the losers' memberships, moves the binding, completes the
    /// verification and issues a fresh invite.
    pub async fn resolve_duplicate_conflict(
        &self,
        verification_id: &VerificationId,
        primary_user_id: ChatUserId,
        loser_user_ids: &[ChatUserId],
    ) -> Result<RemapOutcome> {
        let Some(mut verification) = self.verifications.find_by_id(verification_id).await? else {
            return Ok(RemapOutcome::VerificationNotFound);
        };
        if verification.user_id != primary_user_id {
            return Ok(RemapOutcome::NotAuthorized);
        }
        let Some(cpf) = verification.cpf_verified.clone() else {
            return Ok(RemapOutcome::NoConflictRecorded);
        };

        for loser in loser_user_ids {
            if let Err(e) = remove_from_group(self.chat.as_ref(), self.group_id, *loser).await {
                warn!(loser = %loser, error = %e, "Membership revocation failed, queueing retry");
                let integration_id = self
                    .engine
                    .schedule_with(
                        IntegrationPayload::MembershipRevocation {
                            user_id: *loser,
                            reason: "CPF remapeado para outra conta".into(),
                        },
                        IntegrationPriority::High,
                        ScheduleOptions {
                            metadata: vec![
                                ("action".into(), json!("membership_revocation")),
                                ("verification_id".into(), json!(verification_id.0.clone())),
                                ("primary_user_id".into(), json!(primary_user_id.0)),
                                (
                                    "loser_user_ids".into(),
                                    json!(loser_user_ids.iter().map(|u| u.0).collect::<Vec<_>>()),
                                ),
                            ],
                            ..Default::default()
                        },
                    )
                    .await?;
                return Ok(RemapOutcome::RevocationPending { integration_id });
            }
        }

        // Single transaction per loser over users; the partial unique index
        // keeps P2 intact throughout.
        for loser in loser_user_ids {
            self.users
                .transfer_cpf(&cpf, *loser, primary_user_id, &verification.username)
                .await?;
        }

        verification.complete_with_success(cpf.clone(), None)?;
        self.verifications.save(&verification).await?;
        self.bus.publish_many(verification.take_events()).await;
        for loser in loser_user_ids {
            self.bus
                .publish(&CpfRemapped {
                    old_user_id: *loser,
                    new_user_id: primary_user_id,
                    cpf_masked: cpf.masked(),
                    reason: "duplicate_conflict_resolution".into(),
                })
                .await;
        }

        let invite = match self
            .invites
            .issue(primary_user_id, cpf, None, None)
            .await
        {
            Ok(invite) => Some(invite),
            Err(e) => {
                warn!(user_id = %primary_user_id, error = %e, "Invite after remap failed");
                None
            }
        };

        info!(primary = %primary_user_id, "CPF remapped");
        Ok(RemapOutcome::Completed { invite })
    }

    /// Resumes a remap whose chat-side revocation job has completed.
    /// Intended as a bus handler on `IntegrationCompleted`.
    pub async fn resume_remap(
        &self,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        if metadata.get("action").and_then(|v| v.as_str()) != Some("membership_revocation") {
            return Ok(());
        }
        let Some(verification_id) = metadata
            .get("verification_id")
            .and_then(|v| v.as_str())
            .map(|s| VerificationId(s.to_string()))
        else {
            return Ok(());
        };
        let Some(primary) = metadata
            .get("primary_user_id")
            .and_then(|v| v.as_i64())
            .map(ChatUserId)
        else {
            return Ok(());
        };
        let losers: Vec<ChatUserId> = metadata
            .get("loser_user_ids")
            .and_then(|v| v.as_array())
            .map(|list| list.iter().filter_map(|v| v.as_i64()).map(ChatUserId).collect())
            .unwrap_or_default();

        let outcome = self
            .resolve_duplicate_conflict(&verification_id, primary, &losers)
            .await?;
        info!(verification_id = %verification_id, ?outcome, "Remap resumed after revocation job");
        Ok(())
    }

    /// Expires overdue verifications. Auto-checkup users additionally get a
    /// queued group removal; the expiry notification is rendered by the
    /// adapter off the `VerificationExpired` event.
    pub async fn process_expired_verifications(&self) -> Result<usize> {
        let now = Utc::now();
        let expired = self.verifications.find_expired_pending(now).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        info!(count = expired.len(), "Processing expired verifications");
        let mut processed = 0;
        for mut verification in expired {
            verification.expire(now)?;
            self.verifications.save(&verification).await?;

            if verification.verification_type == VerificationType::AutoCheckup {
                if let Err(e) = self
                    .engine
                    .schedule(
                        IntegrationPayload::MembershipRevocation {
                            user_id: verification.user_id,
                            reason: "Verificação de CPF expirada".into(),
                        },
                        IntegrationPriority::Normal,
                    )
                    .await
                {
                    warn!(user_id = %verification.user_id, error = %e, "Failed to queue expiry removal");
                }
            }

            self.bus.publish_many(verification.take_events()).await;
            processed += 1;
        }
        Ok(processed)
    }
}

