//! Single-use group invite issuing.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::info;

use sn_domain::{ChatUserId, Cpf, GroupInvite};
use sn_storage::InviteRepository;

use crate::chat::ChatService;

pub struct InviteService {
    chat: Arc<dyn ChatService>,
    invites: Arc<dyn InviteRepository>,
    group_id: i64,
    member_limit: u32,
    lifetime: Duration,
}

impl InviteService {
    pub fn new(
        chat: Arc<dyn ChatService>,
        invites: Arc<dyn InviteRepository>,
        group_id: i64,
        member_limit: u32,
        lifetime_secs: u64,
    ) -> Self {
        Self {
            chat,
            invites,
            group_id,
            member_limit,
            lifetime: Duration::seconds(lifetime_secs as i64),
        }
    }

    /// Creates a chat invite link for a confirmed subscriber and persists
    /// the record.
    pub async fn issue(
        &self,
        user_id: ChatUserId,
        cpf: Cpf,
        client_name: Option<String>,
        plan_name: Option<String>,
    ) -> Result<GroupInvite> {
        let link_name = format!("sentinela-{user_id}");
        let url = self
            .chat
            .create_chat_invite_link(self.group_id, self.member_limit, &link_name)
            .await?;

        let invite = GroupInvite::create(
            user_id,
            cpf,
            url,
            client_name,
            plan_name,
            self.lifetime,
            Utc::now(),
        );
        let invite = self.invites.save(invite).await?;
        info!(user_id = %user_id, invite_id = ?invite.invite_id, "Group invite issued");
        Ok(invite)
    }

    pub async fn mark_used(&self, invite_id: i64) -> Result<()> {
        self.invites.mark_used(invite_id).await
    }

    /// Drops invite rows older than `days` days. Returns the count removed.
    pub async fn cleanup_old(&self, days: i64) -> Result<u64> {
        let removed = self.invites.cleanup_old(days).await?;
        if removed > 0 {
            info!(removed, "Old invites cleaned up");
        }
        Ok(removed)
    }
}
