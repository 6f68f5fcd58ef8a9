//! Bridges the engine's chat-side revocation jobs onto the chat service.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use sn_app::{chat::remove_from_group, ChatService};
use sn_domain::ChatUserId;
use sn_engine::GroupRevoker;

pub struct ChatGroupRevoker {
    chat: Arc<dyn ChatService>,
    group_id: i64,
}

impl ChatGroupRevoker {
    pub fn new(chat: Arc<dyn ChatService>, group_id: i64) -> Self {
        Self { chat, group_id }
    }
}

#[async_trait]
impl GroupRevoker for ChatGroupRevoker {
    async fn revoke(&self, user_id: ChatUserId, reason: &str) -> anyhow::Result<()> {
        remove_from_group(self.chat.as_ref(), self.group_id, user_id).await?;
        info!(user_id = %user_id, reason, "Group membership revoked");
        Ok(())
    }
}
