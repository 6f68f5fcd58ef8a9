//! The chat-service collaborator interface.
//!
//! This is the entire surface the core is allowed to reach; the transport
//! implementation lives with the presentation adapter.

use async_trait::async_trait;

use sn_domain::ChatUserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub text: String,
    pub callback_data: String,
}

impl Button {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// Inline keyboard: rows of buttons.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyboard(pub Vec<Vec<Button>>);

impl Keyboard {
    pub fn single_column(buttons: Vec<Button>) -> Self {
        Self(buttons.into_iter().map(|b| vec![b]).collect())
    }
}

#[derive(Debug, Clone)]
pub struct ChatAdmin {
    pub user_id: ChatUserId,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    /// Raw chat-service role name (`creator`, `administrator`, ...).
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
}

impl ChatMemberStatus {
    /// Muted (`restricted`) users still count as members.
    pub fn is_in_group(&self) -> bool {
        matches!(
            self,
            ChatMemberStatus::Creator
                | ChatMemberStatus::Administrator
                | ChatMemberStatus::Member
                | ChatMemberStatus::Restricted
        )
    }
}

#[async_trait]
pub trait ChatService: Send + Sync {
    /// Sends a message; returns the message id.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<Keyboard>,
        thread_id: Option<i64>,
    ) -> anyhow::Result<i64>;

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> anyhow::Result<()>;

    async fn create_chat_invite_link(
        &self,
        chat_id: i64,
        member_limit: u32,
        name: &str,
    ) -> anyhow::Result<String>;

    async fn ban_chat_member(&self, chat_id: i64, user_id: ChatUserId) -> anyhow::Result<()>;

    async fn unban_chat_member(&self, chat_id: i64, user_id: ChatUserId) -> anyhow::Result<()>;

    async fn get_chat_administrators(&self, chat_id: i64) -> anyhow::Result<Vec<ChatAdmin>>;

    async fn get_chat_member(
        &self,
        chat_id: i64,
        user_id: ChatUserId,
    ) -> anyhow::Result<ChatMemberStatus>;

    /// Fetches an attachment's bytes by its file reference. Returns the
    /// filename and content.
    async fn download_file(&self, file_id: &str) -> anyhow::Result<(String, Vec<u8>)>;
}

/// Removal is ban followed by unban, so the user can come back through a
/// fresh invite.
pub async fn remove_from_group(
    chat: &dyn ChatService,
    chat_id: i64,
    user_id: ChatUserId,
) -> anyhow::Result<()> {
    chat.ban_chat_member(chat_id, user_id).await?;
    chat.unban_chat_member(chat_id, user_id).await?;
    Ok(())
}
