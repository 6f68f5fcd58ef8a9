//! Thin Telegram Bot API transport implementing the core's `ChatService`
//! contract. Nothing above this file knows it is Telegram.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use sn_app::{ChatAdmin, ChatMemberStatus, ChatService, Keyboard};
use sn_domain::ChatUserId;

pub struct TelegramApi {
    http: reqwest::Client,
    api_base: String,
    file_base: String,
}

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TgUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TgMessage>,
    #[serde(default)]
    pub callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct TgMessage {
    #[serde(default)]
    pub from: Option<TgUser>,
    pub chat: TgChat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<TgPhotoSize>>,
    #[serde(default)]
    pub document: Option<TgDocument>,
}

#[derive(Debug, Deserialize)]
pub struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TgChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct TgPhotoSize {
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TgDocument {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TgCallbackQuery {
    pub id: String,
    pub from: TgUser,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChatMember {
    status: String,
    user: TgUser,
    #[serde(default)]
    custom_title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgInviteLink {
    invite_link: String,
}

#[derive(Debug, Deserialize)]
struct TgFile {
    #[serde(default)]
    file_path: Option<String>,
}

impl TelegramApi {
    pub fn new(token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(65))
            .build()?;
        Ok(Self {
            http,
            api_base: format!("https://api.telegram.org/bot{token}"),
            file_base: format!("https://api.telegram.org/file/bot{token}"),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, payload: serde_json::Value) -> Result<T> {
        let response = self
            .http
            .post(format!("{}/{method}", self.api_base))
            .json(&payload)
            .send()
            .await?;
        let parsed: TgResponse<T> = response.json().await?;
        if !parsed.ok {
            bail!(
                "telegram {method} failed: {}",
                parsed.description.unwrap_or_default()
            );
        }
        parsed
            .result
            .ok_or_else(|| anyhow::anyhow!("telegram {method}: ok without result"))
    }

    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<TgUpdate>> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await
    }

    pub async fn answer_callback_query(&self, callback_id: &str) -> Result<()> {
        let _: bool = self
            .call("answerCallbackQuery", json!({ "callback_query_id": callback_id }))
            .await?;
        Ok(())
    }

    fn keyboard_json(keyboard: &Keyboard) -> serde_json::Value {
        json!({
            "inline_keyboard": keyboard
                .0
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|b| json!({ "text": b.text, "callback_data": b.callback_data }))
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        })
    }
}

#[derive(Debug, Deserialize)]
struct TgSentMessage {
    message_id: i64,
}

#[async_trait]
impl ChatService for TelegramApi {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<Keyboard>,
        thread_id: Option<i64>,
    ) -> Result<i64> {
        let mut payload = json!({ "chat_id": chat_id, "text": text });
        if let Some(keyboard) = &keyboard {
            payload["reply_markup"] = Self::keyboard_json(keyboard);
        }
        if let Some(thread_id) = thread_id {
            payload["message_thread_id"] = json!(thread_id);
        }
        let sent: TgSentMessage = self.call("sendMessage", payload).await?;
        Ok(sent.message_id)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<()> {
        let mut payload = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        if let Some(keyboard) = &keyboard {
            payload["reply_markup"] = Self::keyboard_json(keyboard);
        }
        let _: serde_json::Value = self.call("editMessageText", payload).await?;
        Ok(())
    }

    async fn create_chat_invite_link(
        &self,
        chat_id: i64,
        member_limit: u32,
        name: &str,
    ) -> Result<String> {
        let link: TgInviteLink = self
            .call(
                "createChatInviteLink",
                json!({
                    "chat_id": chat_id,
                    "member_limit": member_limit,
                    "name": name,
                }),
            )
            .await?;
        Ok(link.invite_link)
    }

    async fn ban_chat_member(&self, chat_id: i64, user_id: ChatUserId) -> Result<()> {
        let _: bool = self
            .call(
                "banChatMember",
                json!({ "chat_id": chat_id, "user_id": user_id.0 }),
            )
            .await?;
        Ok(())
    }

    async fn unban_chat_member(&self, chat_id: i64, user_id: ChatUserId) -> Result<()> {
        let _: bool = self
            .call(
                "unbanChatMember",
                json!({ "chat_id": chat_id, "user_id": user_id.0, "only_if_banned": true }),
            )
            .await?;
        Ok(())
    }

    async fn get_chat_administrators(&self, chat_id: i64) -> Result<Vec<ChatAdmin>> {
        let members: Vec<TgChatMember> = self
            .call("getChatAdministrators", json!({ "chat_id": chat_id }))
            .await?;
        Ok(members
            .into_iter()
            .map(|m| ChatAdmin {
                user_id: ChatUserId(m.user.id),
                username: m.user.username,
                first_name: m.user.first_name.unwrap_or_default(),
                last_name: m.user.last_name.or(m.custom_title),
                status: m.status,
            })
            .collect())
    }

    async fn get_chat_member(
        &self,
        chat_id: i64,
        user_id: ChatUserId,
    ) -> Result<ChatMemberStatus> {
        let member: TgChatMember = self
            .call(
                "getChatMember",
                json!({ "chat_id": chat_id, "user_id": user_id.0 }),
            )
            .await?;
        Ok(match member.status.as_str() {
            "creator" => ChatMemberStatus::Creator,
            "administrator" => ChatMemberStatus::Administrator,
            "member" => ChatMemberStatus::Member,
            "restricted" => ChatMemberStatus::Restricted,
            "kicked" => ChatMemberStatus::Kicked,
            _ => ChatMemberStatus::Left,
        })
    }

    async fn download_file(&self, file_id: &str) -> Result<(String, Vec<u8>)> {
        let file: TgFile = self.call("getFile", json!({ "file_id": file_id })).await?;
        let Some(file_path) = file.file_path else {
            bail!("file {file_id} has no downloadable path");
        };
        let filename = file_path
            .rsplit('/')
            .next()
            .unwrap_or("arquivo.bin")
            .to_string();
        let bytes = self
            .http
            .get(format!("{}/{file_path}", self.file_base))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok((filename, bytes.to_vec()))
    }
}
