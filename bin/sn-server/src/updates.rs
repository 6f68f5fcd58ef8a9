//! Long-poll update loop: one task per incoming update, routed into the
//! adapter.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use sn_domain::ChatUserId;
use sn_telegram::BotAdapter;

use crate::telegram_api::{TelegramApi, TgUpdate};

pub async fn run_update_loop(
    api: Arc<TelegramApi>,
    adapter: Arc<BotAdapter>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut offset: i64 = 0;
    loop {
        let updates = tokio::select! {
            updates = api.get_updates(offset, 30) => updates,
            _ = shutdown.changed() => break,
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "getUpdates failed, backing off");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let api = Arc::clone(&api);
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move {
                if let Err(e) = dispatch(&api, &adapter, update).await {
                    error!(error = %e, "Update handling failed");
                }
            });
        }
    }
    debug!("Update loop stopped");
}

async fn dispatch(api: &TelegramApi, adapter: &BotAdapter, update: TgUpdate) -> anyhow::Result<()> {
    if let Some(callback) = update.callback_query {
        let user_id = ChatUserId(callback.from.id);
        if let Some(data) = callback.data.as_deref() {
            adapter.handle_callback(user_id, data).await?;
        }
        api.answer_callback_query(&callback.id).await.ok();
        return Ok(());
    }

    let Some(message) = update.message else {
        return Ok(());
    };
    // Only private conversations carry verification and intake traffic.
    if message.chat.kind != "private" {
        return Ok(());
    }
    let Some(from) = message.from else {
        return Ok(());
    };
    let user_id = ChatUserId(from.id);
    let username = from.username.clone().unwrap_or_else(|| format!("user{}", from.id));

    if let Some(document) = message.document {
        return adapter.handle_attachment(user_id, &document.file_id).await;
    }
    if let Some(photo) = message.photo {
        if let Some(largest) = photo.last() {
            return adapter.handle_attachment(user_id, &largest.file_id).await;
        }
    }

    let Some(text) = message.text else {
        return Ok(());
    };
    match text.split_whitespace().next().unwrap_or_default() {
        "/start" => adapter.handle_start(user_id, &username).await,
        "/suporte" | "/support" => adapter.handle_support(user_id, &username).await,
        "/meus_chamados" | "/status" => adapter.handle_list_tickets(user_id).await,
        _ => adapter.handle_text(user_id, &text).await,
    }
}
