//! Uploads a ticket's stored attachment references to its atendimento once
//! the sync lands. Registered as a `HubSoftTicketSynced` handler.

use std::sync::Arc;

use tracing::{info, warn};

use sn_app::ChatService;
use sn_domain::events::HubSoftTicketSynced;
use sn_domain::TicketSyncKind;
use sn_hubsoft::HubSoftClient;
use sn_storage::TicketRepository;

pub struct AttachmentUploader {
    chat: Arc<dyn ChatService>,
    client: Arc<HubSoftClient>,
    tickets: Arc<dyn TicketRepository>,
}

impl AttachmentUploader {
    pub fn new(
        chat: Arc<dyn ChatService>,
        client: Arc<HubSoftClient>,
        tickets: Arc<dyn TicketRepository>,
    ) -> Self {
        Self {
            chat,
            client,
            tickets,
        }
    }

    pub async fn on_ticket_synced(&self, event: HubSoftTicketSynced) -> anyhow::Result<()> {
        if event.sync_kind != TicketSyncKind::Create {
            return Ok(());
        }
        let Some(ticket) = self.tickets.find_by_id(event.ticket_id).await? else {
            return Ok(());
        };
        if ticket.attachments.is_empty() {
            return Ok(());
        }

        let mut uploaded = 0usize;
        for file_id in &ticket.attachments {
            match self.chat.download_file(file_id).await {
                Ok((filename, content)) => {
                    match self
                        .client
                        .add_attachment_to_atendimento(&event.hubsoft_ticket_id, &filename, content)
                        .await
                    {
                        Ok(true) => uploaded += 1,
                        Ok(false) => {
                            warn!(hubsoft_id = %event.hubsoft_ticket_id, file_id, "Upstream refused attachment")
                        }
                        Err(e) => {
                            warn!(hubsoft_id = %event.hubsoft_ticket_id, file_id, error = %e, "Attachment upload failed")
                        }
                    }
                }
                Err(e) => {
                    warn!(file_id, error = %e, "Attachment download failed");
                }
            }
        }

        info!(
            ticket_id = %event.ticket_id,
            hubsoft_id = %event.hubsoft_ticket_id,
            uploaded,
            total = ticket.attachments.len(),
            "Attachment upload pass finished"
        );
        Ok(())
    }
}
