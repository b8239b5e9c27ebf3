use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    domain::ChatId,
    errors::Error,
    events::EngineEvent,
    formatting::{event_html, split_lines},
    messaging::port::MessagingPort,
    ports::Notifier,
    Result,
};

/// Delivers engine events as chat messages.
///
/// Sudo admins get every event. The owning operator additionally gets the
/// events that concern them directly (warnings, deactivation, reactivation).
pub struct MessagingNotifier {
    messenger: Arc<dyn MessagingPort>,
    sudo_admins: Vec<i64>,
}

impl MessagingNotifier {
    pub fn new(messenger: Arc<dyn MessagingPort>, sudo_admins: Vec<i64>) -> Self {
        Self {
            messenger,
            sudo_admins,
        }
    }

    fn recipients(&self, event: &EngineEvent) -> Vec<i64> {
        let mut out = self.sudo_admins.clone();
        if let Some(owner) = event.owner_recipient() {
            if !out.contains(&owner.0) {
                out.push(owner.0);
            }
        }
        out
    }
}

#[async_trait]
impl Notifier for MessagingNotifier {
    async fn notify(&self, event: &EngineEvent) -> Result<()> {
        let html = event_html(event);
        let limit = self.messenger.capabilities().max_message_len;
        let chunks = split_lines(&html, limit);

        let recipients = self.recipients(event);
        let mut failures = 0usize;
        for chat in &recipients {
            for chunk in &chunks {
                if let Err(e) = self.messenger.send_html(ChatId(*chat), chunk).await {
                    tracing::warn!(chat, kind = event.kind(), error = %e, "failed to deliver notification");
                    failures += 1;
                    break;
                }
            }
        }

        if !recipients.is_empty() && failures == recipients.len() {
            return Err(Error::External(format!(
                "{} notification reached no recipient",
                event.kind()
            )));
        }
        Ok(())
    }
}
