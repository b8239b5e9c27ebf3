//! Telegram update handlers.
//!
//! Each message is authenticated (sudo admin, panel operator, or stranger),
//! rate limited, and dispatched to a command handler whose HTML reply is sent
//! back through the throttled messenger.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use warden_core::{
    domain::{ChatId, UserId},
    formatting::{escape_html, split_lines},
    messaging::{port::MessagingPort, types::ChatAction, types::Command},
    security::{role_of, Role},
};

use crate::router::AppState;

mod args;
mod commands;

pub async fn handle_message(_bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let chat_id = ChatId(msg.chat.id.0);
    let user_id = UserId(user.id.0 as i64);
    let Some(cmd) = Command::parse(chat_id, user_id, user.username.clone(), text) else {
        return Ok(());
    };

    let role = match resolve_role(&state, user_id).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(user = user_id.0, error = %e, "role lookup failed");
            reply(&state, chat_id, "❌ Storage unavailable, try again later.").await;
            return Ok(());
        }
    };
    if role == Role::Stranger {
        tracing::info!(user = user_id.0, command = %cmd.name, "refused command from unknown user");
        reply(&state, chat_id, "Unauthorized. Contact the panel owner for access.").await;
        return Ok(());
    }

    if commands::is_metered(&cmd.name) {
        let verdict = state.rate_limiter.lock().await.check(user_id);
        if let Err(wait) = verdict {
            reply(
                &state,
                chat_id,
                &format!("⏳ Too many requests. Try again in {}s.", wait.as_secs().max(1)),
            )
            .await;
            return Ok(());
        }
        let _ = state
            .messenger
            .send_chat_action(chat_id, ChatAction::Typing)
            .await;
    }

    tracing::info!(user = user_id.0, command = %cmd.name, ?role, "command received");
    let html = match commands::execute(&state, role, &cmd).await {
        Ok(html) => html,
        Err(e) => {
            tracing::warn!(user = user_id.0, command = %cmd.name, error = %e, "command failed");
            format!("❌ <code>{}</code>", escape_html(&e.to_string()))
        }
    };
    reply(&state, chat_id, &html).await;
    Ok(())
}

async fn resolve_role(state: &AppState, user_id: UserId) -> warden_core::Result<Role> {
    if state.cfg.is_sudo(user_id.0) {
        return Ok(Role::Sudo);
    }
    let owns = !state.engine.operator_panels(user_id).await?.is_empty();
    Ok(role_of(Some(user_id), &state.cfg.sudo_admins, owns))
}

async fn reply(state: &AppState, chat_id: ChatId, html: &str) {
    let limit = state.messenger.capabilities().max_message_len;
    for chunk in split_lines(html, limit) {
        if let Err(e) = state.messenger.send_html(chat_id, &chunk).await {
            tracing::warn!(chat = chat_id.0, error = %e, "reply failed");
            return;
        }
    }
}
