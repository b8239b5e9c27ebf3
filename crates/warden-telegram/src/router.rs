use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use tokio::sync::Mutex;

use warden_core::{
    config::Config, domain::ChatId, engine::Engine, messaging::port::MessagingPort,
    security::RateLimiter,
};

use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub engine: Arc<Engine>,
    pub messenger: Arc<dyn MessagingPort>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl AppState {
    pub fn new(cfg: Arc<Config>, engine: Arc<Engine>, messenger: Arc<dyn MessagingPort>) -> Self {
        let rate_limiter = RateLimiter::new(cfg.rate_limit_requests, cfg.rate_limit_window);
        Self {
            cfg,
            engine,
            messenger,
            rate_limiter: Arc::new(Mutex::new(rate_limiter)),
        }
    }
}

/// Serve operator commands until Ctrl-C.
pub async fn run_polling(bot: Bot, state: Arc<AppState>) -> anyhow::Result<()> {
    match bot.get_me().await {
        Ok(me) => tracing::info!(bot = %me.username(), "telegram bot started"),
        Err(e) => tracing::warn!(error = %e, "get_me failed; continuing"),
    }
    tracing::info!(sudo_admins = state.cfg.sudo_admins.len(), "accepting commands");

    // Best-effort startup notice to the sudo admins.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let html = format!(
                "🛡 <b>Panel warden started</b>\n\n{}",
                state.engine.monitor().status_html().await
            );
            for admin in &state.cfg.sudo_admins {
                if let Err(e) = state.messenger.send_html(ChatId(*admin), &html).await {
                    tracing::warn!(chat = admin, error = %e, "startup notice failed");
                }
            }
        });
    }

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    tracing::info!("telegram dispatcher stopped");
    Ok(())
}
