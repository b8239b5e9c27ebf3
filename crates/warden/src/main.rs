use std::sync::Arc;

use teloxide::Bot;

use warden_core::{
    config::Config,
    engine::Engine,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    notify::MessagingNotifier,
};
use warden_marzban::MarzbanConnector;
use warden_sqlite::SqlitePanelStore;
use warden_telegram::{
    router::{run_polling, AppState},
    TelegramMessenger,
};

#[tokio::main]
async fn main() -> Result<(), warden_core::Error> {
    warden_core::logging::init("warden")?;

    let cfg = Arc::new(Config::load()?);
    let store = Arc::new(SqlitePanelStore::connect(&cfg.database_path).await?);
    let connector = Arc::new(MarzbanConnector::from_config(&cfg)?);

    let bot = Bot::new(cfg.bot_token.clone());
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));
    let notifier = Arc::new(MessagingNotifier::new(
        messenger.clone(),
        cfg.sudo_admins.clone(),
    ));

    let engine = Arc::new(Engine::new(cfg.clone(), store, connector, notifier));
    engine.monitor().start().await;

    let state = Arc::new(AppState::new(cfg, engine.clone(), messenger));
    let served = run_polling(bot, state).await;

    engine.monitor().stop().await;
    served.map_err(|e| warden_core::Error::External(format!("telegram bot failed: {e}")))?;
    tracing::info!("shut down");
    Ok(())
}
