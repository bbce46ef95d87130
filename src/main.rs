// ─────────────────────────────────────────────────────────────────────────────
// signal-exec-core: Signal → Execution → Position pipeline
//
// Ingestion → durable queue → Signal Feed → (policy) → Executor →
// Exchange Client → Position store → Reconciler → Event Bus → subscribers.
// ─────────────────────────────────────────────────────────────────────────────
mod bus;
mod config;
mod db;
mod error;
mod exchange;
mod executor;
mod feed;
mod ingestion;
mod reconciler;
mod recognition;
mod registry;
mod risk;

use std::sync::Arc;

use config::{LogFormat, Settings};
use exchange::live::LiveExchangeClient;
use exchange::sim::SimExchangeClient;
use exchange::ExchangeClient;
use feed::SignalFeed;
use recognition::RecognitionEngine;
use reconciler::Reconciler;
use registry::{ChannelCache, KeyedLocks};

fn init_tracing(format: &LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(env_filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(env_filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?.into_shared();
    init_tracing(&settings.log_format);
    tracing::info!("signal-exec-core starting");

    if settings.risk_management_disabled {
        tracing::warn!("RISK_MANAGEMENT_DISABLED override engaged — sizing guard rails are bypassed");
    }
    tracing::info!(shadow_mode = settings.shadow_mode, "venue mode selected");

    let pool = db::connect(&settings.database_url).await?;
    let event_bus = bus::EventBus::new(&settings.redis_url)?;

    let exchange: Arc<dyn ExchangeClient> = if settings.shadow_mode {
        Arc::new(SimExchangeClient::new())
    } else {
        Arc::new(LiveExchangeClient::new(
            "https://api.venue.example",
            settings.exchange_api_key.clone(),
            settings.exchange_secret_key.clone(),
            settings.exchange_recv_window_ms as i64,
        ))
    };

    let channel_cache = ChannelCache::new();
    tokio::spawn(channel_cache.clone().run_invalidation_listener(event_bus.clone()));

    // Shared keyed-lock registry: the Executor (via SignalFeed) and the
    // Reconciler both serialize on the same (channel, asset) key so the two
    // never race on the same position.
    let locks = KeyedLocks::new();

    let recognition = RecognitionEngine::new(
        "https://api.openai.com/v1",
        settings.llm_api_key.clone(),
        settings.llm_model.clone(),
    );

    let reconciler = Reconciler::new(pool.clone(), event_bus.clone(), exchange.clone(), locks.clone());
    tokio::spawn(reconciler.run_forever(settings.reconcile_interval_secs));

    let feed = Arc::new(SignalFeed::new(
        pool.clone(),
        event_bus.clone(),
        recognition,
        exchange.clone(),
        settings.min_signal_confidence,
        locks.clone(),
        settings.risk_management_disabled,
    ));
    for worker_id in 0..settings.worker_pool_size {
        let feed = feed.clone();
        tokio::spawn(async move { feed.run_worker(worker_id).await });
    }

    let bot = teloxide::Bot::new(settings.chat_bot_token.clone());
    let ingestion = ingestion::Ingestion::new(pool.clone(), event_bus.clone());

    tracing::info!(workers = settings.worker_pool_size, "signal-exec-core ready, entering ingestion loop");
    ingestion.run(bot).await;

    Ok(())
}
