use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use cove_relay::{
    chat::{ChatStore, MemoryChatStore, RedisChatStore},
    cli::{self, Cli, Commands},
    config::{Config, RoomBackend},
    fanout::RedisBus,
    handlers::{self, HealthState},
    registry::ConnectionRegistry,
    storage::{MemoryRoomStore, RedisRoomStore, RoomStore},
    websocket::SignalingState,
};
use signal_bus::{Bus, LocalBus};

#[tokio::main]
async fn main() {
    // Default to WARN when RUST_LOG is not set.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Some(Commands::Probe {
        url,
        room,
        name,
        message,
        watch,
    }) = cli.command
    {
        if let Err(err) = cli::run_probe(url, room, name, message, watch).await {
            error!("probe failed: {}", err);
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!("Starting Cove relay on port {}", config.port);
    info!("Room backend: {}", config.backend.as_str());

    let op_timeout = Duration::from_millis(config.store_timeout_ms);
    let (store, chat, bus): (Arc<dyn RoomStore>, Arc<dyn ChatStore>, Arc<dyn Bus>) =
        match config.backend {
            RoomBackend::Memory => (
                Arc::new(MemoryRoomStore::new()),
                Arc::new(MemoryChatStore::new()),
                Arc::new(LocalBus::new()),
            ),
            RoomBackend::Redis => {
                info!("Redis URL: {}", config.redis_url);
                let store = match RedisRoomStore::new(
                    &config.redis_url,
                    config.room_ttl_seconds,
                    op_timeout,
                )
                .await
                {
                    Ok(store) => store,
                    Err(err) => {
                        error!("Failed to connect to Redis: {}", err);
                        std::process::exit(1);
                    }
                };
                let chat = match RedisChatStore::new(
                    &config.redis_url,
                    config.chat_ttl_seconds,
                    op_timeout,
                )
                .await
                {
                    Ok(chat) => chat,
                    Err(err) => {
                        error!("Failed to connect to Redis for chat: {}", err);
                        std::process::exit(1);
                    }
                };
                let bus = match RedisBus::connect(&config.redis_url).await {
                    Ok(bus) => bus,
                    Err(err) => {
                        error!("Failed to connect to Redis pub/sub: {}", err);
                        std::process::exit(1);
                    }
                };
                (Arc::new(store), Arc::new(chat), Arc::new(bus))
            }
        };

    let registry = Arc::new(ConnectionRegistry::new(store.clone()));
    let signaling = SignalingState::new(registry, chat, bus, config.chat_history_limit);
    let health = HealthState::new(store);

    let app = handlers::router(signaling, health);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("Cove relay listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
