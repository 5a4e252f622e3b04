//! oopzbot-player - Main entry point
//!
//! Wires the playback core together: shared state store, cache and
//! resolver, state publisher, command relay, actuator bridge and the
//! playback controller, then serves the HTTP state/command API until
//! Ctrl+C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oopzbot_common::PlayState;
use oopzbot_player::actuator::{ActuatorBackend, Bridge, BridgeSettings, WebDriverBackend};
use oopzbot_player::api::{self, AppContext};
use oopzbot_player::cache::metadata::{MetadataStore, SqliteMetadataStore};
use oopzbot_player::cache::resolver::NeteaseResolver;
use oopzbot_player::cache::TrackCache;
use oopzbot_player::config::{Config, StoreBackend};
use oopzbot_player::notify::LogNotifier;
use oopzbot_player::publisher::StatePublisher;
use oopzbot_player::queue::QueueStore;
use oopzbot_player::relay::CommandRelay;
use oopzbot_player::store::{MemoryStateStore, SqliteStateStore, StateStore, KEY_PLAY_STATE};
use oopzbot_player::{Controller, ControllerDeps, ControllerSettings};

/// Command-line arguments for oopzbot-player
#[derive(Parser, Debug)]
#[command(name = "oopzbot-player")]
#[command(about = "Playback core of the oopz music bot")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "OOPZBOT_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "OOPZBOT_PORT")]
    port: Option<u16>,

    /// Database path (overrides the config file)
    #[arg(long, env = "OOPZBOT_DATABASE")]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = oopzbot_common::config::resolve_config_path(
        args.config.as_deref(),
        oopzbot_common::config::CONFIG_ENV_VAR,
    );
    let mut config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(database) = args.database {
        config.database.path = Some(database);
    }

    // Initialize tracing; RUST_LOG wins over the config file
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("oopzbot_player={},tower_http=info", config.logging.level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting oopzbot-player v{}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }

    let db_path = config.database.resolved_path();
    info!("Database: {}", db_path.display());
    let db = oopzbot_common::db::init_database(&db_path)
        .await
        .context("Failed to initialize database")?;

    // Shared state store
    let store: Arc<dyn StateStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStateStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteStateStore::new(
            db.clone(),
            config.store.poll_interval(),
        )),
    };
    let initial: Option<PlayState> = store
        .get(KEY_PLAY_STATE)
        .await
        .context("Failed to read persisted play state")?
        .and_then(|value| serde_json::from_value(value).ok());

    // Cache layer
    let resolver = Arc::new(NeteaseResolver::new(&config.resolver).context("Failed to build track resolver")?);
    let metadata: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(db.clone()));
    let cache = Arc::new(TrackCache::new(
        resolver,
        Arc::clone(&metadata),
        config.resolver.retry_policy(),
        config.cache.max_entries,
    ));

    let (publisher, publisher_task) = StatePublisher::spawn(Arc::clone(&store), &config.store);
    let relay = CommandRelay::new(Arc::clone(&store), config.relay.wait());

    // Actuator bridge
    let mut backends: Vec<Box<dyn ActuatorBackend>> = Vec::new();
    if config.actuator.enabled {
        for backend in &config.actuator.backends {
            let driver = WebDriverBackend::new(backend, &config.actuator.page_url, config.actuator.op_timeout())
                .with_context(|| format!("Failed to configure actuator backend '{}'", backend.name))?;
            backends.push(Box::new(driver));
        }
    } else {
        warn!("Actuator disabled, running without audio output");
    }
    let initial_volume = initial
        .as_ref()
        .map(|s| s.volume)
        .unwrap_or(config.playback.default_volume);
    let (bridge, actuator_events, bridge_task) = Bridge::spawn(
        backends,
        BridgeSettings::from(&config.actuator),
        initial_volume,
        Some(relay.clone()),
    );
    if let Some(room) = config.actuator.room.clone() {
        bridge.join(room);
    }

    // Queue and controller
    let queue = Arc::new(
        QueueStore::load(db.clone())
            .await
            .context("Failed to load queue")?
            .with_write_timeout(config.store.write_timeout()),
    );
    info!("Queue loaded: {} pending entries", queue.len().await);

    let (controller, controller_task) = Controller::spawn(
        ControllerDeps {
            queue,
            cache,
            bridge: bridge.clone(),
            publisher: publisher.clone(),
            relay: relay.clone(),
            notifier: Arc::new(LogNotifier),
        },
        ControllerSettings::from(&config.playback),
        initial,
        Some(actuator_events),
    );
    let relay_task = relay.clone().spawn_consumer(controller.clone());
    let room_handle = bridge.clone();

    let ctx = AppContext {
        controller,
        relay,
        store,
        metadata,
        bridge,
    };
    api::run(&config.server, ctx, shutdown_signal())
        .await
        .context("HTTP server error")?;

    room_handle.leave();
    drop(room_handle);

    // The consumer holds the last controller handle; once it is gone the
    // controller exits and releases the bridge and the publisher.
    relay_task.abort();
    let _ = relay_task.await;
    controller_task.await.context("Controller panicked")?;
    drop(publisher);
    bridge_task.await.context("Actuator bridge panicked")?;
    publisher_task.await.context("State publisher panicked")?;

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
