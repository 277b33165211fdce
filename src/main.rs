use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cinnamon_net::config::NetConfig;
use cinnamon_net::game::constants::kind;
use cinnamon_net::game::entity::Component;
use cinnamon_net::game::runner::TickRunner;
use cinnamon_net::game::tick_loop::{ServerEvent, TickLoop};
use cinnamon_net::metrics::Metrics;
use cinnamon_net::net::queue::lossless;
use cinnamon_net::net::transport::ServerTransport;
use cinnamon_net::util::quat::Quat;
use cinnamon_net::util::vec3::Vec3;

/// Longest wait for connected clients to receive their goodbye
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Cinnamon server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = NetConfig::load_or_default();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    info!(
        "Configuration loaded: {}, tick_rate={}, max_connections={}",
        config.socket_addr(),
        config.tick_rate,
        config.max_connections
    );

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());

    #[cfg(feature = "metrics_endpoint")]
    {
        let metrics_clone = metrics.clone();
        let metrics_port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = cinnamon_net::metrics::start_metrics_server(metrics_clone, metrics_port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    // World
    let (accept, accept_rx) = lossless();
    let mut tick_loop = TickLoop::new(&config, accept_rx, metrics.clone());
    seed_world(&mut tick_loop);

    let transport = ServerTransport::bind(config.clone(), accept, metrics.clone()).await?;
    info!("Server ready on udp://{}", transport.local_addr()?);

    let runner = TickRunner::spawn(tick_loop, config.tick_interval(), metrics.clone(), log_events)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let transport_task = tokio::spawn(transport.run(shutdown_rx));

    // Shutdown signal handler
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Shutdown signal received, draining");

    // Let connected clients receive their pending reliable messages first
    runner.drain();
    let started = Instant::now();
    while !runner.is_finished() && started.elapsed() < DRAIN_TIMEOUT {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    if !runner.is_finished() {
        warn!("Drain timed out, stopping tick loop");
        runner.stop();
    }
    let final_state = tokio::task::spawn_blocking(move || runner.join()).await?;
    info!("Tick loop finished in state {:?}", final_state);

    if shutdown_tx.send(true).is_err() {
        warn!("Transport already stopped");
    }
    match transport_task.await {
        Ok(Err(e)) => error!("Transport error: {}", e),
        Err(e) => error!("Transport task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Server stopped");
    Ok(())
}

/// Two server-owned carts parked near spawn
fn seed_world(tick_loop: &mut TickLoop) {
    let store = tick_loop.store_mut();
    for x in [-4.0, 4.0] {
        let cart = store.create([
            Component::Kind(kind::CART),
            Component::Position(Vec3::new(x, 0.0, 6.0)),
            Component::Orientation(Quat::IDENTITY),
            Component::Velocity(Vec3::ZERO),
            Component::Owner(0),
        ]);
        info!("Spawned cart {}", cart);
    }
}

fn log_events(events: Vec<ServerEvent>) {
    for event in events {
        match event {
            ServerEvent::Connected {
                connection,
                entity,
                identity,
            } => info!("Player {} joined as entity {} ({:x})", identity, entity, connection),
            ServerEvent::Disconnected {
                connection,
                entity,
                reason,
            } => info!("Connection {:x} left, entity {} removed: {:?}", connection, entity, reason),
            ServerEvent::CommandRejected {
                connection,
                sequence,
                error,
            } => warn!("Command {} from {:x} rejected: {}", sequence, connection, error),
            ServerEvent::ScriptRejected { actor, error } => {
                warn!("Script command for entity {} rejected: {}", actor, error)
            }
        }
    }
}
