//! simdeck agent
//!
//! Single binary that runs:
//! - REST API for modem inventory and eSIM provisioning
//! - WebSocket endpoint for interactive profile downloads
//! - WebSocket endpoint for live inventory updates
//! - In `--simulate` mode, two fake modems with in-memory eUICCs

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use simdeck_agent::config::{Config, SettingsStore};
use simdeck_agent::lpa::{SessionFactory, SessionOptions};
use simdeck_agent::modem::bus::ModemBus;
use simdeck_agent::modem::dbus::ModemManagerBus;
use simdeck_agent::modem::registry::Registry;
use simdeck_agent::service::ProvisioningService;
use simdeck_agent::{api, simulate, state, ws_inventory};

/// Modem inventory and eSIM provisioning agent.
#[derive(Parser, Debug)]
#[command(name = "simdeck-agent", about = "Modem inventory and eSIM provisioning agent")]
struct Cli {
    /// Configuration file. Defaults are used when it does not exist.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address, overriding `app.listen_address`.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Run against simulated modems and eUICCs.
    #[arg(long, default_value_t = false)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config).map_err(anyhow::Error::msg)?;

    // ── Logging ─────────────────────────────────────────────────
    let default_filter = if config.app.is_production() {
        "info"
    } else {
        "debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!(
        config = %cli.config.display(),
        environment = %config.app.environment,
        simulate = cli.simulate,
        "simdeck-agent starting"
    );

    // ── Hardware ────────────────────────────────────────────────
    let options = SessionOptions {
        force_at: config.lpa.force_at,
        slowdown: config.lpa.slowdown,
    };
    let (bus, sessions): (Arc<dyn ModemBus>, Option<SessionFactory>) = if cli.simulate {
        let hardware = simulate::demo()?;
        let sessions = SessionFactory::new(
            Arc::new(hardware.driver),
            Arc::new(hardware.engine),
            options,
        );
        (Arc::new(hardware.bus), Some(sessions))
    } else {
        let bus = ModemManagerBus::connect().await?;
        tracing::warn!("no profile engine available, eUICC operations are disabled");
        (Arc::new(bus), None)
    };

    // ── Shared state ────────────────────────────────────────────
    let service = ProvisioningService::new(
        Registry::new(bus),
        sessions,
        SettingsStore::new(config.modems.clone()),
        config.lpa.restart_timeout,
    );
    let state = state::AppState::new(service);

    match state.registry().modems().await {
        Ok(snapshot) => tracing::info!(count = snapshot.len(), "initial modem inventory"),
        Err(e) => tracing::warn!(error = %e, "initial modem enumeration failed"),
    }
    if let Err(e) = state.start_inventory_relay().await {
        tracing::warn!(error = %e, "hot-plug events unavailable");
    }

    // ── Router ──────────────────────────────────────────────────
    let app = Router::new()
        .nest("/api", api::router())
        .route("/ws", axum::routing::get(ws_inventory::handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // ── Listen ──────────────────────────────────────────────────
    let addr = cli.listen.unwrap_or(config.app.listen_address);
    tracing::info!("simdeck-agent listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    // ── Shutdown handling ───────────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        result = server => {
            match result {
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => tracing::error!("server task failed: {e}"),
                Ok(Ok(())) => {}
            }
        }
    }

    tracing::info!("simdeck-agent stopped");
    Ok(())
}
