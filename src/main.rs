//! Kirby - real-time market data ingest and broadcast engine.
//!
//! Collects OHLCV candles, perpetual funding and open interest from exchange
//! streams, persists them minute-aligned, and pushes fresh rows to WebSocket
//! subscribers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::ws::WebSocketUpgrade,
    extract::State,
    response::Response,
    routing::get,
    Router,
};
use clap::Parser;
use dotenv::dotenv;
use tokio::{net::TcpListener, sync::watch};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kirby::bus::NotificationBus;
use kirby::catalog::{self, MarketCatalog};
use kirby::config::KirbyConfig;
use kirby::session::{self, SessionContext, SessionRegistry};
use kirby::storage::Db;
use kirby::supervisor::Supervisor;

#[derive(Debug, Parser)]
#[command(name = "kirby", about = "Real-time market data ingest and broadcast")]
struct Args {
    /// Listen address for the live push endpoint.
    #[arg(long, env = "KIRBY_BIND", default_value = "0.0.0.0:3000")]
    bind: String,

    /// SQLite database path.
    #[arg(long, env = "KIRBY_DB_PATH", default_value = "kirby.db")]
    db_path: String,
}

#[derive(Clone)]
struct AppState {
    ctx: Arc<SessionContext>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let cfg = Arc::new(KirbyConfig::from_env());

    info!("🚀 Kirby ingest engine starting");

    let db_path = resolve_data_path(&args.db_path);
    let db = Arc::new(Db::open(&db_path, cfg.storage.pool_size)?);
    info!(path = %db_path, "📊 database ready");

    // The external config loader owns the catalog. When it has not run yet
    // (fresh dev checkout), fall back to the default Hyperliquid set.
    let mut catalog = load_catalog(&db)?;
    if catalog.is_empty() {
        warn!("catalog empty; seeding default markets");
        db.with_writer(|conn| catalog::seed_default(conn))
            .context("seeding default catalog")?;
        catalog = load_catalog(&db)?;
    }
    let catalog = Arc::new(catalog);

    let bus = Arc::new(NotificationBus::new(catalog.clone()));

    // Supervisor owns the writer and the collector fleet.
    let (stop_tx, stop_rx) = watch::channel(false);
    let supervisor = Supervisor::new(db.clone(), bus.clone(), catalog.clone(), cfg.clone());
    let supervisor_task = tokio::spawn(supervisor.run(stop_rx));

    // Live push endpoint.
    let ctx = Arc::new(SessionContext {
        catalog,
        db,
        bus,
        registry: SessionRegistry::new(cfg.session.max_sessions),
        cfg: cfg.session.clone(),
    });
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(AppState { ctx });

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!(addr = %args.bind, "🎯 live push endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(stop_tx))
        .await
        .context("server error")?;

    supervisor_task.await.context("supervisor join")??;
    info!("kirby stopped");
    Ok(())
}

fn load_catalog(db: &Db) -> Result<MarketCatalog> {
    db.with_reader(|conn| Ok(MarketCatalog::load(conn)))
        .context("reading catalog")?
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let max_frame = state.ctx.cfg.max_frame_bytes;
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| session::run_session(socket, state.ctx))
}

async fn health_check() -> &'static str {
    "kirby operational"
}

async fn shutdown_signal(stop_tx: watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    let _ = stop_tx.send(true);
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kirby=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), plus the crate directory for
    // runs with --manifest-path from elsewhere.
    let _ = dotenv();
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}

/// Relative database paths anchor to the crate directory, not the caller's
/// cwd, so running from elsewhere never creates a stray empty database.
fn resolve_data_path(raw: &str) -> String {
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join(p)
        .to_string_lossy()
        .to_string()
}
