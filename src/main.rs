use std::sync::Arc;

use anyhow::Context;
use call_guard::config::GuardConfig;
use call_guard::guard::{Guard, spawn_expiry_sweep};
use call_guard::routes::{GuardRouteState, guard_routes};
use call_guard::store::{ConversationStateStore, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = GuardConfig::from_env();

    eprintln!("📵 Call Guard v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   API: http://0.0.0.0:{}/api/events", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let db = LibSqlBackend::open(&config)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;
    let db = Arc::new(db);

    // ── Expiry sweep ─────────────────────────────────────────────────────
    let _sweep_handle = config.sweep_interval.map(|every| {
        let store: Arc<dyn ConversationStateStore> = db.clone();
        spawn_expiry_sweep(store, every)
    });

    // ── HTTP server ──────────────────────────────────────────────────────
    let guard = Arc::new(Guard::new(db.clone(), db.clone(), db, &config));
    let app = guard_routes(GuardRouteState { guard });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "Call guard server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down...");
        })
        .await?;

    Ok(())
}
