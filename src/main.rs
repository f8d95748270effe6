use std::sync::Arc;

use sakura_fleet::config::{FleetConfig, ServerConfig};
use sakura_fleet::fleet::{FleetManager, FleetRouteState, fleet_routes};
use sakura_fleet::store::LibSqlBackend;
use sakura_fleet::translate::HttpTranslator;
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let server_config = ServerConfig::from_env()?;
    let fleet_config = FleetConfig::from_env();

    eprintln!("🌸 Sakura Fleet v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Admin API: http://{}/api/sakura/workers", server_config.admin_addr);
    eprintln!(
        "   Warmup: {}s, stagger: {}ms",
        fleet_config.warmup.as_secs(),
        fleet_config.stagger.as_millis()
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&server_config.db_path)
            .await
            .map_err(|e| {
                format!(
                    "failed to open database at {}: {e}",
                    server_config.db_path.display()
                )
            })?
            .with_max_attempts(fleet_config.max_attempts),
    );
    eprintln!("   Database: {}", server_config.db_path.display());

    // ── Fleet ────────────────────────────────────────────────────────────
    let translator = Arc::new(HttpTranslator::new(fleet_config.request_timeout));
    let fleet = Arc::new(FleetManager::new(
        db.clone(),
        db,
        translator,
        fleet_config,
    ));
    let _bootstrap = fleet.spawn_bootstrap();

    // ── Admin API ────────────────────────────────────────────────────────
    let app = fleet_routes(FleetRouteState {
        fleet: Arc::clone(&fleet),
    })
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(server_config.admin_addr).await?;
    tracing::info!(addr = %server_config.admin_addr, "Admin API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    fleet.shutdown().await;
    eprintln!("Goodbye.");
    Ok(())
}
