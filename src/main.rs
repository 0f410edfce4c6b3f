//! iREVA server - resilience and bootstrap layer
//!
//! This is the composition root that wires together all the components.

use ireva_server::adapters::inbound::{ApiRoutes, AppRouter};
use ireva_server::adapters::outbound::SqliteDatabase;
use ireva_server::application::{Bootstrapper, PRIORITY_LISTENER};
use ireva_server::config::load_config;
use ireva_server::infrastructure::init_logging;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    init_logging(&cfg);

    tracing::info!(
        "starting ireva-server env={} port={}",
        cfg.node_env,
        cfg.port
    );

    // ===== COMPOSITION ROOT =====

    // 1. Outbound adapters: a lazily connecting database
    let database = Arc::new(SqliteDatabase::from_config(&cfg));

    // 2. Essential boot phase; core and background phases continue in the background
    let app = AppRouter::new();
    let bootstrapper = Bootstrapper::new(cfg.clone(), app.clone(), database);
    let routes = Arc::new(ApiRoutes::with_services(bootstrapper.services()));
    let handles = bootstrapper.with_registrar(routes).bootstrap();

    // 3. Bind the listener before the database has connected
    let listener = TcpListener::bind(cfg.listen_addr()).await?;
    tracing::info!("HTTP listening on {}", cfg.listen_addr());

    let stop = CancellationToken::new();
    let server = {
        let stop = stop.clone();
        let router = app.router();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        })
    };

    handles
        .shutdown
        .register("http-listener", PRIORITY_LISTENER, move || async move {
            stop.cancel();
            server.await??;
            Ok(())
        });

    if cfg.is_production() {
        handles.shutdown.install_panic_hook();
    }

    // Runs shutdown on SIGINT/SIGTERM; the coordinator exits the process.
    handles.shutdown.clone().listen_for_signals().await;

    Ok(())
}
