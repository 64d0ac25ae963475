use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{router, AppState};
use libris_core::{CoreConfig, Library};

/// Address the HTTP server binds to unless `LIBRIS_ADDR` says otherwise.
const DEFAULT_ADDR: &str = "0.0.0.0:8000";

/// Main entry point for the Libris server
///
/// Opens the library, optionally reconciles the catalog with the storage directory, then
/// serves the REST API until interrupted.
///
/// # Environment Variables
/// - `LIBRIS_ADDR`: Server address (default: "0.0.0.0:8000")
/// - `LIBRIS_DATA_DIR`: Base directory for library data (default: "library_data")
/// - `LIBRIS_UPLOAD_DIR`: Storage directory (default: "<data>/uploads")
/// - `LIBRIS_CATALOG_PATH`: Catalog file (default: "<data>/catalog.json")
/// - `LIBRIS_MAX_UPLOAD_BYTES`: Global upload ceiling, with optional K/M/G/T suffix (default: 50G)
/// - `LIBRIS_RECONCILE_ON_STARTUP`: Reconcile catalog and storage at startup (default: true)
///
/// # Returns
/// * `Ok(())` - If the server starts and shuts down cleanly
/// * `Err(anyhow::Error)` - If configuration, startup or serving fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("libris_run=info".parse()?)
                .add_directive("libris_core=info".parse()?)
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::var("LIBRIS_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.into());
    let cfg = Arc::new(CoreConfig::from_lookup(|key| std::env::var(key).ok())?);
    let library = Arc::new(Library::open(cfg.clone())?);

    if cfg.reconcile_on_startup() {
        let reconciling = library.clone();
        let report = tokio::task::spawn_blocking(move || reconciling.reconciler().run(false)).await??;
        tracing::info!(
            "reconciled catalog: {} pruned, {} adopted, {} ignored",
            report.pruned.len(),
            report.adopted.len(),
            report.ignored.len()
        );
    }

    let app = router(AppState { library });

    tracing::info!("++ Starting Libris REST on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("-- Libris REST stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
