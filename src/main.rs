use livetok::app::AppContext;
use livetok::config::ServerSettings;
use livetok::server;
use livetok::snapshot::ConfigStore;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 2. Settings and config snapshot; a broken snapshot is fatal here
    let settings = ServerSettings::load()?;
    let store = ConfigStore::load(&settings.paths.snapshot).map_err(|e| {
        error!(
            path = %settings.paths.snapshot.display(),
            error = %e,
            "Failed to load config snapshot"
        );
        e
    })?;

    let app = Arc::new(AppContext::new(settings, store));

    // 3. Background work
    app.start();

    let username = app.config.current().document.tiktok_username.clone();
    if !username.is_empty() {
        if let Err(e) = app.start_tracking(&username).await {
            error!(username = %username, error = %e, "Failed to track configured user");
        }
    }

    let signals = app.shutdown.clone();
    tokio::spawn(async move { signals.wait_for_os_signal().await });

    // 4. Serve until shutdown
    let served = server::serve(app.clone()).await;

    app.close().await;

    served?;
    info!("LiveTok shutdown complete");
    Ok(())
}
