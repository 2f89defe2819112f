use std::sync::Arc;

use rollbook::RollbookError;
use rollbook::config::fetch_config;
use rollbook::discovery::GammaCatalog;
use rollbook::session::{Orchestrator, SessionContext};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), RollbookError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Both reqwest and tungstenite pull in rustls; pick the provider once.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let app_config = fetch_config()?;
    let catalog = GammaCatalog::new(app_config.catalog.clone(), app_config.session.assets.clone())?;

    let mut orchestrator = Orchestrator::new(SessionContext {
        catalog: Arc::new(catalog),
        feed: app_config.feed,
        session: app_config.session,
        storage: app_config.storage,
    });

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                on_signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for interrupt"),
        }
    });

    if let Err(e) = orchestrator.run(cancel).await {
        error!(error = %e, "Shutdown finished with a storage failure");
        return Err(e);
    }

    info!("All sessions closed cleanly");
    Ok(())
}
