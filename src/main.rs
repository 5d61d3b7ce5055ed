use otp_keygate::server::{build_router, AppState};
use otp_keygate::{
    CodeRetriever, HashmapKeyStore, ImapMailStore, KeyLedger, OtpGate, ServiceConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = ServiceConfig::from_env();

    // RUST_LOG wins; DEBUG=true only raises the fallback level
    let debug = config.as_ref().is_ok_and(|config| config.debug);
    let fallback = if debug { "otp_keygate=debug,info" } else { "otp_keygate=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(true)
        .init();

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    tracing::info!(
        email = %config.mailbox.email(),
        imap_host = %config.mailbox.imap_host,
        sender = %config.mailbox.sender(),
        admin_enabled = config.admin_secret.is_some(),
        "Starting otp-keygate"
    );

    let store = Arc::new(RwLock::new(HashmapKeyStore::default()));
    let ledger = KeyLedger::new(store, config.keys.clone());
    let retriever = CodeRetriever::new(ImapMailStore::new(config.mailbox.clone()), &config.mailbox);
    let gate = OtpGate::new(ledger, retriever);
    let app = build_router(AppState::new(gate, config.admin_secret.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
