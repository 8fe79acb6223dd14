use adgate::api::{create_router, AppState};
use adgate::config::{load_config, ClientMode, GatewayConfig};
use adgate::credentials::{CredentialStore, Vault};
use adgate::oauth::run_purge_loop;
use adgate::provider::{FakeProviderClient, HttpProviderClient, ProviderClient};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adgate=info".into()),
        )
        .init();

    info!("adgate starting...");

    let mut config = match std::env::var("ADGATE_CONFIG") {
        Ok(path) => {
            info!(path = %path, "Loading configuration");
            load_config(&path)?
        }
        Err(_) => GatewayConfig::default(),
    };
    config.apply_env_overrides();

    let key = std::env::var("ADGATE_ENCRYPTION_KEY")
        .context("ADGATE_ENCRYPTION_KEY must be set (base64-encoded 32-byte key)")?;
    let vault = Vault::new(&key).context("Invalid ADGATE_ENCRYPTION_KEY")?;

    let store = Arc::new(
        CredentialStore::new(&config.storage.database_path)
            .context("Failed to open credential store")?,
    );
    info!(path = %config.storage.database_path, "Credential store ready");

    let client: Arc<dyn ProviderClient> = match config.gateway.client {
        ClientMode::Http => Arc::new(
            HttpProviderClient::new(config.providers.clone(), config.gateway.http_timeout())
                .context("Failed to build HTTP provider client")?,
        ),
        ClientMode::Fake => {
            warn!("Using fake provider client; no real provider is contacted");
            Arc::new(FakeProviderClient::new())
        }
    };

    let state = AppState::new(&config, store, vault, client);

    tokio::spawn(run_purge_loop(
        state.oauth.state_manager().clone(),
        config.oauth.state_cleanup_interval_seconds,
    ));

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;
    info!(address = %config.server.bind_address, "adgate listening");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
