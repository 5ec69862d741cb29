//! OpenID Connect relying-party demo server
//!
//! Binds the relying-party entry points to `/ni-oidc/*`, keeps sessions and
//! accounts in memory, and renders a minimal home and account page.
//!
//! Configure the provider in `oidc-server.toml` or through environment
//! variables, e.g.:
//!
//! ```text
//! OIDC__OIDC__PROVIDER_URL=https://idp.example.com
//! OIDC__OIDC__CLIENT_ID=my-client
//! OIDC__OIDC__CLIENT_SECRET=my-secret
//! OIDC__OIDC__SITE_BASE_URL=http://localhost:3000
//! ```

use anyhow::{Context, Result};
use ras_identity_oidc::{InMemoryAccountRepository, OidcManager};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod routes;
mod session;

use config::OidcServerConfig;
use routes::AppState;
use session::SessionRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = OidcServerConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    let accounts = Arc::new(InMemoryAccountRepository::new());
    let manager = OidcManager::new(config.oidc.clone(), accounts.clone())
        .context("Failed to create OIDC manager")?;

    let sessions = SessionRegistry::new(config.session_idle_timeout());
    sessions.spawn_purger(Duration::from_secs(60));

    let state = AppState {
        manager: Arc::new(manager),
        sessions,
        accounts,
    };

    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let addr = config.bind_address();
    info!("OIDC demo server listening on http://{}", addr);
    info!("Identity provider: {}", config.oidc.provider_url);
    info!("Callback URL: {}", config.oidc.callback_url(None));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
