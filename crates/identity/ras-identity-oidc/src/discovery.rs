//! Provider metadata discovery via the well-known endpoint.

use crate::config::OidcSettings;
use crate::error::{OidcError, OidcResult};
use crate::types::DiscoveredEndpoints;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
struct CachedDiscovery {
    endpoints: DiscoveredEndpoints,
    fetched_at: DateTime<Utc>,
}

/// Fetches the discovery document of the configured provider.
///
/// Without a cache TTL every call is a fresh request, so callers discover once
/// per flow invocation and pass the result along. With a TTL the document is
/// shared across requests until it goes stale or [`DiscoveryClient::invalidate`]
/// is called; a failed refetch never falls back to a stale copy.
#[derive(Clone)]
pub struct DiscoveryClient {
    http_client: Client,
    settings: Arc<OidcSettings>,
    cache: Arc<RwLock<Option<CachedDiscovery>>>,
}

impl DiscoveryClient {
    pub fn new(settings: Arc<OidcSettings>, http_client: Client) -> Self {
        Self {
            http_client,
            settings,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    fn cache_ttl(&self) -> Option<Duration> {
        match self.settings.discovery_cache_ttl_seconds {
            0 => None,
            seconds => Some(Duration::seconds(seconds as i64)),
        }
    }

    /// Returns the provider endpoints, with the configured userinfo override
    /// applied.
    pub async fn discover(&self) -> OidcResult<DiscoveredEndpoints> {
        self.settings.validate().inspect_err(|e| {
            error!("Cannot discover OIDC configuration: {}", e);
        })?;

        if let Some(ttl) = self.cache_ttl() {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if Utc::now() - cached.fetched_at < ttl {
                    debug!("Using cached OIDC configuration");
                    return Ok(cached.endpoints.clone());
                }
            }
        }

        let endpoints = self.fetch().await?;

        if self.cache_ttl().is_some() {
            let mut cache = self.cache.write().await;
            *cache = Some(CachedDiscovery {
                endpoints: endpoints.clone(),
                fetched_at: Utc::now(),
            });
        }

        Ok(endpoints)
    }

    /// Drops the cached discovery document, if any.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        if cache.take().is_some() {
            info!("Invalidated cached OIDC configuration");
        }
    }

    async fn fetch(&self) -> OidcResult<DiscoveredEndpoints> {
        let well_known_url = self.settings.well_known_url();
        info!(
            "Attempting to discover OIDC configuration from: {}",
            well_known_url
        );

        let response = match self.http_client.get(&well_known_url).send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to discover OIDC configuration: {}", e);
                error!(
                    "No response from server. This may indicate network connectivity issues or incorrect provider URL."
                );
                return Err(OidcError::unreachable(None, e.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                "Failed to discover OIDC configuration: status code {}, body: {}",
                status.as_u16(),
                body
            );
            return Err(OidcError::unreachable(
                Some(status.as_u16()),
                format!("discovery returned {}", status),
            ));
        }

        let mut endpoints: DiscoveredEndpoints = response.json().await.map_err(|e| {
            error!("Invalid OIDC discovery document: {}", e);
            OidcError::ProtocolViolation(format!("invalid discovery document: {}", e))
        })?;

        if let Some(userinfo_endpoint) = &self.settings.userinfo_endpoint {
            endpoints.userinfo_endpoint = Some(userinfo_endpoint.clone());
        }

        debug!(
            "Discovered OIDC endpoints: authorization={:?} token={:?} userinfo={:?} end_session={:?}",
            endpoints.authorization_endpoint,
            endpoints.token_endpoint,
            endpoints.userinfo_endpoint,
            endpoints.end_session_endpoint
        );

        Ok(endpoints)
    }
}
