//! Authorization request construction.

use crate::config::OidcSettings;
use crate::error::{OidcError, OidcResult};
use crate::session::SessionStore;
use crate::state::StateTokenGuard;
use crate::types::{AuthorizeOptions, DiscoveredEndpoints, FlowSelector};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

/// A single authorization request. Built per redirect, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: String,
    pub scope: String,
    pub state: String,
    pub prompt: Option<String>,
    pub max_age: Option<u64>,
    pub selector: Option<FlowSelector>,
}

impl AuthorizationRequest {
    /// Resolves the target URL.
    ///
    /// A flow selector replaces the authorization endpoint with
    /// `{provider_url}/{selector}`; the query string is the same either way.
    pub fn to_url(
        &self,
        settings: &OidcSettings,
        endpoints: &DiscoveredEndpoints,
    ) -> OidcResult<Url> {
        let authorization_endpoint = endpoints
            .authorization_endpoint()
            .ok_or(OidcError::EndpointUnavailable("authorization_endpoint"))?;

        let mut url = match self.selector {
            Some(selector) => Url::parse(&format!(
                "{}/{}",
                settings.provider_url,
                selector.as_path()
            ))?,
            None => Url::parse(authorization_endpoint)?,
        };

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("client_id", &self.client_id);
            params.append_pair("redirect_uri", &self.redirect_uri);
            params.append_pair("response_type", &self.response_type);
            params.append_pair("scope", &self.scope);
            params.append_pair("state", &self.state);

            if let Some(prompt) = self.prompt.as_deref().filter(|p| !p.is_empty()) {
                params.append_pair("prompt", prompt);
            }
            if let Some(max_age) = self.max_age.filter(|age| *age > 0) {
                params.append_pair("max_age", &max_age.to_string());
            }
        }

        Ok(url)
    }
}

/// Builds provider redirects for the login, registration and profile flows.
pub struct AuthorizationRedirector;

impl AuthorizationRedirector {
    /// Generates a new state token in the session and returns the URL to send
    /// the browser to.
    ///
    /// State is generated for selector flows too, even though only the login
    /// callback consumes it.
    pub async fn build_redirect(
        settings: &OidcSettings,
        endpoints: &DiscoveredEndpoints,
        session: &dyn SessionStore,
        selector: Option<FlowSelector>,
        options: &AuthorizeOptions,
        redirect_uri: &str,
    ) -> OidcResult<String> {
        if endpoints.authorization_endpoint().is_none() {
            return Err(OidcError::EndpointUnavailable("authorization_endpoint"));
        }

        let state = StateTokenGuard::generate(session).await?;

        let request = AuthorizationRequest {
            client_id: settings.client_id.clone(),
            redirect_uri: redirect_uri.to_string(),
            response_type: "code".to_string(),
            scope: options
                .scopes
                .clone()
                .unwrap_or_else(|| settings.scopes.clone()),
            state,
            prompt: options.prompt.clone(),
            max_age: options.max_age,
            selector,
        };

        let url = request.to_url(settings, endpoints)?;
        debug!(
            "Built authorization redirect to {}",
            url.origin().ascii_serialization()
        );

        Ok(url.to_string())
    }
}
