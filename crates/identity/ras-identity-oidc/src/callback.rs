//! Callback handling: state check, code exchange and userinfo retrieval.

use crate::config::OidcSettings;
use crate::discovery::DiscoveryClient;
use crate::error::{OidcError, OidcResult};
use crate::session::{SessionAuthState, SessionStore};
use crate::state::StateTokenGuard;
use crate::types::{CallbackQuery, TokenResponse, UserInfoClaims};
use reqwest::Client;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Terminal states of a callback.
///
/// Every variant but `Authenticated` ends the flow without a local login.
/// `UserInfoFetchFailed` still leaves the exchanged tokens in the session.
#[derive(Debug)]
pub enum CallbackOutcome {
    ErrorFromProvider {
        error: String,
        description: Option<String>,
    },
    MissingParameters,
    StateInvalid,
    EndpointsUnavailable(OidcError),
    TokenExchangeFailed(OidcError),
    UserInfoFetchFailed {
        tokens: TokenResponse,
        reason: OidcError,
    },
    Authenticated {
        tokens: TokenResponse,
        userinfo: UserInfoClaims,
    },
}

impl CallbackOutcome {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, CallbackOutcome::Authenticated { .. })
    }

    /// Message for the end user when the outcome is a failure.
    pub fn user_message(&self) -> Option<String> {
        match self {
            CallbackOutcome::ErrorFromProvider { error, description } => Some(format!(
                "Authentication error: {} - {}",
                error,
                description.as_deref().unwrap_or("")
            )),
            CallbackOutcome::MissingParameters => {
                Some("Invalid authentication response.".to_string())
            }
            CallbackOutcome::StateInvalid => Some(OidcError::CsrfMismatch.user_message()),
            CallbackOutcome::EndpointsUnavailable(err) => Some(err.user_message()),
            CallbackOutcome::TokenExchangeFailed(_)
            | CallbackOutcome::UserInfoFetchFailed { .. } => {
                Some("Failed to authenticate with the Identity Provider.".to_string())
            }
            CallbackOutcome::Authenticated { .. } => None,
        }
    }
}

/// Drives a callback request through to one [`CallbackOutcome`].
#[derive(Clone)]
pub struct CallbackProcessor {
    http_client: Client,
    settings: Arc<OidcSettings>,
    discovery: DiscoveryClient,
}

impl CallbackProcessor {
    pub fn new(settings: Arc<OidcSettings>, http_client: Client, discovery: DiscoveryClient) -> Self {
        Self {
            http_client,
            settings,
            discovery,
        }
    }

    /// `redirect_uri` must be the value sent in the authorization request.
    pub async fn process(
        &self,
        session: &dyn SessionStore,
        query: &CallbackQuery,
        redirect_uri: &str,
    ) -> CallbackOutcome {
        if let Some(error) = non_empty(&query.error) {
            warn!(
                "OIDC provider returned error: {}: {}",
                error,
                query.error_description.as_deref().unwrap_or("No description")
            );
            return CallbackOutcome::ErrorFromProvider {
                error: error.to_string(),
                description: query.error_description.clone(),
            };
        }

        let (Some(code), Some(state)) = (non_empty(&query.code), non_empty(&query.state)) else {
            warn!("OIDC callback without code or state");
            return CallbackOutcome::MissingParameters;
        };

        match StateTokenGuard::validate(session, state).await {
            Ok(true) => {}
            Ok(false) => return CallbackOutcome::StateInvalid,
            Err(e) => {
                error!("Could not read pending state from session: {}", e);
                return CallbackOutcome::StateInvalid;
            }
        }

        let endpoints = match self.discovery.discover().await {
            Ok(endpoints) => endpoints,
            Err(e) => return CallbackOutcome::EndpointsUnavailable(e),
        };

        let Some(token_endpoint) = endpoints.token_endpoint() else {
            error!("Failed to discover OIDC token endpoint");
            return CallbackOutcome::EndpointsUnavailable(OidcError::EndpointUnavailable(
                "token_endpoint",
            ));
        };

        let tokens = match self.exchange_code(token_endpoint, code, redirect_uri).await {
            Ok(tokens) => tokens,
            Err(e) => return CallbackOutcome::TokenExchangeFailed(e),
        };

        let auth_state = SessionAuthState::new(session);
        if let Err(e) = auth_state.store_tokens(&tokens).await {
            error!("Failed to store tokens in session: {}", e);
            return CallbackOutcome::TokenExchangeFailed(e);
        }

        let userinfo = match endpoints.userinfo_endpoint() {
            Some(userinfo_endpoint) => {
                self.fetch_userinfo(userinfo_endpoint, &tokens.access_token)
                    .await
            }
            None => {
                error!("Failed to discover OIDC userinfo endpoint");
                Err(OidcError::EndpointUnavailable("userinfo_endpoint"))
            }
        };

        let userinfo = match userinfo {
            Ok(userinfo) => userinfo,
            Err(reason) => return CallbackOutcome::UserInfoFetchFailed { tokens, reason },
        };

        if let Err(reason) = auth_state.store_userinfo(&userinfo).await {
            error!("Failed to store user info in session: {}", reason);
            return CallbackOutcome::UserInfoFetchFailed { tokens, reason };
        }

        CallbackOutcome::Authenticated { tokens, userinfo }
    }

    /// Exchanges an authorization code at the token endpoint.
    pub async fn exchange_code(
        &self,
        token_endpoint: &str,
        code: &str,
        redirect_uri: &str,
    ) -> OidcResult<TokenResponse> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("redirect_uri", redirect_uri),
        ];

        let response = self
            .http_client
            .post(token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to exchange code for tokens: {}", e);
                OidcError::unreachable(None, e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(
                "Token exchange failed: status code {}, body: {}",
                status.as_u16(),
                error_text
            );
            return Err(OidcError::unreachable(
                Some(status.as_u16()),
                format!("token endpoint returned {}", status),
            ));
        }

        let tokens: TokenResponse = response.json().await.map_err(|e| {
            error!("Invalid token response from OIDC provider: {}", e);
            OidcError::ProtocolViolation(format!("invalid token response: {}", e))
        })?;

        if tokens.access_token.is_empty() {
            error!("Invalid token response from OIDC provider: no access token");
            return Err(OidcError::ProtocolViolation(
                "token response without access_token".to_string(),
            ));
        }

        info!("Successfully exchanged code for tokens");
        Ok(tokens)
    }

    /// Fetches the claims of the token's subject.
    pub async fn fetch_userinfo(
        &self,
        userinfo_endpoint: &str,
        access_token: &str,
    ) -> OidcResult<UserInfoClaims> {
        let response = self
            .http_client
            .get(userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to fetch user info: {}", e);
                OidcError::unreachable(None, e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(
                "User info request failed: status code {}, body: {}",
                status.as_u16(),
                error_text
            );
            return Err(OidcError::unreachable(
                Some(status.as_u16()),
                format!("userinfo endpoint returned {}", status),
            ));
        }

        let claims: UserInfoClaims = response.json().await.map_err(|e| {
            error!("Invalid user info response from OIDC provider: {}", e);
            OidcError::ProtocolViolation(format!("invalid userinfo response: {}", e))
        })?;

        if claims.sub.is_empty() {
            error!("Invalid user info response from OIDC provider: no subject");
            return Err(OidcError::ProtocolViolation(
                "userinfo response without sub".to_string(),
            ));
        }

        debug!(
            "Successfully retrieved user info for subject: {}",
            claims.sub
        );
        Ok(claims)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
