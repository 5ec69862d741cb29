//! Entry points bound to the relying party's HTTP routes.

use crate::authorize::AuthorizationRedirector;
use crate::callback::{CallbackOutcome, CallbackProcessor};
use crate::config::OidcSettings;
use crate::discovery::DiscoveryClient;
use crate::error::{OidcError, OidcResult};
use crate::logout::LogoutCoordinator;
use crate::reconcile::{AccountRepository, IdentityReconciler, Reconciliation};
use crate::session::{LocalSession, SessionAuthState, SessionStore};
use crate::types::{AuthorizeOptions, CallbackQuery, FlowResponse, FlowSelector, UserInfoClaims};
use reqwest::Client;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Per-request collaborators.
#[derive(Clone, Copy)]
pub struct RequestContext<'a> {
    pub session: &'a dyn SessionStore,
    pub local_session: &'a dyn LocalSession,
    /// Language path prefix of the current request, if any
    pub language_prefix: Option<&'a str>,
}

impl<'a> RequestContext<'a> {
    pub fn new(session: &'a dyn SessionStore, local_session: &'a dyn LocalSession) -> Self {
        Self {
            session,
            local_session,
            language_prefix: None,
        }
    }

    pub fn with_language_prefix(mut self, prefix: &'a str) -> Self {
        self.language_prefix = Some(prefix);
        self
    }
}

/// Coordinates discovery, redirects, callbacks, reconciliation and logout.
///
/// None of the entry points fail: every error becomes a redirect to the home
/// page carrying a user-facing message.
#[derive(Clone)]
pub struct OidcManager {
    settings: Arc<OidcSettings>,
    discovery: DiscoveryClient,
    callback: CallbackProcessor,
    reconciler: IdentityReconciler,
}

impl OidcManager {
    pub fn new(settings: OidcSettings, accounts: Arc<dyn AccountRepository>) -> OidcResult<Self> {
        let settings = Arc::new(settings.normalized());
        let http_client = Client::builder()
            .timeout(settings.http_timeout())
            .build()?;

        let discovery = DiscoveryClient::new(settings.clone(), http_client.clone());
        let callback = CallbackProcessor::new(settings.clone(), http_client, discovery.clone());
        let reconciler = IdentityReconciler::new(
            accounts,
            settings.auto_register,
            settings.user_roles.clone(),
        );

        Ok(Self {
            settings,
            discovery,
            callback,
            reconciler,
        })
    }

    pub fn settings(&self) -> &OidcSettings {
        &self.settings
    }

    pub fn discovery(&self) -> &DiscoveryClient {
        &self.discovery
    }

    pub fn callback_url(&self, ctx: &RequestContext<'_>) -> String {
        if let Some(prefix) = ctx.language_prefix {
            if !prefix.is_empty() && !self.settings.serves_language(prefix) {
                warn!(
                    target: "security",
                    "Ignoring unknown language prefix in callback URL: {}",
                    prefix
                );
            }
        }
        let callback_url = self.settings.callback_url(ctx.language_prefix);
        info!("Generated callback URL: {}", callback_url);
        callback_url
    }

    fn home(&self) -> FlowResponse {
        FlowResponse::local(self.settings.home_path.clone())
    }

    pub async fn authorize(&self, ctx: &RequestContext<'_>) -> FlowResponse {
        self.authorize_with(ctx, None, &AuthorizeOptions::default())
            .await
    }

    pub async fn register(&self, ctx: &RequestContext<'_>) -> FlowResponse {
        self.authorize_with(ctx, Some(FlowSelector::Register), &AuthorizeOptions::default())
            .await
    }

    pub async fn edit_profile(&self, ctx: &RequestContext<'_>) -> FlowResponse {
        self.authorize_with(
            ctx,
            Some(FlowSelector::PersonalDetails),
            &AuthorizeOptions::default(),
        )
        .await
    }

    pub async fn authorize_with(
        &self,
        ctx: &RequestContext<'_>,
        selector: Option<FlowSelector>,
        options: &AuthorizeOptions,
    ) -> FlowResponse {
        let result = async {
            let endpoints = self.discovery.discover().await?;
            let redirect_uri = self.callback_url(ctx);
            AuthorizationRedirector::build_redirect(
                &self.settings,
                &endpoints,
                ctx.session,
                selector,
                options,
                &redirect_uri,
            )
            .await
        }
        .await;

        match result {
            Ok(target) => FlowResponse::external(target),
            Err(e) => {
                error!("Cannot start OIDC authorization: {}", e);
                self.home().with_error(e.user_message())
            }
        }
    }

    pub async fn callback(&self, ctx: &RequestContext<'_>, query: &CallbackQuery) -> FlowResponse {
        let redirect_uri = self.callback_url(ctx);
        let outcome = self.callback.process(ctx.session, query, &redirect_uri).await;

        let userinfo = match outcome {
            CallbackOutcome::Authenticated { userinfo, .. } => userinfo,
            failed => {
                match &failed {
                    CallbackOutcome::UserInfoFetchFailed { reason, .. } => {
                        warn!("Tokens obtained but user info unavailable: {}", reason)
                    }
                    CallbackOutcome::EndpointsUnavailable(e)
                    | CallbackOutcome::TokenExchangeFailed(e) => {
                        error!("OIDC callback failed: {}", e)
                    }
                    other => warn!("OIDC callback rejected: {:?}", other),
                }
                return self.home().with_error(failed.user_message().unwrap_or_default());
            }
        };

        match self.login(ctx, &userinfo).await {
            Ok(()) => {
                let destination = query
                    .destination
                    .as_deref()
                    .filter(|d| is_local_path(d))
                    .unwrap_or(self.settings.account_path.as_str());
                FlowResponse::local(destination).with_status("You have been logged in.")
            }
            Err(e) => {
                error!("OIDC login for {} aborted: {}", userinfo.sub, e);
                if let Err(clear_err) = SessionAuthState::new(ctx.session).clear().await {
                    error!("Failed to clear session auth state: {}", clear_err);
                }
                self.home().with_error(e.user_message())
            }
        }
    }

    async fn login(&self, ctx: &RequestContext<'_>, userinfo: &UserInfoClaims) -> OidcResult<()> {
        let account = match self.reconciler.reconcile(userinfo).await {
            Ok(Reconciliation::Existing(account)) | Ok(Reconciliation::Created(account)) => {
                account
            }
            Ok(Reconciliation::NotFound) => return Err(OidcError::AccountResolutionFailed),
            Err(e) => {
                error!("Account reconciliation failed: {}", e);
                return Err(OidcError::AccountResolutionFailed);
            }
        };

        ctx.local_session.establish(&account).await?;
        info!("User {} logged in through OIDC", account.username);
        Ok(())
    }

    pub async fn logout(&self, ctx: &RequestContext<'_>) -> FlowResponse {
        let endpoints = match self.discovery.discover().await {
            Ok(endpoints) => Some(endpoints),
            Err(e) => {
                warn!("Logging out without provider end-session: {}", e);
                None
            }
        };

        let response =
            match LogoutCoordinator::logout(ctx.session, endpoints.as_ref(), &self.settings.home_path)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    error!("Failed to clear session auth state: {}", e);
                    self.home()
                }
            };

        if let Err(e) = ctx.local_session.terminate().await {
            error!("Failed to end local session: {}", e);
        }

        response
    }

    pub async fn access_token(&self, session: &dyn SessionStore) -> OidcResult<Option<String>> {
        SessionAuthState::new(session).access_token().await
    }

    pub async fn id_token(&self, session: &dyn SessionStore) -> OidcResult<Option<String>> {
        SessionAuthState::new(session).id_token().await
    }

    pub async fn refresh_token(&self, session: &dyn SessionStore) -> OidcResult<Option<String>> {
        SessionAuthState::new(session).refresh_token().await
    }

    pub async fn userinfo(&self, session: &dyn SessionStore) -> OidcResult<Option<UserInfoClaims>> {
        SessionAuthState::new(session).userinfo().await
    }

    /// Presence check only; the token's expiry is not inspected.
    pub async fn has_valid_access_token(&self, session: &dyn SessionStore) -> bool {
        matches!(self.access_token(session).await, Ok(Some(_)))
    }
}

/// Accepts site-relative paths only, so `destination` cannot bounce the user
/// to another host.
fn is_local_path(destination: &str) -> bool {
    destination.starts_with('/') && !destination.starts_with("//") && !destination.contains('\\')
}
