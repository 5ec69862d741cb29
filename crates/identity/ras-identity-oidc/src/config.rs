//! OpenID Connect relying-party configuration.

use crate::error::{OidcError, OidcResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Path the provider redirects back to after authorization.
pub const CALLBACK_PATH: &str = "/ni-oidc/callback";

/// Settings for the single identity provider this relying party talks to.
///
/// Values are read-only for the lifetime of a flow. Construct with
/// [`OidcSettings::new`] and the `with_*` builders, or deserialize from any
/// serde source; call [`OidcSettings::normalized`] before use so the provider
/// URL invariant (no trailing slash) holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcSettings {
    /// Base URL of the identity provider, e.g. `https://auth.example.com`
    pub provider_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Space-delimited scopes requested during authorization
    pub scopes: String,
    /// Takes precedence over the discovered `userinfo_endpoint`
    pub userinfo_endpoint: Option<String>,
    /// Base URL of this site, used to build the callback URL
    pub site_base_url: String,
    /// Language path prefixes this site serves, e.g. `fr`. Any other prefix
    /// is left out of the callback URL.
    pub languages: BTreeSet<String>,
    /// Create local accounts for subjects that are not yet known
    pub auto_register: bool,
    /// Roles granted to accounts created through auto-registration
    pub user_roles: BTreeSet<String>,
    /// Safe default page for failed flows and plain logouts
    pub home_path: String,
    /// Landing page after a successful login without a destination
    pub account_path: String,
    pub http_timeout_seconds: u64,
    /// 0 disables the shared discovery cache
    pub discovery_cache_ttl_seconds: u64,
    pub login_button_text: String,
    pub register_button_text: String,
}

impl Default for OidcSettings {
    fn default() -> Self {
        Self {
            provider_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            scopes: "openid profile email".to_string(),
            userinfo_endpoint: None,
            site_base_url: String::new(),
            languages: BTreeSet::new(),
            auto_register: true,
            user_roles: BTreeSet::new(),
            home_path: "/".to_string(),
            account_path: "/user".to_string(),
            http_timeout_seconds: 10,
            discovery_cache_ttl_seconds: 0,
            login_button_text: "Log in with Next Identity".to_string(),
            register_button_text: "Register with Next Identity".to_string(),
        }
    }
}

impl OidcSettings {
    pub fn new(
        provider_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            provider_url: provider_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            ..Self::default()
        }
        .normalized()
    }

    pub fn with_scopes(mut self, scopes: impl Into<String>) -> Self {
        self.scopes = scopes.into();
        self
    }

    pub fn with_userinfo_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.userinfo_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_site_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.site_base_url = base_url.into();
        self.normalized()
    }

    pub fn with_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_auto_register(mut self, enabled: bool) -> Self {
        self.auto_register = enabled;
        self
    }

    pub fn with_user_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_http_timeout(mut self, seconds: u64) -> Self {
        self.http_timeout_seconds = seconds;
        self
    }

    pub fn with_discovery_cache_ttl(mut self, seconds: u64) -> Self {
        self.discovery_cache_ttl_seconds = seconds;
        self
    }

    /// Strips trailing slashes from the provider and site URLs and drops an
    /// empty userinfo override.
    pub fn normalized(mut self) -> Self {
        let trimmed = self.provider_url.trim().trim_end_matches('/').to_string();
        self.provider_url = trimmed;
        let trimmed = self.site_base_url.trim().trim_end_matches('/').to_string();
        self.site_base_url = trimmed;
        if self
            .userinfo_endpoint
            .as_deref()
            .is_some_and(|endpoint| endpoint.trim().is_empty())
        {
            self.userinfo_endpoint = None;
        }
        self
    }

    /// Checks the values a flow cannot start without.
    pub fn validate(&self) -> OidcResult<()> {
        if self.provider_url.is_empty() {
            return Err(OidcError::ConfigurationMissing(
                "provider URL not configured".to_string(),
            ));
        }
        if self.client_id.is_empty() {
            return Err(OidcError::ConfigurationMissing(
                "client ID not configured".to_string(),
            ));
        }
        if self.site_base_url.is_empty() {
            return Err(OidcError::ConfigurationMissing(
                "site base URL not configured".to_string(),
            ));
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn well_known_url(&self) -> String {
        format!("{}/.well-known/openid-configuration", self.provider_url)
    }

    pub fn serves_language(&self, prefix: &str) -> bool {
        self.languages.contains(prefix.trim_matches('/'))
    }

    /// Callback URL sent as `redirect_uri`. The provider compares it
    /// byte-for-byte between the authorization request and the token exchange.
    /// Prefixes outside [`OidcSettings::languages`] are dropped.
    pub fn callback_url(&self, language_prefix: Option<&str>) -> String {
        let prefix = language_prefix
            .map(|prefix| prefix.trim_matches('/'))
            .filter(|prefix| self.languages.contains(*prefix))
            .map(|prefix| format!("/{}", prefix))
            .unwrap_or_default();

        format!("{}{}{}", self.site_base_url, prefix, CALLBACK_PATH)
    }
}
