//! OIDC error types.

use thiserror::Error;

pub type OidcResult<T> = Result<T, OidcError>;

#[derive(Debug, Error)]
pub enum OidcError {
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("Identity provider unreachable: {detail}")]
    ProviderUnreachable { status: Option<u16>, detail: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("State parameter mismatch")]
    CsrfMismatch,

    #[error("Unable to find or create a local account")]
    AccountResolutionFailed,

    #[error("Endpoint not discovered: {0}")]
    EndpointUnavailable(&'static str),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Account store error: {0}")]
    AccountStore(String),

    #[error("Password hashing failed: {0}")]
    PasswordHash(String),
}

impl OidcError {
    /// Message safe to show to the end user. Never carries provider bodies,
    /// tokens or internal details.
    pub fn user_message(&self) -> String {
        match self {
            OidcError::ConfigurationMissing(_) => {
                "Single sign-on is not configured. Please contact the site administrator."
                    .to_string()
            }
            OidcError::ProviderUnreachable { .. } | OidcError::Http(_) => {
                "Unable to connect to the Identity Provider. Please check your configuration and ensure the provider is accessible."
                    .to_string()
            }
            OidcError::CsrfMismatch => {
                "Invalid state parameter. Authentication failed.".to_string()
            }
            OidcError::AccountResolutionFailed => {
                "Unable to find or create a user account.".to_string()
            }
            OidcError::EndpointUnavailable(name) => {
                format!("Failed to discover OIDC {}.", name.replace('_', " "))
            }
            OidcError::ProtocolViolation(_)
            | OidcError::Serialization(_)
            | OidcError::Url(_)
            | OidcError::Session(_)
            | OidcError::AccountStore(_)
            | OidcError::PasswordHash(_) => {
                "Failed to authenticate with the Identity Provider.".to_string()
            }
        }
    }

    pub(crate) fn unreachable(status: Option<u16>, detail: impl Into<String>) -> Self {
        OidcError::ProviderUnreachable {
            status,
            detail: detail.into(),
        }
    }
}
