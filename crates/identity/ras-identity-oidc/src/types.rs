//! OpenID Connect protocol types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Provider metadata from `/.well-known/openid-configuration`.
///
/// The endpoints the relying party uses are typed; every other member of the
/// discovery document is kept untouched in `additional`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredEndpoints {
    pub issuer: Option<String>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub userinfo_endpoint: Option<String>,
    pub end_session_endpoint: Option<String>,
    pub jwks_uri: Option<String>,
    #[serde(flatten)]
    pub additional: HashMap<String, serde_json::Value>,
}

impl DiscoveredEndpoints {
    /// Looks up an endpoint by its discovery document name. Empty values count
    /// as absent.
    pub fn get(&self, name: &str) -> Option<&str> {
        let value = match name {
            "issuer" => self.issuer.as_deref(),
            "authorization_endpoint" => self.authorization_endpoint.as_deref(),
            "token_endpoint" => self.token_endpoint.as_deref(),
            "userinfo_endpoint" => self.userinfo_endpoint.as_deref(),
            "end_session_endpoint" => self.end_session_endpoint.as_deref(),
            "jwks_uri" => self.jwks_uri.as_deref(),
            other => self.additional.get(other).and_then(|v| v.as_str()),
        };
        value.filter(|v| !v.is_empty())
    }

    pub fn authorization_endpoint(&self) -> Option<&str> {
        self.get("authorization_endpoint")
    }

    pub fn token_endpoint(&self) -> Option<&str> {
        self.get("token_endpoint")
    }

    pub fn userinfo_endpoint(&self) -> Option<&str> {
        self.get("userinfo_endpoint")
    }

    pub fn end_session_endpoint(&self) -> Option<&str> {
        self.get("end_session_endpoint")
    }
}

/// Token endpoint response.
///
/// Providers disagree on the JSON types of the optional members (`expires_in`
/// as a string, ids as numbers), so every field is read leniently: a value of
/// an unexpected type becomes `None` instead of failing the exchange. A body
/// without a usable `access_token` parses with it empty and is rejected by the
/// caller as a protocol violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    #[serde(default, deserialize_with = "lenient::string")]
    pub access_token: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub token_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub expires_in: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub scope: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub id_token: Option<String>,
    #[serde(flatten)]
    pub additional: HashMap<String, serde_json::Value>,
}

/// Claims returned by the userinfo endpoint.
///
/// Read with the same leniency as [`TokenResponse`]; `sub` accepts a string
/// or a number and only an empty `sub` fails the flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfoClaims {
    /// Stable subject identifier, the join key to local accounts
    #[serde(default, deserialize_with = "lenient::string")]
    pub sub: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_bool")]
    pub email_verified: Option<bool>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub preferred_username: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub given_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub family_name: Option<String>,
    #[serde(flatten)]
    pub additional_claims: HashMap<String, serde_json::Value>,
}

impl UserInfoClaims {
    pub fn new(sub: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            ..Self::default()
        }
    }
}

/// Deserializers that accept the loosely typed JSON real providers send.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    fn scalar_to_string(value: Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(scalar_to_string(Value::deserialize(deserializer)?).unwrap_or_default())
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        Ok(scalar_to_string(Value::deserialize(deserializer)?))
    }

    pub fn opt_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn opt_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Bool(b) => Some(b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            Value::Number(n) => n.as_u64().map(|n| n != 0),
            _ => None,
        })
    }
}

/// Query parameters the provider sends to the callback path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub destination: Option<String>,
}

/// Provider pages reached through a dedicated path instead of the
/// authorization endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowSelector {
    Register,
    PersonalDetails,
}

impl FlowSelector {
    pub fn as_path(&self) -> &'static str {
        match self {
            FlowSelector::Register => "register",
            FlowSelector::PersonalDetails => "personal-details",
        }
    }
}

/// Per-request tweaks to the authorization request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizeOptions {
    pub prompt: Option<String>,
    pub max_age: Option<u64>,
    /// Replaces the configured scope string for this request only
    pub scopes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Status,
    Error,
}

/// A message for the end user, shown on the page the flow redirects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub level: MessageLevel,
    pub text: String,
}

/// Outcome of every entry point: where to send the browser next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowResponse {
    pub location: String,
    /// True when `location` points at the identity provider
    pub external: bool,
    pub message: Option<UserMessage>,
}

impl FlowResponse {
    pub fn local(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            external: false,
            message: None,
        }
    }

    pub fn external(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            external: true,
            message: None,
        }
    }

    pub fn with_error(mut self, text: impl Into<String>) -> Self {
        self.message = Some(UserMessage {
            level: MessageLevel::Error,
            text: text.into(),
        });
        self
    }

    pub fn with_status(mut self, text: impl Into<String>) -> Self {
        self.message = Some(UserMessage {
            level: MessageLevel::Status,
            text: text.into(),
        });
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.message,
            Some(UserMessage {
                level: MessageLevel::Error,
                ..
            })
        )
    }
}
