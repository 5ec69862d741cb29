//! Session-scoped storage for the OIDC handshake and the resulting tokens.

use crate::error::OidcResult;
use crate::reconcile::LocalAccount;
use crate::types::{TokenResponse, UserInfoClaims};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Key/value storage scoped to one end-user session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> OidcResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> OidcResult<()>;

    async fn delete(&self, key: &str) -> OidcResult<()>;

    /// Read and remove a key in one step. Two concurrent callers must never
    /// both observe the value.
    async fn take(&self, key: &str) -> OidcResult<Option<Value>>;
}

/// Hands the reconciled account to the host application's own login
/// machinery, and tears it down again on logout.
#[async_trait]
pub trait LocalSession: Send + Sync {
    async fn establish(&self, account: &LocalAccount) -> OidcResult<()>;

    async fn terminate(&self) -> OidcResult<()>;
}

/// Session keys holding the relying-party auth state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    State,
    AccessToken,
    IdToken,
    RefreshToken,
    UserInfo,
}

impl SessionKey {
    pub const ALL: [SessionKey; 5] = [
        SessionKey::State,
        SessionKey::AccessToken,
        SessionKey::IdToken,
        SessionKey::RefreshToken,
        SessionKey::UserInfo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKey::State => "ni_oidc_state",
            SessionKey::AccessToken => "ni_oidc_access_token",
            SessionKey::IdToken => "ni_oidc_id_token",
            SessionKey::RefreshToken => "ni_oidc_refresh_token",
            SessionKey::UserInfo => "ni_oidc_userinfo",
        }
    }
}

/// Typed view over the auth-state entries of a [`SessionStore`].
pub struct SessionAuthState<'a> {
    store: &'a dyn SessionStore,
}

impl<'a> SessionAuthState<'a> {
    pub fn new(store: &'a dyn SessionStore) -> Self {
        Self { store }
    }

    async fn get_string(&self, key: SessionKey) -> OidcResult<Option<String>> {
        Ok(self
            .store
            .get(key.as_str())
            .await?
            .and_then(|value| value.as_str().map(String::from))
            .filter(|value| !value.is_empty()))
    }

    pub async fn set_pending_state(&self, state: &str) -> OidcResult<()> {
        self.store
            .set(SessionKey::State.as_str(), Value::String(state.to_string()))
            .await
    }

    pub async fn take_pending_state(&self) -> OidcResult<Option<String>> {
        Ok(self
            .store
            .take(SessionKey::State.as_str())
            .await?
            .and_then(|value| value.as_str().map(String::from)))
    }

    /// Persists the tokens of a successful exchange. The refresh token is
    /// only written when the provider issued one.
    pub async fn store_tokens(&self, tokens: &TokenResponse) -> OidcResult<()> {
        self.store
            .set(
                SessionKey::AccessToken.as_str(),
                Value::String(tokens.access_token.clone()),
            )
            .await?;

        match tokens.id_token.as_deref().filter(|t| !t.is_empty()) {
            Some(id_token) => {
                self.store
                    .set(
                        SessionKey::IdToken.as_str(),
                        Value::String(id_token.to_string()),
                    )
                    .await?
            }
            None => self.store.delete(SessionKey::IdToken.as_str()).await?,
        }

        if let Some(refresh_token) = tokens.refresh_token.as_deref().filter(|t| !t.is_empty()) {
            self.store
                .set(
                    SessionKey::RefreshToken.as_str(),
                    Value::String(refresh_token.to_string()),
                )
                .await?;
        }

        Ok(())
    }

    pub async fn store_userinfo(&self, claims: &UserInfoClaims) -> OidcResult<()> {
        self.store
            .set(SessionKey::UserInfo.as_str(), serde_json::to_value(claims)?)
            .await
    }

    pub async fn access_token(&self) -> OidcResult<Option<String>> {
        self.get_string(SessionKey::AccessToken).await
    }

    pub async fn id_token(&self) -> OidcResult<Option<String>> {
        self.get_string(SessionKey::IdToken).await
    }

    pub async fn refresh_token(&self) -> OidcResult<Option<String>> {
        self.get_string(SessionKey::RefreshToken).await
    }

    pub async fn userinfo(&self) -> OidcResult<Option<UserInfoClaims>> {
        match self.store.get(SessionKey::UserInfo.as_str()).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Removes every auth-state key, the pending state included.
    pub async fn clear(&self) -> OidcResult<()> {
        for key in SessionKey::ALL {
            self.store.delete(key.as_str()).await?;
        }
        Ok(())
    }
}

/// In-memory implementation of [`SessionStore`] for a single session.
#[derive(Clone, Default)]
pub struct InMemorySession {
    values: Arc<RwLock<HashMap<String, Value>>>,
}

impl InMemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.values.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySession {
    async fn get(&self, key: &str) -> OidcResult<Option<Value>> {
        let values = self.values.read().await;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> OidcResult<()> {
        let mut values = self.values.write().await;
        values.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> OidcResult<()> {
        let mut values = self.values.write().await;
        values.remove(key);
        Ok(())
    }

    async fn take(&self, key: &str) -> OidcResult<Option<Value>> {
        let mut values = self.values.write().await;
        Ok(values.remove(key))
    }
}
