//! Mapping of external identities onto local accounts.

use crate::error::{OidcError, OidcResult};
use crate::types::UserInfoClaims;
use argon2::{
    Argon2,
    password_hash::{PasswordHasher, SaltString},
};
use async_trait::async_trait;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Upper bound on `_N` suffixes tried before giving up on a username.
pub const MAX_USERNAME_ATTEMPTS: u64 = 10_000;

/// A local account as seen by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAccount {
    pub id: String,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub roles: BTreeSet<String>,
    pub enabled: bool,
    /// Dedicated subject field, for schemas that have one
    pub subject: Option<String>,
    pub password_hash: String,
}

/// Attributes of an account about to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub enabled: bool,
    pub password_hash: String,
}

/// Lookup keys for an external subject.
///
/// `data_key` addresses the auxiliary key/value store; it is a hash of the
/// subject so arbitrary provider identifiers fit a bounded key column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectKey {
    pub subject: String,
    pub data_key: String,
}

impl SubjectKey {
    pub fn new(subject: &str) -> Self {
        let data_key = format!("sub_{}", hex::encode(Sha256::digest(subject.as_bytes())));

        Self {
            subject: subject.to_string(),
            data_key,
        }
    }
}

/// Storage of local accounts, owned by the host application.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Whether accounts carry a dedicated subject field.
    fn has_subject_field(&self) -> bool;

    /// Whether accounts carry first/last name fields.
    fn supports_name_fields(&self) -> bool;

    /// Finds the account linked to a subject. Implementations check the
    /// dedicated field first and fall back to the auxiliary store; a field
    /// match wins when the two disagree.
    async fn find_by_subject(&self, key: &SubjectKey) -> OidcResult<Option<LocalAccount>>;

    /// Uniqueness predicate for usernames, under the store's own rules.
    async fn username_exists(&self, username: &str) -> OidcResult<bool>;

    async fn create(&self, account: NewAccount) -> OidcResult<LocalAccount>;

    async fn update(&self, account: &LocalAccount) -> OidcResult<()>;

    /// Records the subject in the auxiliary store under `key.data_key`.
    async fn link_subject(&self, account: &LocalAccount, key: &SubjectKey) -> OidcResult<()>;

    async fn assign_role(&self, account: &LocalAccount, role: &str) -> OidcResult<()>;
}

/// Result of a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Existing(LocalAccount),
    Created(LocalAccount),
    NotFound,
}

impl Reconciliation {
    pub fn into_account(self) -> Option<LocalAccount> {
        match self {
            Reconciliation::Existing(account) | Reconciliation::Created(account) => Some(account),
            Reconciliation::NotFound => None,
        }
    }
}

/// Finds, updates or creates the local account for a set of userinfo claims.
#[derive(Clone)]
pub struct IdentityReconciler {
    repository: Arc<dyn AccountRepository>,
    auto_register: bool,
    default_roles: BTreeSet<String>,
}

impl IdentityReconciler {
    pub fn new(
        repository: Arc<dyn AccountRepository>,
        auto_register: bool,
        default_roles: BTreeSet<String>,
    ) -> Self {
        Self {
            repository,
            auto_register,
            default_roles,
        }
    }

    pub async fn reconcile(&self, claims: &UserInfoClaims) -> OidcResult<Reconciliation> {
        if claims.sub.is_empty() {
            return Err(OidcError::ProtocolViolation(
                "userinfo claims without subject".to_string(),
            ));
        }

        let key = SubjectKey::new(&claims.sub);

        if let Some(mut account) = self.repository.find_by_subject(&key).await? {
            self.apply_drift(&mut account, claims).await?;
            return Ok(Reconciliation::Existing(account));
        }

        if !self.auto_register {
            info!(
                "User {} not found and auto-registration is disabled",
                claims.sub
            );
            return Ok(Reconciliation::NotFound);
        }

        let account = self.create_account(claims, &key).await?;
        Ok(Reconciliation::Created(account))
    }

    async fn apply_drift(
        &self,
        account: &mut LocalAccount,
        claims: &UserInfoClaims,
    ) -> OidcResult<()> {
        let mut changed = false;

        if let Some(email) = claims.email.as_deref().filter(|e| !e.is_empty()) {
            if account.email != email {
                account.email = email.to_string();
                changed = true;
            }
        }

        if self.repository.supports_name_fields() {
            if let Some(given_name) = &claims.given_name {
                if account.first_name.as_ref() != Some(given_name) {
                    account.first_name = Some(given_name.clone());
                    changed = true;
                }
            }
            if let Some(family_name) = &claims.family_name {
                if account.last_name.as_ref() != Some(family_name) {
                    account.last_name = Some(family_name.clone());
                    changed = true;
                }
            }
        }

        if changed {
            self.repository.update(account).await?;
            info!("Updated user {} with provider user info", account.username);
        }

        Ok(())
    }

    async fn create_account(
        &self,
        claims: &UserInfoClaims,
        key: &SubjectKey,
    ) -> OidcResult<LocalAccount> {
        let username = self.unique_username(&derive_username(claims)).await?;
        let names = self.repository.supports_name_fields();

        let mut account = self
            .repository
            .create(NewAccount {
                username: username.clone(),
                email: claims.email.clone().unwrap_or_default(),
                first_name: claims.given_name.clone().filter(|_| names),
                last_name: claims.family_name.clone().filter(|_| names),
                enabled: true,
                password_hash: unrecoverable_password_hash()?,
            })
            .await?;

        self.repository.link_subject(&account, key).await?;

        if self.repository.has_subject_field() {
            account.subject = Some(key.subject.clone());
            self.repository.update(&account).await?;
        }

        for role in &self.default_roles {
            if !account.roles.contains(role) {
                self.repository.assign_role(&account, role).await?;
                account.roles.insert(role.clone());
            }
        }
        self.repository.update(&account).await?;

        info!(
            "Created new user {} for provider user {}",
            username, key.subject
        );

        Ok(account)
    }

    async fn unique_username(&self, base: &str) -> OidcResult<String> {
        let mut candidate = base.to_string();
        let mut suffix: u64 = 1;

        while self.repository.username_exists(&candidate).await? {
            if suffix > MAX_USERNAME_ATTEMPTS {
                warn!("No free username found for base {}", base);
                return Err(OidcError::AccountStore(format!(
                    "no unique username available for {}",
                    base
                )));
            }
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }

        Ok(candidate)
    }
}

/// Username candidate: `preferred_username`, else the local part of the
/// email, else `user_` and the first 8 characters of the subject.
pub fn derive_username(claims: &UserInfoClaims) -> String {
    if let Some(preferred) = claims
        .preferred_username
        .as_deref()
        .filter(|name| !name.is_empty())
    {
        return preferred.to_string();
    }

    if let Some(local_part) = claims
        .email
        .as_deref()
        .and_then(|email| email.split('@').next())
        .filter(|local| !local.is_empty())
    {
        return local_part.to_string();
    }

    let prefix: String = claims.sub.chars().take(8).collect();
    format!("user_{}", prefix)
}

fn unrecoverable_password_hash() -> OidcResult<String> {
    let mut password = [0u8; 32];
    OsRng.fill_bytes(&mut password);

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(&password, &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| OidcError::PasswordHash(e.to_string()))
}

/// In-memory implementation of [`AccountRepository`].
#[derive(Clone)]
pub struct InMemoryAccountRepository {
    accounts: Arc<RwLock<BTreeMap<String, LocalAccount>>>,
    /// data_key -> (account id -> subject)
    subject_data: Arc<RwLock<BTreeMap<String, BTreeMap<String, String>>>>,
    subject_field: bool,
    name_fields: bool,
}

impl InMemoryAccountRepository {
    pub fn new() -> Self {
        Self {
            accounts: Arc::new(RwLock::new(BTreeMap::new())),
            subject_data: Arc::new(RwLock::new(BTreeMap::new())),
            subject_field: true,
            name_fields: true,
        }
    }

    /// Schema without a dedicated subject field; only the auxiliary store is used.
    pub fn without_subject_field(mut self) -> Self {
        self.subject_field = false;
        self
    }

    pub fn without_name_fields(mut self) -> Self {
        self.name_fields = false;
        self
    }

    /// Inserts an account as-is, e.g. one that predates OIDC.
    pub async fn insert(&self, account: LocalAccount) {
        let mut accounts = self.accounts.write().await;
        accounts.insert(account.id.clone(), account);
    }

    pub async fn get(&self, id: &str) -> Option<LocalAccount> {
        self.accounts.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }

    pub async fn linked_subject(&self, key: &SubjectKey, account_id: &str) -> Option<String> {
        let data = self.subject_data.read().await;
        data.get(&key.data_key)
            .and_then(|entries| entries.get(account_id))
            .cloned()
    }
}

impl Default for InMemoryAccountRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountRepository for InMemoryAccountRepository {
    fn has_subject_field(&self) -> bool {
        self.subject_field
    }

    fn supports_name_fields(&self) -> bool {
        self.name_fields
    }

    async fn find_by_subject(&self, key: &SubjectKey) -> OidcResult<Option<LocalAccount>> {
        let accounts = self.accounts.read().await;

        if self.subject_field {
            if let Some(account) = accounts
                .values()
                .find(|account| account.subject.as_deref() == Some(key.subject.as_str()))
            {
                return Ok(Some(account.clone()));
            }
        }

        let data = self.subject_data.read().await;
        let found = data.get(&key.data_key).and_then(|entries| {
            entries
                .iter()
                .filter(|(_, subject)| **subject == key.subject)
                .find_map(|(account_id, _)| accounts.get(account_id).cloned())
        });

        Ok(found)
    }

    async fn username_exists(&self, username: &str) -> OidcResult<bool> {
        let accounts = self.accounts.read().await;
        Ok(accounts.values().any(|account| account.username == username))
    }

    async fn create(&self, account: NewAccount) -> OidcResult<LocalAccount> {
        let mut accounts = self.accounts.write().await;
        if accounts
            .values()
            .any(|existing| existing.username == account.username)
        {
            return Err(OidcError::AccountStore(format!(
                "username {} already taken",
                account.username
            )));
        }

        let created = LocalAccount {
            id: Uuid::new_v4().to_string(),
            username: account.username,
            email: account.email,
            first_name: account.first_name,
            last_name: account.last_name,
            roles: BTreeSet::new(),
            enabled: account.enabled,
            subject: None,
            password_hash: account.password_hash,
        };
        accounts.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn update(&self, account: &LocalAccount) -> OidcResult<()> {
        let mut accounts = self.accounts.write().await;
        let stored = accounts
            .get_mut(&account.id)
            .ok_or_else(|| OidcError::AccountStore(format!("unknown account {}", account.id)))?;
        *stored = account.clone();
        if !self.subject_field {
            stored.subject = None;
        }
        Ok(())
    }

    async fn link_subject(&self, account: &LocalAccount, key: &SubjectKey) -> OidcResult<()> {
        let mut data = self.subject_data.write().await;
        data.entry(key.data_key.clone())
            .or_default()
            .insert(account.id.clone(), key.subject.clone());
        Ok(())
    }

    async fn assign_role(&self, account: &LocalAccount, role: &str) -> OidcResult<()> {
        let mut accounts = self.accounts.write().await;
        let stored = accounts
            .get_mut(&account.id)
            .ok_or_else(|| OidcError::AccountStore(format!("unknown account {}", account.id)))?;
        stored.roles.insert(role.to_string());
        Ok(())
    }
}
