//! OpenID Connect relying party for the Authorization Code flow.
//!
//! This crate discovers a provider's endpoints, sends users to its
//! authorization, registration and profile pages, completes the callback
//! (state check, code exchange, userinfo) and maps the external identity onto
//! a local account. Session storage, account storage and the host's own login
//! are collaborators behind the [`SessionStore`], [`AccountRepository`] and
//! [`LocalSession`] traits.
//!
//! ID token signatures and nonces are not verified and PKCE is not used; the
//! id token is kept opaque for `id_token_hint` on logout.

mod authorize;
mod callback;
mod config;
mod discovery;
mod error;
mod logout;
mod manager;
mod reconcile;
mod session;
mod state;
mod types;

#[cfg(test)]
mod tests;

pub use authorize::{AuthorizationRedirector, AuthorizationRequest};
pub use callback::{CallbackOutcome, CallbackProcessor};
pub use config::{CALLBACK_PATH, OidcSettings};
pub use discovery::DiscoveryClient;
pub use error::{OidcError, OidcResult};
pub use logout::LogoutCoordinator;
pub use manager::{OidcManager, RequestContext};
pub use reconcile::{
    AccountRepository, IdentityReconciler, InMemoryAccountRepository, LocalAccount, NewAccount,
    Reconciliation, SubjectKey, derive_username,
};
pub use session::{InMemorySession, LocalSession, SessionAuthState, SessionKey, SessionStore};
pub use state::StateTokenGuard;
pub use types::{
    AuthorizeOptions, CallbackQuery, DiscoveredEndpoints, FlowResponse, FlowSelector,
    MessageLevel, TokenResponse, UserInfoClaims, UserMessage,
};
