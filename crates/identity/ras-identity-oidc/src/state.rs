//! CSRF state parameter bound to the user's session.

use crate::error::OidcResult;
use crate::session::{SessionAuthState, SessionStore};
use rand::{RngCore, thread_rng};
use subtle::ConstantTimeEq;
use tracing::warn;

/// Bytes of entropy in a generated state token.
pub const STATE_ENTROPY_BYTES: usize = 16;

/// Issues and consumes the single-use `state` parameter.
pub struct StateTokenGuard;

impl StateTokenGuard {
    /// Generates a fresh hex-encoded token and stores it as the session's
    /// pending state, replacing any earlier one.
    pub async fn generate(session: &dyn SessionStore) -> OidcResult<String> {
        let mut bytes = [0u8; STATE_ENTROPY_BYTES];
        thread_rng().fill_bytes(&mut bytes);

        let token = hex::encode(bytes);

        SessionAuthState::new(session)
            .set_pending_state(&token)
            .await?;
        Ok(token)
    }

    /// Consumes the pending state and compares it with `received`.
    ///
    /// The pending state is removed whatever the outcome, so a token is
    /// accepted at most once.
    pub async fn validate(session: &dyn SessionStore, received: &str) -> OidcResult<bool> {
        let pending = SessionAuthState::new(session).take_pending_state().await?;

        let valid = match pending.as_deref() {
            Some(expected) if !expected.is_empty() => {
                bool::from(expected.as_bytes().ct_eq(received.as_bytes()))
            }
            _ => false,
        };

        if !valid {
            warn!(
                target: "security",
                pending_present = pending.is_some(),
                "Invalid state parameter in OIDC callback"
            );
        }

        Ok(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InMemorySession, SessionKey};

    #[tokio::test]
    async fn test_generated_state_is_hex_and_stored() {
        let session = InMemorySession::new();
        let state = StateTokenGuard::generate(&session).await.unwrap();

        assert_eq!(state.len(), STATE_ENTROPY_BYTES * 2);
        assert!(state.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(session.contains(SessionKey::State.as_str()).await);
    }

    #[tokio::test]
    async fn test_state_is_accepted_exactly_once() {
        let session = InMemorySession::new();
        let state = StateTokenGuard::generate(&session).await.unwrap();

        assert!(StateTokenGuard::validate(&session, &state).await.unwrap());
        assert!(!StateTokenGuard::validate(&session, &state).await.unwrap());
    }

    #[tokio::test]
    async fn test_mismatch_still_consumes_pending_state() {
        let session = InMemorySession::new();
        let state = StateTokenGuard::generate(&session).await.unwrap();

        assert!(!StateTokenGuard::validate(&session, "forged").await.unwrap());
        assert!(!session.contains(SessionKey::State.as_str()).await);
        assert!(!StateTokenGuard::validate(&session, &state).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_pending_state_is_invalid() {
        let session = InMemorySession::new();
        assert!(!StateTokenGuard::validate(&session, "").await.unwrap());
        assert!(!StateTokenGuard::validate(&session, "anything").await.unwrap());
    }

    #[tokio::test]
    async fn test_states_are_unique() {
        let session = InMemorySession::new();
        let first = StateTokenGuard::generate(&session).await.unwrap();
        let second = StateTokenGuard::generate(&session).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_concurrent_replay_succeeds_once() {
        let session = InMemorySession::new();
        let state = StateTokenGuard::generate(&session).await.unwrap();

        let mut handles = vec![];
        for _ in 0..8 {
            let session = session.clone();
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                StateTokenGuard::validate(&session, &state).await.unwrap()
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn test_prefix_or_extension_of_state_is_rejected() {
        let session = InMemorySession::new();
        let state = StateTokenGuard::generate(&session).await.unwrap();
        assert!(!StateTokenGuard::validate(&session, &state[..8]).await.unwrap());

        let state = StateTokenGuard::generate(&session).await.unwrap();
        let extended = format!("{}00", state);
        assert!(!StateTokenGuard::validate(&session, &extended).await.unwrap());
    }
}
