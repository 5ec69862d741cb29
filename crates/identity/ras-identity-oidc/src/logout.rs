//! Relying-party logout.

use crate::error::OidcResult;
use crate::session::{SessionAuthState, SessionStore};
use crate::types::{DiscoveredEndpoints, FlowResponse};
use tracing::{debug, warn};
use url::Url;

pub struct LogoutCoordinator;

impl LogoutCoordinator {
    /// Clears the session auth state and picks the post-logout redirect.
    ///
    /// The id token is read before the clear; the clear completes before this
    /// returns, so the caller can end the local session straight after.
    pub async fn logout(
        session: &dyn SessionStore,
        endpoints: Option<&DiscoveredEndpoints>,
        home_path: &str,
    ) -> OidcResult<FlowResponse> {
        let auth_state = SessionAuthState::new(session);
        let id_token = match auth_state.id_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!("Could not read id token before logout: {}", e);
                None
            }
        };

        auth_state.clear().await?;

        let end_session = endpoints.and_then(DiscoveredEndpoints::end_session_endpoint);
        if let (Some(end_session), Some(id_token)) = (end_session, id_token) {
            match Url::parse(end_session) {
                Ok(mut url) => {
                    url.query_pairs_mut().append_pair("id_token_hint", &id_token);
                    debug!("Redirecting to provider end-session endpoint");
                    return Ok(FlowResponse::external(url.to_string()));
                }
                Err(e) => warn!("Ignoring malformed end_session_endpoint: {}", e),
            }
        }

        Ok(FlowResponse::local(home_path))
    }
}
