//! End-to-end tests of the relying party against a mock provider.

#[cfg(test)]
mod flow_tests {
    use crate::{
        AccountRepository, CallbackQuery, InMemoryAccountRepository, InMemorySession,
        LocalAccount, LocalSession, MessageLevel, OidcManager, OidcResult, OidcSettings,
        RequestContext, SessionKey, SessionStore, SubjectKey,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use url::Url;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SITE: &str = "https://site.example.com";
    const ENCODED_CALLBACK: &str = "redirect_uri=https%3A%2F%2Fsite.example.com%2Fni-oidc%2Fcallback";

    /// Records local logins, and which auth keys were still in the session
    /// store at the moment the local session was terminated.
    struct RecordingLocalSession {
        store: InMemorySession,
        established: RwLock<Vec<LocalAccount>>,
        keys_at_terminate: RwLock<Option<Vec<&'static str>>>,
    }

    impl RecordingLocalSession {
        fn watching(store: InMemorySession) -> Self {
            Self {
                store,
                established: RwLock::new(Vec::new()),
                keys_at_terminate: RwLock::new(None),
            }
        }

        async fn logins(&self) -> Vec<LocalAccount> {
            self.established.read().await.clone()
        }

        async fn keys_at_terminate(&self) -> Option<Vec<&'static str>> {
            self.keys_at_terminate.read().await.clone()
        }
    }

    #[async_trait]
    impl LocalSession for RecordingLocalSession {
        async fn establish(&self, account: &LocalAccount) -> OidcResult<()> {
            self.established.write().await.push(account.clone());
            Ok(())
        }

        async fn terminate(&self) -> OidcResult<()> {
            let mut present = Vec::new();
            for key in SessionKey::ALL {
                if self.store.contains(key.as_str()).await {
                    present.push(key.as_str());
                }
            }
            *self.keys_at_terminate.write().await = Some(present);
            Ok(())
        }
    }

    struct Harness {
        provider: MockServer,
        manager: OidcManager,
        accounts: Arc<InMemoryAccountRepository>,
        session: InMemorySession,
        local: RecordingLocalSession,
    }

    impl Harness {
        async fn start() -> Self {
            Self::start_with(|settings| settings).await
        }

        async fn start_with(customize: impl FnOnce(OidcSettings) -> OidcSettings) -> Self {
            let _ = tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter("ras_identity_oidc=debug,security=warn")
                .try_init();

            let provider = MockServer::start().await;
            let settings = customize(
                OidcSettings::new(provider.uri(), "site-client", "site-secret")
                    .with_site_base_url(SITE),
            );
            let accounts = Arc::new(InMemoryAccountRepository::new());
            let manager = OidcManager::new(settings, accounts.clone()).unwrap();
            let session = InMemorySession::new();

            Self {
                provider,
                manager,
                accounts,
                local: RecordingLocalSession::watching(session.clone()),
                session,
            }
        }

        fn ctx(&self) -> RequestContext<'_> {
            RequestContext::new(&self.session, &self.local)
        }

        async fn mount_discovery(&self) {
            let uri = self.provider.uri();
            Mock::given(method("GET"))
                .and(path("/.well-known/openid-configuration"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "issuer": uri,
                    "authorization_endpoint": format!("{}/authorize", uri),
                    "token_endpoint": format!("{}/token", uri),
                    "userinfo_endpoint": format!("{}/userinfo", uri),
                    "end_session_endpoint": format!("{}/endsession", uri),
                    "jwks_uri": format!("{}/jwks", uri)
                })))
                .mount(&self.provider)
                .await;
        }

        async fn mount_token(&self, code: &str, access_token: &str) {
            Mock::given(method("POST"))
                .and(path("/token"))
                .and(body_string_contains("grant_type=authorization_code"))
                .and(body_string_contains(format!("code={}", code)))
                .and(body_string_contains("client_id=site-client"))
                .and(body_string_contains("client_secret=site-secret"))
                .and(body_string_contains(ENCODED_CALLBACK))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "access_token": access_token,
                    "token_type": "Bearer",
                    "expires_in": 3600,
                    "refresh_token": format!("refresh-{}", access_token),
                    "id_token": format!("id-{}", access_token)
                })))
                .mount(&self.provider)
                .await;
        }

        async fn mount_userinfo(&self, access_token: &str, claims: serde_json::Value) {
            Mock::given(method("GET"))
                .and(path("/userinfo"))
                .and(header("Authorization", format!("Bearer {}", access_token)))
                .respond_with(ResponseTemplate::new(200).set_body_json(claims))
                .mount(&self.provider)
                .await;
        }

        /// Starts a login and returns the state parameter sent to the provider.
        async fn begin_login(&self) -> String {
            let response = self.manager.authorize(&self.ctx()).await;
            assert!(response.external, "unexpected response: {:?}", response);
            let url = Url::parse(&response.location).unwrap();
            let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
            params.get("state").cloned().unwrap()
        }

        async fn complete(&self, code: &str, state: &str) -> crate::FlowResponse {
            let query = CallbackQuery {
                code: Some(code.to_string()),
                state: Some(state.to_string()),
                ..Default::default()
            };
            self.manager.callback(&self.ctx(), &query).await
        }
    }

    fn jdoe_claims() -> serde_json::Value {
        serde_json::json!({
            "sub": "subject-123",
            "email": "jdoe@example.com",
            "email_verified": true,
            "preferred_username": "jdoe",
            "given_name": "Jane",
            "family_name": "Doe"
        })
    }

    #[tokio::test]
    async fn test_full_login_creates_account_and_session() {
        let harness = Harness::start_with(|s| s.with_user_roles(["member"])).await;
        harness.mount_discovery().await;
        harness.mount_token("auth-code", "access-1").await;
        harness.mount_userinfo("access-1", jdoe_claims()).await;

        let state = harness.begin_login().await;
        let query = CallbackQuery {
            code: Some("auth-code".to_string()),
            state: Some(state),
            destination: Some("/node/42".to_string()),
            ..Default::default()
        };
        let response = harness.manager.callback(&harness.ctx(), &query).await;

        assert_eq!(response.location, "/node/42");
        assert!(!response.external);
        let message = response.message.unwrap();
        assert_eq!(message.level, MessageLevel::Status);
        assert_eq!(message.text, "You have been logged in.");

        let account = harness
            .accounts
            .find_by_subject(&SubjectKey::new("subject-123"))
            .await
            .unwrap()
            .expect("account created");
        assert_eq!(account.username, "jdoe");
        assert_eq!(account.email, "jdoe@example.com");
        assert_eq!(account.first_name.as_deref(), Some("Jane"));
        assert!(account.roles.contains("member"));

        let logins = harness.local.logins().await;
        assert_eq!(logins.len(), 1);
        assert_eq!(logins[0].id, account.id);

        let session = &harness.session;
        assert_eq!(
            harness.manager.access_token(session).await.unwrap().as_deref(),
            Some("access-1")
        );
        assert_eq!(
            harness.manager.id_token(session).await.unwrap().as_deref(),
            Some("id-access-1")
        );
        assert_eq!(
            harness.manager.refresh_token(session).await.unwrap().as_deref(),
            Some("refresh-access-1")
        );
        assert_eq!(
            harness.manager.userinfo(session).await.unwrap().unwrap().sub,
            "subject-123"
        );
        assert!(!session.contains(SessionKey::State.as_str()).await);
        assert!(harness.manager.has_valid_access_token(session).await);
    }

    #[tokio::test]
    async fn test_login_without_destination_lands_on_account_page() {
        let harness = Harness::start().await;
        harness.mount_discovery().await;
        harness.mount_token("auth-code", "access-1").await;
        harness.mount_userinfo("access-1", jdoe_claims()).await;

        let state = harness.begin_login().await;
        let response = harness.complete("auth-code", &state).await;

        assert_eq!(response.location, "/user");
        assert!(!response.is_error());
    }

    #[tokio::test]
    async fn test_offsite_destination_is_ignored() {
        let harness = Harness::start().await;
        harness.mount_discovery().await;
        harness.mount_token("auth-code", "access-1").await;
        harness.mount_userinfo("access-1", jdoe_claims()).await;

        let state = harness.begin_login().await;
        let query = CallbackQuery {
            code: Some("auth-code".to_string()),
            state: Some(state),
            destination: Some("https://evil.example.com/".to_string()),
            ..Default::default()
        };
        let response = harness.manager.callback(&harness.ctx(), &query).await;

        assert_eq!(response.location, "/user");
    }

    #[tokio::test]
    async fn test_second_login_updates_existing_account() {
        let harness = Harness::start().await;
        harness.mount_discovery().await;
        harness.mount_token("first-code", "access-1").await;
        harness.mount_token("second-code", "access-2").await;
        harness.mount_userinfo("access-1", jdoe_claims()).await;
        harness
            .mount_userinfo(
                "access-2",
                serde_json::json!({
                    "sub": "subject-123",
                    "email": "jane.doe@example.com",
                    "preferred_username": "jdoe",
                    "given_name": "Jane",
                    "family_name": "Smith"
                }),
            )
            .await;

        let state = harness.begin_login().await;
        assert!(!harness.complete("first-code", &state).await.is_error());

        let state = harness.begin_login().await;
        assert!(!harness.complete("second-code", &state).await.is_error());

        assert_eq!(harness.accounts.len().await, 1);
        let account = harness
            .accounts
            .find_by_subject(&SubjectKey::new("subject-123"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.email, "jane.doe@example.com");
        assert_eq!(account.last_name.as_deref(), Some("Smith"));

        let logins = harness.local.logins().await;
        assert_eq!(logins.len(), 2);
        assert_eq!(logins[0].id, logins[1].id);
    }

    #[tokio::test]
    async fn test_provider_error_skips_token_exchange() {
        let harness = Harness::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&harness.provider)
            .await;

        let query = CallbackQuery {
            error: Some("access_denied".to_string()),
            error_description: Some("User cancelled".to_string()),
            ..Default::default()
        };
        let response = harness.manager.callback(&harness.ctx(), &query).await;

        assert_eq!(response.location, "/");
        assert!(response.is_error());
        assert_eq!(
            response.message.unwrap().text,
            "Authentication error: access_denied - User cancelled"
        );
        assert!(harness.local.logins().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_code_or_state_contacts_nobody() {
        let harness = Harness::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&harness.provider)
            .await;

        for query in [
            CallbackQuery {
                state: Some("abc".to_string()),
                ..Default::default()
            },
            CallbackQuery {
                code: Some("auth-code".to_string()),
                ..Default::default()
            },
            CallbackQuery {
                code: Some(String::new()),
                state: Some("abc".to_string()),
                ..Default::default()
            },
        ] {
            let response = harness.manager.callback(&harness.ctx(), &query).await;
            assert_eq!(response.location, "/");
            assert_eq!(
                response.message.unwrap().text,
                "Invalid authentication response."
            );
        }
    }

    #[tokio::test]
    async fn test_forged_state_is_rejected_before_discovery() {
        let harness = Harness::start().await;
        harness.mount_discovery().await;
        let _state = harness.begin_login().await;

        // Only the authorize call may have hit discovery.
        harness.provider.reset().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&harness.provider)
            .await;

        let response = harness.complete("auth-code", "not-the-state").await;

        assert_eq!(
            response.message.unwrap().text,
            "Invalid state parameter. Authentication failed."
        );
        assert!(!harness.session.contains(SessionKey::State.as_str()).await);
    }

    #[tokio::test]
    async fn test_state_cannot_be_replayed() {
        let harness = Harness::start().await;
        harness.mount_discovery().await;
        harness.mount_token("auth-code", "access-1").await;
        harness.mount_userinfo("access-1", jdoe_claims()).await;

        let state = harness.begin_login().await;
        assert!(!harness.complete("auth-code", &state).await.is_error());

        let replay = harness.complete("auth-code", &state).await;
        assert!(replay.is_error());
        assert_eq!(
            replay.message.unwrap().text,
            "Invalid state parameter. Authentication failed."
        );
        assert_eq!(harness.local.logins().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_token_exchange() {
        let harness = Harness::start().await;
        harness.mount_discovery().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant"
            })))
            .mount(&harness.provider)
            .await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&harness.provider)
            .await;

        let state = harness.begin_login().await;
        let response = harness.complete("auth-code", &state).await;

        assert_eq!(response.location, "/");
        assert_eq!(
            response.message.unwrap().text,
            "Failed to authenticate with the Identity Provider."
        );
        assert!(harness.session.is_empty().await);
        assert!(harness.local.logins().await.is_empty());
    }

    #[tokio::test]
    async fn test_token_response_without_access_token() {
        let harness = Harness::start().await;
        harness.mount_discovery().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token_type": "Bearer"
            })))
            .mount(&harness.provider)
            .await;

        let state = harness.begin_login().await;
        let response = harness.complete("auth-code", &state).await;

        assert!(response.is_error());
        assert!(!harness.manager.has_valid_access_token(&harness.session).await);
    }

    #[tokio::test]
    async fn test_userinfo_failure_keeps_tokens_without_login() {
        let harness = Harness::start().await;
        harness.mount_discovery().await;
        harness.mount_token("auth-code", "access-1").await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&harness.provider)
            .await;

        let state = harness.begin_login().await;
        let response = harness.complete("auth-code", &state).await;

        assert_eq!(response.location, "/");
        assert!(response.is_error());
        assert_eq!(
            harness
                .manager
                .access_token(&harness.session)
                .await
                .unwrap()
                .as_deref(),
            Some("access-1")
        );
        assert!(harness.manager.userinfo(&harness.session).await.unwrap().is_none());
        assert!(harness.local.logins().await.is_empty());
        assert!(harness.accounts.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_user_without_auto_register() {
        let harness = Harness::start_with(|s| s.with_auto_register(false)).await;
        harness.mount_discovery().await;
        harness.mount_token("auth-code", "access-1").await;
        harness.mount_userinfo("access-1", jdoe_claims()).await;

        let state = harness.begin_login().await;
        let response = harness.complete("auth-code", &state).await;

        assert_eq!(response.location, "/");
        assert_eq!(
            response.message.unwrap().text,
            "Unable to find or create a user account."
        );
        assert!(harness.accounts.is_empty().await);
        assert!(harness.local.logins().await.is_empty());
        for key in SessionKey::ALL {
            assert!(!harness.session.contains(key.as_str()).await);
        }
    }

    #[tokio::test]
    async fn test_userinfo_endpoint_override() {
        let harness = Harness::start_with(|s| {
            let custom = format!("{}/custom/userinfo", s.provider_url);
            s.with_userinfo_endpoint(custom)
        })
        .await;
        harness.mount_discovery().await;
        harness.mount_token("auth-code", "access-1").await;
        Mock::given(method("GET"))
            .and(path("/custom/userinfo"))
            .and(header("Authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jdoe_claims()))
            .expect(1)
            .mount(&harness.provider)
            .await;

        let state = harness.begin_login().await;
        let response = harness.complete("auth-code", &state).await;

        assert!(!response.is_error());
    }

    #[tokio::test]
    async fn test_redirect_uri_is_identical_in_both_legs() {
        let harness = Harness::start().await;
        harness.mount_discovery().await;
        harness.mount_token("auth-code", "access-1").await;
        harness.mount_userinfo("access-1", jdoe_claims()).await;

        let response = harness.manager.authorize(&harness.ctx()).await;
        let url = Url::parse(&response.location).unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(
            params.get("redirect_uri").map(String::as_str),
            Some("https://site.example.com/ni-oidc/callback")
        );
        assert!(response.location.contains(ENCODED_CALLBACK));

        // The token mock only matches the same encoded redirect_uri.
        let state = params.get("state").cloned().unwrap();
        assert!(!harness.complete("auth-code", &state).await.is_error());
    }

    #[tokio::test]
    async fn test_language_prefix_in_callback_url() {
        let harness = Harness::start_with(|s| s.with_languages(["nl"])).await;
        harness.mount_discovery().await;

        let redirect_uri = |location: &str| {
            let url = Url::parse(location).unwrap();
            url.query_pairs()
                .find(|(name, _)| name == "redirect_uri")
                .map(|(_, value)| value.into_owned())
        };

        let ctx = harness.ctx().with_language_prefix("nl");
        let response = harness.manager.authorize(&ctx).await;
        assert_eq!(
            redirect_uri(&response.location).as_deref(),
            Some("https://site.example.com/nl/ni-oidc/callback")
        );

        let ctx = harness.ctx().with_language_prefix("evil.example.com");
        let response = harness.manager.authorize(&ctx).await;
        assert_eq!(
            redirect_uri(&response.location).as_deref(),
            Some("https://site.example.com/ni-oidc/callback")
        );
    }

    #[tokio::test]
    async fn test_loosely_typed_provider_responses_still_log_in() {
        let harness = Harness::start().await;
        harness.mount_discovery().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-1",
                "token_type": "Bearer",
                "expires_in": "3600",
                "ext_expires_in": "3600",
                "id_token": "id-1"
            })))
            .mount(&harness.provider)
            .await;
        harness
            .mount_userinfo(
                "access-1",
                serde_json::json!({
                    "sub": 98765,
                    "email": "jdoe@example.com",
                    "email_verified": "true",
                    "preferred_username": "jdoe"
                }),
            )
            .await;

        let state = harness.begin_login().await;
        let response = harness.complete("auth-code", &state).await;

        assert!(!response.is_error(), "unexpected response: {:?}", response);
        let account = harness
            .accounts
            .find_by_subject(&SubjectKey::new("98765"))
            .await
            .unwrap()
            .expect("account created");
        assert_eq!(account.username, "jdoe");
        let userinfo = harness.manager.userinfo(&harness.session).await.unwrap().unwrap();
        assert_eq!(userinfo.email_verified, Some(true));
    }

    #[tokio::test]
    async fn test_userinfo_with_non_scalar_sub_is_rejected() {
        let harness = Harness::start().await;
        harness.mount_discovery().await;
        harness.mount_token("auth-code", "access-1").await;
        harness
            .mount_userinfo("access-1", serde_json::json!({ "sub": { "id": 1 } }))
            .await;

        let state = harness.begin_login().await;
        let response = harness.complete("auth-code", &state).await;

        assert!(response.is_error());
        assert!(harness.accounts.is_empty().await);
        assert!(harness.local.logins().await.is_empty());
    }

    #[tokio::test]
    async fn test_register_and_edit_profile_use_provider_pages() {
        let harness = Harness::start().await;
        harness.mount_discovery().await;
        let uri = harness.provider.uri();

        let register = harness.manager.register(&harness.ctx()).await;
        assert!(register.external);
        assert!(register.location.starts_with(&format!("{}/register?", uri)));
        assert!(register.location.contains("client_id=site-client"));
        assert!(register.location.contains("state="));

        let profile = harness.manager.edit_profile(&harness.ctx()).await;
        assert!(
            profile
                .location
                .starts_with(&format!("{}/personal-details?", uri))
        );
        assert!(harness.session.contains(SessionKey::State.as_str()).await);
    }

    #[tokio::test]
    async fn test_authorize_with_unreachable_provider() {
        let harness = Harness::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&harness.provider)
            .await;

        let response = harness.manager.authorize(&harness.ctx()).await;

        assert_eq!(response.location, "/");
        assert!(!response.external);
        assert!(
            response
                .message
                .unwrap()
                .text
                .starts_with("Unable to connect to the Identity Provider.")
        );
        assert!(harness.session.is_empty().await);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_goes_home() {
        let session = InMemorySession::new();
        let local = RecordingLocalSession::watching(session.clone());
        let manager = OidcManager::new(
            OidcSettings::default(),
            Arc::new(InMemoryAccountRepository::new()),
        )
        .unwrap();

        let response = manager
            .authorize(&RequestContext::new(&session, &local))
            .await;

        assert_eq!(response.location, "/");
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn test_logout_redirects_to_end_session() {
        let harness = Harness::start().await;
        harness.mount_discovery().await;
        harness.mount_token("auth-code", "access-1").await;
        harness.mount_userinfo("access-1", jdoe_claims()).await;

        let state = harness.begin_login().await;
        assert!(!harness.complete("auth-code", &state).await.is_error());

        let response = harness.manager.logout(&harness.ctx()).await;

        assert!(response.external);
        let url = Url::parse(&response.location).unwrap();
        assert_eq!(url.path(), "/endsession");
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(
            params.get("id_token_hint").map(String::as_str),
            Some("id-access-1")
        );
        for key in SessionKey::ALL {
            assert!(!harness.session.contains(key.as_str()).await);
        }
        assert_eq!(harness.local.keys_at_terminate().await, Some(vec![]));
    }

    #[tokio::test]
    async fn test_logout_with_provider_down_goes_home() {
        let harness = Harness::start().await;
        harness
            .session
            .set(SessionKey::IdToken.as_str(), serde_json::json!("id-token"))
            .await
            .unwrap();

        let response = harness.manager.logout(&harness.ctx()).await;

        assert_eq!(response.location, "/");
        assert!(!response.external);
        assert!(harness.session.is_empty().await);
        assert_eq!(harness.local.keys_at_terminate().await, Some(vec![]));
    }

    #[tokio::test]
    async fn test_auth_state_is_cleared_before_local_logout() {
        let harness = Harness::start().await;
        harness.mount_discovery().await;
        let _state = harness.begin_login().await;
        for key in SessionKey::ALL {
            harness
                .session
                .set(key.as_str(), serde_json::json!("value"))
                .await
                .unwrap();
        }

        harness.manager.logout(&harness.ctx()).await;

        assert_eq!(harness.local.keys_at_terminate().await, Some(vec![]));
    }
}
