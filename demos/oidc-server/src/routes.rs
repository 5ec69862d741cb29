//! HTTP routes of the demo relying party.

use crate::session::{BrowserSession, SessionRegistry};
use axum::{
    Router,
    extract::{OriginalUri, Query, State},
    http::{StatusCode, Uri},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use axum_extra::extract::cookie::CookieJar;
use ras_identity_oidc::{
    CALLBACK_PATH, CallbackQuery, FlowResponse, InMemoryAccountRepository, MessageLevel,
    OidcManager, RequestContext,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<OidcManager>,
    pub sessions: SessionRegistry,
    pub accounts: Arc<InMemoryAccountRepository>,
}

/// The relying-party entry points.
enum Flow {
    Authorize,
    Register,
    EditProfile,
    Callback(CallbackQuery),
    Logout,
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(home_handler))
        .route("/user", get(account_handler))
        .route("/health", get(|| async { "OK" }));

    // Every entry point is also reachable below a language prefix, e.g. /fr/ni-oidc/authorize
    for prefix in ["", "/{lang}"] {
        router = router
            .route(&format!("{}/ni-oidc/authorize", prefix), get(authorize_handler))
            .route(&format!("{}/ni-oidc/register", prefix), get(register_handler))
            .route(
                &format!("{}/ni-oidc/edit-profile", prefix),
                get(edit_profile_handler),
            )
            .route(&format!("{}{}", prefix, CALLBACK_PATH), get(callback_handler))
            .route(&format!("{}/ni-oidc/logout", prefix), get(logout_handler));
    }

    router.with_state(state)
}

async fn authorize_handler(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    jar: CookieJar,
) -> Response {
    run_flow(&state, &uri, jar, Flow::Authorize).await
}

async fn register_handler(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    jar: CookieJar,
) -> Response {
    run_flow(&state, &uri, jar, Flow::Register).await
}

async fn edit_profile_handler(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    jar: CookieJar,
) -> Response {
    run_flow(&state, &uri, jar, Flow::EditProfile).await
}

async fn callback_handler(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
) -> Response {
    info!("Handling OIDC callback");
    run_flow(&state, &uri, jar, Flow::Callback(query)).await
}

async fn logout_handler(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    jar: CookieJar,
) -> Response {
    run_flow(&state, &uri, jar, Flow::Logout).await
}

async fn run_flow(state: &AppState, uri: &Uri, jar: CookieJar, flow: Flow) -> Response {
    let language_prefix = language_prefix(uri.path());
    if let Some(prefix) = language_prefix.as_deref() {
        if !state.manager.settings().serves_language(prefix) {
            warn!("Unknown language prefix: {}", prefix);
            return StatusCode::NOT_FOUND.into_response();
        }
    }

    let (jar, session) = state.sessions.resolve(jar);

    let mut ctx = RequestContext::new(&session.store, &session);
    if let Some(prefix) = language_prefix.as_deref() {
        ctx = ctx.with_language_prefix(prefix);
    }

    let response = match flow {
        Flow::Authorize => state.manager.authorize(&ctx).await,
        Flow::Register => state.manager.register(&ctx).await,
        Flow::EditProfile => state.manager.edit_profile(&ctx).await,
        Flow::Callback(query) => state.manager.callback(&ctx, &query).await,
        Flow::Logout => state.manager.logout(&ctx).await,
    };

    let redirect = redirect(&session, response).await;
    let jar = state.sessions.finish(jar, &session);
    (jar, redirect).into_response()
}

async fn redirect(session: &BrowserSession, response: FlowResponse) -> Redirect {
    if let Some(message) = response.message {
        session.push_message(message).await;
    }
    if response.external {
        debug!("Redirecting to identity provider");
    } else {
        debug!("Redirecting to {}", response.location);
    }
    Redirect::to(&response.location)
}

/// `/fr/ni-oidc/...` yields `fr`; unprefixed paths yield nothing.
fn language_prefix(path: &str) -> Option<String> {
    let mut segments = path.trim_start_matches('/').split('/');
    match (segments.next(), segments.next()) {
        (Some(first), Some("ni-oidc")) if !first.is_empty() => Some(first.to_string()),
        _ => None,
    }
}

async fn home_handler(State(state): State<AppState>, jar: CookieJar) -> impl IntoResponse {
    let (jar, session) = state.sessions.resolve(jar);
    let messages = render_messages(&session).await;
    let settings = state.manager.settings();

    let body = match session.current_user().await {
        Some(account) => format!(
            r#"<p>Signed in as <strong>{}</strong>.</p>
<a href="/user">Your account</a> | <a href="/ni-oidc/edit-profile">Edit profile</a> | <a href="/ni-oidc/logout">Log out</a>"#,
            escape(&account.username)
        ),
        None => format!(
            r#"<a href="/ni-oidc/authorize">{}</a> | <a href="/ni-oidc/register">{}</a>"#,
            escape(&settings.login_button_text),
            escape(&settings.register_button_text)
        ),
    };

    (jar, Html(page("OIDC demo", &messages, &body)))
}

async fn account_handler(State(state): State<AppState>, jar: CookieJar) -> Response {
    let (jar, session) = state.sessions.resolve(jar);
    let Some(account) = session.current_user().await else {
        return (jar, Redirect::to("/")).into_response();
    };

    let messages = render_messages(&session).await;
    let has_token = state.manager.has_valid_access_token(&session.store).await;
    let roles = account.roles.iter().cloned().collect::<Vec<_>>().join(", ");
    let body = format!(
        r#"<table>
<tr><th>Username</th><td>{}</td></tr>
<tr><th>Email</th><td>{}</td></tr>
<tr><th>Name</th><td>{} {}</td></tr>
<tr><th>Roles</th><td>{}</td></tr>
<tr><th>Provider access token</th><td>{}</td></tr>
<tr><th>Accounts on this site</th><td>{}</td></tr>
</table>
<a href="/">Home</a> | <a href="/ni-oidc/logout">Log out</a>"#,
        escape(&account.username),
        escape(&account.email),
        escape(account.first_name.as_deref().unwrap_or("")),
        escape(account.last_name.as_deref().unwrap_or("")),
        escape(&roles),
        if has_token { "present" } else { "absent" },
        state.accounts.len().await,
    );

    (jar, Html(page("Your account", &messages, &body))).into_response()
}

async fn render_messages(session: &BrowserSession) -> String {
    session
        .take_messages()
        .await
        .into_iter()
        .map(|message| {
            let class = match message.level {
                MessageLevel::Status => "status",
                MessageLevel::Error => "error",
            };
            format!(r#"<div class="{}">{}</div>"#, class, escape(&message.text))
        })
        .collect()
}

fn page(title: &str, messages: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>{title}</title>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 40px; }}
        .status {{ background: #e6f4ea; padding: 10px; margin: 10px 0; }}
        .error {{ background: #fce8e6; padding: 10px; margin: 10px 0; }}
        th {{ text-align: left; padding-right: 20px; }}
    </style>
</head>
<body>
    <h1>{title}</h1>
    {messages}
    {body}
</body>
</html>"#
    )
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
