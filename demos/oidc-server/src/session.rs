//! Cookie-keyed browser sessions held in memory.

use async_trait::async_trait;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use dashmap::DashMap;
use ras_identity_oidc::{InMemorySession, LocalAccount, LocalSession, OidcResult, UserMessage};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "oidc_demo_sid";

/// Sessions unused for this long are dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Server-side state of one browser.
#[derive(Clone, Default)]
pub struct BrowserSession {
    /// Key/value store the relying party keeps its auth state in
    pub store: InMemorySession,
    user: Arc<RwLock<Option<LocalAccount>>>,
    messages: Arc<RwLock<Vec<UserMessage>>>,
    /// Set when the signed-in user changes; the registry then moves the
    /// session to a fresh id before the response goes out.
    rotate: Arc<AtomicBool>,
}

impl BrowserSession {
    pub async fn current_user(&self) -> Option<LocalAccount> {
        self.user.read().await.clone()
    }

    pub async fn push_message(&self, message: UserMessage) {
        self.messages.write().await.push(message);
    }

    /// Messages are shown once.
    pub async fn take_messages(&self) -> Vec<UserMessage> {
        std::mem::take(&mut *self.messages.write().await)
    }
}

#[async_trait]
impl LocalSession for BrowserSession {
    async fn establish(&self, account: &LocalAccount) -> OidcResult<()> {
        info!("Local session started for {}", account.username);
        *self.user.write().await = Some(account.clone());
        self.rotate.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate(&self) -> OidcResult<()> {
        if let Some(account) = self.user.write().await.take() {
            info!("Local session ended for {}", account.username);
        }
        self.rotate.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct SessionEntry {
    session: BrowserSession,
    last_seen: Instant,
}

impl SessionEntry {
    fn new(session: BrowserSession) -> Self {
        Self {
            session,
            last_seen: Instant::now(),
        }
    }
}

/// Browser sessions keyed by the id in [`SESSION_COOKIE`].
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, SessionEntry>>,
    idle_timeout: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            idle_timeout,
        }
    }

    /// Returns the session named by the request cookie, starting a new one
    /// (and setting the cookie) when there is none or it has gone idle.
    pub fn resolve(&self, jar: CookieJar) -> (CookieJar, BrowserSession) {
        let existing = session_id(&jar).and_then(|id| self.touch(id));

        if let Some(session) = existing {
            return (jar, session);
        }

        let session = BrowserSession::default();
        let id = self.insert(session.clone());
        debug!("Started browser session {}", id);
        (jar.add(session_cookie(id)), session)
    }

    /// Moves a session whose signed-in user changed to a new id, so an id
    /// handed out before login (or kept after logout) no longer reaches it.
    pub fn finish(&self, jar: CookieJar, session: &BrowserSession) -> CookieJar {
        if !session.rotate.swap(false, Ordering::SeqCst) {
            return jar;
        }

        if let Some(old_id) = session_id(&jar) {
            self.sessions.remove(&old_id);
        }
        let id = self.insert(session.clone());
        debug!("Rotated browser session to {}", id);
        jar.add(session_cookie(id))
    }

    /// Drops every session idle for longer than the timeout and returns how
    /// many were removed.
    pub fn purge_idle(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| entry.last_seen.elapsed() < self.idle_timeout);
        let purged = before.saturating_sub(self.sessions.len());
        if purged > 0 {
            info!("Purged {} idle browser sessions", purged);
        }
        purged
    }

    /// Runs [`SessionRegistry::purge_idle`] every `every` on the runtime.
    pub fn spawn_purger(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut purge_interval = tokio::time::interval(every);
            purge_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                purge_interval.tick().await;
                registry.purge_idle();
            }
        })
    }

    fn touch(&self, id: Uuid) -> Option<BrowserSession> {
        let mut entry = self.sessions.get_mut(&id)?;
        if entry.last_seen.elapsed() >= self.idle_timeout {
            drop(entry);
            self.sessions.remove(&id);
            debug!("Browser session {} expired", id);
            return None;
        }
        entry.last_seen = Instant::now();
        Some(entry.session.clone())
    }

    fn insert(&self, session: BrowserSession) -> Uuid {
        let id = Uuid::new_v4();
        self.sessions.insert(id, SessionEntry::new(session));
        id
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn session_id(jar: &CookieJar) -> Option<Uuid> {
    jar.get(SESSION_COOKIE)
        .and_then(|cookie| Uuid::parse_str(cookie.value()).ok())
}

fn session_cookie(id: Uuid) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, id.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build()
}
