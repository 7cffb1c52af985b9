//! Server-side sessions.
//!
//! The browser only ever holds an opaque random id in the `ragchat_sid`
//! cookie. Everything else lives in a [`SessionContext`] held by the
//! [`SessionStore`], keyed by the SHA-256 digest of that id.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::state::AppState;

pub const SESSION_COOKIE: &str = "ragchat_sid";

/// Lifetime of the pending slots (verification, OAuth registration, OAuth state).
pub fn pending_ttl() -> Duration {
    Duration::minutes(10)
}

/// A value parked in the session between two requests of one flow.
#[derive(Debug, Clone)]
pub struct Pending<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

impl<T> Pending<T> {
    fn new(value: T) -> Self {
        Self { value, expires_at: Utc::now() + pending_ttl() }
    }

    fn live(self) -> Option<T> {
        (Utc::now() < self.expires_at).then_some(self.value)
    }
}

/// Typed per-session state. Pending slots are cleared when consumed.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    user_id: Option<Uuid>,
    roles: Vec<String>,
    pending_verification: Option<Pending<Uuid>>,
    pending_oauth_email: Option<Pending<String>>,
    oauth_state: Option<Pending<String>>,
    rotate: bool,
}

impl SessionContext {
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.user_id
    }

    /// Roles loaded when the session was bound. The store stays authoritative.
    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    /// Attach an authenticated identity. Clears the pending-verification slot
    /// and forces a fresh session id on commit.
    pub fn bind(&mut self, user_id: Uuid, roles: Vec<String>) {
        self.user_id = Some(user_id);
        self.roles = roles;
        self.pending_verification = None;
        self.rotate = true;
    }

    pub fn unbind(&mut self) {
        self.user_id = None;
        self.roles.clear();
    }

    pub fn set_pending_verification(&mut self, user_id: Uuid) {
        self.pending_verification = Some(Pending::new(user_id));
    }

    /// Peek without consuming; used to resend a code.
    pub fn pending_verification(&self) -> Option<Uuid> {
        self.pending_verification.clone().and_then(Pending::live)
    }

    pub fn take_pending_verification(&mut self) -> Option<Uuid> {
        self.pending_verification.take().and_then(Pending::live)
    }

    pub fn set_pending_oauth_email(&mut self, email: String) {
        self.pending_oauth_email = Some(Pending::new(email));
    }

    pub fn take_pending_oauth_email(&mut self) -> Option<String> {
        self.pending_oauth_email.take().and_then(Pending::live)
    }

    pub fn set_oauth_state(&mut self, state: String) {
        self.oauth_state = Some(Pending::new(state));
    }

    pub fn take_oauth_state(&mut self) -> Option<String> {
        self.oauth_state.take().and_then(Pending::live)
    }

    fn is_empty(&self) -> bool {
        self.user_id.is_none()
            && self.pending_verification.is_none()
            && self.pending_oauth_email.is_none()
            && self.oauth_state.is_none()
    }
}

struct StoredSession {
    context: SessionContext,
    last_seen: DateTime<Utc>,
}

/// In-process session storage shared by all handlers.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionStoreInner>,
}

struct SessionStoreInner {
    sessions: RwLock<HashMap<String, StoredSession>>,
    idle_ttl: Duration,
    secure_cookie: bool,
}

impl SessionStore {
    pub fn new(idle_ttl: Duration, secure_cookie: bool) -> Self {
        Self {
            inner: Arc::new(SessionStoreInner {
                sessions: RwLock::new(HashMap::new()),
                idle_ttl,
                secure_cookie,
            }),
        }
    }

    pub async fn load(&self, sid: &str) -> Option<SessionContext> {
        let key = digest(sid);
        let mut sessions = self.inner.sessions.write().await;
        let now = Utc::now();
        let expired = match sessions.get_mut(&key) {
            Some(stored) if now - stored.last_seen < self.inner.idle_ttl => {
                stored.last_seen = now;
                return Some(stored.context.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            sessions.remove(&key);
        }
        None
    }

    /// Persist `context`, returning the id the client must hold from now on.
    /// Rotates the id when the context was just bound to a user.
    ///
    /// Returns `None` when the session was destroyed while the request was in
    /// flight; a stale context must not bring it back.
    async fn save(&self, sid: Option<&str>, mut context: SessionContext) -> Option<String> {
        let rotate = std::mem::take(&mut context.rotate);
        let mut sessions = self.inner.sessions.write().await;
        let now = Utc::now();
        sessions.retain(|_, s| now - s.last_seen < self.inner.idle_ttl);

        let sid = match sid {
            Some(existing) if !rotate => {
                if !sessions.contains_key(&digest(existing)) {
                    debug!("Session vanished before commit; not restoring it");
                    return None;
                }
                existing.to_string()
            }
            existing => {
                if let Some(old) = existing {
                    sessions.remove(&digest(old));
                }
                new_session_id()
            }
        };
        sessions.insert(digest(&sid), StoredSession { context, last_seen: now });
        Some(sid)
    }

    pub async fn destroy(&self, sid: &str) {
        self.inner.sessions.write().await.remove(&digest(sid));
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    fn cookie(&self, sid: String) -> Cookie<'static> {
        Cookie::build((SESSION_COOKIE, sid))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.inner.secure_cookie)
            .into()
    }
}

/// Request-scoped view of the caller's session. Handlers mutate `context`
/// and hand the session back through [`Session::commit`].
pub struct Session {
    id: Option<String>,
    jar: CookieJar,
    pub context: SessionContext,
}

impl Session {
    /// Store the context and return the cookie jar to send back.
    /// An anonymous session with nothing pending is not stored at all.
    pub async fn commit(self, store: &SessionStore) -> CookieJar {
        if self.id.is_none() && self.context.is_empty() {
            return self.jar;
        }
        match store.save(self.id.as_deref(), self.context).await {
            Some(sid) => self.jar.add(store.cookie(sid)),
            None => self.jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
        }
    }

    /// Tear the session down. Safe to call on an anonymous session.
    pub async fn destroy(self, store: &SessionStore) -> CookieJar {
        if let Some(sid) = &self.id {
            store.destroy(sid).await;
            debug!("Session destroyed");
        }
        self.jar.remove(Cookie::build(SESSION_COOKIE).path("/"))
    }
}

impl FromRequestParts<AppState> for Session {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let sid = jar.get(SESSION_COOKIE).map(|c| c.value().to_string());

        let (id, context) = match sid {
            Some(sid) => match state.sessions.load(&sid).await {
                Some(context) => (Some(sid), context),
                None => (None, SessionContext::default()),
            },
            None => (None, SessionContext::default()),
        };

        Ok(Self { id, jar, context })
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    B64.encode(bytes)
}

fn digest(sid: &str) -> String {
    hex::encode(Sha256::digest(sid.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_clears_pending_verification() {
        let mut ctx = SessionContext::default();
        let id = Uuid::new_v4();
        ctx.set_pending_verification(id);
        assert_eq!(ctx.pending_verification(), Some(id));

        ctx.bind(id, vec!["user".into()]);
        assert!(ctx.is_authenticated());
        assert_eq!(ctx.pending_verification(), None);
        assert_eq!(ctx.roles(), ["user".to_string()]);
    }

    #[test]
    fn pending_slots_are_single_use() {
        let mut ctx = SessionContext::default();
        ctx.set_pending_oauth_email("a@x.com".into());
        assert_eq!(ctx.take_pending_oauth_email().as_deref(), Some("a@x.com"));
        assert_eq!(ctx.take_pending_oauth_email(), None);

        ctx.set_oauth_state("s".into());
        assert_eq!(ctx.take_oauth_state().as_deref(), Some("s"));
        assert_eq!(ctx.take_oauth_state(), None);
    }

    #[test]
    fn expired_pending_slot_is_ignored() {
        let expired = Pending { value: 7, expires_at: Utc::now() - Duration::seconds(1) };
        assert_eq!(expired.live(), None);
    }

    #[tokio::test]
    async fn binding_rotates_the_session_id() {
        let store = SessionStore::new(Duration::hours(1), false);
        let mut ctx = SessionContext::default();
        ctx.set_oauth_state("s".into());
        let first = store.save(None, ctx).await.unwrap();

        let mut ctx = store.load(&first).await.unwrap();
        ctx.bind(Uuid::new_v4(), vec![]);
        let second = store.save(Some(&first), ctx).await.unwrap();

        assert_ne!(first, second);
        assert!(store.load(&first).await.is_none());
        assert!(store.load(&second).await.unwrap().is_authenticated());

        let ctx = store.load(&second).await.unwrap();
        let third = store.save(Some(&second), ctx).await.unwrap();
        assert_eq!(second, third);
    }

    #[tokio::test]
    async fn idle_sessions_expire_and_destroy_is_idempotent() {
        let store = SessionStore::new(Duration::zero(), false);
        let sid = store.save(None, SessionContext::default()).await.unwrap();
        assert!(store.load(&sid).await.is_none());

        let store = SessionStore::new(Duration::hours(1), false);
        let sid = store.save(None, SessionContext::default()).await.unwrap();
        store.destroy(&sid).await;
        store.destroy(&sid).await;
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn commit_after_logout_does_not_revive_the_session() {
        let store = SessionStore::new(Duration::hours(1), false);
        let mut ctx = SessionContext::default();
        ctx.bind(Uuid::new_v4(), vec!["user".into()]);
        let sid = store.save(None, ctx).await.unwrap();

        // A slow request loaded the session before a concurrent logout.
        let stale = store.load(&sid).await.unwrap();
        store.destroy(&sid).await;

        assert_eq!(store.save(Some(&sid), stale).await, None);
        assert!(store.load(&sid).await.is_none());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn binding_after_logout_still_issues_a_fresh_session() {
        let store = SessionStore::new(Duration::hours(1), false);
        let sid = store.save(None, SessionContext::default()).await.unwrap();
        let mut ctx = store.load(&sid).await.unwrap();
        store.destroy(&sid).await;

        ctx.bind(Uuid::new_v4(), vec![]);
        let fresh = store.save(Some(&sid), ctx).await.unwrap();
        assert_ne!(fresh, sid);
        assert!(store.load(&fresh).await.unwrap().is_authenticated());
    }
}
