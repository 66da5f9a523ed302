//! Server-side sessions and single-display flash messages.
//!
//! Every request passing through [`attach`] carries a [`SessionId`] in its
//! extensions. Visitors without a valid cookie get an unsaved id; nothing is
//! stored or sent back until a handler writes to it (a flash message or a
//! login). Session state lives in a bounded moka cache keyed by the
//! hex-encoded id, so it is lost on restart.

use std::time::Duration;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use moka::future::Cache;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::http::HttpError;
use crate::state::AppState;

const SESSION_ID_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashLevel {
    Success,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashMessage {
    pub level: FlashLevel,
    pub text: String,
}

impl FlashMessage {
    pub fn new(level: FlashLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::new(FlashLevel::Success, text)
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(FlashLevel::Info, text)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(FlashLevel::Warning, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(FlashLevel::Error, text)
    }

    pub fn css_class(&self) -> &'static str {
        match self.level {
            FlashLevel::Success => "success",
            FlashLevel::Info => "info",
            FlashLevel::Warning => "warning",
            FlashLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub id: i32,
    pub username: String,
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub user: Option<SessionUser>,
    pub messages: Vec<FlashMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let bytes: [u8; SESSION_ID_BYTES] = rand::thread_rng().r#gen();
        Self(hex::encode(bytes))
    }

    /// Accepts only ids shaped like the ones [`SessionId::generate`] hands out.
    fn parse(raw: &str) -> Option<Self> {
        let well_formed = raw.len() == SESSION_ID_BYTES * 2
            && raw.bytes().all(|byte| byte.is_ascii_hexdigit());
        well_formed.then(|| Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub struct SessionStore {
    sessions: Cache<String, Session>,
    cookie_name: String,
    ttl: Duration,
    secure_cookie: bool,
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        assert!(
            config.max_capacity >= 100,
            "Session store capacity threshold"
        );
        let ttl = config.ttl();
        let sessions = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_idle(ttl)
            .build();

        Self {
            sessions,
            cookie_name: config.cookie_name.clone(),
            ttl,
            secure_cookie: config.secure_cookie,
        }
    }

    async fn create_with(&self, session: Session) -> SessionId {
        let id = SessionId::generate();
        self.sessions.insert(id.0.clone(), session).await;
        id
    }

    pub async fn load(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(&id.0).await
    }

    async fn update<F>(&self, id: &SessionId, apply: F)
    where
        F: FnOnce(&mut Session),
    {
        let mut session = self.sessions.get(&id.0).await.unwrap_or_default();
        apply(&mut session);
        self.sessions.insert(id.0.clone(), session).await;
    }

    pub async fn flash(&self, id: &SessionId, message: FlashMessage) {
        self.update(id, |session| session.messages.push(message))
            .await;
    }

    /// Drains pending flash messages so each is displayed exactly once.
    pub async fn take_messages(&self, id: &SessionId) -> Vec<FlashMessage> {
        let Some(mut session) = self.sessions.get(&id.0).await else {
            return Vec::new();
        };
        if session.messages.is_empty() {
            return Vec::new();
        }
        let messages = std::mem::take(&mut session.messages);
        self.sessions.insert(id.0.clone(), session).await;
        messages
    }

    /// Replaces the session id with a fresh one bound to `user`, keeping any
    /// pending messages. The old id stops resolving immediately.
    pub async fn login(&self, previous: &SessionId, user: SessionUser) -> SessionId {
        let messages = self
            .sessions
            .remove(&previous.0)
            .await
            .map(|session| session.messages)
            .unwrap_or_default();
        self.create_with(Session {
            user: Some(user),
            messages,
        })
        .await
    }

    /// Ends the session and starts a new anonymous one carrying `farewell`.
    pub async fn logout(&self, previous: &SessionId, farewell: FlashMessage) -> SessionId {
        self.sessions.invalidate(&previous.0).await;
        self.create_with(Session {
            user: None,
            messages: vec![farewell],
        })
        .await
    }

    pub fn session_cookie(&self, id: &SessionId) -> HeaderValue {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.cookie_name,
            id.as_str(),
            self.ttl.as_secs()
        );
        if self.secure_cookie {
            cookie.push_str("; Secure");
        }
        // Built from a plain-token name and a hex id, always a valid header value
        HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static(""))
    }

    /// Number of stored sessions after pending evictions are applied.
    pub async fn active_sessions(&self) -> u64 {
        self.sessions.run_pending_tasks().await;
        self.sessions.entry_count()
    }
}

/// Extracts the raw value of the cookie called `name` from a map of headers.
fn extract_cookie<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|section| section.trim().split_once('='))
        .find_map(|(key, value)| (key == name).then_some(value))
}

/// Middleware resolving the visitor's session before the handler runs.
pub async fn attach(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let sessions = &state.sessions;
    let presented =
        extract_cookie(request.headers(), &sessions.cookie_name).and_then(SessionId::parse);

    let id = match presented {
        Some(id) if sessions.load(&id).await.is_some() => id,
        Some(_) => {
            debug!("Discarding unknown or expired session cookie");
            SessionId::generate()
        }
        None => SessionId::generate(),
    };

    request.extensions_mut().insert(id.clone());
    let mut response = next.run(request).await;

    // Handlers that rotate the session set their own cookie. Otherwise a
    // stored session gets its Max-Age renewed to follow the idle timeout.
    if !response.headers().contains_key(SET_COOKIE) && sessions.load(&id).await.is_some() {
        response
            .headers_mut()
            .append(SET_COOKIE, sessions.session_cookie(&id));
    }
    response
}

/// The current visitor: their session id and a snapshot of the session.
#[derive(Debug, Clone)]
pub struct Visitor {
    pub session_id: SessionId,
    pub session: Session,
}

impl Visitor {
    pub fn user(&self) -> Option<&SessionUser> {
        self.session.user.as_ref()
    }
}

impl FromRequestParts<AppState> for Visitor {
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let session_id = parts.extensions.get::<SessionId>().cloned().ok_or_else(|| {
            warn!("Session layer missing from the request pipeline");
            HttpError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Session unavailable".to_string(),
            )
        })?;

        let session = state.sessions.load(&session_id).await.unwrap_or_default();
        Ok(Self {
            session_id,
            session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(&SessionConfig::default())
    }

    #[test]
    fn generated_ids_parse_back() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), SESSION_ID_BYTES * 2);
        assert_eq!(SessionId::parse(id.as_str()), Some(id));
        assert!(SessionId::parse("not-a-session").is_none());
        assert!(SessionId::parse(&"z".repeat(SESSION_ID_BYTES * 2)).is_none());
    }

    #[test]
    fn cookie_lookup_finds_named_value() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; sid=abc123; lang=en"));
        assert_eq!(extract_cookie(&headers, "sid"), Some("abc123"));
        assert_eq!(extract_cookie(&headers, "lang"), Some("en"));
        assert_eq!(extract_cookie(&headers, "missing"), None);
    }

    #[test]
    fn session_cookie_carries_attributes() {
        let store = store();
        let id = SessionId::generate();
        let cookie = store.session_cookie(&id);
        let cookie = cookie.to_str().expect("ascii cookie");
        assert!(cookie.starts_with(&format!("sid={}", id.as_str())));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(!cookie.contains("Secure"));
    }

    #[tokio::test]
    async fn unsaved_ids_are_stored_only_once_written() {
        let store = store();
        let ids: Vec<SessionId> = (0..50).map(|_| SessionId::generate()).collect();
        for id in &ids {
            assert!(store.take_messages(id).await.is_empty());
            assert!(store.load(id).await.is_none());
        }
        assert_eq!(store.active_sessions().await, 0);

        store.flash(&ids[0], FlashMessage::warning("Please log in to vote.")).await;
        assert_eq!(store.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn flash_messages_are_drained_once() {
        let store = store();
        let id = SessionId::generate();
        store.flash(&id, FlashMessage::success("saved")).await;
        store.flash(&id, FlashMessage::error("but also broken")).await;

        let first = store.take_messages(&id).await;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].css_class(), "success");
        assert_eq!(first[1].text, "but also broken");
        assert!(store.take_messages(&id).await.is_empty());
    }

    #[tokio::test]
    async fn login_rotates_id_and_keeps_messages() {
        let store = store();
        let anonymous = SessionId::generate();
        store.flash(&anonymous, FlashMessage::info("hello")).await;

        let user = SessionUser {
            id: 7,
            username: "alice".to_string(),
        };
        let rotated = store.login(&anonymous, user.clone()).await;

        assert_ne!(rotated, anonymous);
        assert!(store.load(&anonymous).await.is_none());
        let session = store.load(&rotated).await.expect("rotated session stored");
        assert_eq!(session.user, Some(user));
        assert_eq!(session.messages, vec![FlashMessage::info("hello")]);
    }

    #[tokio::test]
    async fn logout_drops_user() {
        let store = store();
        let anonymous = SessionId::generate();
        let user = SessionUser {
            id: 1,
            username: "bob".to_string(),
        };
        let logged_in = store.login(&anonymous, user).await;
        let fresh = store
            .logout(&logged_in, FlashMessage::success("bye"))
            .await;

        assert!(store.load(&logged_in).await.is_none());
        let session = store.load(&fresh).await.expect("fresh session stored");
        assert!(session.user.is_none());
        assert_eq!(session.messages.len(), 1);
    }
}
