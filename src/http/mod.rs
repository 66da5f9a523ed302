use std::time::Duration;

use askama::Template;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::session::{self, Visitor};
use crate::state::AppState;
use crate::templates::{ErrorTemplate, Page};

mod accounts;
mod polls;

pub fn router(state: AppState) -> Router {
    assert!(
        state.start_time.elapsed() < Duration::from_secs(86_400),
        "Application uptime exceeds 24 hours before router creation"
    );

    // Health probes stay outside the session layer
    let pages = Router::new()
        .route("/", get(polls::home))
        .nest("/accounts", accounts::router())
        .nest("/polls", polls::router())
        .layer(middleware::from_fn_with_state(state.clone(), session::attach));

    Router::new()
        .route("/health", get(health_live))
        .route("/health/ready", get(health_ready))
        .merge(pages)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_live(State(state): State<AppState>) -> Result<Json<HealthResponse>, HttpError> {
    let uptime = state.start_time.elapsed().as_secs();
    let response = HealthResponse {
        status: "live",
        uptime_seconds: uptime,
    };
    Ok(Json(response))
}

async fn health_ready(State(state): State<AppState>) -> Result<Json<ReadyResponse>, HttpError> {
    state
        .database
        .ping()
        .await
        .map_err(|err| HttpError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;

    let response = ReadyResponse {
        status: "ready",
        active_sessions: state.sessions.active_sessions().await,
    };
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    status: &'static str,
    active_sessions: u64,
}

/// Layout context for the visitor, consuming their pending flash messages.
async fn page_for(state: &AppState, visitor: &Visitor) -> Page {
    let messages = state.sessions.take_messages(&visitor.session_id).await;
    Page::new(visitor.user(), messages)
}

fn render<T: Template>(template: &T) -> Result<Response, HttpError> {
    let body = template
        .render()
        .map_err(|err| HttpError::internal(format!("Template rendering failed: {err}")))?;
    Ok(Html(body).into_response())
}

/// Sends the visitor to the login form, returning them to `next` afterwards.
fn login_redirect(next: &str) -> Response {
    let next = safe_next(Some(next));
    Redirect::to(&format!("/accounts/login?next={next}")).into_response()
}

/// Only same-site absolute paths made of URL-safe characters are honored;
/// anything else falls back to the home page.
fn safe_next(raw: Option<&str>) -> String {
    let Some(candidate) = raw.map(str::trim) else {
        return "/".to_string();
    };
    let plain_path = candidate.starts_with('/')
        && !candidate.starts_with("//")
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.'));
    if plain_path && !candidate.contains("..") {
        candidate.to_string()
    } else {
        "/".to_string()
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: String) -> Self {
        assert!(status != StatusCode::OK, "Error status cannot be 200");
        assert!(!message.is_empty(), "Error message cannot be empty");
        Self { status, message }
    }

    pub fn not_found(message: String) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: String) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        // Internal details stay in the log
        let public_message = if self.status.is_server_error() {
            error!("HTTP error: {}", self.message);
            "Something went wrong on our side. Please try again later."
        } else {
            info!("HTTP error: {}", self.message);
            self.message.as_str()
        };

        let page = ErrorTemplate {
            status: self.status.as_u16(),
            reason: self.status.canonical_reason().unwrap_or("Error"),
            message: public_message,
        };
        match page.render() {
            Ok(body) => (self.status, Html(body)).into_response(),
            Err(_) => (self.status, public_message.to_string()).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use axum::http::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
    use sea_orm::{DatabaseConnection, EntityTrait, PaginatorTrait};
    use tower::ServiceExt;

    use super::*;
    use crate::accounts::{NewAccount, register};
    use crate::config::SessionConfig;
    use crate::database::memory_database;
    use crate::entities::vote;
    use crate::polls::{choices_of, create_poll, validate_poll_input};
    use crate::session::{SessionId, SessionStore, SessionUser};

    async fn test_state() -> AppState {
        let database = memory_database().await;
        let sessions = Arc::new(SessionStore::new(&SessionConfig::default()));
        AppState::new(database, sessions)
    }

    async fn seed_poll(database: &DatabaseConnection) -> (String, i32, i32) {
        let owner = register(
            database,
            NewAccount {
                username: "owner".to_string(),
                email: "owner@example.com".to_string(),
                password: "owner-pass".to_string(),
            },
        )
        .await
        .expect("owner registered");
        let draft = validate_poll_input("Coffee or tea?", &["Coffee".to_string(), "Tea".to_string()])
            .expect("valid draft");
        let poll = create_poll(database, Some(owner.id), &draft)
            .await
            .expect("poll created");
        let first_choice = choices_of(database, poll.id).await.expect("choices")[0].id;
        (poll.code, first_choice, owner.id)
    }

    /// Logs `user` in directly through the store and returns the cookie header.
    async fn signed_in_cookie(state: &AppState, user: SessionUser) -> String {
        let anonymous = SessionId::generate();
        let id = state.sessions.login(&anonymous, user).await;
        format!("sid={}", id.as_str())
    }

    fn form_post(uri: &str, body: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::post(uri).header(CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, cookie);
        }
        builder.body(Body::from(body.to_string())).expect("request builds")
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body readable");
        String::from_utf8(bytes.to_vec()).expect("utf-8 body")
    }

    #[test]
    fn next_parameter_is_restricted_to_local_paths() {
        assert_eq!(safe_next(Some("/polls/ABCD1234/")), "/polls/ABCD1234/");
        assert_eq!(safe_next(Some("https://evil.example")), "/");
        assert_eq!(safe_next(Some("//evil.example")), "/");
        assert_eq!(safe_next(Some("/a/../b")), "/");
        assert_eq!(safe_next(Some("/x?y=1")), "/");
        assert_eq!(safe_next(None), "/");
    }

    #[tokio::test]
    async fn unauthenticated_vote_redirects_to_login_without_mutation() {
        let state = test_state().await;
        let (code, choice_id, _) = seed_poll(&state.database).await;

        let response = router(state.clone())
            .oneshot(form_post(
                &format!("/polls/{code}/vote/"),
                &format!("choice={choice_id}"),
                None,
            ))
            .await
            .expect("router responds");

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response.headers()[LOCATION].to_str().expect("ascii location");
        assert_eq!(location, format!("/accounts/login?next=/polls/{code}/"));
        assert!(response.headers().contains_key(SET_COOKIE));

        let votes = vote::Entity::find()
            .count(&state.database)
            .await
            .expect("count votes");
        assert_eq!(votes, 0);
    }

    #[tokio::test]
    async fn repeated_vote_reports_already_voted() {
        let state = test_state().await;
        let (code, choice_id, owner_id) = seed_poll(&state.database).await;
        let cookie = signed_in_cookie(
            &state,
            SessionUser {
                id: owner_id,
                username: "owner".to_string(),
            },
        )
        .await;

        for _ in 0..2 {
            let response = router(state.clone())
                .oneshot(form_post(
                    &format!("/polls/{code}/vote/"),
                    &format!("choice={choice_id}"),
                    Some(&cookie),
                ))
                .await
                .expect("router responds");
            assert_eq!(response.status(), StatusCode::SEE_OTHER);
        }

        let votes = vote::Entity::find()
            .count(&state.database)
            .await
            .expect("count votes");
        assert_eq!(votes, 1);

        let detail = router(state.clone())
            .oneshot(
                Request::get(format!("/polls/{code}/"))
                    .header(COOKIE, &cookie)
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("router responds");
        assert_eq!(detail.status(), StatusCode::OK);
        let html = body_text(detail).await;
        assert!(html.contains("Your vote has been recorded!"));
        assert!(html.contains("You have already voted on this poll."));
        assert!(html.contains("100.0%"));
    }

    #[tokio::test]
    async fn health_probes_leave_no_session_behind() {
        let state = test_state().await;
        for uri in ["/health", "/health/ready"] {
            for _ in 0..25 {
                let response = router(state.clone())
                    .oneshot(Request::get(uri).body(Body::empty()).expect("request builds"))
                    .await
                    .expect("router responds");
                assert_eq!(response.status(), StatusCode::OK);
                assert!(!response.headers().contains_key(SET_COOKIE));
            }
        }
        assert_eq!(state.sessions.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn anonymous_browsing_stores_nothing() {
        let state = test_state().await;
        let (code, _, _) = seed_poll(&state.database).await;
        for uri in ["/".to_string(), format!("/polls/{code}/"), "/accounts/login".to_string()] {
            let response = router(state.clone())
                .oneshot(Request::get(uri).body(Body::empty()).expect("request builds"))
                .await
                .expect("router responds");
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key(SET_COOKIE));
        }
        assert_eq!(state.sessions.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn active_session_cookie_is_renewed() {
        let state = test_state().await;
        let cookie = signed_in_cookie(
            &state,
            SessionUser {
                id: 1,
                username: "ivy".to_string(),
            },
        )
        .await;

        let response = router(state)
            .oneshot(
                Request::get("/")
                    .header(COOKIE, &cookie)
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("router responds");
        let renewed = response.headers()[SET_COOKIE].to_str().expect("ascii cookie");
        assert!(renewed.starts_with(&format!("{cookie};")));
        assert!(renewed.contains("Max-Age="));
    }

    #[tokio::test]
    async fn unauthenticated_vote_ignores_body_encoding() {
        let state = test_state().await;
        let (code, _, _) = seed_poll(&state.database).await;

        let response = router(state)
            .oneshot(
                Request::post(format!("/polls/{code}/vote/"))
                    .header(CONTENT_TYPE, "text/plain")
                    .body(Body::from("whatever"))
                    .expect("request builds"),
            )
            .await
            .expect("router responds");
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers()[LOCATION],
            format!("/accounts/login?next=/polls/{code}/").as_str()
        );
    }

    #[tokio::test]
    async fn unknown_poll_renders_not_found() {
        let state = test_state().await;
        let response = router(state)
            .oneshot(
                Request::get("/polls/NOPE0000/")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("router responds");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_poll_requires_login() {
        let state = test_state().await;
        let response = router(state)
            .oneshot(
                Request::get("/polls/create/")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("router responds");
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers()[LOCATION],
            "/accounts/login?next=/polls/create/"
        );
    }

    #[tokio::test]
    async fn signup_logs_the_new_user_in() {
        let state = test_state().await;
        let response = router(state.clone())
            .oneshot(form_post(
                "/accounts/signup",
                "username=dana&email=dana%40example.com&password=secret1&confirm_password=secret1",
                None,
            ))
            .await
            .expect("router responds");

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[LOCATION], "/");
        let cookie = response.headers()[SET_COOKIE]
            .to_str()
            .expect("ascii cookie")
            .split(';')
            .next()
            .expect("cookie pair")
            .to_string();

        let home = router(state)
            .oneshot(
                Request::get("/")
                    .header(COOKIE, cookie)
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("router responds");
        let html = body_text(home).await;
        assert!(html.contains("Account created successfully! Welcome, dana!"));
        assert!(html.contains("Signed in as dana"));
    }

    #[tokio::test]
    async fn login_follows_local_next_and_rejects_bad_password() {
        let state = test_state().await;
        register(
            &state.database,
            NewAccount {
                username: "frank".to_string(),
                email: "frank@example.com".to_string(),
                password: "frank-pass".to_string(),
            },
        )
        .await
        .expect("frank registered");

        let response = router(state.clone())
            .oneshot(form_post(
                "/accounts/login",
                "username=frank&password=frank-pass&next=%2Fpolls%2Fmy-polls%2F",
                None,
            ))
            .await
            .expect("router responds");
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[LOCATION], "/polls/my-polls/");
        assert!(response.headers().contains_key(SET_COOKIE));

        let rejected = router(state)
            .oneshot(form_post(
                "/accounts/login",
                "username=frank&password=wrong-pass",
                None,
            ))
            .await
            .expect("router responds");
        assert_eq!(rejected.status(), StatusCode::OK);
        let html = body_text(rejected).await;
        assert!(html.contains("Invalid username or password."));
    }

    #[tokio::test]
    async fn only_the_owner_can_close_a_poll() {
        let state = test_state().await;
        let (code, choice_id, owner_id) = seed_poll(&state.database).await;
        let stranger = register(
            &state.database,
            NewAccount {
                username: "mallory".to_string(),
                email: "mallory@example.com".to_string(),
                password: "mallory-pass".to_string(),
            },
        )
        .await
        .expect("stranger registered");

        let stranger_cookie = signed_in_cookie(
            &state,
            SessionUser {
                id: stranger.id,
                username: "mallory".to_string(),
            },
        )
        .await;
        router(state.clone())
            .oneshot(form_post(&format!("/polls/{code}/toggle/"), "", Some(&stranger_cookie)))
            .await
            .expect("router responds");
        let still_open = crate::polls::find_by_code(&state.database, &code)
            .await
            .expect("lookup succeeds")
            .expect("poll exists");
        assert!(still_open.is_active);

        let owner_cookie = signed_in_cookie(
            &state,
            SessionUser {
                id: owner_id,
                username: "owner".to_string(),
            },
        )
        .await;
        router(state.clone())
            .oneshot(form_post(&format!("/polls/{code}/toggle/"), "", Some(&owner_cookie)))
            .await
            .expect("router responds");

        router(state.clone())
            .oneshot(form_post(
                &format!("/polls/{code}/vote/"),
                &format!("choice={choice_id}"),
                Some(&stranger_cookie),
            ))
            .await
            .expect("router responds");
        let votes = vote::Entity::find()
            .count(&state.database)
            .await
            .expect("count votes");
        assert_eq!(votes, 0);
    }

    #[tokio::test]
    async fn short_password_signup_rerenders_form() {
        let state = test_state().await;
        let response = router(state)
            .oneshot(form_post(
                "/accounts/signup",
                "username=eve&email=eve%40example.com&password=12345&confirm_password=12345",
                None,
            ))
            .await
            .expect("router responds");

        assert_eq!(response.status(), StatusCode::OK);
        let html = body_text(response).await;
        assert!(html.contains("Password must be at least 6 characters long."));
    }
}
