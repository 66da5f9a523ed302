use axum::extract::{Query, State};
use axum::http::header::SET_COOKIE;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use tracing::{debug, info};

use crate::accounts::{self as account_service, AccountError};
use crate::models::account::{LoginForm, NextQuery, SignupForm};
use crate::session::{FlashMessage, SessionId, SessionUser, Visitor};
use crate::state::AppState;
use crate::templates::{LoginTemplate, SignupTemplate};

use super::{HttpError, login_redirect, page_for, render, safe_next};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", get(login_form).post(login))
        .route("/signup", get(signup_form).post(signup))
        .route("/logout", post(logout))
}

/// Redirect that also hands the browser its rotated session cookie.
fn redirect_with_session(state: &AppState, session_id: &SessionId, target: &str) -> Response {
    let cookie = state.sessions.session_cookie(session_id);
    ([(SET_COOKIE, cookie)], Redirect::to(target)).into_response()
}

async fn login_form(
    State(state): State<AppState>,
    visitor: Visitor,
    Query(query): Query<NextQuery>,
) -> Result<Response, HttpError> {
    if visitor.user().is_some() {
        return Ok(Redirect::to("/").into_response());
    }
    let page = page_for(&state, &visitor).await;
    let next = safe_next(query.next.as_deref());
    render(&LoginTemplate { page, next })
}

async fn login(
    State(state): State<AppState>,
    visitor: Visitor,
    Query(query): Query<NextQuery>,
    Form(form): Form<LoginForm>,
) -> Result<Response, HttpError> {
    if visitor.user().is_some() {
        return Ok(Redirect::to("/").into_response());
    }
    let next = safe_next(form.next.as_deref().or(query.next.as_deref()));

    match account_service::authenticate(&state.database, &form.username, &form.password).await {
        Ok(account) => {
            let user = SessionUser {
                id: account.id,
                username: account.username.clone(),
            };
            let session_id = state.sessions.login(&visitor.session_id, user).await;
            state
                .sessions
                .flash(
                    &session_id,
                    FlashMessage::success(format!("Welcome back, {}!", account.username)),
                )
                .await;
            info!("{} logged in", account.username);
            Ok(redirect_with_session(&state, &session_id, &next))
        }
        Err(err) if err.is_user_error() => {
            let page = page_for(&state, &visitor)
                .await
                .with_message(FlashMessage::error(err.to_string()));
            render(&LoginTemplate { page, next })
        }
        Err(err) => Err(HttpError::internal(err.to_string())),
    }
}

async fn signup_form(
    State(state): State<AppState>,
    visitor: Visitor,
) -> Result<Response, HttpError> {
    if visitor.user().is_some() {
        return Ok(Redirect::to("/").into_response());
    }
    let page = page_for(&state, &visitor).await;
    render(&SignupTemplate { page })
}

async fn signup(
    State(state): State<AppState>,
    visitor: Visitor,
    Form(form): Form<SignupForm>,
) -> Result<Response, HttpError> {
    if visitor.user().is_some() {
        return Ok(Redirect::to("/").into_response());
    }

    let registered = match account_service::validate_signup(
        &form.username,
        &form.email,
        &form.password,
        &form.confirm_password,
    ) {
        Ok(account) => account_service::register(&state.database, account).await,
        Err(err) => Err(err),
    };

    match registered {
        Ok(account) => {
            let user = SessionUser {
                id: account.id,
                username: account.username.clone(),
            };
            let session_id = state.sessions.login(&visitor.session_id, user).await;
            state
                .sessions
                .flash(
                    &session_id,
                    FlashMessage::success(format!(
                        "Account created successfully! Welcome, {}!",
                        account.username
                    )),
                )
                .await;
            Ok(redirect_with_session(&state, &session_id, "/"))
        }
        Err(err @ (AccountError::Hashing(_) | AccountError::Database(_))) => {
            Err(HttpError::internal(err.to_string()))
        }
        Err(err) => {
            debug!("Signup rejected: {err}");
            let page = page_for(&state, &visitor)
                .await
                .with_message(FlashMessage::error(err.to_string()));
            render(&SignupTemplate { page })
        }
    }
}

async fn logout(State(state): State<AppState>, visitor: Visitor) -> Response {
    let Some(user) = visitor.user() else {
        return login_redirect("/");
    };
    info!("{} logged out", user.username);
    let session_id = state
        .sessions
        .logout(
            &visitor.session_id,
            FlashMessage::success("You have been logged out successfully."),
        )
        .await;
    redirect_with_session(&state, &session_id, "/")
}
