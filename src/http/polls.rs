use axum::extract::rejection::FormRejection;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use sea_orm::DbErr;
use tracing::{debug, info};

use crate::entities::poll;
use crate::models::poll::{CreatePollForm, PageQuery, PollDetail, ResultRow, VoteForm};
use crate::polls::{self as poll_service, PollError};
use crate::session::{FlashMessage, Visitor};
use crate::state::AppState;
use crate::templates::{CreatePollTemplate, HomeTemplate, MyPollsTemplate, ViewPollTemplate};
use crate::voting::{self, VoteError};

use super::{HttpError, login_redirect, page_for, render};

const HOME_POLL_LIMIT: u64 = 10;
const MY_POLLS_PER_PAGE: u64 = 10;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/create/", get(create_form).post(create_poll))
        .route("/my-polls/", get(my_polls))
        .route("/{code}/", get(view_poll))
        .route("/{code}/vote/", post(vote))
        .route("/{code}/toggle/", post(toggle_poll))
}

fn database_error(err: DbErr) -> HttpError {
    HttpError::internal(err.to_string())
}

fn detail_redirect(code: &str) -> Response {
    Redirect::to(&format!("/polls/{code}/")).into_response()
}

async fn load_poll(state: &AppState, code: &str) -> Result<poll::Model, HttpError> {
    poll_service::find_by_code(&state.database, code)
        .await
        .map_err(database_error)?
        .ok_or_else(|| HttpError::not_found(format!("Poll {} not found", code.trim())))
}

pub(super) async fn home(
    State(state): State<AppState>,
    visitor: Visitor,
) -> Result<Response, HttpError> {
    let polls = poll_service::recent_active(&state.database, HOME_POLL_LIMIT)
        .await
        .map_err(database_error)?;
    let page = page_for(&state, &visitor).await;
    render(&HomeTemplate { page, polls })
}

async fn create_form(
    State(state): State<AppState>,
    visitor: Visitor,
) -> Result<Response, HttpError> {
    if visitor.user().is_none() {
        return Ok(login_redirect("/polls/create/"));
    }
    let page = page_for(&state, &visitor).await;
    render(&CreatePollTemplate { page })
}

async fn create_poll(
    State(state): State<AppState>,
    visitor: Visitor,
    Form(form): Form<CreatePollForm>,
) -> Result<Response, HttpError> {
    let Some(user) = visitor.user() else {
        return Ok(login_redirect("/polls/create/"));
    };

    let created = match poll_service::validate_poll_input(&form.question, &form.options()) {
        Ok(draft) => poll_service::create_poll(&state.database, Some(user.id), &draft).await,
        Err(err) => Err(err),
    };

    match created {
        Ok(poll) => {
            state
                .sessions
                .flash(
                    &visitor.session_id,
                    FlashMessage::success(format!(
                        "Poll created successfully! Poll code: {}",
                        poll.code
                    )),
                )
                .await;
            Ok(detail_redirect(&poll.code))
        }
        Err(err) if err.is_user_error() => {
            debug!("Rejected poll from {}: {err}", user.username);
            let page = page_for(&state, &visitor)
                .await
                .with_message(FlashMessage::error(err.to_string()));
            render(&CreatePollTemplate { page })
        }
        Err(err) => Err(HttpError::internal(err.to_string())),
    }
}

async fn my_polls(
    State(state): State<AppState>,
    visitor: Visitor,
    Query(query): Query<PageQuery>,
) -> Result<Response, HttpError> {
    let Some(user) = visitor.user() else {
        return Ok(login_redirect("/polls/my-polls/"));
    };

    let listing = poll_service::owned_page(
        &state.database,
        user.id,
        query.number(),
        MY_POLLS_PER_PAGE,
    )
    .await
    .map_err(database_error)?;

    let page = page_for(&state, &visitor).await;
    render(&MyPollsTemplate { page, listing })
}

async fn view_poll(
    Path(code): Path<String>,
    State(state): State<AppState>,
    visitor: Visitor,
) -> Result<Response, HttpError> {
    let poll = load_poll(&state, &code).await?;
    let results = poll_service::load_results(&state.database, &poll)
        .await
        .map_err(database_error)?;

    let viewer_choice = match visitor.user() {
        Some(user) => voting::viewer_choice(&state.database, poll.id, user.id)
            .await
            .map_err(database_error)?,
        None => None,
    };
    let is_owner = visitor
        .user()
        .is_some_and(|user| poll.is_owned_by(user.id));

    let rows = results
        .choices
        .into_iter()
        .map(|tally| ResultRow {
            selected: viewer_choice == Some(tally.choice_id),
            choice_id: tally.choice_id,
            text: tally.text,
            votes: tally.votes,
            percentage: format!("{:.1}", tally.percentage),
        })
        .collect();

    let has_voted = viewer_choice.is_some();
    let detail = PollDetail {
        can_vote: visitor.user().is_some() && poll.is_active && !has_voted,
        created_at: poll.created_at.format("%b %d, %Y %H:%M").to_string(),
        code: poll.code,
        question: poll.question,
        is_active: poll.is_active,
        is_owner,
        total_votes: results.total_votes,
        rows,
        has_voted,
    };

    let page = page_for(&state, &visitor).await;
    render(&ViewPollTemplate { page, poll: detail })
}

async fn vote(
    Path(code): Path<String>,
    State(state): State<AppState>,
    visitor: Visitor,
    form: Result<Form<VoteForm>, FormRejection>,
) -> Result<Response, HttpError> {
    let Some(user) = visitor.user() else {
        state
            .sessions
            .flash(
                &visitor.session_id,
                FlashMessage::warning("Please log in to vote."),
            )
            .await;
        let next = poll_service::normalize_code(&code)
            .map(|code| format!("/polls/{code}/"))
            .unwrap_or_else(|| "/".to_string());
        return Ok(login_redirect(&next));
    };

    // An unreadable body counts as no selection
    let choice = form.ok().and_then(|Form(form)| form.choice);
    let poll = load_poll(&state, &code).await?;
    let outcome = voting::cast_vote(&state.database, &poll, user.id, choice.as_deref()).await;

    let message = match outcome {
        Ok(_) => FlashMessage::success("Your vote has been recorded!"),
        Err(err @ (VoteError::AlreadyVoted | VoteError::Closed)) => {
            debug!("Vote by {} on {} refused: {err}", user.username, poll.code);
            FlashMessage::warning(err.to_string())
        }
        Err(err @ (VoteError::MissingChoice | VoteError::InvalidChoice)) => {
            FlashMessage::error(err.to_string())
        }
        Err(VoteError::Database(err)) => return Err(database_error(err)),
    };

    state.sessions.flash(&visitor.session_id, message).await;
    Ok(detail_redirect(&poll.code))
}

async fn toggle_poll(
    Path(code): Path<String>,
    State(state): State<AppState>,
    visitor: Visitor,
) -> Result<Response, HttpError> {
    let Some(user) = visitor.user() else {
        let next = poll_service::normalize_code(&code)
            .map(|code| format!("/polls/{code}/"))
            .unwrap_or_else(|| "/".to_string());
        return Ok(login_redirect(&next));
    };

    let poll = load_poll(&state, &code).await?;
    let code = poll.code.clone();
    let message = match poll_service::toggle_active(&state.database, poll, user.id).await {
        Ok(updated) if updated.is_active => FlashMessage::success("Poll reopened."),
        Ok(_) => FlashMessage::info("Poll closed."),
        Err(PollError::NotOwner) => {
            info!("{} tried to toggle poll {code} they do not own", user.username);
            FlashMessage::error(PollError::NotOwner.to_string())
        }
        Err(err) => return Err(HttpError::internal(err.to_string())),
    };

    state.sessions.flash(&visitor.session_id, message).await;
    Ok(detail_redirect(&code))
}
