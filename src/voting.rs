use chrono::Utc;
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter,
};
use tracing::{debug, info};

use crate::database::is_unique_violation;
use crate::entities::{choice, poll, vote};

#[derive(Debug, thiserror::Error)]
pub enum VoteError {
    #[error("This poll is closed.")]
    Closed,
    #[error("You have already voted on this poll.")]
    AlreadyVoted,
    #[error("Please select an option.")]
    MissingChoice,
    #[error("Invalid choice.")]
    InvalidChoice,
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

pub async fn has_voted(
    database: &DatabaseConnection,
    poll_id: i32,
    user_id: i32,
) -> Result<bool, DbErr> {
    let votes = vote::Entity::find()
        .filter(vote::Column::PollId.eq(poll_id))
        .filter(vote::Column::UserId.eq(user_id))
        .count(database)
        .await?;
    assert!(votes <= 1, "More than one vote stored for a user on one poll");
    Ok(votes == 1)
}

/// The choice the user picked on this poll, if any.
pub async fn viewer_choice(
    database: &DatabaseConnection,
    poll_id: i32,
    user_id: i32,
) -> Result<Option<i32>, DbErr> {
    let vote = vote::Entity::find()
        .filter(vote::Column::PollId.eq(poll_id))
        .filter(vote::Column::UserId.eq(user_id))
        .one(database)
        .await?;
    Ok(vote.map(|vote| vote.choice_id))
}

/// Inserts the vote row. A unique index violation means another request
/// recorded this user's vote first and is reported as [`VoteError::AlreadyVoted`].
pub async fn record_vote(
    database: &DatabaseConnection,
    poll_id: i32,
    choice_id: i32,
    user_id: i32,
) -> Result<vote::Model, VoteError> {
    let ballot = vote::ActiveModel {
        id: NotSet,
        user_id: Set(user_id),
        choice_id: Set(choice_id),
        poll_id: Set(poll_id),
        voted_at: Set(Utc::now().fixed_offset()),
    };

    match ballot.insert(database).await {
        Ok(vote) => Ok(vote),
        Err(err) if is_unique_violation(&err) => {
            debug!("Duplicate vote by user {user_id} on poll {poll_id} rejected by constraint");
            Err(VoteError::AlreadyVoted)
        }
        Err(err) => Err(err.into()),
    }
}

/// Casts `user_id`'s vote on `poll`. The existence check handles the common
/// case; [`record_vote`] closes the race with concurrent submissions.
pub async fn cast_vote(
    database: &DatabaseConnection,
    poll: &poll::Model,
    user_id: i32,
    raw_choice: Option<&str>,
) -> Result<vote::Model, VoteError> {
    if !poll.is_active {
        return Err(VoteError::Closed);
    }

    if has_voted(database, poll.id, user_id).await? {
        return Err(VoteError::AlreadyVoted);
    }

    let raw_choice = raw_choice
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(VoteError::MissingChoice)?;
    let choice_id: i32 = raw_choice.parse().map_err(|_| VoteError::InvalidChoice)?;

    let choice = choice::Entity::find_by_id(choice_id)
        .filter(choice::Column::PollId.eq(poll.id))
        .one(database)
        .await?
        .ok_or(VoteError::InvalidChoice)?;

    let vote = record_vote(database, poll.id, choice.id, user_id).await?;
    info!("Vote recorded on poll {} for choice {}", poll.code, choice.id);
    Ok(vote)
}
