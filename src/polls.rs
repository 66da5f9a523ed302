use std::collections::HashMap;

use chrono::Utc;
use rand::seq::SliceRandom;
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use tracing::{info, warn};

use crate::database::is_unique_violation;
use crate::entities::{choice, poll, vote};
use crate::models::poll::{PollPage, PollSummary};

pub const POLL_CODE_LEN: usize = 8;
pub const POLL_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const MIN_CHOICES: usize = 2;
pub const MAX_CHOICES: usize = 4;
pub const MAX_TEXT_LEN: usize = 200;
pub const MAX_CODE_ATTEMPTS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Please provide a question for your poll.")]
    MissingQuestion,
    #[error("Please provide at least 2 options.")]
    TooFewChoices,
    #[error("Maximum 4 options allowed.")]
    TooManyChoices,
    #[error("Question must be at most 200 characters.")]
    QuestionTooLong,
    #[error("Options must be at most 200 characters.")]
    ChoiceTooLong,
    #[error("Only the poll owner can change its status.")]
    NotOwner,
    #[error("no free poll code found after {attempts} attempts")]
    CodeSpaceExhausted { attempts: usize },
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

impl PollError {
    /// Errors caused by the submitted form rather than the system.
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            Self::CodeSpaceExhausted { .. } | Self::Database(_)
        )
    }
}

/// A poll that passed validation and is ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollDraft {
    pub question: String,
    pub choices: Vec<String>,
}

pub fn validate_poll_input(question: &str, options: &[String]) -> Result<PollDraft, PollError> {
    let question = question.trim();
    if question.is_empty() {
        return Err(PollError::MissingQuestion);
    }

    let choices: Vec<String> = options
        .iter()
        .map(|option| option.trim())
        .filter(|option| !option.is_empty())
        .map(str::to_string)
        .collect();

    if choices.len() < MIN_CHOICES {
        return Err(PollError::TooFewChoices);
    }
    if choices.len() > MAX_CHOICES {
        return Err(PollError::TooManyChoices);
    }
    if question.chars().count() > MAX_TEXT_LEN {
        return Err(PollError::QuestionTooLong);
    }
    if choices
        .iter()
        .any(|choice| choice.chars().count() > MAX_TEXT_LEN)
    {
        return Err(PollError::ChoiceTooLong);
    }

    Ok(PollDraft {
        question: question.to_string(),
        choices,
    })
}

pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..POLL_CODE_LEN)
        .filter_map(|_| POLL_CODE_ALPHABET.choose(&mut rng))
        .map(|&byte| char::from(byte))
        .collect()
}

/// Canonical form of a code taken from a URL, or `None` if it cannot name a poll.
pub fn normalize_code(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    let well_formed = code.len() == POLL_CODE_LEN
        && code.bytes().all(|byte| POLL_CODE_ALPHABET.contains(&byte));
    well_formed.then_some(code)
}

async fn code_in_use(database: &DatabaseConnection, code: &str) -> Result<bool, DbErr> {
    let matches = poll::Entity::find()
        .filter(poll::Column::Code.eq(code))
        .count(database)
        .await?;
    Ok(matches > 0)
}

/// Samples codes until one is unused. Best effort only: the unique index on
/// `polls.code` is what actually rules out duplicates.
async fn unused_code(database: &DatabaseConnection) -> Result<String, PollError> {
    for _ in 0..MAX_CODE_ATTEMPTS {
        let code = generate_code();
        assert_eq!(code.len(), POLL_CODE_LEN, "Generated code has wrong length");
        if !code_in_use(database, &code).await? {
            return Ok(code);
        }
    }
    Err(PollError::CodeSpaceExhausted {
        attempts: MAX_CODE_ATTEMPTS,
    })
}

/// Persists the poll and its choices in one transaction.
pub async fn create_poll(
    database: &DatabaseConnection,
    owner_id: Option<i32>,
    draft: &PollDraft,
) -> Result<poll::Model, PollError> {
    assert!(
        (MIN_CHOICES..=MAX_CHOICES).contains(&draft.choices.len()),
        "Draft must carry a validated number of choices"
    );

    for attempt in 1..=MAX_CODE_ATTEMPTS {
        let code = unused_code(database).await?;
        let txn = database.begin().await?;

        let inserted = poll::ActiveModel {
            id: NotSet,
            question: Set(draft.question.clone()),
            owner_id: Set(owner_id),
            created_at: Set(Utc::now().fixed_offset()),
            code: Set(code.clone()),
            is_active: Set(true),
        }
        .insert(&txn)
        .await;

        let poll = match inserted {
            Ok(poll) => poll,
            Err(err) if is_unique_violation(&err) => {
                txn.rollback().await?;
                warn!("Poll code {code} taken concurrently (attempt {attempt})");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let choices = draft.choices.iter().map(|text| choice::ActiveModel {
            id: NotSet,
            poll_id: Set(poll.id),
            text: Set(text.clone()),
        });
        choice::Entity::insert_many(choices).exec(&txn).await?;
        txn.commit().await?;

        info!(
            "Poll {} created with {} choices",
            poll.code,
            draft.choices.len()
        );
        return Ok(poll);
    }

    Err(PollError::CodeSpaceExhausted {
        attempts: MAX_CODE_ATTEMPTS,
    })
}

pub async fn find_by_code(
    database: &DatabaseConnection,
    raw_code: &str,
) -> Result<Option<poll::Model>, DbErr> {
    let Some(code) = normalize_code(raw_code) else {
        return Ok(None);
    };
    poll::Entity::find()
        .filter(poll::Column::Code.eq(code))
        .one(database)
        .await
}

pub async fn choices_of(
    database: &DatabaseConnection,
    poll_id: i32,
) -> Result<Vec<choice::Model>, DbErr> {
    choice::Entity::find()
        .filter(choice::Column::PollId.eq(poll_id))
        .order_by_asc(choice::Column::Id)
        .all(database)
        .await
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceTally {
    pub choice_id: i32,
    pub text: String,
    pub votes: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollResults {
    pub total_votes: u64,
    pub choices: Vec<ChoiceTally>,
}

/// Share of `total` in percent, rounded to one decimal place. Zero when no
/// votes were cast.
pub fn percentage(votes: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    assert!(votes <= total, "Choice votes cannot exceed the poll total");
    let raw = votes as f64 / total as f64 * 100.0;
    (raw * 10.0).round() / 10.0
}

pub fn tally(choices: Vec<choice::Model>, counts: &HashMap<i32, u64>) -> PollResults {
    let total_votes = choices
        .iter()
        .map(|choice| counts.get(&choice.id).copied().unwrap_or(0))
        .sum();

    let choices = choices
        .into_iter()
        .map(|choice| {
            let votes = counts.get(&choice.id).copied().unwrap_or(0);
            ChoiceTally {
                choice_id: choice.id,
                text: choice.text,
                votes,
                percentage: percentage(votes, total_votes),
            }
        })
        .collect();

    PollResults {
        total_votes,
        choices,
    }
}

pub async fn load_results(
    database: &DatabaseConnection,
    poll: &poll::Model,
) -> Result<PollResults, DbErr> {
    let choices = choices_of(database, poll.id).await?;

    let counts = vote::Entity::find()
        .select_only()
        .column(vote::Column::ChoiceId)
        .column_as(vote::Column::Id.count(), "votes")
        .filter(vote::Column::PollId.eq(poll.id))
        .group_by(vote::Column::ChoiceId)
        .into_tuple::<(i32, i64)>()
        .all(database)
        .await?
        .into_iter()
        .map(|(choice_id, votes)| (choice_id, votes.max(0) as u64))
        .collect::<HashMap<_, _>>();

    Ok(tally(choices, &counts))
}

async fn totals_per_poll<E>(
    database: &DatabaseConnection,
    poll_ids: &[i32],
    poll_column: E::Column,
    id_column: E::Column,
) -> Result<HashMap<i32, u64>, DbErr>
where
    E: EntityTrait,
{
    let rows = E::find()
        .select_only()
        .column(poll_column)
        .column_as(id_column.count(), "total")
        .filter(poll_column.is_in(poll_ids.iter().copied()))
        .group_by(poll_column)
        .into_tuple::<(i32, i64)>()
        .all(database)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(poll_id, total)| (poll_id, total.max(0) as u64))
        .collect())
}

/// Attaches choice and vote totals to a batch of polls, two queries per batch.
pub async fn summarize(
    database: &DatabaseConnection,
    polls: Vec<poll::Model>,
) -> Result<Vec<PollSummary>, DbErr> {
    if polls.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i32> = polls.iter().map(|poll| poll.id).collect();
    let choice_counts = totals_per_poll::<choice::Entity>(
        database,
        &ids,
        choice::Column::PollId,
        choice::Column::Id,
    )
    .await?;
    let vote_counts =
        totals_per_poll::<vote::Entity>(database, &ids, vote::Column::PollId, vote::Column::Id)
            .await?;

    Ok(polls
        .into_iter()
        .map(|poll| PollSummary {
            choice_count: choice_counts.get(&poll.id).copied().unwrap_or(0),
            total_votes: vote_counts.get(&poll.id).copied().unwrap_or(0),
            created_at: poll.created_at.format("%b %d, %Y %H:%M").to_string(),
            code: poll.code,
            question: poll.question,
            is_active: poll.is_active,
        })
        .collect())
}

pub async fn recent_active(
    database: &DatabaseConnection,
    limit: u64,
) -> Result<Vec<PollSummary>, DbErr> {
    assert!(limit > 0, "Listing limit must be positive");
    let polls = poll::Entity::find()
        .filter(poll::Column::IsActive.eq(true))
        .order_by_desc(poll::Column::CreatedAt)
        .order_by_desc(poll::Column::Id)
        .limit(limit)
        .all(database)
        .await?;
    summarize(database, polls).await
}

/// One page of the owner's polls, newest first. Pages are 1-based and
/// out-of-range requests clamp to the nearest existing page.
pub async fn owned_page(
    database: &DatabaseConnection,
    owner_id: i32,
    requested_page: u64,
    per_page: u64,
) -> Result<PollPage, DbErr> {
    assert!(per_page > 0, "Page size must be positive");

    let paginator = poll::Entity::find()
        .filter(poll::Column::OwnerId.eq(owner_id))
        .order_by_desc(poll::Column::CreatedAt)
        .order_by_desc(poll::Column::Id)
        .paginate(database, per_page);

    let num_pages = paginator.num_pages().await?.max(1);
    let page = requested_page.clamp(1, num_pages);
    let polls = paginator.fetch_page(page - 1).await?;

    Ok(PollPage {
        polls: summarize(database, polls).await?,
        page,
        num_pages,
    })
}

/// Flips the active flag. Only the owner may do this.
pub async fn toggle_active(
    database: &DatabaseConnection,
    poll: poll::Model,
    user_id: i32,
) -> Result<poll::Model, PollError> {
    if !poll.is_owned_by(user_id) {
        return Err(PollError::NotOwner);
    }
    let next_state = !poll.is_active;
    let mut active: poll::ActiveModel = poll.into();
    active.is_active = Set(next_state);
    let updated = active.update(database).await?;
    info!(
        "Poll {} is now {}",
        updated.code,
        if updated.is_active { "open" } else { "closed" }
    );
    Ok(updated)
}
