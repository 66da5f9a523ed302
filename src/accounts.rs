use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter,
};
use tracing::{debug, info};

use crate::database::is_unique_violation;
use crate::entities::user;

pub const MIN_PASSWORD_LEN: usize = 6;
pub const MAX_USERNAME_LEN: usize = 150;
pub const MAX_EMAIL_LEN: usize = 254;
const SALT_BYTES: usize = 16;

/// Verified against on unknown usernames so both failure paths cost one hash.
static DUMMY_HASH: Lazy<String> =
    Lazy::new(|| hash_password("quickpoll-no-such-user").unwrap_or_default());

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("All fields are required.")]
    MissingFields,
    #[error("Username must be at most 150 characters.")]
    UsernameTooLong,
    #[error("Email must be at most 254 characters.")]
    EmailTooLong,
    #[error("Password must be at least 6 characters long.")]
    PasswordTooShort,
    #[error("Passwords do not match.")]
    PasswordMismatch,
    #[error("Username already exists.")]
    UsernameTaken,
    #[error("Email already registered.")]
    EmailTaken,
    #[error("Invalid username or password.")]
    InvalidCredentials,
    #[error("password hashing failed: {0}")]
    Hashing(String),
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

impl AccountError {
    /// Errors worth showing to the visitor as-is.
    pub fn is_user_error(&self) -> bool {
        !matches!(self, Self::Hashing(_) | Self::Database(_))
    }
}

/// Signup input that passed every check not requiring the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
    pub password: String,
}

pub fn validate_signup(
    username: &str,
    email: &str,
    password: &str,
    confirmation: &str,
) -> Result<NewAccount, AccountError> {
    let username = username.trim();
    let email = email.trim();
    if username.is_empty() || email.is_empty() || password.is_empty() {
        return Err(AccountError::MissingFields);
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(AccountError::UsernameTooLong);
    }
    if email.chars().count() > MAX_EMAIL_LEN {
        return Err(AccountError::EmailTooLong);
    }
    if password != confirmation {
        return Err(AccountError::PasswordMismatch);
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AccountError::PasswordTooShort);
    }

    Ok(NewAccount {
        username: username.to_string(),
        email: email.to_string(),
        password: password.to_string(),
    })
}

#[cfg(not(test))]
fn hasher() -> Argon2<'static> {
    Argon2::default()
}

// Minimum cost keeps the suite fast; verification reads parameters from the hash.
#[cfg(test)]
fn hasher() -> Argon2<'static> {
    use argon2::{Algorithm, Params, Version};
    let params = Params::new(Params::MIN_M_COST, 1, 1, None).expect("valid argon2 params");
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
}

pub fn hash_password(password: &str) -> Result<String, AccountError> {
    let salt_bytes: [u8; SALT_BYTES] = rand::thread_rng().r#gen();
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|err| AccountError::Hashing(err.to_string()))?;
    let hash = hasher()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| AccountError::Hashing(err.to_string()))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => hasher()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

async fn hash_off_thread(password: String) -> Result<String, AccountError> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|err| AccountError::Hashing(err.to_string()))?
}

async fn username_taken(database: &DatabaseConnection, username: &str) -> Result<bool, DbErr> {
    let matches = user::Entity::find()
        .filter(user::Column::Username.eq(username))
        .count(database)
        .await?;
    Ok(matches > 0)
}

async fn email_taken(database: &DatabaseConnection, email: &str) -> Result<bool, DbErr> {
    let matches = user::Entity::find()
        .filter(user::Column::Email.eq(email))
        .count(database)
        .await?;
    Ok(matches > 0)
}

pub async fn register(
    database: &DatabaseConnection,
    account: NewAccount,
) -> Result<user::Model, AccountError> {
    if username_taken(database, &account.username).await? {
        return Err(AccountError::UsernameTaken);
    }
    if email_taken(database, &account.email).await? {
        return Err(AccountError::EmailTaken);
    }

    let password_hash = hash_off_thread(account.password).await?;
    let record = user::ActiveModel {
        id: NotSet,
        username: Set(account.username.clone()),
        email: Set(account.email.clone()),
        password_hash: Set(password_hash),
        created_at: Set(Utc::now().fixed_offset()),
    };

    match record.insert(database).await {
        Ok(created) => {
            info!("Account {} registered", created.username);
            Ok(created)
        }
        Err(err) if is_unique_violation(&err) => {
            debug!("Signup for {} lost a uniqueness race", account.username);
            if username_taken(database, &account.username).await? {
                Err(AccountError::UsernameTaken)
            } else {
                Err(AccountError::EmailTaken)
            }
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn authenticate(
    database: &DatabaseConnection,
    username: &str,
    password: &str,
) -> Result<user::Model, AccountError> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Err(AccountError::InvalidCredentials);
    }

    let account = user::Entity::find()
        .filter(user::Column::Username.eq(username))
        .one(database)
        .await?;

    let password = password.to_string();
    let stored = account.as_ref().map(|account| account.password_hash.clone());
    let verified = tokio::task::spawn_blocking(move || match stored {
        Some(hash) => verify_password(&password, &hash),
        None => {
            verify_password(&password, &DUMMY_HASH);
            false
        }
    })
    .await
    .map_err(|err| AccountError::Hashing(err.to_string()))?;

    match account {
        Some(account) if verified => Ok(account),
        Some(account) => {
            debug!("Rejected password for {}", account.username);
            Err(AccountError::InvalidCredentials)
        }
        None => Err(AccountError::InvalidCredentials),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory_database;

    fn account(username: &str, email: &str) -> NewAccount {
        validate_signup(username, email, "hunter22", "hunter22").expect("valid signup")
    }

    #[test]
    fn password_length_boundary() {
        assert!(matches!(
            validate_signup("alice", "a@example.com", "12345", "12345"),
            Err(AccountError::PasswordTooShort)
        ));
        assert!(validate_signup("alice", "a@example.com", "123456", "123456").is_ok());
    }

    #[test]
    fn mismatch_is_reported_before_password_length() {
        assert!(matches!(
            validate_signup("alice", "a@example.com", "12345", "54321"),
            Err(AccountError::PasswordMismatch)
        ));
        assert!(matches!(
            validate_signup("alice", "a@example.com", "12345", "12345"),
            Err(AccountError::PasswordTooShort)
        ));
    }

    #[test]
    fn unknown_users_are_checked_against_a_real_hash() {
        assert!(DUMMY_HASH.starts_with("$argon2id$"));
        assert!(!verify_password("anything", &DUMMY_HASH));
    }

    #[test]
    fn signup_requires_fields_and_matching_confirmation() {
        assert!(matches!(
            validate_signup(" ", "a@example.com", "123456", "123456"),
            Err(AccountError::MissingFields)
        ));
        assert!(matches!(
            validate_signup("alice", "", "123456", "123456"),
            Err(AccountError::MissingFields)
        ));
        assert!(matches!(
            validate_signup("alice", "a@example.com", "123456", "654321"),
            Err(AccountError::PasswordMismatch)
        ));
        let long_name = "a".repeat(MAX_USERNAME_LEN + 1);
        assert!(matches!(
            validate_signup(&long_name, "a@example.com", "123456", "123456"),
            Err(AccountError::UsernameTooLong)
        ));
    }

    #[test]
    fn hashes_verify_only_the_matching_password() {
        let hash = hash_password("correct horse").expect("hash succeeds");
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("battery staple", &hash));
        assert!(!verify_password("correct horse", "not-a-phc-string"));
    }

    #[tokio::test]
    async fn duplicate_username_rejected_even_with_new_email() {
        let database = memory_database().await;
        register(&database, account("alice", "alice@example.com"))
            .await
            .expect("first signup");

        let result = register(&database, account("alice", "other@example.com")).await;
        assert!(matches!(result, Err(AccountError::UsernameTaken)));
    }

    #[tokio::test]
    async fn duplicate_email_rejected_even_with_new_username() {
        let database = memory_database().await;
        register(&database, account("alice", "alice@example.com"))
            .await
            .expect("first signup");

        let result = register(&database, account("bob", "alice@example.com")).await;
        assert!(matches!(result, Err(AccountError::EmailTaken)));
    }

    #[tokio::test]
    async fn authenticate_checks_password() {
        let database = memory_database().await;
        let created = register(&database, account("carol", "carol@example.com"))
            .await
            .expect("signup");

        let found = authenticate(&database, "carol", "hunter22")
            .await
            .expect("valid credentials");
        assert_eq!(found.id, created.id);

        assert!(matches!(
            authenticate(&database, "carol", "wrong-pass").await,
            Err(AccountError::InvalidCredentials)
        ));
        assert!(matches!(
            authenticate(&database, "nobody", "hunter22").await,
            Err(AccountError::InvalidCredentials)
        ));
    }
}
