use std::sync::Arc;
use std::time::Instant;

use sea_orm::DatabaseConnection;

use crate::session::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub database: DatabaseConnection,
    pub sessions: Arc<SessionStore>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(database: DatabaseConnection, sessions: Arc<SessionStore>) -> Self {
        assert!(
            Arc::strong_count(&sessions) >= 1,
            "Session store must be shared"
        );
        Self {
            database,
            sessions,
            start_time: Instant::now(),
        }
    }
}
