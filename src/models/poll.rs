use serde::Deserialize;

// Form payloads

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreatePollForm {
    pub question: String,
    pub option_1: String,
    pub option_2: String,
    pub option_3: String,
    pub option_4: String,
}

impl CreatePollForm {
    pub fn options(&self) -> Vec<String> {
        vec![
            self.option_1.clone(),
            self.option_2.clone(),
            self.option_3.clone(),
            self.option_4.clone(),
        ]
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VoteForm {
    pub choice: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PageQuery {
    pub page: Option<String>,
}

impl PageQuery {
    /// Requested page number; anything unparseable means the first page.
    pub fn number(&self) -> u64 {
        self.page
            .as_deref()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(1)
    }
}

// Views handed to templates

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub code: String,
    pub question: String,
    pub created_at: String,
    pub is_active: bool,
    pub choice_count: u64,
    pub total_votes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub choice_id: i32,
    pub text: String,
    pub votes: u64,
    pub percentage: String,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollDetail {
    pub code: String,
    pub question: String,
    pub created_at: String,
    pub is_active: bool,
    pub is_owner: bool,
    pub total_votes: u64,
    pub rows: Vec<ResultRow>,
    pub has_voted: bool,
    pub can_vote: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPage {
    pub polls: Vec<PollSummary>,
    pub page: u64,
    pub num_pages: u64,
}

impl PollPage {
    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    pub fn has_next(&self) -> bool {
        self.page < self.num_pages
    }
}
