use askama::Template;

use crate::models::poll::{PollDetail, PollPage, PollSummary};
use crate::session::{FlashMessage, SessionUser};

/// Layout data every page shares: navigation state and pending messages.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub logged_in: bool,
    pub username: String,
    pub messages: Vec<FlashMessage>,
}

impl Page {
    pub fn new(user: Option<&SessionUser>, messages: Vec<FlashMessage>) -> Self {
        Self {
            logged_in: user.is_some(),
            username: user.map(|user| user.username.clone()).unwrap_or_default(),
            messages,
        }
    }

    pub fn with_message(mut self, message: FlashMessage) -> Self {
        self.messages.push(message);
        self
    }
}

#[derive(Template)]
#[template(path = "home.html")]
pub struct HomeTemplate {
    pub page: Page,
    pub polls: Vec<PollSummary>,
}

#[derive(Template)]
#[template(path = "accounts/login.html")]
pub struct LoginTemplate {
    pub page: Page,
    pub next: String,
}

#[derive(Template)]
#[template(path = "accounts/signup.html")]
pub struct SignupTemplate {
    pub page: Page,
}

#[derive(Template)]
#[template(path = "polls/create_poll.html")]
pub struct CreatePollTemplate {
    pub page: Page,
}

#[derive(Template)]
#[template(path = "polls/my_polls.html")]
pub struct MyPollsTemplate {
    pub page: Page,
    pub listing: PollPage,
}

#[derive(Template)]
#[template(path = "polls/view_poll.html")]
pub struct ViewPollTemplate {
    pub page: Page,
    pub poll: PollDetail,
}

#[derive(Template)]
#[template(path = "error.html")]
pub struct ErrorTemplate<'a> {
    pub status: u16,
    pub reason: &'a str,
    pub message: &'a str,
}
