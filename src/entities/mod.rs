
pub mod choice;
pub mod poll;
pub mod user;
pub mod vote;
