pub mod account;
pub mod poll;
