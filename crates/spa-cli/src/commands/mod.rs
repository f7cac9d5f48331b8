//! CLI subcommand implementations.

pub mod credential;
pub mod mint;
pub mod request;
