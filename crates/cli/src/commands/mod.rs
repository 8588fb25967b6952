//! CLI subcommands

pub mod browsers;
pub mod health;
