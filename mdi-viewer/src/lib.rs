//! Command-line viewer client for an MDI slice server.

pub mod commands;
pub mod config;
