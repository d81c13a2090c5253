//! This module aggregates the process-level plumbing used throughout the application.

/// Settings persistence backed by the application's SQLite database.
pub mod database;
/// Outbound notifications to users.
pub mod notifier;
