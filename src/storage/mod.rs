//! Storage layer for automations, runs and contact activity.

mod models;
mod sqlite;

pub use models::*;
pub use sqlite::SqliteStorage;
