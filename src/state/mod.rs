//! Durable run state: the single source of truth shared by all workers.

mod models;
mod sqlite;

pub use models::*;
pub use sqlite::SqliteStore;
