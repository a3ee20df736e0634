/// Database abstraction layer
///
/// This module provides the problem ledger and notification registry on top
/// of a pooled LibSQL (SQLite) database.

pub mod migrations;
pub mod models;
pub mod repository;

pub use repository::{DatabaseImpl, ProblemStore};

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
