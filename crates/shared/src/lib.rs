//! Ledgerline shared infrastructure
//!
//! Database pool construction and embedded schema migrations used by every
//! binary in the workspace.

pub mod db;

pub use db::{create_migration_pool, create_pool, run_migrations, DbError};
