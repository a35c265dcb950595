//! SQLite plumbing for the Pulse SDK core.
//!
//! Provides the pooled connection factory used by every durable component
//! (the persistent data queue in particular) and the embedded migration
//! runner that creates the on-disk schema. Higher layers never open raw
//! connections themselves; they take a [`DbPool`] and go through it.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, PoolError};
