//! Data layer module
//!
//! Persistence for the federation engine:
//! - Repository traits consumed by the protocol components
//! - SQLite implementation (sqlx)
//! - In-memory implementation for tests and embedding hosts

mod database;
mod memory;
mod models;
mod store;

pub use database::Database;
pub use memory::MemoryStore;
pub use models::*;
pub use store::{FederationStore, FollowStore, JobStore, LocalActorStore};
