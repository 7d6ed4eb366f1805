//! # palaver-store
//!
//! Durable storage for the Palaver delivery core, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle with typed CRUD
//! helpers (one module per domain model) plus the async [`Repository`]
//! collaborator trait the delivery core consumes.  [`SqliteRepository`]
//! bridges the two; [`MemoryRepository`] backs tests and ad-hoc tooling.

pub mod database;
pub mod groups;
pub mod memory;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod repository;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use memory::MemoryRepository;
pub use repository::{Repository, SqliteRepository};
