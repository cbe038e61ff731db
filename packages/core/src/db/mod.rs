//! Database Layer
//!
//! libsql/Turso persistence for the conversation tree: connection and schema
//! management in [`database`], the storage trait and its Turso
//! implementation in [`tree_store`], and database error types in [`error`].

pub mod database;
pub mod error;
pub mod tree_store;

pub use database::{
    DatabaseService, DbCreateNodeParams, DbCreateSessionParams, DbUpdateNodeParams,
    DbUpsertPreferencesParams,
};
pub use error::DatabaseError;
pub use tree_store::{TreeStore, TursoTreeStore};
