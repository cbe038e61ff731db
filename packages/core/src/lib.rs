//! Arbor Core - Branching Conversation Engine
//!
//! This crate provides the conversation-tree data management and chat
//! orchestration for the Arbor branching chat system.
//!
//! # Architecture
//!
//! - **Flat tree storage**: Nodes live in a single table keyed by id with a
//!   `parent_id` pointer; all traversal goes through indexed queries.
//! - **libsql/Turso**: Embedded SQLite-compatible database.
//! - **Two-phase turns**: The user node is committed before the model provider
//!   is contacted; the assistant node is committed in an independent unit of
//!   work after the token stream completes.
//!
//! # Modules
//!
//! - [`models`] - Data structures (Node, Session, Topic, UserPreferences)
//! - [`db`] - Database layer with libsql integration and the `TreeStore` trait
//! - [`services`] - Business services (TreeService, ChatService, context assembly)

pub mod db;
pub mod models;
pub mod services;

// Re-export commonly used types
pub use models::*;
pub use services::*;
