//! Data Models
//!
//! Core data structures for the conversation tree:
//!
//! - [`Node`] - one turn, note, or side-chat message in the tree
//! - [`Session`] / [`Topic`] - conversation grouping
//! - [`UserPreferences`] - per-user context injected into model calls

pub mod node;
pub mod preferences;
pub mod session;

pub use node::{GenerationConfig, Node, NodeKind, NodeStatus, NodeUpdate, SideChatAnchor};
pub use preferences::{PreferencesUpdate, UserPreferences};
pub use session::{Session, SessionUpdate, Topic, TopicUpdate};
