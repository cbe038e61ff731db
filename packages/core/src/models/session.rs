//! Session and Topic Models
//!
//! A `Topic` is a top-level grouping owned by a user; a `Session` is one
//! named conversation inside a topic. Deleting either cascades downward
//! (topic -> sessions -> nodes) at the storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level grouping for related sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Topic {
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Sparse update for a topic.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopicUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// A named conversation scoped to a topic.
///
/// `root_node_id` caches the first root node created in the session and is
/// set at most once. `default_model` overrides the system default for turns
/// in this session unless a per-request model is supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub topic_id: String,
    pub name: String,
    pub description: Option<String>,
    pub default_model: Option<String>,
    pub root_node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        topic_id: impl Into<String>,
        name: impl Into<String>,
        description: Option<String>,
        default_model: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            topic_id: topic_id.into(),
            name: name.into(),
            description,
            default_model,
            root_node_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Sparse update for a session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub default_model: Option<String>,
}
