//! User Preferences Model
//!
//! Optional per-user context injected into the system preamble during
//! context assembly. Owned 1:1 by a user and created lazily on first write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    pub id: String,
    pub user_id: String,
    pub background: Option<String>,
    pub interests: Option<String>,
    pub custom_instructions: Option<String>,
    pub preferred_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserPreferences {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            background: None,
            interests: None,
            custom_instructions: None,
            preferred_model: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether any field would contribute to the system preamble.
    pub fn is_empty(&self) -> bool {
        self.background.is_none()
            && self.interests.is_none()
            && self.custom_instructions.is_none()
    }
}

/// Sparse update for preferences; only provided fields change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreferencesUpdate {
    pub background: Option<String>,
    pub interests: Option<String>,
    pub custom_instructions: Option<String>,
    pub preferred_model: Option<String>,
}
