//! Node Data Structures
//!
//! The conversation tree is stored flat: every node carries a `parent_id`
//! pointer and all traversal happens through indexed queries, never through
//! an in-memory object graph.
//!
//! # Branching Model
//!
//! Children of a parent are partitioned by kind. Among children that
//! participate in branching (`user_message` / `assistant_message`), exactly
//! one sibling per `(parent_id, kind)` group is on the selected path at any
//! time. Side-chat nodes and notes never compete for path selection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a node in the conversation tree.
///
/// The kind decides which invariants apply: only `UserMessage` and
/// `AssistantMessage` participate in the single-selection branching
/// invariant; the side-chat kinds are grouped into threads by their anchor
/// text instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    UserMessage,
    AssistantMessage,
    UserNote,
    BranchSummary,
    System,
    SideChatUser,
    SideChatAssistant,
}

impl NodeKind {
    /// Stable string form used in the database and over the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::UserMessage => "user_message",
            NodeKind::AssistantMessage => "assistant_message",
            NodeKind::UserNote => "user_note",
            NodeKind::BranchSummary => "branch_summary",
            NodeKind::System => "system",
            NodeKind::SideChatUser => "side_chat_user",
            NodeKind::SideChatAssistant => "side_chat_assistant",
        }
    }

    /// Parse the database string form. Returns `None` for unknown kinds.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_message" => Some(NodeKind::UserMessage),
            "assistant_message" => Some(NodeKind::AssistantMessage),
            "user_note" => Some(NodeKind::UserNote),
            "branch_summary" => Some(NodeKind::BranchSummary),
            "system" => Some(NodeKind::System),
            "side_chat_user" => Some(NodeKind::SideChatUser),
            "side_chat_assistant" => Some(NodeKind::SideChatAssistant),
            _ => None,
        }
    }

    /// Whether nodes of this kind compete for main-path selection.
    pub fn participates_in_branching(&self) -> bool {
        matches!(self, NodeKind::UserMessage | NodeKind::AssistantMessage)
    }

    /// Whether this is one of the two side-chat kinds.
    pub fn is_side_chat(&self) -> bool {
        matches!(self, NodeKind::SideChatUser | NodeKind::SideChatAssistant)
    }
}

/// Lifecycle status of a node.
///
/// `Collapsed` pairs with a non-null `collapsed_summary` which substitutes
/// for the node's full content during context assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Collapsed,
    Abandoned,
    Merged,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Collapsed => "collapsed",
            NodeStatus::Abandoned => "abandoned",
            NodeStatus::Merged => "merged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(NodeStatus::Active),
            "collapsed" => Some(NodeStatus::Collapsed),
            "abandoned" => Some(NodeStatus::Abandoned),
            "merged" => Some(NodeStatus::Merged),
            _ => None,
        }
    }
}

/// Metadata recording how an assistant node was generated.
///
/// Always `None` for user-authored nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: i64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

/// The highlighted span a side-chat thread is anchored to.
///
/// `selected_text = None` marks a general side discussion. Thread identity
/// is decided by literal text equality on `selected_text` alone; the
/// start/end offsets are kept for highlighting and never enter the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideChatAnchor {
    pub selected_text: Option<String>,
    pub selection_start: Option<i64>,
    pub selection_end: Option<i64>,
}

/// One turn, note, or side-chat message in the conversation tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier (UUID v4), immutable.
    pub id: String,

    /// Owning session, immutable after creation.
    pub session_id: String,

    /// Back-reference to another node in the same session; `None` marks a root.
    pub parent_id: Option<String>,

    /// Text body. Immutable once persisted, except user notes and explicit
    /// edits; status/branch metadata updates never touch it.
    pub content: String,

    pub kind: NodeKind,

    pub status: NodeStatus,

    /// Optional human label for a branch, independent of tree structure.
    pub branch_name: Option<String>,

    /// Substitutes for `content` in context assembly while `status` is
    /// `Collapsed`.
    pub collapsed_summary: Option<String>,

    /// Provider/model/temperature used to produce an assistant node.
    pub generation_config: Option<GenerationConfig>,

    /// Recorded token usage. Stored, never computed.
    pub token_count: Option<i64>,

    /// Position among same-parent, same-kind peers at creation time.
    /// Never renumbered on deletion.
    pub sibling_index: i64,

    /// True for exactly one sibling per `(parent_id, kind)` group among
    /// branching kinds. Always false for side-chat kinds and notes.
    pub is_selected_path: bool,

    /// Anchor text for side-chat nodes (`None` = general side discussion).
    pub selected_text: Option<String>,
    pub selection_start: Option<i64>,
    pub selection_end: Option<i64>,

    /// Creation timestamp, immutable.
    pub created_at: DateTime<Utc>,

    /// Bumped on every mutation.
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Create a node of the given kind with an auto-generated UUID.
    ///
    /// `sibling_index` and `is_selected_path` get their provisional values
    /// here; the store finalizes both atomically at insert time.
    pub fn new(
        kind: NodeKind,
        session_id: impl Into<String>,
        parent_id: Option<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            parent_id,
            content: content.into(),
            kind,
            status: NodeStatus::Active,
            branch_name: None,
            collapsed_summary: None,
            generation_config: None,
            token_count: None,
            sibling_index: 0,
            is_selected_path: kind.participates_in_branching(),
            selected_text: None,
            selection_start: None,
            selection_end: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a user message node.
    pub fn user_message(
        session_id: impl Into<String>,
        parent_id: Option<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(NodeKind::UserMessage, session_id, parent_id, content)
    }

    /// Create an assistant message node with its generation metadata.
    pub fn assistant_message(
        session_id: impl Into<String>,
        parent_id: Option<String>,
        content: impl Into<String>,
        generation_config: GenerationConfig,
    ) -> Self {
        let mut node = Self::new(NodeKind::AssistantMessage, session_id, parent_id, content);
        node.generation_config = Some(generation_config);
        node
    }

    /// Create a side-chat node of the given kind, anchored to `anchor`.
    pub fn side_chat(
        kind: NodeKind,
        session_id: impl Into<String>,
        parent_id: impl Into<String>,
        content: impl Into<String>,
        anchor: SideChatAnchor,
    ) -> Self {
        debug_assert!(kind.is_side_chat());
        let mut node = Self::new(kind, session_id, Some(parent_id.into()), content);
        node.selected_text = anchor.selected_text;
        node.selection_start = anchor.selection_start;
        node.selection_end = anchor.selection_end;
        node
    }

    /// The anchor of a side-chat node (empty anchor for main-path nodes).
    pub fn anchor(&self) -> SideChatAnchor {
        SideChatAnchor {
            selected_text: self.selected_text.clone(),
            selection_start: self.selection_start,
            selection_end: self.selection_end,
        }
    }
}

/// Sparse update for a node: only provided fields change.
///
/// `content` is honored for user notes and explicit edits only; the service
/// layer rejects content changes on other kinds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeUpdate {
    pub status: Option<NodeStatus>,
    pub branch_name: Option<String>,
    pub collapsed_summary: Option<String>,
    pub content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        for kind in [
            NodeKind::UserMessage,
            NodeKind::AssistantMessage,
            NodeKind::UserNote,
            NodeKind::BranchSummary,
            NodeKind::System,
            NodeKind::SideChatUser,
            NodeKind::SideChatAssistant,
        ] {
            assert_eq!(NodeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(NodeKind::parse("bogus"), None);
    }

    #[test]
    fn branching_participation() {
        assert!(NodeKind::UserMessage.participates_in_branching());
        assert!(NodeKind::AssistantMessage.participates_in_branching());
        assert!(!NodeKind::SideChatUser.participates_in_branching());
        assert!(!NodeKind::UserNote.participates_in_branching());
        assert!(NodeKind::SideChatAssistant.is_side_chat());
        assert!(!NodeKind::AssistantMessage.is_side_chat());
    }

    #[test]
    fn new_node_selection_defaults() {
        let user = Node::user_message("session-1", None, "Hi");
        assert!(user.is_selected_path);
        assert_eq!(user.sibling_index, 0);
        assert_eq!(user.status, NodeStatus::Active);

        let side = Node::side_chat(
            NodeKind::SideChatUser,
            "session-1",
            "parent-1",
            "what does this mean?",
            SideChatAnchor {
                selected_text: Some("borrow checker".to_string()),
                selection_start: Some(10),
                selection_end: Some(24),
            },
        );
        assert!(!side.is_selected_path);
        assert_eq!(side.selected_text.as_deref(), Some("borrow checker"));
    }
}
