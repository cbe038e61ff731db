//! Tree Service
//!
//! Business logic over the conversation tree: path resolution, branch
//! creation and selection, side-chat thread grouping, notes, and the
//! topic/session/preferences CRUD that frames it all.
//!
//! # Concurrency
//!
//! Sibling creation serializes per parent through an async mutex keyed by
//! parent id (or by session for root nodes), so two turns branching off the
//! same node get distinct sibling indexes and a deterministic winner for
//! path selection. The store makes each individual insert atomic; the lock
//! keeps whole create flows from interleaving.

use crate::db::TreeStore;
use crate::models::{
    Node, NodeKind, NodeStatus, NodeUpdate, PreferencesUpdate, Session, SessionUpdate,
    SideChatAnchor, Topic, TopicUpdate, UserPreferences,
};
use crate::services::context::thread_preview;
use crate::services::error::ChatServiceError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, ChatServiceError>;

/// One side-chat thread hanging off a main-path node.
///
/// Threads have no id of their own; identity is `(parent_id, selected_text)`
/// with literal text equality, `None` being the general-discussion thread.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SideChatThread {
    pub parent_id: String,
    pub anchor: SideChatAnchor,
    pub message_count: usize,
    /// First message of the thread, truncated for listings.
    pub preview: String,
    pub last_message_at: DateTime<Utc>,
}

/// Filter for reading side-chat messages under a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideChatFilter {
    /// Every side-chat message regardless of thread.
    All,
    /// Only the general-discussion thread (no anchor).
    General,
    /// Only the thread anchored to exactly this text.
    Anchored(String),
}

pub struct TreeService {
    store: Arc<dyn TreeStore>,
    /// Per-parent creation locks; entries are created on demand and live for
    /// the service's lifetime.
    parent_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TreeService {
    pub fn new(store: Arc<dyn TreeStore>) -> Self {
        Self {
            store,
            parent_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .parent_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    //
    // PATH RESOLUTION
    //

    /// Resolve the root-to-node path by walking parent pointers.
    ///
    /// The starting node must exist. A dangling ancestor pointer stops the
    /// walk with a warning instead of failing the whole request; a repeated
    /// id (which the schema should make impossible) does the same.
    pub async fn resolve_path(&self, node_id: &str) -> Result<Vec<Node>> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ChatServiceError::node_not_found(node_id))?;

        let mut path = vec![node];
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(node_id.to_string());

        loop {
            let parent_id = match path.last().and_then(|n| n.parent_id.clone()) {
                Some(id) => id,
                None => break,
            };
            if !seen.insert(parent_id.clone()) {
                warn!(node_id, parent_id = %parent_id, "cycle detected while resolving path");
                break;
            }
            match self.store.get_node(&parent_id).await? {
                Some(parent) => path.push(parent),
                None => {
                    warn!(node_id, parent_id = %parent_id, "dangling parent while resolving path");
                    break;
                }
            }
        }

        path.reverse();
        Ok(path)
    }

    //
    // NODE CREATION AND BRANCHING
    //

    /// Insert a node under its parent (or as a session root).
    ///
    /// Validates the parent/session relationship, then creates under the
    /// per-parent lock so sibling indexing and selection stay deterministic
    /// under concurrency.
    pub async fn create_node(&self, node: Node) -> Result<Node> {
        let lock_key = match &node.parent_id {
            Some(parent_id) => {
                let parent = self
                    .store
                    .get_node(parent_id)
                    .await?
                    .ok_or_else(|| ChatServiceError::node_not_found(parent_id))?;
                if parent.session_id != node.session_id {
                    return Err(ChatServiceError::invalid_operation(format!(
                        "parent {} belongs to session {}, not {}",
                        parent_id, parent.session_id, node.session_id
                    )));
                }
                parent_id.clone()
            }
            None => {
                self.get_session(&node.session_id).await?;
                format!("root:{}", node.session_id)
            }
        };

        let lock = self.lock_for(&lock_key);
        let _guard = lock.lock().await;

        let created = self.store.create_node(node).await?;
        debug!(
            node_id = %created.id,
            kind = created.kind.as_str(),
            sibling_index = created.sibling_index,
            "created node"
        );
        Ok(created)
    }

    /// Switch the selected path to `node_id` within its sibling group.
    ///
    /// Only branching kinds can be selected; the store flips the whole
    /// `(parent, kind)` group in one statement.
    pub async fn select_branch(&self, node_id: &str) -> Result<Node> {
        let node = self.get_node(node_id).await?;
        if !node.kind.participates_in_branching() {
            return Err(ChatServiceError::invalid_operation(format!(
                "nodes of kind '{}' do not participate in branching",
                node.kind.as_str()
            )));
        }

        self.store
            .set_selected(
                &node.session_id,
                node.parent_id.as_deref(),
                node.kind,
                node_id,
            )
            .await?;
        debug!(node_id, "selected branch");

        self.get_node(node_id).await
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Node> {
        self.store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ChatServiceError::node_not_found(node_id))
    }

    /// Direct children of a node, sibling order.
    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<Node>> {
        self.get_node(parent_id).await?;
        Ok(self.store.get_children(parent_id).await?)
    }

    /// The same-kind sibling group `node_id` belongs to, including itself.
    /// Only branching kinds have sibling groups; side chats and notes are
    /// listed through their own queries.
    pub async fn list_siblings(&self, node_id: &str) -> Result<Vec<Node>> {
        let node = self.get_node(node_id).await?;
        if !node.kind.participates_in_branching() {
            return Err(ChatServiceError::invalid_operation(format!(
                "nodes of kind '{}' have no sibling group",
                node.kind.as_str()
            )));
        }
        let peers = match &node.parent_id {
            Some(parent_id) => self.store.get_children(parent_id).await?,
            None => self.store.get_root_nodes(&node.session_id).await?,
        };
        Ok(peers.into_iter().filter(|n| n.kind == node.kind).collect())
    }

    /// Every main-conversation node of a session (side chats excluded),
    /// creation order. Callers rebuild the tree shape from `parent_id`.
    pub async fn list_session_tree(&self, session_id: &str) -> Result<Vec<Node>> {
        self.get_session(session_id).await?;
        let nodes = self.store.get_session_nodes(session_id).await?;
        Ok(nodes
            .into_iter()
            .filter(|n| !n.kind.is_side_chat())
            .collect())
    }

    /// Metadata update. Content changes are honored for user notes only;
    /// collapsing requires a summary to substitute with.
    pub async fn update_node(&self, node_id: &str, update: NodeUpdate) -> Result<Node> {
        let mut node = self.get_node(node_id).await?;

        if let Some(content) = update.content {
            if node.kind != NodeKind::UserNote {
                return Err(ChatServiceError::invalid_operation(format!(
                    "content of '{}' nodes is immutable",
                    node.kind.as_str()
                )));
            }
            node.content = content;
        }
        if let Some(branch_name) = update.branch_name {
            node.branch_name = Some(branch_name);
        }
        if let Some(summary) = update.collapsed_summary {
            node.collapsed_summary = Some(summary);
        }
        if let Some(status) = update.status {
            if status == NodeStatus::Collapsed && node.collapsed_summary.is_none() {
                return Err(ChatServiceError::invalid_operation(
                    "cannot collapse a node without a summary",
                ));
            }
            node.status = status;
        }

        self.store.update_node(&node).await?;
        self.get_node(node_id).await
    }

    /// Delete a node and its whole subtree.
    ///
    /// If the deleted node was the selected sibling, selection moves to the
    /// newest remaining sibling so the group invariant holds.
    pub async fn delete_node(&self, node_id: &str) -> Result<()> {
        let node = self.get_node(node_id).await?;

        self.store.delete_node(node_id).await?;
        debug!(node_id, "deleted node subtree");

        if node.is_selected_path && node.kind.participates_in_branching() {
            let remaining: Vec<Node> = match &node.parent_id {
                Some(parent_id) => self.store.get_children(parent_id).await?,
                None => self.store.get_root_nodes(&node.session_id).await?,
            }
            .into_iter()
            .filter(|n| n.kind == node.kind)
            .collect();

            if let Some(newest) = remaining.iter().max_by_key(|n| n.sibling_index) {
                self.store
                    .set_selected(
                        &node.session_id,
                        node.parent_id.as_deref(),
                        node.kind,
                        &newest.id,
                    )
                    .await?;
                debug!(node_id = %newest.id, "reselected sibling after deletion");
            }
        }

        Ok(())
    }

    //
    // SIDE-CHAT THREADS
    //

    /// Side-chat threads under one main-path node.
    ///
    /// Grouped by literal anchor text; ordered by each thread's first
    /// message.
    pub async fn list_side_chat_threads(&self, parent_id: &str) -> Result<Vec<SideChatThread>> {
        let children = self.list_children(parent_id).await?;
        Ok(group_threads(parent_id, &children))
    }

    /// Every side-chat thread in a session, most recently active first.
    pub async fn list_session_side_chat_threads(
        &self,
        session_id: &str,
    ) -> Result<Vec<SideChatThread>> {
        self.get_session(session_id).await?;
        let nodes = self.store.get_session_nodes(session_id).await?;

        let mut by_parent: HashMap<String, Vec<Node>> = HashMap::new();
        for node in nodes.into_iter().filter(|n| n.kind.is_side_chat()) {
            if let Some(parent_id) = node.parent_id.clone() {
                by_parent.entry(parent_id).or_default().push(node);
            }
        }

        let mut threads = Vec::new();
        for (parent_id, group) in by_parent {
            threads.extend(group_threads(&parent_id, &group));
        }
        threads.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(threads)
    }

    /// Side-chat messages under a parent, filtered by thread, in creation
    /// order.
    pub async fn list_side_chat_messages(
        &self,
        parent_id: &str,
        filter: SideChatFilter,
    ) -> Result<Vec<Node>> {
        let children = self.list_children(parent_id).await?;
        let mut messages: Vec<Node> = children
            .into_iter()
            .filter(|n| n.kind.is_side_chat())
            .filter(|n| match &filter {
                SideChatFilter::All => true,
                SideChatFilter::General => n.selected_text.is_none(),
                SideChatFilter::Anchored(text) => n.selected_text.as_deref() == Some(text),
            })
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    //
    // NOTES
    //

    /// Create or replace the singleton note attached to a node.
    pub async fn upsert_note(&self, parent_id: &str, content: impl Into<String>) -> Result<Node> {
        let content = content.into();
        match self.get_note(parent_id).await? {
            Some(mut note) => {
                note.content = content;
                note.status = NodeStatus::Active;
                self.store.update_node(&note).await?;
                self.get_node(&note.id).await
            }
            None => {
                let parent = self.get_node(parent_id).await?;
                let note = Node::new(
                    NodeKind::UserNote,
                    parent.session_id,
                    Some(parent_id.to_string()),
                    content,
                );
                self.create_node(note).await
            }
        }
    }

    /// The note attached to a node, if any.
    pub async fn get_note(&self, parent_id: &str) -> Result<Option<Node>> {
        let children = self.list_children(parent_id).await?;
        Ok(children.into_iter().find(|n| n.kind == NodeKind::UserNote))
    }

    /// Remove a node's note. Returns whether one existed.
    pub async fn delete_note(&self, parent_id: &str) -> Result<bool> {
        match self.get_note(parent_id).await? {
            Some(note) => {
                self.store.delete_node(&note.id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    //
    // TOPICS
    //

    pub async fn create_topic(
        &self,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Result<Topic> {
        let topic = Topic::new(name, description);
        self.store.create_topic(&topic).await?;
        Ok(topic)
    }

    pub async fn get_topic(&self, topic_id: &str) -> Result<Topic> {
        self.store
            .get_topic(topic_id)
            .await?
            .ok_or_else(|| ChatServiceError::topic_not_found(topic_id))
    }

    pub async fn update_topic(&self, topic_id: &str, update: TopicUpdate) -> Result<Topic> {
        let mut topic = self.get_topic(topic_id).await?;
        if let Some(name) = update.name {
            topic.name = name;
        }
        if let Some(description) = update.description {
            topic.description = Some(description);
        }
        self.store.update_topic(&topic).await?;
        self.get_topic(topic_id).await
    }

    pub async fn delete_topic(&self, topic_id: &str) -> Result<()> {
        self.get_topic(topic_id).await?;
        self.store.delete_topic(topic_id).await?;
        Ok(())
    }

    pub async fn list_topics(&self) -> Result<Vec<Topic>> {
        Ok(self.store.list_topics().await?)
    }

    //
    // SESSIONS
    //

    pub async fn create_session(
        &self,
        topic_id: &str,
        name: impl Into<String>,
        description: Option<String>,
        default_model: Option<String>,
    ) -> Result<Session> {
        self.get_topic(topic_id).await?;
        let session = Session::new(topic_id, name, description, default_model);
        self.store.create_session(&session).await?;
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| ChatServiceError::session_not_found(session_id))
    }

    pub async fn update_session(
        &self,
        session_id: &str,
        update: SessionUpdate,
    ) -> Result<Session> {
        let mut session = self.get_session(session_id).await?;
        if let Some(name) = update.name {
            session.name = name;
        }
        if let Some(description) = update.description {
            session.description = Some(description);
        }
        if let Some(default_model) = update.default_model {
            session.default_model = Some(default_model);
        }
        self.store.update_session(&session).await?;
        self.get_session(session_id).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.get_session(session_id).await?;
        self.store.delete_session(session_id).await?;
        Ok(())
    }

    pub async fn list_topic_sessions(&self, topic_id: &str) -> Result<Vec<Session>> {
        self.get_topic(topic_id).await?;
        Ok(self.store.list_topic_sessions(topic_id).await?)
    }

    //
    // PREFERENCES
    //

    pub async fn get_preferences(&self, user_id: &str) -> Result<Option<UserPreferences>> {
        Ok(self.store.get_preferences(user_id).await?)
    }

    /// Merge an update into the user's preferences, creating them on first
    /// write.
    pub async fn update_preferences(
        &self,
        user_id: &str,
        update: PreferencesUpdate,
    ) -> Result<UserPreferences> {
        let mut prefs = self
            .store
            .get_preferences(user_id)
            .await?
            .unwrap_or_else(|| UserPreferences::new(user_id));

        if let Some(background) = update.background {
            prefs.background = Some(background);
        }
        if let Some(interests) = update.interests {
            prefs.interests = Some(interests);
        }
        if let Some(custom_instructions) = update.custom_instructions {
            prefs.custom_instructions = Some(custom_instructions);
        }
        if let Some(preferred_model) = update.preferred_model {
            prefs.preferred_model = Some(preferred_model);
        }

        self.store.upsert_preferences(&prefs).await?;
        self.get_preferences(user_id)
            .await?
            .ok_or_else(|| ChatServiceError::invalid_operation("preferences vanished after upsert"))
    }
}

/// Group a parent's side-chat children into threads keyed by anchor text.
fn group_threads(parent_id: &str, children: &[Node]) -> Vec<SideChatThread> {
    let mut order: Vec<Option<String>> = Vec::new();
    let mut groups: HashMap<Option<String>, Vec<&Node>> = HashMap::new();

    let mut side: Vec<&Node> = children.iter().filter(|n| n.kind.is_side_chat()).collect();
    side.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    for node in side {
        let key = node.selected_text.clone();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(node);
    }

    order
        .into_iter()
        .filter_map(|key| {
            let nodes = groups.get(&key)?;
            let first = nodes.first()?;
            // Preview prefers the user's opening message.
            let preview_node = nodes
                .iter()
                .find(|n| n.kind == NodeKind::SideChatUser)
                .unwrap_or(first);
            let last_message_at = nodes.iter().map(|n| n.created_at).max()?;
            Some(SideChatThread {
                parent_id: parent_id.to_string(),
                anchor: first.anchor(),
                message_count: nodes.len(),
                preview: thread_preview(&preview_node.content),
                last_message_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseService, TursoTreeStore};
    use crate::models::GenerationConfig;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<TreeService>, Session) {
        let temp_dir = TempDir::new().unwrap();
        let db = DatabaseService::new(temp_dir.path().join("test.db"))
            .await
            .unwrap();
        let store = Arc::new(TursoTreeStore::new(Arc::new(db)));
        let service = Arc::new(TreeService::new(store));

        let topic = service.create_topic("Test Topic", None).await.unwrap();
        let session = service
            .create_session(&topic.id, "Test Session", None, None)
            .await
            .unwrap();

        (temp_dir, service, session)
    }

    async fn user_turn(
        service: &TreeService,
        session: &Session,
        parent: Option<&Node>,
        content: &str,
    ) -> Node {
        service
            .create_node(Node::user_message(
                &session.id,
                parent.map(|n| n.id.clone()),
                content,
            ))
            .await
            .unwrap()
    }

    async fn assistant_turn(
        service: &TreeService,
        session: &Session,
        parent: &Node,
        content: &str,
    ) -> Node {
        service
            .create_node(Node::assistant_message(
                &session.id,
                Some(parent.id.clone()),
                content,
                GenerationConfig::default(),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn resolve_path_walks_to_root() {
        let (_dir, service, session) = setup().await;

        let root = user_turn(&service, &session, None, "Hi").await;
        let reply = assistant_turn(&service, &session, &root, "Hello!").await;
        let followup = user_turn(&service, &session, Some(&reply), "More please").await;

        let path = service.resolve_path(&followup.id).await.unwrap();
        let ids: Vec<&str> = path.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec![&root.id, &reply.id, &followup.id]);
    }

    #[tokio::test]
    async fn resolve_path_unknown_node_errors() {
        let (_dir, service, _session) = setup().await;
        let err = service.resolve_path("missing").await.unwrap_err();
        assert!(matches!(err, ChatServiceError::NodeNotFound { .. }));
    }

    #[tokio::test]
    async fn branching_keeps_single_selection() {
        let (_dir, service, session) = setup().await;

        let root = user_turn(&service, &session, None, "Hi").await;
        let reply = assistant_turn(&service, &session, &root, "Hello!").await;

        let option_a = user_turn(&service, &session, Some(&reply), "Option A").await;
        let option_b = user_turn(&service, &session, Some(&reply), "Option B").await;

        // Newest branch wins selection.
        assert!(option_b.is_selected_path);
        let a = service.get_node(&option_a.id).await.unwrap();
        assert!(!a.is_selected_path);

        // Explicit selection flips back.
        service.select_branch(&option_a.id).await.unwrap();
        let a = service.get_node(&option_a.id).await.unwrap();
        let b = service.get_node(&option_b.id).await.unwrap();
        assert!(a.is_selected_path);
        assert!(!b.is_selected_path);
    }

    #[tokio::test]
    async fn select_branch_rejects_non_branching_kinds() {
        let (_dir, service, session) = setup().await;

        let root = user_turn(&service, &session, None, "Hi").await;
        let note = service.upsert_note(&root.id, "a note").await.unwrap();

        let err = service.select_branch(&note.id).await.unwrap_err();
        assert!(matches!(err, ChatServiceError::InvalidOperation { .. }));
    }

    #[tokio::test]
    async fn list_siblings_covers_branching_kinds_only() {
        let (_dir, service, session) = setup().await;

        let root = user_turn(&service, &session, None, "Hi").await;
        let reply = assistant_turn(&service, &session, &root, "Hello!").await;
        let option_a = user_turn(&service, &session, Some(&reply), "A").await;
        let option_b = user_turn(&service, &session, Some(&reply), "B").await;

        let siblings = service.list_siblings(&option_a.id).await.unwrap();
        let ids: Vec<&str> = siblings.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec![&option_a.id, &option_b.id]);

        let note = service.upsert_note(&reply.id, "a note").await.unwrap();
        let err = service.list_siblings(&note.id).await.unwrap_err();
        assert!(matches!(err, ChatServiceError::InvalidOperation { .. }));
    }

    #[tokio::test]
    async fn create_node_rejects_cross_session_parent() {
        let (_dir, service, session) = setup().await;
        let root = user_turn(&service, &session, None, "Hi").await;

        let topic = service.create_topic("Other", None).await.unwrap();
        let other = service
            .create_session(&topic.id, "Other Session", None, None)
            .await
            .unwrap();

        let err = service
            .create_node(Node::user_message(&other.id, Some(root.id.clone()), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatServiceError::InvalidOperation { .. }));
    }

    #[tokio::test]
    async fn concurrent_siblings_get_unique_indexes() {
        let (_dir, service, session) = setup().await;

        let root = user_turn(&service, &session, None, "Hi").await;
        let reply = assistant_turn(&service, &session, &root, "Hello!").await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let service = Arc::clone(&service);
            let session_id = session.id.clone();
            let parent_id = reply.id.clone();
            handles.push(tokio::spawn(async move {
                service
                    .create_node(Node::user_message(
                        session_id,
                        Some(parent_id),
                        format!("branch {}", i),
                    ))
                    .await
                    .unwrap()
            }));
        }

        let mut indexes = Vec::new();
        for handle in handles {
            indexes.push(handle.await.unwrap().sibling_index);
        }
        indexes.sort();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);

        let siblings = service
            .list_children(&reply.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.kind == NodeKind::UserMessage)
            .collect::<Vec<_>>();
        let selected = siblings.iter().filter(|n| n.is_selected_path).count();
        assert_eq!(selected, 1);
    }

    #[tokio::test]
    async fn side_chat_threads_group_by_anchor() {
        let (_dir, service, session) = setup().await;

        let root = user_turn(&service, &session, None, "Hi").await;
        let reply = assistant_turn(&service, &session, &root, "Rust has ownership and traits").await;

        let anchored = SideChatAnchor {
            selected_text: Some("ownership".to_string()),
            selection_start: Some(9),
            selection_end: Some(18),
        };
        for content in ["what is ownership?", "got it, and borrowing?"] {
            service
                .create_node(Node::side_chat(
                    NodeKind::SideChatUser,
                    &session.id,
                    &reply.id,
                    content,
                    anchored.clone(),
                ))
                .await
                .unwrap();
        }
        service
            .create_node(Node::side_chat(
                NodeKind::SideChatUser,
                &session.id,
                &reply.id,
                "a general aside",
                SideChatAnchor::default(),
            ))
            .await
            .unwrap();

        let threads = service.list_side_chat_threads(&reply.id).await.unwrap();
        assert_eq!(threads.len(), 2);
        assert_eq!(
            threads[0].anchor.selected_text.as_deref(),
            Some("ownership")
        );
        assert_eq!(threads[0].message_count, 2);
        assert_eq!(threads[0].preview, "what is ownership?");
        assert_eq!(threads[1].anchor.selected_text, None);
        assert_eq!(threads[1].message_count, 1);

        // Filters pick out one thread at a time.
        let general = service
            .list_side_chat_messages(&reply.id, SideChatFilter::General)
            .await
            .unwrap();
        assert_eq!(general.len(), 1);
        assert_eq!(general[0].content, "a general aside");

        let anchored_msgs = service
            .list_side_chat_messages(&reply.id, SideChatFilter::Anchored("ownership".to_string()))
            .await
            .unwrap();
        assert_eq!(anchored_msgs.len(), 2);

        let all = service
            .list_side_chat_messages(&reply.id, SideChatFilter::All)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn session_threads_sorted_by_recency() {
        let (_dir, service, session) = setup().await;

        let root = user_turn(&service, &session, None, "Hi").await;
        let reply = assistant_turn(&service, &session, &root, "Hello!").await;

        service
            .create_node(Node::side_chat(
                NodeKind::SideChatUser,
                &session.id,
                &root.id,
                "older thread",
                SideChatAnchor::default(),
            ))
            .await
            .unwrap();
        service
            .create_node(Node::side_chat(
                NodeKind::SideChatUser,
                &session.id,
                &reply.id,
                "newer thread",
                SideChatAnchor::default(),
            ))
            .await
            .unwrap();

        let threads = service
            .list_session_side_chat_threads(&session.id)
            .await
            .unwrap();
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].preview, "newer thread");
        assert_eq!(threads[1].preview, "older thread");
    }

    #[tokio::test]
    async fn note_is_a_singleton_per_node() {
        let (_dir, service, session) = setup().await;
        let root = user_turn(&service, &session, None, "Hi").await;

        let first = service.upsert_note(&root.id, "draft").await.unwrap();
        let second = service.upsert_note(&root.id, "final").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.content, "final");

        let note = service.get_note(&root.id).await.unwrap().unwrap();
        assert_eq!(note.content, "final");
        assert!(!note.is_selected_path);

        assert!(service.delete_note(&root.id).await.unwrap());
        assert!(service.get_note(&root.id).await.unwrap().is_none());
        assert!(!service.delete_note(&root.id).await.unwrap());
    }

    #[tokio::test]
    async fn content_edits_limited_to_notes() {
        let (_dir, service, session) = setup().await;
        let root = user_turn(&service, &session, None, "Hi").await;

        let err = service
            .update_node(
                &root.id,
                NodeUpdate {
                    content: Some("rewritten".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatServiceError::InvalidOperation { .. }));

        // Branch metadata is fine on any kind.
        let updated = service
            .update_node(
                &root.id,
                NodeUpdate {
                    branch_name: Some("main line".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.branch_name.as_deref(), Some("main line"));
        assert_eq!(updated.content, "Hi");
    }

    #[tokio::test]
    async fn collapse_requires_summary() {
        let (_dir, service, session) = setup().await;
        let root = user_turn(&service, &session, None, "Hi").await;

        let err = service
            .update_node(
                &root.id,
                NodeUpdate {
                    status: Some(NodeStatus::Collapsed),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatServiceError::InvalidOperation { .. }));

        let collapsed = service
            .update_node(
                &root.id,
                NodeUpdate {
                    status: Some(NodeStatus::Collapsed),
                    collapsed_summary: Some("greeting".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(collapsed.status, NodeStatus::Collapsed);
    }

    #[tokio::test]
    async fn deleting_selected_branch_reselects_newest() {
        let (_dir, service, session) = setup().await;

        let root = user_turn(&service, &session, None, "Hi").await;
        let reply = assistant_turn(&service, &session, &root, "Hello!").await;
        let option_a = user_turn(&service, &session, Some(&reply), "A").await;
        let option_b = user_turn(&service, &session, Some(&reply), "B").await;

        // B is selected; delete it and A should take over.
        service.delete_node(&option_b.id).await.unwrap();
        let a = service.get_node(&option_a.id).await.unwrap();
        assert!(a.is_selected_path);
    }

    #[tokio::test]
    async fn session_tree_excludes_side_chats() {
        let (_dir, service, session) = setup().await;

        let root = user_turn(&service, &session, None, "Hi").await;
        let reply = assistant_turn(&service, &session, &root, "Hello!").await;
        service
            .create_node(Node::side_chat(
                NodeKind::SideChatUser,
                &session.id,
                &reply.id,
                "aside",
                SideChatAnchor::default(),
            ))
            .await
            .unwrap();

        let tree = service.list_session_tree(&session.id).await.unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree.iter().all(|n| !n.kind.is_side_chat()));
    }

    #[tokio::test]
    async fn preferences_merge_on_update() {
        let (_dir, service, _session) = setup().await;

        assert!(service.get_preferences("u1").await.unwrap().is_none());

        service
            .update_preferences(
                "u1",
                PreferencesUpdate {
                    background: Some("teacher".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let prefs = service
            .update_preferences(
                "u1",
                PreferencesUpdate {
                    preferred_model: Some("gpt-4o".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(prefs.background.as_deref(), Some("teacher"));
        assert_eq!(prefs.preferred_model.as_deref(), Some("gpt-4o"));
    }

    #[tokio::test]
    async fn topic_and_session_crud() {
        let (_dir, service, session) = setup().await;

        let updated = service
            .update_session(
                &session.id,
                SessionUpdate {
                    name: Some("Renamed".to_string()),
                    default_model: Some("gpt-4o".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.default_model.as_deref(), Some("gpt-4o"));

        let sessions = service
            .list_topic_sessions(&session.topic_id)
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);

        service.delete_session(&session.id).await.unwrap();
        let err = service.get_session(&session.id).await.unwrap_err();
        assert!(matches!(err, ChatServiceError::SessionNotFound { .. }));
    }
}
