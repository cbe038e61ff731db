//! TreeStore Trait and Turso Implementation
//!
//! `TreeStore` is the persistence seam for the conversation tree: services
//! depend on the trait, tests can swap the backend, and `TursoTreeStore`
//! provides the production implementation over [`DatabaseService`].
//!
//! Row decoding lives here; the database layer deals in rows and the
//! services deal in models.

use crate::db::database::{
    DatabaseService, DbCreateNodeParams, DbCreateSessionParams, DbUpdateNodeParams,
    DbUpsertPreferencesParams,
};
use crate::db::error::DatabaseError;
use crate::models::{
    Node, NodeKind, NodeStatus, Session, Topic, UserPreferences,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use std::sync::Arc;

/// Persistence operations for the conversation tree
///
/// All structural writes go through this trait so sibling indexing and
/// selection flips stay atomic regardless of backend.
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Insert a node; returns it with `sibling_index` and
    /// `is_selected_path` finalized by the store.
    async fn create_node(&self, node: Node) -> Result<Node>;

    async fn get_node(&self, id: &str) -> Result<Option<Node>>;

    /// Direct children, ordered by sibling index then creation time.
    async fn get_children(&self, parent_id: &str) -> Result<Vec<Node>>;

    /// Root-level nodes of a session in creation order.
    async fn get_root_nodes(&self, session_id: &str) -> Result<Vec<Node>>;

    /// Every node of a session in creation order.
    async fn get_session_nodes(&self, session_id: &str) -> Result<Vec<Node>>;

    /// Persist content/status/branch metadata of an already-loaded node.
    async fn update_node(&self, node: &Node) -> Result<()>;

    /// Mark `selected_id` as the selected sibling in its `(parent, kind)`
    /// group and unselect the rest. `parent_id = None` addresses the
    /// session's root group.
    async fn set_selected(
        &self,
        session_id: &str,
        parent_id: Option<&str>,
        kind: NodeKind,
        selected_id: &str,
    ) -> Result<()>;

    /// Delete a node and (via cascade) its whole subtree. Returns the
    /// number of directly deleted rows (0 when the id is unknown).
    async fn delete_node(&self, id: &str) -> Result<u64>;

    // Sessions
    async fn create_session(&self, session: &Session) -> Result<()>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;
    async fn update_session(&self, session: &Session) -> Result<()>;
    async fn delete_session(&self, id: &str) -> Result<u64>;
    async fn list_topic_sessions(&self, topic_id: &str) -> Result<Vec<Session>>;

    // Topics
    async fn create_topic(&self, topic: &Topic) -> Result<()>;
    async fn get_topic(&self, id: &str) -> Result<Option<Topic>>;
    async fn update_topic(&self, topic: &Topic) -> Result<()>;
    async fn delete_topic(&self, id: &str) -> Result<u64>;
    async fn list_topics(&self) -> Result<Vec<Topic>>;

    // Preferences
    async fn get_preferences(&self, user_id: &str) -> Result<Option<UserPreferences>>;
    async fn upsert_preferences(&self, preferences: &UserPreferences) -> Result<()>;
}

/// Turso/libsql-backed implementation of [`TreeStore`]
#[derive(Debug, Clone)]
pub struct TursoTreeStore {
    db: Arc<DatabaseService>,
}

impl TursoTreeStore {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self { db }
    }
}

/// Format a timestamp for storage.
///
/// RFC3339 with microseconds so same-second writes still sort in creation
/// order under the text comparison the queries rely on.
fn fmt_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
///
/// Accepts RFC3339 (what we write) and SQLite's `datetime()` format (what
/// hand-edited or migrated rows may carry).
fn parse_timestamp(s: &str, context: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    Err(DatabaseError::corrupt_row(format!(
        "{}: unparseable timestamp '{}'",
        context, s
    )))
}

/// Decode a node row in `NODE_COLUMNS` order.
fn row_to_node(row: &libsql::Row) -> Result<Node, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::corrupt_row(format!("node id: {}", e)))?;

    let get_text = |idx: i32, name: &str| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::corrupt_row(format!("node {} {}: {}", id, name, e)))
    };
    let get_opt_text = |idx: i32, name: &str| -> Result<Option<String>, DatabaseError> {
        row.get::<Option<String>>(idx)
            .map_err(|e| DatabaseError::corrupt_row(format!("node {} {}: {}", id, name, e)))
    };
    let get_opt_int = |idx: i32, name: &str| -> Result<Option<i64>, DatabaseError> {
        row.get::<Option<i64>>(idx)
            .map_err(|e| DatabaseError::corrupt_row(format!("node {} {}: {}", id, name, e)))
    };

    let kind_str = get_text(3, "kind")?;
    let kind = NodeKind::parse(&kind_str).ok_or_else(|| {
        DatabaseError::corrupt_row(format!("node {}: unknown kind '{}'", id, kind_str))
    })?;

    let status_str = get_text(5, "status")?;
    let status = NodeStatus::parse(&status_str).ok_or_else(|| {
        DatabaseError::corrupt_row(format!("node {}: unknown status '{}'", id, status_str))
    })?;

    let generation_config = match get_opt_text(8, "generation_config")? {
        Some(json) => Some(serde_json::from_str(&json).map_err(|e| {
            DatabaseError::corrupt_row(format!("node {}: generation_config: {}", id, e))
        })?),
        None => None,
    };

    let sibling_index: i64 = row
        .get(10)
        .map_err(|e| DatabaseError::corrupt_row(format!("node {} sibling_index: {}", id, e)))?;
    let is_selected_path: i64 = row
        .get(11)
        .map_err(|e| DatabaseError::corrupt_row(format!("node {} is_selected_path: {}", id, e)))?;

    let created_at = parse_timestamp(&get_text(15, "created_at")?, "node created_at")?;
    let updated_at = parse_timestamp(&get_text(16, "updated_at")?, "node updated_at")?;

    Ok(Node {
        session_id: get_text(1, "session_id")?,
        parent_id: get_opt_text(2, "parent_id")?,
        content: get_text(4, "content")?,
        kind,
        status,
        branch_name: get_opt_text(6, "branch_name")?,
        collapsed_summary: get_opt_text(7, "collapsed_summary")?,
        generation_config,
        token_count: get_opt_int(9, "token_count")?,
        sibling_index,
        is_selected_path: is_selected_path != 0,
        selected_text: get_opt_text(12, "selected_text")?,
        selection_start: get_opt_int(13, "selection_start")?,
        selection_end: get_opt_int(14, "selection_end")?,
        created_at,
        updated_at,
        id,
    })
}

/// Decode a session row in `SESSION_COLUMNS` order.
fn row_to_session(row: &libsql::Row) -> Result<Session, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::corrupt_row(format!("session id: {}", e)))?;
    let created_at: String = row
        .get(6)
        .map_err(|e| DatabaseError::corrupt_row(format!("session {} created_at: {}", id, e)))?;
    let updated_at: String = row
        .get(7)
        .map_err(|e| DatabaseError::corrupt_row(format!("session {} updated_at: {}", id, e)))?;

    Ok(Session {
        topic_id: row
            .get(1)
            .map_err(|e| DatabaseError::corrupt_row(format!("session {} topic_id: {}", id, e)))?,
        name: row
            .get(2)
            .map_err(|e| DatabaseError::corrupt_row(format!("session {} name: {}", id, e)))?,
        description: row.get::<Option<String>>(3).map_err(|e| {
            DatabaseError::corrupt_row(format!("session {} description: {}", id, e))
        })?,
        default_model: row.get::<Option<String>>(4).map_err(|e| {
            DatabaseError::corrupt_row(format!("session {} default_model: {}", id, e))
        })?,
        root_node_id: row.get::<Option<String>>(5).map_err(|e| {
            DatabaseError::corrupt_row(format!("session {} root_node_id: {}", id, e))
        })?,
        created_at: parse_timestamp(&created_at, "session created_at")?,
        updated_at: parse_timestamp(&updated_at, "session updated_at")?,
        id,
    })
}

fn row_to_topic(row: &libsql::Row) -> Result<Topic, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::corrupt_row(format!("topic id: {}", e)))?;
    let created_at: String = row
        .get(3)
        .map_err(|e| DatabaseError::corrupt_row(format!("topic {} created_at: {}", id, e)))?;
    let updated_at: String = row
        .get(4)
        .map_err(|e| DatabaseError::corrupt_row(format!("topic {} updated_at: {}", id, e)))?;

    Ok(Topic {
        name: row
            .get(1)
            .map_err(|e| DatabaseError::corrupt_row(format!("topic {} name: {}", id, e)))?,
        description: row
            .get::<Option<String>>(2)
            .map_err(|e| DatabaseError::corrupt_row(format!("topic {} description: {}", id, e)))?,
        created_at: parse_timestamp(&created_at, "topic created_at")?,
        updated_at: parse_timestamp(&updated_at, "topic updated_at")?,
        id,
    })
}

fn row_to_preferences(row: &libsql::Row) -> Result<UserPreferences, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::corrupt_row(format!("preferences id: {}", e)))?;
    let created_at: String = row.get(6).map_err(|e| {
        DatabaseError::corrupt_row(format!("preferences {} created_at: {}", id, e))
    })?;
    let updated_at: String = row.get(7).map_err(|e| {
        DatabaseError::corrupt_row(format!("preferences {} updated_at: {}", id, e))
    })?;

    Ok(UserPreferences {
        user_id: row
            .get(1)
            .map_err(|e| DatabaseError::corrupt_row(format!("preferences {} user_id: {}", id, e)))?,
        background: row.get::<Option<String>>(2).map_err(|e| {
            DatabaseError::corrupt_row(format!("preferences {} background: {}", id, e))
        })?,
        interests: row.get::<Option<String>>(3).map_err(|e| {
            DatabaseError::corrupt_row(format!("preferences {} interests: {}", id, e))
        })?,
        custom_instructions: row.get::<Option<String>>(4).map_err(|e| {
            DatabaseError::corrupt_row(format!("preferences {} custom_instructions: {}", id, e))
        })?,
        preferred_model: row.get::<Option<String>>(5).map_err(|e| {
            DatabaseError::corrupt_row(format!("preferences {} preferred_model: {}", id, e))
        })?,
        created_at: parse_timestamp(&created_at, "preferences created_at")?,
        updated_at: parse_timestamp(&updated_at, "preferences updated_at")?,
        id,
    })
}

async fn collect_nodes(mut rows: libsql::Rows) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::sql_execution(e.to_string()))?
    {
        nodes.push(row_to_node(&row)?);
    }
    Ok(nodes)
}

async fn collect_sessions(mut rows: libsql::Rows) -> Result<Vec<Session>> {
    let mut sessions = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::sql_execution(e.to_string()))?
    {
        sessions.push(row_to_session(&row)?);
    }
    Ok(sessions)
}

#[async_trait]
impl TreeStore for TursoTreeStore {
    async fn create_node(&self, mut node: Node) -> Result<Node> {
        let generation_config = match &node.generation_config {
            Some(config) => Some(serde_json::to_string(config)?),
            None => None,
        };
        let created_at = fmt_timestamp(node.created_at);
        let updated_at = fmt_timestamp(node.updated_at);

        let (sibling_index, is_selected) = self
            .db
            .db_create_node(DbCreateNodeParams {
                id: &node.id,
                session_id: &node.session_id,
                parent_id: node.parent_id.as_deref(),
                kind: node.kind.as_str(),
                content: &node.content,
                status: node.status.as_str(),
                branch_name: node.branch_name.as_deref(),
                collapsed_summary: node.collapsed_summary.as_deref(),
                generation_config: generation_config.as_deref(),
                token_count: node.token_count,
                selected_text: node.selected_text.as_deref(),
                selection_start: node.selection_start,
                selection_end: node.selection_end,
                created_at: &created_at,
                updated_at: &updated_at,
                participates_in_branching: node.kind.participates_in_branching(),
            })
            .await?;

        node.sibling_index = sibling_index;
        node.is_selected_path = is_selected;
        Ok(node)
    }

    async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        match self.db.db_get_node(id).await? {
            Some(row) => Ok(Some(row_to_node(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_children(&self, parent_id: &str) -> Result<Vec<Node>> {
        collect_nodes(self.db.db_children(parent_id).await?).await
    }

    async fn get_root_nodes(&self, session_id: &str) -> Result<Vec<Node>> {
        collect_nodes(self.db.db_root_nodes(session_id).await?).await
    }

    async fn get_session_nodes(&self, session_id: &str) -> Result<Vec<Node>> {
        collect_nodes(self.db.db_session_nodes(session_id).await?).await
    }

    async fn update_node(&self, node: &Node) -> Result<()> {
        self.db
            .db_update_node(DbUpdateNodeParams {
                id: &node.id,
                content: &node.content,
                status: node.status.as_str(),
                branch_name: node.branch_name.as_deref(),
                collapsed_summary: node.collapsed_summary.as_deref(),
                updated_at: &fmt_timestamp(Utc::now()),
            })
            .await?;
        Ok(())
    }

    async fn set_selected(
        &self,
        session_id: &str,
        parent_id: Option<&str>,
        kind: NodeKind,
        selected_id: &str,
    ) -> Result<()> {
        self.db
            .db_select_branch(
                selected_id,
                session_id,
                parent_id,
                kind.as_str(),
                &fmt_timestamp(Utc::now()),
            )
            .await?;
        Ok(())
    }

    async fn delete_node(&self, id: &str) -> Result<u64> {
        Ok(self.db.db_delete_node(id).await?)
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        self.db
            .db_create_session(DbCreateSessionParams {
                id: &session.id,
                topic_id: &session.topic_id,
                name: &session.name,
                description: session.description.as_deref(),
                default_model: session.default_model.as_deref(),
                created_at: &fmt_timestamp(session.created_at),
                updated_at: &fmt_timestamp(session.updated_at),
            })
            .await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        match self.db.db_get_session(id).await? {
            Some(row) => Ok(Some(row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        self.db
            .db_update_session(
                &session.id,
                &session.name,
                session.description.as_deref(),
                session.default_model.as_deref(),
                &fmt_timestamp(Utc::now()),
            )
            .await?;
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<u64> {
        Ok(self.db.db_delete_session(id).await?)
    }

    async fn list_topic_sessions(&self, topic_id: &str) -> Result<Vec<Session>> {
        collect_sessions(self.db.db_topic_sessions(topic_id).await?).await
    }

    async fn create_topic(&self, topic: &Topic) -> Result<()> {
        self.db
            .db_create_topic(
                &topic.id,
                &topic.name,
                topic.description.as_deref(),
                &fmt_timestamp(topic.created_at),
                &fmt_timestamp(topic.updated_at),
            )
            .await?;
        Ok(())
    }

    async fn get_topic(&self, id: &str) -> Result<Option<Topic>> {
        match self.db.db_get_topic(id).await? {
            Some(row) => Ok(Some(row_to_topic(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_topic(&self, topic: &Topic) -> Result<()> {
        self.db
            .db_update_topic(
                &topic.id,
                &topic.name,
                topic.description.as_deref(),
                &fmt_timestamp(Utc::now()),
            )
            .await?;
        Ok(())
    }

    async fn delete_topic(&self, id: &str) -> Result<u64> {
        Ok(self.db.db_delete_topic(id).await?)
    }

    async fn list_topics(&self) -> Result<Vec<Topic>> {
        let mut rows = self.db.db_list_topics().await?;
        let mut topics = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::sql_execution(e.to_string()))?
        {
            topics.push(row_to_topic(&row)?);
        }
        Ok(topics)
    }

    async fn get_preferences(&self, user_id: &str) -> Result<Option<UserPreferences>> {
        match self.db.db_get_preferences(user_id).await? {
            Some(row) => Ok(Some(row_to_preferences(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert_preferences(&self, preferences: &UserPreferences) -> Result<()> {
        self.db
            .db_upsert_preferences(DbUpsertPreferencesParams {
                id: &preferences.id,
                user_id: &preferences.user_id,
                background: preferences.background.as_deref(),
                interests: preferences.interests.as_deref(),
                custom_instructions: preferences.custom_instructions.as_deref(),
                preferred_model: preferences.preferred_model.as_deref(),
                created_at: &fmt_timestamp(preferences.created_at),
                updated_at: &fmt_timestamp(Utc::now()),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GenerationConfig, SideChatAnchor};
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, TursoTreeStore, Session) {
        let temp_dir = TempDir::new().unwrap();
        let db = DatabaseService::new(temp_dir.path().join("test.db"))
            .await
            .unwrap();
        let store = TursoTreeStore::new(Arc::new(db));

        let topic = Topic::new("Test Topic", None);
        store.create_topic(&topic).await.unwrap();
        let session = Session::new(&topic.id, "Test Session", None, None);
        store.create_session(&session).await.unwrap();

        (temp_dir, store, session)
    }

    #[tokio::test]
    async fn create_node_assigns_index_and_selection() {
        let (_dir, store, session) = test_store().await;

        let first = store
            .create_node(Node::user_message(&session.id, None, "Hi"))
            .await
            .unwrap();
        assert_eq!(first.sibling_index, 0);
        assert!(first.is_selected_path);

        let second = store
            .create_node(Node::user_message(&session.id, None, "Hello"))
            .await
            .unwrap();
        assert_eq!(second.sibling_index, 1);
        assert!(second.is_selected_path);

        // The older root lost selection when its sibling appeared.
        let reloaded = store.get_node(&first.id).await.unwrap().unwrap();
        assert!(!reloaded.is_selected_path);
    }

    #[tokio::test]
    async fn first_root_cached_on_session() {
        let (_dir, store, session) = test_store().await;

        let root = store
            .create_node(Node::user_message(&session.id, None, "Hi"))
            .await
            .unwrap();
        store
            .create_node(Node::user_message(&session.id, None, "Hello"))
            .await
            .unwrap();

        let reloaded = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(reloaded.root_node_id.as_deref(), Some(root.id.as_str()));
    }

    #[tokio::test]
    async fn side_chat_nodes_never_selected() {
        let (_dir, store, session) = test_store().await;

        let root = store
            .create_node(Node::user_message(&session.id, None, "Hi"))
            .await
            .unwrap();
        let side = store
            .create_node(Node::side_chat(
                NodeKind::SideChatUser,
                &session.id,
                &root.id,
                "what about this?",
                SideChatAnchor::default(),
            ))
            .await
            .unwrap();

        assert!(!side.is_selected_path);
        assert_eq!(side.sibling_index, 0);

        // Side-chat insertion does not disturb the main path.
        let reloaded = store.get_node(&root.id).await.unwrap().unwrap();
        assert!(reloaded.is_selected_path);
    }

    #[tokio::test]
    async fn generation_config_roundtrips() {
        let (_dir, store, session) = test_store().await;

        let root = store
            .create_node(Node::user_message(&session.id, None, "Hi"))
            .await
            .unwrap();
        let assistant = store
            .create_node(Node::assistant_message(
                &session.id,
                Some(root.id.clone()),
                "Hello there",
                GenerationConfig::default(),
            ))
            .await
            .unwrap();

        let reloaded = store.get_node(&assistant.id).await.unwrap().unwrap();
        let config = reloaded.generation_config.unwrap();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.provider, "openai");
    }

    #[tokio::test]
    async fn delete_cascades_to_descendants() {
        let (_dir, store, session) = test_store().await;

        let root = store
            .create_node(Node::user_message(&session.id, None, "Hi"))
            .await
            .unwrap();
        let child = store
            .create_node(Node::assistant_message(
                &session.id,
                Some(root.id.clone()),
                "Hello",
                GenerationConfig::default(),
            ))
            .await
            .unwrap();
        let grandchild = store
            .create_node(Node::user_message(
                &session.id,
                Some(child.id.clone()),
                "Tell me more",
            ))
            .await
            .unwrap();

        let deleted = store.delete_node(&root.id).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_node(&child.id).await.unwrap().is_none());
        assert!(store.get_node(&grandchild.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn preferences_upsert_is_idempotent() {
        let (_dir, store, _session) = test_store().await;

        let mut prefs = UserPreferences::new("user-1");
        prefs.background = Some("software engineer".to_string());
        store.upsert_preferences(&prefs).await.unwrap();

        prefs.interests = Some("distributed systems".to_string());
        store.upsert_preferences(&prefs).await.unwrap();

        let reloaded = store.get_preferences("user-1").await.unwrap().unwrap();
        assert_eq!(reloaded.background.as_deref(), Some("software engineer"));
        assert_eq!(
            reloaded.interests.as_deref(),
            Some("distributed systems")
        );
    }
}
