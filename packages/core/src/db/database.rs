//! Database Connection Management
//!
//! Core database connection and schema initialization using libsql/Turso,
//! plus the extracted SQL operations the [`crate::db::TreeStore`]
//! implementation delegates to.
//!
//! # Architecture
//!
//! - **Flat tree**: nodes live in one table keyed by id with a `parent_id`
//!   pointer; parent deletion cascades to the whole subtree via foreign keys.
//! - **WAL mode** with a 5s busy timeout for concurrent request handling.
//! - **Idempotent init**: `CREATE TABLE IF NOT EXISTS`, safe to call twice.
//!
//! Connections are cheap handles over the shared database; async code must
//! go through [`DatabaseService::connect_with_timeout`] so every connection
//! carries the busy timeout and foreign-key enforcement.

use crate::db::error::DatabaseError;
use libsql::{Builder, Database};
use std::path::PathBuf;
use std::sync::Arc;

/// Column list shared by every node SELECT; row decoding relies on this order.
pub(crate) const NODE_COLUMNS: &str = "id, session_id, parent_id, kind, content, status, \
     branch_name, collapsed_summary, generation_config, token_count, sibling_index, \
     is_selected_path, selected_text, selection_start, selection_end, created_at, updated_at";

/// Column list shared by every session SELECT.
pub(crate) const SESSION_COLUMNS: &str =
    "id, topic_id, name, description, default_model, root_node_id, created_at, updated_at";

/// Database service for managing the libsql connection and schema
#[derive(Debug, Clone)]
pub struct DatabaseService {
    /// libsql database (wrapped in Arc for sharing)
    pub db: Arc<Database>,

    /// Path to the database file
    pub db_path: PathBuf,
}

/// Parameters for node insertion (avoids too-many-arguments lint)
pub struct DbCreateNodeParams<'a> {
    pub id: &'a str,
    pub session_id: &'a str,
    pub parent_id: Option<&'a str>,
    pub kind: &'a str,
    pub content: &'a str,
    pub status: &'a str,
    pub branch_name: Option<&'a str>,
    pub collapsed_summary: Option<&'a str>,
    pub generation_config: Option<&'a str>,
    pub token_count: Option<i64>,
    pub selected_text: Option<&'a str>,
    pub selection_start: Option<i64>,
    pub selection_end: Option<i64>,
    pub created_at: &'a str,
    pub updated_at: &'a str,
    /// Whether this kind competes for main-path selection.
    pub participates_in_branching: bool,
}

/// Parameters for node metadata update (avoids too-many-arguments lint)
pub struct DbUpdateNodeParams<'a> {
    pub id: &'a str,
    pub content: &'a str,
    pub status: &'a str,
    pub branch_name: Option<&'a str>,
    pub collapsed_summary: Option<&'a str>,
    pub updated_at: &'a str,
}

/// Parameters for session insertion
pub struct DbCreateSessionParams<'a> {
    pub id: &'a str,
    pub topic_id: &'a str,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub default_model: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Parameters for a preferences upsert
pub struct DbUpsertPreferencesParams<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub background: Option<&'a str>,
    pub interests: Option<&'a str>,
    pub custom_instructions: Option<&'a str>,
    pub preferred_model: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

impl DatabaseService {
    /// Create a new DatabaseService with the specified database path
    ///
    /// This will:
    /// 1. Ensure the parent directory exists (create if needed)
    /// 2. Open/create the database file
    /// 3. Initialize the schema (CREATE TABLE IF NOT EXISTS)
    /// 4. Enable SQLite features (WAL mode, foreign keys)
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        DatabaseError::permission_denied(db_path.clone())
                    } else {
                        DatabaseError::DirectoryCreationFailed(e)
                    }
                })?;
            }
        }

        let db = Builder::new_local(&db_path)
            .build()
            .await
            .map_err(|e| DatabaseError::connection_failed(db_path.clone(), e))?;

        let service = Self {
            db: Arc::new(db),
            db_path,
        };

        service.initialize_schema().await?;

        Ok(service)
    }

    /// Execute a PRAGMA statement
    ///
    /// PRAGMA statements return rows, so we must use query() instead of execute().
    async fn execute_pragma(
        &self,
        conn: &libsql::Connection,
        pragma: &str,
    ) -> Result<(), DatabaseError> {
        let mut stmt = conn.prepare(pragma).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        let _ = stmt.query(()).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        Ok(())
    }

    /// Get an async connection with busy timeout and foreign keys configured
    ///
    /// All async code must use this instead of a raw connect: the busy
    /// timeout makes concurrent operations wait and retry instead of failing
    /// with `SQLITE_BUSY`, and foreign-key enforcement is per-connection in
    /// SQLite, so the cascade semantics depend on it being set here.
    pub async fn connect_with_timeout(&self) -> Result<libsql::Connection, DatabaseError> {
        let conn = self.db.connect().map_err(DatabaseError::LibsqlError)?;
        self.execute_pragma(&conn, "PRAGMA busy_timeout = 5000")
            .await?;
        self.execute_pragma(&conn, "PRAGMA foreign_keys = ON")
            .await?;
        Ok(conn)
    }

    /// Initialize database schema and configuration
    ///
    /// Creates tables and indexes using CREATE TABLE IF NOT EXISTS, so
    /// initialization is idempotent.
    async fn initialize_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        // WAL mode for better concurrency
        self.execute_pragma(&conn, "PRAGMA journal_mode = WAL")
            .await?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS topics (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to create topics table: {}", e))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                topic_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                default_model TEXT,
                root_node_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (topic_id) REFERENCES topics(id) ON DELETE CASCADE
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to create sessions table: {}", e))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                parent_id TEXT,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                branch_name TEXT,
                collapsed_summary TEXT,
                generation_config JSON,
                token_count INTEGER,
                sibling_index INTEGER NOT NULL DEFAULT 0,
                is_selected_path INTEGER NOT NULL DEFAULT 1,
                selected_text TEXT,
                selection_start INTEGER,
                selection_end INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                -- Session deletion removes the whole tree
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE,
                -- Parent deletion cascades to all descendants (no orphans)
                FOREIGN KEY (parent_id) REFERENCES nodes(id) ON DELETE CASCADE
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to create nodes table: {}", e))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS user_preferences (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL UNIQUE,
                background TEXT,
                interests TEXT,
                custom_instructions TEXT,
                preferred_model TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to create user_preferences table: {}",
                e
            ))
        })?;

        self.create_core_indexes(&conn).await?;

        Ok(())
    }

    /// Create core indexes for hierarchy and listing queries
    async fn create_core_indexes(&self, conn: &libsql::Connection) -> Result<(), DatabaseError> {
        for (name, sql) in [
            (
                "idx_nodes_session",
                "CREATE INDEX IF NOT EXISTS idx_nodes_session ON nodes(session_id)",
            ),
            (
                "idx_nodes_parent",
                "CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id)",
            ),
            (
                "idx_nodes_kind",
                "CREATE INDEX IF NOT EXISTS idx_nodes_kind ON nodes(kind)",
            ),
            (
                "idx_nodes_created",
                "CREATE INDEX IF NOT EXISTS idx_nodes_created ON nodes(created_at)",
            ),
            (
                "idx_sessions_topic",
                "CREATE INDEX IF NOT EXISTS idx_sessions_topic ON sessions(topic_id)",
            ),
            (
                "idx_sessions_updated",
                "CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at)",
            ),
        ] {
            conn.execute(sql, ()).await.map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to create index '{}': {}", name, e))
            })?;
        }
        Ok(())
    }

    //
    // NODE OPERATIONS
    //

    /// Insert a node, assigning its sibling index and selection flag atomically
    ///
    /// Runs the whole branch-insert block in one IMMEDIATE transaction so two
    /// racing inserts under the same parent cannot observe the same peer
    /// count:
    ///
    /// 1. count existing same-parent, same-kind peers
    /// 2. insert with `sibling_index = count`
    /// 3. if the kind participates in branching and peers exist, flip
    ///    selection to the new node across the whole peer group
    /// 4. if this is a root node, cache it as the session's `root_node_id`
    ///    (first root only)
    ///
    /// Returns the assigned `(sibling_index, is_selected_path)`.
    pub async fn db_create_node(
        &self,
        params: DbCreateNodeParams<'_>,
    ) -> Result<(i64, bool), DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        conn.execute("BEGIN IMMEDIATE", ()).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to begin transaction: {}", e))
        })?;

        match self.create_node_in_tx(&conn, &params).await {
            Ok(assigned) => {
                conn.execute("COMMIT", ()).await.map_err(|e| {
                    DatabaseError::sql_execution(format!("Failed to commit node insert: {}", e))
                })?;
                Ok(assigned)
            }
            Err(e) => {
                // Best effort; the connection is dropped either way.
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(e)
            }
        }
    }

    async fn create_node_in_tx(
        &self,
        conn: &libsql::Connection,
        params: &DbCreateNodeParams<'_>,
    ) -> Result<(i64, bool), DatabaseError> {
        // 1. Count existing same-parent, same-kind peers.
        let count_sql = match params.parent_id {
            Some(_) => "SELECT COUNT(*) FROM nodes WHERE parent_id = ? AND kind = ?",
            None => {
                "SELECT COUNT(*) FROM nodes WHERE session_id = ? AND parent_id IS NULL AND kind = ?"
            }
        };
        let scope = params.parent_id.unwrap_or(params.session_id);

        let mut stmt = conn.prepare(count_sql).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to prepare sibling count: {}", e))
        })?;
        let mut rows = stmt.query((scope, params.kind)).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to count siblings: {}", e))
        })?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::sql_execution(e.to_string()))?
            .ok_or_else(|| DatabaseError::sql_execution("Sibling count returned no row"))?;
        let peer_count: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::sql_execution(e.to_string()))?;

        // 2. Insert with the assigned index. Side-chat nodes and notes are
        //    never on the selected path.
        let is_selected = params.participates_in_branching;
        conn.execute(
            "INSERT INTO nodes (id, session_id, parent_id, kind, content, status, branch_name, \
             collapsed_summary, generation_config, token_count, sibling_index, is_selected_path, \
             selected_text, selection_start, selection_end, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            libsql::params![
                params.id,
                params.session_id,
                params.parent_id,
                params.kind,
                params.content,
                params.status,
                params.branch_name,
                params.collapsed_summary,
                params.generation_config,
                params.token_count,
                peer_count,
                if is_selected { 1i64 } else { 0i64 },
                params.selected_text,
                params.selection_start,
                params.selection_end,
                params.created_at,
                params.updated_at,
            ],
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to insert node: {}", e)))?;

        // 3. A branch was created: move selection to the new node.
        if is_selected && peer_count > 0 {
            self.select_in_group(conn, params.id, params.session_id, params.parent_id, params.kind, params.updated_at)
                .await?;
        }

        // 4. First root node becomes the session's cached root.
        if params.parent_id.is_none() {
            conn.execute(
                "UPDATE sessions SET root_node_id = ?, updated_at = ? \
                 WHERE id = ? AND root_node_id IS NULL",
                (params.id, params.updated_at, params.session_id),
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to cache session root: {}", e))
            })?;
        }

        Ok((peer_count, is_selected))
    }

    /// Flip `is_selected_path` to `selected_id` across its peer group
    ///
    /// One statement so the multi-row invariant (exactly one selected
    /// sibling) is restored atomically.
    async fn select_in_group(
        &self,
        conn: &libsql::Connection,
        selected_id: &str,
        session_id: &str,
        parent_id: Option<&str>,
        kind: &str,
        updated_at: &str,
    ) -> Result<u64, DatabaseError> {
        let (sql, scope) = match parent_id {
            Some(parent) => (
                "UPDATE nodes SET is_selected_path = CASE WHEN id = ? THEN 1 ELSE 0 END, \
                 updated_at = ? WHERE parent_id = ? AND kind = ?",
                parent,
            ),
            None => (
                "UPDATE nodes SET is_selected_path = CASE WHEN id = ? THEN 1 ELSE 0 END, \
                 updated_at = ? WHERE session_id = ? AND parent_id IS NULL AND kind = ?",
                session_id,
            ),
        };
        conn.execute(sql, (selected_id, updated_at, scope, kind))
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to update branch selection: {}", e))
            })
    }

    /// Select a branch: mark `selected_id` selected and its same-kind
    /// siblings unselected
    pub async fn db_select_branch(
        &self,
        selected_id: &str,
        session_id: &str,
        parent_id: Option<&str>,
        kind: &str,
        updated_at: &str,
    ) -> Result<u64, DatabaseError> {
        let conn = self.connect_with_timeout().await?;
        self.select_in_group(&conn, selected_id, session_id, parent_id, kind, updated_at)
            .await
    }

    /// Retrieve a single node row by ID
    pub async fn db_get_node(&self, id: &str) -> Result<Option<libsql::Row>, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM nodes WHERE id = ?", NODE_COLUMNS))
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to prepare get_node query: {}", e))
            })?;

        let mut rows = stmt.query([id]).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute get_node query: {}", e))
        })?;

        rows.next()
            .await
            .map_err(|e| DatabaseError::sql_execution(e.to_string()))
    }

    /// All direct children of a node, sibling order first, then creation time
    pub async fn db_children(&self, parent_id: &str) -> Result<libsql::Rows, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM nodes WHERE parent_id = ? \
                 ORDER BY sibling_index ASC, created_at ASC",
                NODE_COLUMNS
            ))
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to prepare children query: {}", e))
            })?;

        stmt.query([parent_id]).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute children query: {}", e))
        })
    }

    /// Root-level nodes of a session (parent IS NULL), creation order
    pub async fn db_root_nodes(&self, session_id: &str) -> Result<libsql::Rows, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM nodes WHERE session_id = ? AND parent_id IS NULL \
                 ORDER BY created_at ASC",
                NODE_COLUMNS
            ))
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to prepare roots query: {}", e))
            })?;

        stmt.query([session_id]).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute roots query: {}", e))
        })
    }

    /// Every node of a session in creation order
    pub async fn db_session_nodes(&self, session_id: &str) -> Result<libsql::Rows, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM nodes WHERE session_id = ? ORDER BY created_at ASC",
                NODE_COLUMNS
            ))
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to prepare session nodes query: {}",
                    e
                ))
            })?;

        stmt.query([session_id]).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute session nodes query: {}", e))
        })
    }

    /// Update node content/status/branch metadata (never structure)
    pub async fn db_update_node(
        &self,
        params: DbUpdateNodeParams<'_>,
    ) -> Result<u64, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        conn.execute(
            "UPDATE nodes SET content = ?, status = ?, branch_name = ?, collapsed_summary = ?, \
             updated_at = ? WHERE id = ?",
            (
                params.content,
                params.status,
                params.branch_name,
                params.collapsed_summary,
                params.updated_at,
                params.id,
            ),
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to update node: {}", e)))
    }

    /// Delete a node; descendants go with it via the parent_id cascade
    pub async fn db_delete_node(&self, id: &str) -> Result<u64, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        conn.execute("DELETE FROM nodes WHERE id = ?", [id])
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to delete node: {}", e)))
    }

    //
    // SESSION OPERATIONS
    //

    pub async fn db_create_session(
        &self,
        params: DbCreateSessionParams<'_>,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        conn.execute(
            "INSERT INTO sessions (id, topic_id, name, description, default_model, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                params.id,
                params.topic_id,
                params.name,
                params.description,
                params.default_model,
                params.created_at,
                params.updated_at,
            ),
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to insert session: {}", e)))?;

        Ok(())
    }

    pub async fn db_get_session(&self, id: &str) -> Result<Option<libsql::Row>, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM sessions WHERE id = ?",
                SESSION_COLUMNS
            ))
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to prepare get_session query: {}", e))
            })?;

        let mut rows = stmt.query([id]).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute get_session query: {}", e))
        })?;

        rows.next()
            .await
            .map_err(|e| DatabaseError::sql_execution(e.to_string()))
    }

    pub async fn db_update_session(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
        default_model: Option<&str>,
        updated_at: &str,
    ) -> Result<u64, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        conn.execute(
            "UPDATE sessions SET name = ?, description = ?, default_model = ?, updated_at = ? \
             WHERE id = ?",
            (name, description, default_model, updated_at, id),
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to update session: {}", e)))
    }

    pub async fn db_delete_session(&self, id: &str) -> Result<u64, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        conn.execute("DELETE FROM sessions WHERE id = ?", [id])
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to delete session: {}", e)))
    }

    /// Sessions of a topic, most recently updated first
    pub async fn db_topic_sessions(&self, topic_id: &str) -> Result<libsql::Rows, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM sessions WHERE topic_id = ? ORDER BY updated_at DESC",
                SESSION_COLUMNS
            ))
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to prepare topic sessions query: {}",
                    e
                ))
            })?;

        stmt.query([topic_id]).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute topic sessions query: {}", e))
        })
    }

    //
    // TOPIC OPERATIONS
    //

    pub async fn db_create_topic(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
        created_at: &str,
        updated_at: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        conn.execute(
            "INSERT INTO topics (id, name, description, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
            (id, name, description, created_at, updated_at),
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to insert topic: {}", e)))?;

        Ok(())
    }

    pub async fn db_get_topic(&self, id: &str) -> Result<Option<libsql::Row>, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        let mut stmt = conn
            .prepare("SELECT id, name, description, created_at, updated_at FROM topics WHERE id = ?")
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to prepare get_topic query: {}", e))
            })?;

        let mut rows = stmt.query([id]).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute get_topic query: {}", e))
        })?;

        rows.next()
            .await
            .map_err(|e| DatabaseError::sql_execution(e.to_string()))
    }

    pub async fn db_update_topic(
        &self,
        id: &str,
        name: &str,
        description: Option<&str>,
        updated_at: &str,
    ) -> Result<u64, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        conn.execute(
            "UPDATE topics SET name = ?, description = ?, updated_at = ? WHERE id = ?",
            (name, description, updated_at, id),
        )
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to update topic: {}", e)))
    }

    pub async fn db_delete_topic(&self, id: &str) -> Result<u64, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        conn.execute("DELETE FROM topics WHERE id = ?", [id])
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to delete topic: {}", e)))
    }

    pub async fn db_list_topics(&self) -> Result<libsql::Rows, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        let mut stmt = conn
            .prepare(
                "SELECT id, name, description, created_at, updated_at FROM topics \
                 ORDER BY updated_at DESC",
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to prepare topics query: {}", e))
            })?;

        stmt.query(()).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute topics query: {}", e))
        })
    }

    //
    // PREFERENCES OPERATIONS
    //

    pub async fn db_get_preferences(
        &self,
        user_id: &str,
    ) -> Result<Option<libsql::Row>, DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, background, interests, custom_instructions, preferred_model, \
                 created_at, updated_at FROM user_preferences WHERE user_id = ?",
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to prepare preferences query: {}", e))
            })?;

        let mut rows = stmt.query([user_id]).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute preferences query: {}", e))
        })?;

        rows.next()
            .await
            .map_err(|e| DatabaseError::sql_execution(e.to_string()))
    }

    /// Insert-or-update preferences keyed by user (lazy creation on first write)
    pub async fn db_upsert_preferences(
        &self,
        params: DbUpsertPreferencesParams<'_>,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        conn.execute(
            "INSERT INTO user_preferences \
             (id, user_id, background, interests, custom_instructions, preferred_model, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                 background = excluded.background,
                 interests = excluded.interests,
                 custom_instructions = excluded.custom_instructions,
                 preferred_model = excluded.preferred_model,
                 updated_at = excluded.updated_at",
            (
                params.id,
                params.user_id,
                params.background,
                params.interests,
                params.custom_instructions,
                params.preferred_model,
                params.created_at,
                params.updated_at,
            ),
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to upsert preferences: {}", e))
        })?;

        Ok(())
    }
}
