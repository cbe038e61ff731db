//! Chat Service
//!
//! Orchestrates a conversation turn end to end: resolve the model, assemble
//! context, and run the two-phase commit around the provider call.
//!
//! # Two-phase turns
//!
//! The user's message is persisted *before* the provider is contacted, so a
//! provider failure never loses user input. The assistant's message is
//! persisted only after generation finishes, through the tree service on a
//! fresh store call that depends only on owned data; a persistence failure
//! at that point surfaces as a terminal error event and leaves the user
//! node intact.

use crate::models::{GenerationConfig, Node, NodeKind, SideChatAnchor, UserPreferences};
use crate::services::context::{build_main_context, build_side_chat_context, ChatMessage};
use crate::services::error::ChatServiceError;
use crate::services::models::{
    provider_for, resolve_model, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
};
use crate::services::provider::{CompletionProvider, CompletionRequest};
use crate::services::tree_service::{SideChatFilter, TreeService};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, ChatServiceError>;

/// Events emitted over a streaming turn, in order: `UserNode` once, `Token`
/// zero or more times, then exactly one of `Complete` or `Error`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// The user's message was committed (phase one).
    UserNode { node: Node },
    Token { token: String },
    /// The assistant's message was generated and persisted.
    Complete { node: Node },
    Error { message: String },
}

/// A main-path turn request.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    /// Node to branch from; `None` starts the conversation.
    pub parent_id: Option<String>,
    pub content: String,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
    /// Whose preferences to inject, if known.
    pub user_id: Option<String>,
}

/// A side-chat turn request, anchored or general.
#[derive(Debug, Clone)]
pub struct SideChatTurnRequest {
    pub session_id: String,
    /// Main-path node the thread hangs off.
    pub parent_id: String,
    pub content: String,
    pub anchor: SideChatAnchor,
    /// Anchored threads only see the recent main conversation when asked;
    /// general threads always do.
    pub include_main_context: bool,
    pub model: Option<String>,
    pub user_id: Option<String>,
}

/// Outcome of a non-streaming turn.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    pub user_node: Node,
    pub assistant_node: Node,
}

/// What to persist once generation finishes.
struct AssistantSpec {
    session_id: String,
    parent_id: String,
    kind: NodeKind,
    anchor: Option<SideChatAnchor>,
    config: GenerationConfig,
}

pub struct ChatService {
    tree: Arc<TreeService>,
    provider: Arc<dyn CompletionProvider>,
}

impl ChatService {
    pub fn new(tree: Arc<TreeService>, provider: Arc<dyn CompletionProvider>) -> Self {
        Self { tree, provider }
    }

    async fn load_preferences(&self, user_id: Option<&str>) -> Result<Option<UserPreferences>> {
        match user_id {
            Some(id) => self.tree.get_preferences(id).await,
            None => Ok(None),
        }
    }

    /// Resolve model and sampling parameters for a turn.
    async fn generation_config(
        &self,
        session_id: &str,
        request_model: Option<&str>,
        temperature: Option<f64>,
        max_tokens: Option<i64>,
        preferences: Option<&UserPreferences>,
    ) -> Result<GenerationConfig> {
        let session = self.tree.get_session(session_id).await?;
        let model = resolve_model(
            request_model,
            session.default_model.as_deref(),
            preferences.and_then(|p| p.preferred_model.as_deref()),
        );
        Ok(GenerationConfig {
            provider: provider_for(&model).to_string(),
            model,
            temperature: temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        })
    }

    /// Root-to-parent path with each node's note interleaved after it.
    async fn path_with_notes(&self, parent_id: &str) -> Result<Vec<Node>> {
        let path = self.tree.resolve_path(parent_id).await?;
        let mut with_notes = Vec::with_capacity(path.len());
        for node in path {
            let note = self.tree.get_note(&node.id).await?;
            with_notes.push(node);
            if let Some(note) = note {
                with_notes.push(note);
            }
        }
        Ok(with_notes)
    }

    /// Phase one plus context assembly for a main-path turn.
    async fn prepare_turn(
        &self,
        request: &TurnRequest,
    ) -> Result<(Node, Vec<ChatMessage>, GenerationConfig)> {
        let preferences = self.load_preferences(request.user_id.as_deref()).await?;
        let config = self
            .generation_config(
                &request.session_id,
                request.model.as_deref(),
                request.temperature,
                request.max_tokens,
                preferences.as_ref(),
            )
            .await?;

        let path = match &request.parent_id {
            Some(parent_id) => self.path_with_notes(parent_id).await?,
            None => Vec::new(),
        };
        let messages = build_main_context(&path, &request.content, preferences.as_ref());

        // Phase one: the user's message is durable before any provider call.
        let user_node = self
            .tree
            .create_node(Node::user_message(
                &request.session_id,
                request.parent_id.clone(),
                &request.content,
            ))
            .await?;
        debug!(user_node_id = %user_node.id, model = %config.model, "committed user turn");

        Ok((user_node, messages, config))
    }

    /// Run a complete turn without streaming.
    ///
    /// The user node survives a provider failure; the assistant node exists
    /// only on success.
    pub async fn create_turn(&self, request: TurnRequest) -> Result<TurnResult> {
        let (user_node, messages, config) = self.prepare_turn(&request).await?;

        let text = self
            .provider
            .complete(CompletionRequest {
                messages,
                model: config.model.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            })
            .await
            .map_err(|e| ChatServiceError::provider(e.to_string()))?;

        let assistant_node = self
            .tree
            .create_node(Node::assistant_message(
                &request.session_id,
                Some(user_node.id.clone()),
                text,
                config,
            ))
            .await?;

        Ok(TurnResult {
            user_node,
            assistant_node,
        })
    }

    /// Run a streaming main-path turn.
    ///
    /// Setup errors (unknown session or parent) fail the call itself;
    /// everything after phase one arrives as events.
    pub async fn create_turn_stream(
        &self,
        request: TurnRequest,
    ) -> Result<ReceiverStream<ChatEvent>> {
        let (user_node, messages, config) = self.prepare_turn(&request).await?;

        let assistant_spec = AssistantSpec {
            session_id: request.session_id,
            parent_id: user_node.id.clone(),
            kind: NodeKind::AssistantMessage,
            anchor: None,
            config,
        };
        Ok(self.spawn_stream(user_node, messages, assistant_spec))
    }

    /// Run a streaming side-chat turn.
    pub async fn create_side_chat_turn_stream(
        &self,
        request: SideChatTurnRequest,
    ) -> Result<ReceiverStream<ChatEvent>> {
        let preferences = self.load_preferences(request.user_id.as_deref()).await?;
        let config = self
            .generation_config(
                &request.session_id,
                request.model.as_deref(),
                None,
                None,
                preferences.as_ref(),
            )
            .await?;

        let main_path = self.path_with_notes(&request.parent_id).await?;
        let filter = match &request.anchor.selected_text {
            Some(text) => SideChatFilter::Anchored(text.clone()),
            None => SideChatFilter::General,
        };
        let side_history = self
            .tree
            .list_side_chat_messages(&request.parent_id, filter)
            .await?;

        let messages = build_side_chat_context(
            &main_path,
            &side_history,
            &request.content,
            request.anchor.selected_text.as_deref(),
            request.include_main_context,
            preferences.as_ref(),
        );

        let user_node = self
            .tree
            .create_node(Node::side_chat(
                NodeKind::SideChatUser,
                &request.session_id,
                &request.parent_id,
                &request.content,
                request.anchor.clone(),
            ))
            .await?;
        debug!(user_node_id = %user_node.id, "committed side-chat turn");

        let assistant_spec = AssistantSpec {
            session_id: request.session_id,
            parent_id: request.parent_id,
            kind: NodeKind::SideChatAssistant,
            anchor: Some(request.anchor),
            config,
        };
        Ok(self.spawn_stream(user_node, messages, assistant_spec))
    }

    /// Phase two and three on a background task; the returned stream yields
    /// events as they happen.
    fn spawn_stream(
        &self,
        user_node: Node,
        messages: Vec<ChatMessage>,
        assistant_spec: AssistantSpec,
    ) -> ReceiverStream<ChatEvent> {
        let (tx, rx) = mpsc::channel(32);
        let tree = Arc::clone(&self.tree);
        let provider = Arc::clone(&self.provider);

        tokio::spawn(async move {
            run_stream(tree, provider, tx, user_node, messages, assistant_spec).await;
        });

        ReceiverStream::new(rx)
    }

    /// Regenerate an assistant response as a new sibling branch.
    ///
    /// The original node keeps its content and loses path selection; the
    /// regenerated node is a fresh sibling under the same user message and
    /// becomes the selected path. The original's recorded model is reused
    /// when present.
    pub async fn regenerate(&self, assistant_node_id: &str) -> Result<Node> {
        let node = self.tree.get_node(assistant_node_id).await?;
        if node.kind != NodeKind::AssistantMessage {
            return Err(ChatServiceError::invalid_operation(format!(
                "only assistant messages can be regenerated, got '{}'",
                node.kind.as_str()
            )));
        }
        let parent_id = node.parent_id.clone().ok_or_else(|| {
            ChatServiceError::invalid_operation("cannot regenerate a root assistant message")
        })?;

        let path = self.path_with_notes(&parent_id).await?;
        let parent_pos = path
            .iter()
            .position(|n| n.id == parent_id)
            .ok_or_else(|| ChatServiceError::node_not_found(&parent_id))?;
        let parent = &path[parent_pos];
        if parent.kind != NodeKind::UserMessage {
            return Err(ChatServiceError::invalid_operation(
                "assistant message is not attached to a user message",
            ));
        }
        let messages = build_main_context(&path[..parent_pos], &parent.content, None);

        let config = match &node.generation_config {
            Some(original) => original.clone(),
            None => {
                self.generation_config(&node.session_id, None, None, None, None)
                    .await?
            }
        };

        let text = self
            .provider
            .complete(CompletionRequest {
                messages,
                model: config.model.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            })
            .await
            .map_err(|e| ChatServiceError::provider(e.to_string()))?;

        // New sibling takes over path selection at insert time.
        let regenerated = self
            .tree
            .create_node(Node::assistant_message(
                &node.session_id,
                Some(parent_id),
                text,
                config,
            ))
            .await?;
        debug!(
            original = assistant_node_id,
            regenerated = %regenerated.id,
            "regenerated assistant response"
        );
        Ok(regenerated)
    }
}

/// Stream tokens from the provider, then persist the assistant node.
///
/// Event send failures mean the consumer is gone; accumulated text is still
/// persisted so the turn survives a dropped connection.
async fn run_stream(
    tree: Arc<TreeService>,
    provider: Arc<dyn CompletionProvider>,
    tx: mpsc::Sender<ChatEvent>,
    user_node: Node,
    messages: Vec<ChatMessage>,
    assistant_spec: AssistantSpec,
) {
    let _ = tx
        .send(ChatEvent::UserNode {
            node: user_node.clone(),
        })
        .await;

    let request = CompletionRequest {
        messages,
        model: assistant_spec.config.model.clone(),
        temperature: assistant_spec.config.temperature,
        max_tokens: assistant_spec.config.max_tokens,
    };

    let mut tokens = match provider.complete_stream(request).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(user_node_id = %user_node.id, error = %e, "provider rejected stream");
            let _ = tx
                .send(ChatEvent::Error {
                    message: e.to_string(),
                })
                .await;
            return;
        }
    };

    let mut accumulated = String::new();
    let mut consumer_gone = false;
    while let Some(item) = tokens.recv().await {
        match item {
            Ok(token) => {
                accumulated.push_str(&token);
                if !consumer_gone
                    && tx
                        .send(ChatEvent::Token {
                            token: token.clone(),
                        })
                        .await
                        .is_err()
                {
                    // Keep draining so the full response gets persisted.
                    consumer_gone = true;
                }
            }
            Err(e) => {
                warn!(user_node_id = %user_node.id, error = %e, "provider stream failed");
                let _ = tx
                    .send(ChatEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        }
    }

    let assistant = match assistant_spec.anchor {
        Some(anchor) => Node::side_chat(
            assistant_spec.kind,
            assistant_spec.session_id,
            assistant_spec.parent_id,
            accumulated,
            anchor,
        ),
        None => Node::assistant_message(
            assistant_spec.session_id,
            Some(assistant_spec.parent_id),
            accumulated,
            assistant_spec.config,
        ),
    };

    // Phase three: persistence failure must not look like a lost user turn.
    match tree.create_node(assistant).await {
        Ok(node) => {
            let _ = tx.send(ChatEvent::Complete { node }).await;
        }
        Err(e) => {
            warn!(user_node_id = %user_node.id, error = %e, "failed to persist assistant node");
            let _ = tx
                .send(ChatEvent::Error {
                    message: format!("failed to persist assistant response: {}", e),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseService, TursoTreeStore};
    use crate::models::SessionUpdate;
    use crate::services::provider::{ScriptedProvider, ScriptedReply};
    use tempfile::TempDir;
    use tokio_stream::StreamExt;

    struct Fixture {
        _dir: TempDir,
        tree: Arc<TreeService>,
        provider: Arc<ScriptedProvider>,
        chat: ChatService,
        session_id: String,
    }

    async fn setup(replies: Vec<ScriptedReply>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = DatabaseService::new(dir.path().join("test.db")).await.unwrap();
        let store = Arc::new(TursoTreeStore::new(Arc::new(db)));
        let tree = Arc::new(TreeService::new(store));
        let provider = Arc::new(ScriptedProvider::new(replies));
        let chat = ChatService::new(
            Arc::clone(&tree),
            Arc::clone(&provider) as Arc<dyn CompletionProvider>,
        );

        let topic = tree.create_topic("Topic", None).await.unwrap();
        let session = tree
            .create_session(&topic.id, "Session", None, None)
            .await
            .unwrap();

        Fixture {
            _dir: dir,
            tree,
            provider,
            chat,
            session_id: session.id,
        }
    }

    fn turn(session_id: &str, parent_id: Option<String>, content: &str) -> TurnRequest {
        TurnRequest {
            session_id: session_id.to_string(),
            parent_id,
            content: content.to_string(),
            model: None,
            temperature: None,
            max_tokens: None,
            user_id: None,
        }
    }

    #[tokio::test]
    async fn turn_persists_both_nodes() {
        let fx = setup(vec![ScriptedReply::Tokens(vec![
            "Hel".to_string(),
            "lo".to_string(),
        ])])
        .await;

        let result = fx
            .chat
            .create_turn(turn(&fx.session_id, None, "Hi"))
            .await
            .unwrap();

        assert_eq!(result.user_node.content, "Hi");
        assert_eq!(result.assistant_node.content, "Hello");
        assert_eq!(
            result.assistant_node.parent_id.as_deref(),
            Some(result.user_node.id.as_str())
        );
        assert!(result.assistant_node.is_selected_path);

        let config = result.assistant_node.generation_config.unwrap();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.temperature, 0.7);
    }

    #[tokio::test]
    async fn provider_failure_keeps_user_node() {
        let fx = setup(vec![ScriptedReply::FailBeforeStart(
            "model overloaded".to_string(),
        )])
        .await;

        let err = fx
            .chat
            .create_turn(turn(&fx.session_id, None, "Hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatServiceError::Provider { .. }));

        // Phase one already committed: the user's message survived.
        let tree = fx.tree.list_session_tree(&fx.session_id).await.unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].content, "Hi");
        assert_eq!(tree[0].kind, NodeKind::UserMessage);
    }

    #[tokio::test]
    async fn stream_emits_events_in_order() {
        let fx = setup(vec![ScriptedReply::Tokens(vec![
            "Hel".to_string(),
            "lo".to_string(),
        ])])
        .await;

        let mut stream = fx
            .chat
            .create_turn_stream(turn(&fx.session_id, None, "Hi"))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], ChatEvent::UserNode { node } if node.content == "Hi"));
        assert!(matches!(&events[1], ChatEvent::Token { token } if token == "Hel"));
        assert!(matches!(&events[2], ChatEvent::Token { token } if token == "lo"));
        let complete = match &events[3] {
            ChatEvent::Complete { node } => node.clone(),
            other => panic!("expected Complete, got {:?}", other),
        };
        assert_eq!(complete.content, "Hello");

        let persisted = fx.tree.get_node(&complete.id).await.unwrap();
        assert_eq!(persisted.content, "Hello");
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_error_event() {
        let fx = setup(vec![ScriptedReply::FailAfter(
            vec!["par".to_string(), "tial".to_string()],
            "connection reset".to_string(),
        )])
        .await;

        let mut stream = fx
            .chat
            .create_turn_stream(turn(&fx.session_id, None, "Hi"))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        assert!(matches!(events.last(), Some(ChatEvent::Error { .. })));

        // No assistant node was persisted; only the user turn remains.
        let tree = fx.tree.list_session_tree(&fx.session_id).await.unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].kind, NodeKind::UserMessage);
    }

    #[tokio::test]
    async fn regenerate_creates_selected_sibling() {
        let fx = setup(vec![
            ScriptedReply::Tokens(vec!["Hello".to_string()]),
            ScriptedReply::Tokens(vec!["Hello again".to_string()]),
        ])
        .await;

        let first = fx
            .chat
            .create_turn(turn(&fx.session_id, None, "Hi"))
            .await
            .unwrap();

        let regenerated = fx.chat.regenerate(&first.assistant_node.id).await.unwrap();
        assert_eq!(regenerated.content, "Hello again");
        assert_eq!(regenerated.sibling_index, 1);
        assert!(regenerated.is_selected_path);

        // The original answer still exists but is off the selected path.
        let original = fx.tree.get_node(&first.assistant_node.id).await.unwrap();
        assert_eq!(original.content, "Hello");
        assert!(!original.is_selected_path);

        // Selecting the original flips the path back.
        fx.tree.select_branch(&original.id).await.unwrap();
        let original = fx.tree.get_node(&original.id).await.unwrap();
        let regenerated = fx.tree.get_node(&regenerated.id).await.unwrap();
        assert!(original.is_selected_path);
        assert!(!regenerated.is_selected_path);
    }

    #[tokio::test]
    async fn regenerate_rejects_user_messages() {
        let fx = setup(vec![ScriptedReply::Tokens(vec!["Hello".to_string()])]).await;
        let result = fx
            .chat
            .create_turn(turn(&fx.session_id, None, "Hi"))
            .await
            .unwrap();

        let err = fx.chat.regenerate(&result.user_node.id).await.unwrap_err();
        assert!(matches!(err, ChatServiceError::InvalidOperation { .. }));
    }

    #[tokio::test]
    async fn regenerate_reuses_recorded_model() {
        let fx = setup(vec![
            ScriptedReply::Tokens(vec!["Hello".to_string()]),
            ScriptedReply::Tokens(vec!["Hello again".to_string()]),
        ])
        .await;

        let mut request = turn(&fx.session_id, None, "Hi");
        request.model = Some("claude-sonnet-4-20250514".to_string());
        let result = fx.chat.create_turn(request).await.unwrap();

        fx.chat.regenerate(&result.assistant_node.id).await.unwrap();

        let requests = fx.provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].model, "claude-sonnet-4-20250514");
    }

    #[tokio::test]
    async fn session_default_model_applies() {
        let fx = setup(vec![ScriptedReply::Tokens(vec!["Hello".to_string()])]).await;
        fx.tree
            .update_session(
                &fx.session_id,
                SessionUpdate {
                    default_model: Some("gemini-2.0-flash".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let result = fx
            .chat
            .create_turn(turn(&fx.session_id, None, "Hi"))
            .await
            .unwrap();

        let config = result.assistant_node.generation_config.unwrap();
        assert_eq!(config.model, "gemini-2.0-flash");
        assert_eq!(config.provider, "gemini");

        let requests = fx.provider.requests.lock().unwrap();
        assert_eq!(requests[0].model, "gemini-2.0-flash");
    }

    #[tokio::test]
    async fn side_chat_stream_persists_anchored_pair() {
        let fx = setup(vec![
            ScriptedReply::Tokens(vec!["Hello".to_string()]),
            ScriptedReply::Tokens(vec!["It means ownership.".to_string()]),
        ])
        .await;

        let main = fx
            .chat
            .create_turn(turn(&fx.session_id, None, "Explain Rust"))
            .await
            .unwrap();

        let anchor = SideChatAnchor {
            selected_text: Some("ownership".to_string()),
            selection_start: Some(0),
            selection_end: Some(9),
        };
        let mut stream = fx
            .chat
            .create_side_chat_turn_stream(SideChatTurnRequest {
                session_id: fx.session_id.clone(),
                parent_id: main.assistant_node.id.clone(),
                content: "what is this?".to_string(),
                anchor: anchor.clone(),
                include_main_context: false,
                model: None,
                user_id: None,
            })
            .await
            .unwrap();

        let mut complete = None;
        while let Some(event) = stream.next().await {
            if let ChatEvent::Complete { node } = event {
                complete = Some(node);
            }
        }
        let assistant = complete.unwrap();
        assert_eq!(assistant.kind, NodeKind::SideChatAssistant);
        assert_eq!(assistant.selected_text.as_deref(), Some("ownership"));
        assert!(!assistant.is_selected_path);

        // The provider saw the anchored preamble.
        let requests = fx.provider.requests.lock().unwrap();
        let preamble = &requests[1].messages[0].content;
        assert!(preamble.contains("\"ownership\""));
        assert!(preamble.contains("highlighted"));
    }

    #[tokio::test]
    async fn notes_enter_turn_context() {
        let fx = setup(vec![
            ScriptedReply::Tokens(vec!["Hello".to_string()]),
            ScriptedReply::Tokens(vec!["Noted.".to_string()]),
        ])
        .await;

        let first = fx
            .chat
            .create_turn(turn(&fx.session_id, None, "Hi"))
            .await
            .unwrap();
        fx.tree
            .upsert_note(&first.assistant_node.id, "answer in French next")
            .await
            .unwrap();

        fx.chat
            .create_turn(turn(
                &fx.session_id,
                Some(first.assistant_node.id.clone()),
                "Continue",
            ))
            .await
            .unwrap();

        let requests = fx.provider.requests.lock().unwrap();
        assert!(requests[1]
            .messages
            .iter()
            .any(|m| m.content == "[User note: answer in French next]"));
    }
}
