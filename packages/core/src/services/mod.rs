//! Service Layer
//!
//! Business logic over the database layer: tree operations in
//! [`tree_service`], turn orchestration in [`chat_service`], pure context
//! assembly in [`context`], and the model registry in [`models`]. Provider
//! backends plug in through [`provider::CompletionProvider`].

pub mod chat_service;
pub mod context;
pub mod error;
pub mod models;
pub mod provider;
pub mod tree_service;

pub use chat_service::{ChatEvent, ChatService, SideChatTurnRequest, TurnRequest, TurnResult};
pub use context::{build_main_context, build_side_chat_context, ChatMessage, ChatRole};
pub use error::ChatServiceError;
pub use models::{
    provider_for, resolve_model, ModelInfo, AVAILABLE_MODELS, DEFAULT_MAX_TOKENS, DEFAULT_MODEL,
    DEFAULT_TEMPERATURE,
};
pub use provider::{CompletionProvider, CompletionRequest, ProviderError};
pub use tree_service::{SideChatFilter, SideChatThread, TreeService};
