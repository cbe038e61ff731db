//! Completion Provider Abstraction
//!
//! The orchestration layer talks to model backends through
//! [`CompletionProvider`]; wire-level HTTP clients implement it per
//! provider. Streaming hands back a channel of token results so the caller
//! can forward them without knowing the transport.

use crate::services::context::ChatMessage;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum ProviderError {
    /// The provider rejected the request or could not be reached.
    #[error("Provider request failed: {0}")]
    Request(String),

    /// The stream broke after generation started.
    #[error("Provider stream interrupted: {0}")]
    Stream(String),
}

/// One generation request, already fully resolved (model, sampling, context).
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: i64,
}

/// A model backend capable of turning a message list into text.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Generate the full completion in one call.
    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError>;

    /// Generate a streamed completion.
    ///
    /// A successful return means generation started; individual items may
    /// still carry a mid-stream error, after which the channel closes.
    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<Result<String, ProviderError>>, ProviderError>;
}

/// Scripted provider for tests: replays canned token sequences and can fail
/// before or during a stream.
#[cfg(test)]
pub struct ScriptedProvider {
    replies: std::sync::Mutex<std::collections::VecDeque<ScriptedReply>>,
    pub requests: std::sync::Mutex<Vec<CompletionRequest>>,
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Stream these tokens, then finish cleanly.
    Tokens(Vec<String>),
    /// Fail before any token is produced.
    FailBeforeStart(String),
    /// Stream these tokens, then fail mid-stream.
    FailAfter(Vec<String>, String),
}

#[cfg(test)]
impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies.into()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn next_reply(&self, request: &CompletionRequest) -> ScriptedReply {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::Tokens(vec!["ok".to_string()]))
    }
}

#[cfg(test)]
#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError> {
        match self.next_reply(&request) {
            ScriptedReply::Tokens(tokens) => Ok(tokens.concat()),
            ScriptedReply::FailBeforeStart(msg) => Err(ProviderError::Request(msg)),
            ScriptedReply::FailAfter(_, msg) => Err(ProviderError::Stream(msg)),
        }
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<Result<String, ProviderError>>, ProviderError> {
        let reply = self.next_reply(&request);
        let (tokens, failure) = match reply {
            ScriptedReply::Tokens(tokens) => (tokens, None),
            ScriptedReply::FailBeforeStart(msg) => return Err(ProviderError::Request(msg)),
            ScriptedReply::FailAfter(tokens, msg) => (tokens, Some(msg)),
        };

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for token in tokens {
                if tx.send(Ok(token)).await.is_err() {
                    return;
                }
            }
            if let Some(msg) = failure {
                let _ = tx.send(Err(ProviderError::Stream(msg))).await;
            }
        });
        Ok(rx)
    }
}
