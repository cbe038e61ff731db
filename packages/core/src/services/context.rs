//! Context Assembly
//!
//! Pure functions that turn a resolved tree path into the message list sent
//! to a completion provider. No I/O here; callers load nodes and
//! preferences first.
//!
//! Collapsed nodes contribute their summary instead of their full content,
//! and user notes ride along as system messages so the model sees them
//! without treating them as conversation turns.

use crate::models::{Node, NodeKind, NodeStatus, UserPreferences};
use serde::{Deserialize, Serialize};

/// Role of a chat message, provider-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message in a provider request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

const PERSONA: &str = "You are a helpful AI assistant for brainstorming and learning.
You are part of a branching conversation system where the user can explore
multiple lines of thinking. Stay focused on the current branch's topic.

When relevant context from other conversations is provided, use it to give
more informed and consistent responses, but don't explicitly reference
\"previous conversations\" unless directly relevant.";

/// How many recent main-path turns a side chat sees.
const SIDE_CHAT_MAIN_WINDOW: usize = 5;

/// Per-turn excerpt length in the side-chat digest.
const DIGEST_EXCERPT_CHARS: usize = 200;

/// Truncate on a char boundary, appending "..." when anything was cut.
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{}...", cut)
}

/// Build the system preamble: persona plus whatever the user has told us
/// about themselves.
fn system_preamble(preferences: Option<&UserPreferences>) -> String {
    let mut preamble = PERSONA.to_string();

    if let Some(prefs) = preferences {
        if !prefs.is_empty() {
            let mut about = String::from("About the user:");
            if let Some(background) = &prefs.background {
                about.push_str(&format!("\n- Background: {}", background));
            }
            if let Some(interests) = &prefs.interests {
                about.push_str(&format!("\n- Interests: {}", interests));
            }
            preamble.push_str("\n\n");
            preamble.push_str(&about);

            if let Some(instructions) = &prefs.custom_instructions {
                preamble.push_str("\n\n");
                preamble.push_str(instructions);
            }
        }
    }

    preamble
}

/// Map one path node to its context message, or `None` if the node
/// contributes nothing (only messages and notes enter main context).
fn node_message(node: &Node) -> Option<ChatMessage> {
    // A collapsed branch with a summary contributes the summary, never its
    // content. Without a summary the node falls through to kind handling.
    if node.status == NodeStatus::Collapsed {
        if let Some(summary) = node.collapsed_summary.as_deref() {
            return Some(ChatMessage::assistant(format!(
                "[Previous discussion summary: {}]",
                summary
            )));
        }
    }

    match node.kind {
        NodeKind::UserMessage => Some(ChatMessage::user(node.content.clone())),
        NodeKind::AssistantMessage => Some(ChatMessage::assistant(node.content.clone())),
        NodeKind::UserNote => Some(ChatMessage::system(format!(
            "[User note: {}]",
            node.content
        ))),
        NodeKind::BranchSummary
        | NodeKind::System
        | NodeKind::SideChatUser
        | NodeKind::SideChatAssistant => None,
    }
}

/// Assemble the message list for a main-path turn.
///
/// `path` is the resolved root-to-parent path (notes interleaved by the
/// caller); `new_user_text` becomes the final user message.
pub fn build_main_context(
    path: &[Node],
    new_user_text: &str,
    preferences: Option<&UserPreferences>,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_preamble(preferences))];
    messages.extend(path.iter().filter_map(node_message));
    messages.push(ChatMessage::user(new_user_text));
    messages
}

/// Assemble the message list for a side-chat turn.
///
/// `anchor_text` distinguishes an anchored discussion (about a highlighted
/// span) from a general tangent. Anchored threads only see the recent main
/// conversation when `include_main_context` asks for it; general threads
/// always do.
pub fn build_side_chat_context(
    main_path: &[Node],
    side_history: &[Node],
    new_user_text: &str,
    anchor_text: Option<&str>,
    include_main_context: bool,
    preferences: Option<&UserPreferences>,
) -> Vec<ChatMessage> {
    let mut preamble = system_preamble(preferences);
    match anchor_text {
        Some(text) => {
            preamble.push_str(&format!(
                "\n\nThe user has highlighted this text from the assistant's response:\n\
                 \"{}\"\n\n\
                 They want to discuss it in a side conversation. Keep the discussion \
                 focused on the highlighted text and its immediate context.",
                text
            ));
        }
        None => {
            preamble.push_str(
                "\n\nThe user has opened a general side discussion about the assistant's \
                 response. Keep it focused on that response without derailing the main \
                 conversation.",
            );
        }
    }
    let mut messages = vec![ChatMessage::system(preamble)];

    if anchor_text.is_none() || include_main_context {
        if let Some(digest) = main_context_digest(main_path) {
            messages.push(ChatMessage::system(digest));
        }
    }

    for node in side_history {
        match node.kind {
            NodeKind::SideChatUser => messages.push(ChatMessage::user(node.content.clone())),
            NodeKind::SideChatAssistant => {
                messages.push(ChatMessage::assistant(node.content.clone()))
            }
            _ => {}
        }
    }

    messages.push(ChatMessage::user(new_user_text));
    messages
}

/// Short digest of the recent main conversation for side-chat preambles.
fn main_context_digest(main_path: &[Node]) -> Option<String> {
    let recent: Vec<&Node> = main_path
        .iter()
        .filter(|n| n.kind.participates_in_branching())
        .collect();
    if recent.is_empty() {
        return None;
    }

    let start = recent.len().saturating_sub(SIDE_CHAT_MAIN_WINDOW);
    let lines: Vec<String> = recent[start..]
        .iter()
        .map(|n| {
            let speaker = match n.kind {
                NodeKind::UserMessage => "User",
                _ => "Assistant",
            };
            format!("{}: {}", speaker, truncate(&n.content, DIGEST_EXCERPT_CHARS))
        })
        .collect();

    Some(format!(
        "Recent main conversation:\n{}",
        lines.join("\n")
    ))
}

/// Short preview of a thread's first message, for thread listings.
pub fn thread_preview(content: &str) -> String {
    truncate(content, 100)
}
