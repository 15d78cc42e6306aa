//! Conversation messages — the lingua franca between scratchpad, loop, and
//! model clients.

use serde::{Deserialize, Serialize};

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message (instructions).
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Role-less content, e.g. synthetic summaries injected by compaction.
    Generic,
}

/// A single content part within a message.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// Opaque binary content (base64-encoded).
    Binary {
        /// MIME type of the payload.
        media_type: String,
        /// Base64-encoded data.
        data: String,
    },
}

impl ContentPart {
    /// Create a text part.
    pub fn text(s: impl Into<String>) -> Self {
        ContentPart::Text { text: s.into() }
    }

    /// The text of this part, if it is textual.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A message in the conversation presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message author.
    pub role: Role,
    /// Content parts of the message.
    pub content: Vec<ContentPart>,
}

impl Message {
    /// Create a single-part text message.
    pub fn text(role: Role, s: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::text(s)],
        }
    }

    /// Create a message from pre-built parts.
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self { role, content }
    }

    /// Concatenate the text parts of this message, dropping binary parts.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
