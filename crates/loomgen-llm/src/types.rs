use serde::{Deserialize, Serialize};

use loomgen_types::{LoomError, Result};

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

// ---------------------------------------------------------------------------
// ChatMessage / Conversation
// ---------------------------------------------------------------------------

/// One role/content turn of a conversation. Serializes to the
/// `{"role": ..., "content": ...}` shape chat-completion backends expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// An ordered sequence of turns sent to a generation backend. Treated as
/// immutable once handed to an adapter call.
pub type Conversation = Vec<ChatMessage>;

// ---------------------------------------------------------------------------
// GenerationParams
// ---------------------------------------------------------------------------

/// Numeric generation knobs passed alongside a conversation.
///
/// Defaults mirror the common chat-completion defaults: 128 new tokens,
/// no penalties, temperature 1.0, top_p 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_new_tokens: u32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            temperature: 1.0,
            top_p: 1.0,
        }
    }
}

impl GenerationParams {
    /// Check that every numeric field lies in its documented range.
    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            return Err(LoomError::Other(
                "max_new_tokens must be at least 1".into(),
            ));
        }
        if self.temperature < 0.0 {
            return Err(LoomError::Other(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(LoomError::Other(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
