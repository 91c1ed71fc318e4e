//! Token counting
//!
//! Estimates token usage with tiktoken's cl100k_base encoding. Used for
//! the router's context-window pre-check and to fill in usage when a
//! provider omits it.

use crate::types::{ChatMessage, MessageContent};
use std::sync::LazyLock;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Global tokenizer instance (initialized once, thread-safe)
static TOKENIZER: LazyLock<CoreBPE> = LazyLock::new(|| {
    cl100k_base().expect("cl100k_base tokenizer is a compile-time constant and should never fail")
});

/// Token counter for estimating message token usage
///
/// Uses cl100k_base, which is a close estimate for most modern LLMs.
#[derive(Clone, Copy, Default)]
pub struct TokenCounter;

impl TokenCounter {
    /// Create a new token counter
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Count tokens in a string
    #[must_use]
    pub fn count_tokens(&self, text: &str) -> usize {
        TOKENIZER.encode_with_special_tokens(text).len()
    }

    /// Count tokens in a message (includes role overhead)
    #[must_use]
    pub fn count_message_tokens(&self, message: &ChatMessage) -> usize {
        // role marker + separators
        const MESSAGE_OVERHEAD: usize = 6;
        let text = match &message.content {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(_) => message.content.as_text(),
        };
        self.count_tokens(&text) + MESSAGE_OVERHEAD
    }

    /// Count total tokens in a conversation
    #[must_use]
    pub fn count_conversation_tokens(&self, messages: &[ChatMessage]) -> usize {
        const CONVERSATION_OVERHEAD: usize = 3;
        messages
            .iter()
            .map(|m| self.count_message_tokens(m))
            .sum::<usize>()
            + CONVERSATION_OVERHEAD
    }
}

/// Convenience function to count tokens in text
#[must_use]
pub fn count_tokens(text: &str) -> usize {
    TokenCounter::new().count_tokens(text)
}

/// Convenience function to count tokens across messages
#[must_use]
pub fn count_message_tokens(messages: &[ChatMessage]) -> usize {
    TokenCounter::new().count_conversation_tokens(messages)
}
