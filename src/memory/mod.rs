//! Conversation memory
//!
//! Conversation state carried through the dispatch loop, plus a session
//! map for callers that keep conversations between requests.

pub mod conversation;
pub mod sessions;

pub use conversation::{
    BudgetSnapshot, ConversationMessage, ConversationState, MessageRole, ALL_CATEGORY,
};
pub use sessions::{SessionStore, DEFAULT_MAX_SESSIONS};
