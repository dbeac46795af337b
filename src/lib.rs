//! Budget Chat Agent
//!
//! A conversational personal-finance assistant that:
//! - Records expenses and reports spending against budgets
//! - Lets a language model pick which finance operation to run next
//! - Runs operations deterministically (the model never touches the store)
//! - Persists transactions and budgets in Postgres
//! - Bounds every turn by round count, timeouts and a deadline
//!
//! DISPATCH LOOP:
//! USER → PLANNING → EXECUTING → PLANNING → ... → ANSWER

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod gemini;
pub mod memory;
pub mod models;
pub mod oracle;
pub mod store;
pub mod tools;

pub use error::Result;

// Re-export common types
pub use agent::{Agent, TurnOutcome, COULD_NOT_COMPLETE};
pub use config::{AgentConfig, LoopLimits};
pub use error::OrchestrationError;
pub use memory::{ConversationState, SessionStore};
pub use models::*;
pub use oracle::{DecisionOracle, GeminiOracle, ScriptedOracle};
pub use store::{FinanceStore, InMemoryFinanceStore, PgFinanceStore};
