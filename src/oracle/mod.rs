//! Decision oracle trait and implementations
//!
//! The oracle reads the conversation and either answers or names the
//! operations to run next. It is injected into the agent so tests can
//! swap in a deterministic script.

use crate::error::OrchestrationError;
use crate::memory::{ConversationMessage, ConversationState, MessageRole};
use crate::models::{Decision, DATE_FORMAT};
use crate::tools::OperationSpec;
use crate::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::VecDeque;
use std::sync::Mutex;

pub mod gemini;
pub use gemini::GeminiOracle;

/// Everything the oracle sees for one decision
pub struct OracleRequest<'a> {
    pub system_instruction: String,
    pub conversation: &'a ConversationState,
    pub catalog: &'a [OperationSpec],
}

/// Trait for next-step decisions (LLM controlled)
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide(&self, request: &OracleRequest<'_>) -> Result<Decision>;
}

/// Fixed instruction naming the assistant, today's date and the session.
pub fn build_system_instruction(session_id: &str, today: NaiveDate) -> String {
    format!(
        "You are a helpful financial assistant named MakwentaBot. \
         Today's date is {}. \
         Your thread_id is {}. \
         You have tools to record expenses, check budgets, retrieve past reports, and set new budgets. \
         1. If the user says 'Set my weekly budget to 5000', use 'set_budget' with amount=5000 and period='weekly'. \
         2. If the user wants to record a transaction, use 'record_transaction', then ALWAYS follow up with 'check_budget'. \
         3. If the user asks for expenses on a specific day (e.g., 'yesterday', 'last Friday', 'Dec 3'), \
         calculate the correct 'YYYY-MM-DD' date relative to today's date and use 'list_expenses_by_date'. \
         4. For a weekly overview, use 'daily_summary'. \
         Do NOT invent data. If the tool returns 'No expenses found', tell the user exactly that.",
        today.format(DATE_FORMAT),
        session_id
    )
}

/// Deterministic oracle that replays a script of decisions.
/// Keeps the dispatch loop testable without a live model.
pub struct ScriptedOracle {
    script: Mutex<VecDeque<Decision>>,
    fallback: Option<Decision>,
    seen: Mutex<Vec<Vec<ConversationMessage>>>,
}

impl ScriptedOracle {
    pub fn new(script: Vec<Decision>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Once the script runs out, keep returning `decision`.
    pub fn with_fallback(mut self, decision: Decision) -> Self {
        self.fallback = Some(decision);
        self
    }

    /// For each decision made, the operation results appended since the
    /// oracle last spoke.
    pub fn observations_seen(&self) -> Vec<Vec<String>> {
        let seen = match self.seen.lock() {
            Ok(seen) => seen,
            Err(poisoned) => poisoned.into_inner(),
        };

        seen.iter()
            .map(|history| {
                history
                    .iter()
                    .rev()
                    .take_while(|m| m.role == MessageRole::Operation)
                    .map(|m| m.content.clone())
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect()
            })
            .collect()
    }

    /// Number of decisions requested so far
    pub fn calls_made(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or_default()
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn decide(&self, request: &OracleRequest<'_>) -> Result<Decision> {
        {
            let mut seen = self
                .seen
                .lock()
                .map_err(|_| OrchestrationError::PlanningError("oracle lock poisoned".to_string()))?;
            seen.push(request.conversation.messages().cloned().collect());
        }

        let next = self
            .script
            .lock()
            .map_err(|_| OrchestrationError::PlanningError("oracle lock poisoned".to_string()))?
            .pop_front();

        next.or_else(|| self.fallback.clone()).ok_or_else(|| {
            OrchestrationError::PlanningError("scripted oracle has no more decisions".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationCall;
    use serde_json::json;

    #[test]
    fn test_system_instruction_names_date_and_session() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let prompt = build_system_instruction("thread-42", today);
        assert!(prompt.contains("Today's date is 2026-10-16."));
        assert!(prompt.contains("thread-42"));
        assert!(prompt.contains("check_budget"));
    }

    #[tokio::test]
    async fn test_scripted_oracle_replays_then_falls_back() {
        let oracle = ScriptedOracle::new(vec![Decision::call(vec![OperationCall::new(
            "c1",
            "check_budget",
            json!({}),
        )])])
        .with_fallback(Decision::answer("done"));

        let state = ConversationState::new("s");
        let request = OracleRequest {
            system_instruction: String::new(),
            conversation: &state,
            catalog: &[],
        };

        assert_eq!(oracle.decide(&request).await.unwrap().calls.len(), 1);
        assert_eq!(oracle.decide(&request).await.unwrap().text.as_deref(), Some("done"));
        assert_eq!(oracle.calls_made(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_script_errors() {
        let oracle = ScriptedOracle::new(vec![]);
        let state = ConversationState::new("s");
        let request = OracleRequest {
            system_instruction: String::new(),
            conversation: &state,
            catalog: &[],
        };
        assert!(oracle.decide(&request).await.is_err());
    }
}
