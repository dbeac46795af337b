//! Conversation state threaded through every loop round
//!
//! Holds the ordered message history, the session id, and a cached budget
//! snapshot. Operation results always point back at the decision that
//! requested them via the call id.

use crate::error::OrchestrationError;
use crate::models::{Decision, OperationCall};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Category key for the overall weekly limit
pub const ALL_CATEGORY: &str = "All";

/// Who produced a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Oracle,
    Operation,
}

/// A single message in the conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub role: MessageRole,
    pub content: String,
    /// Operations requested by an oracle decision
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<OperationCall>,
    /// Decision call this observation answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl ConversationMessage {
    fn new(role: MessageRole, content: String) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            role,
            content,
            calls: Vec::new(),
            call_id: None,
            operation: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content.into())
    }

    pub fn decision(decision: &Decision) -> Self {
        let mut message = Self::new(
            MessageRole::Oracle,
            decision.text.clone().unwrap_or_default(),
        );
        message.calls = decision.calls.clone();
        message
    }

    pub fn observation(call: &OperationCall, content: impl Into<String>) -> Self {
        let mut message = Self::new(MessageRole::Operation, content.into());
        message.call_id = Some(call.id.clone());
        message.operation = Some(call.name.clone());
        message
    }
}

/// Budget details the caller already knows, so operations can use them
/// without another lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub owner_name: String,
    #[serde(default)]
    pub weekly_limits: BTreeMap<String, f64>,
}

impl Default for BudgetSnapshot {
    fn default() -> Self {
        Self {
            owner_name: "there".to_string(),
            weekly_limits: BTreeMap::new(),
        }
    }
}

impl BudgetSnapshot {
    pub fn weekly_limit(&self, category: &str) -> Option<f64> {
        self.weekly_limits.get(category).copied()
    }

    pub fn set_weekly_limit(&mut self, category: impl Into<String>, limit: f64) {
        self.weekly_limits.insert(category.into(), limit);
    }
}

/// State of one conversation (one session id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    messages: Vec<ConversationMessage>,
    pub budget: BudgetSnapshot,
}

impl ConversationState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            messages: Vec::new(),
            budget: BudgetSnapshot::default(),
        }
    }

    pub fn with_budget(mut self, budget: BudgetSnapshot) -> Self {
        self.budget = budget;
        self
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.push(ConversationMessage::user(content));
    }

    pub fn add_decision(&mut self, decision: &Decision) {
        self.push(ConversationMessage::decision(decision));
    }

    /// Append an operation result. The call must belong to a recorded
    /// decision and must not already have a result.
    pub fn add_observation(&mut self, call: &OperationCall, content: impl Into<String>) -> Result<()> {
        let requested = self
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Oracle)
            .flat_map(|m| m.calls.iter())
            .any(|c| c.id == call.id);

        if !requested {
            return Err(OrchestrationError::StateError(format!(
                "no decision requested call '{}'",
                call.id
            )));
        }

        let answered = self
            .messages
            .iter()
            .any(|m| m.call_id.as_deref() == Some(call.id.as_str()));

        if answered {
            return Err(OrchestrationError::StateError(format!(
                "call '{}' already has a result",
                call.id
            )));
        }

        self.push(ConversationMessage::observation(call, content));
        Ok(())
    }

    fn push(&mut self, message: ConversationMessage) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    pub fn messages(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.messages.iter()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn last_message(&self) -> Option<&ConversationMessage> {
        self.messages.last()
    }

    /// Every call id used so far, for de-duplicating fresh decisions.
    pub fn known_call_ids(&self) -> HashSet<&str> {
        self.messages
            .iter()
            .flat_map(|m| m.calls.iter())
            .map(|c| c.id.as_str())
            .collect()
    }

    /// Calls from any decision that still lack a result
    pub fn unanswered_calls(&self) -> Vec<&OperationCall> {
        let answered: HashSet<&str> = self
            .messages
            .iter()
            .filter_map(|m| m.call_id.as_deref())
            .collect();

        self.messages
            .iter()
            .flat_map(|m| m.calls.iter())
            .filter(|c| !answered.contains(c.id.as_str()))
            .collect()
    }

    /// Text of the most recent oracle answer, if any
    pub fn last_answer(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Oracle && m.calls.is_empty())
            .map(|m| m.content.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_observation_must_reference_requested_call() {
        let mut state = ConversationState::new("session-1");
        state.add_user_message("Spent 200 on food");

        let call = OperationCall::new("call-1", "record_transaction", json!({"amount": 200}));
        let stray = OperationCall::new("call-9", "check_budget", json!({}));

        assert!(state.add_observation(&call, "too early").is_err());

        state.add_decision(&Decision::call(vec![call.clone()]));
        assert_eq!(state.unanswered_calls().len(), 1);

        state.add_observation(&call, "Transaction recorded").unwrap();
        assert!(state.unanswered_calls().is_empty());
        assert!(state.add_observation(&call, "twice").is_err());
        assert!(state.add_observation(&stray, "unknown").is_err());

        let last = state.last_message().unwrap();
        assert_eq!(last.role, MessageRole::Operation);
        assert_eq!(last.call_id.as_deref(), Some("call-1"));
        assert_eq!(last.operation.as_deref(), Some("record_transaction"));
    }

    #[test]
    fn test_last_answer_skips_call_decisions() {
        let mut state = ConversationState::new("s");
        assert!(state.last_answer().is_none());

        state.add_user_message("hi");
        state.add_decision(&Decision::answer("Hello!"));
        state.add_decision(&Decision::call(vec![OperationCall::new(
            "c1",
            "check_budget",
            json!({}),
        )]));

        assert_eq!(state.last_answer(), Some("Hello!"));
        assert_eq!(state.message_count(), 3);
        assert!(state.known_call_ids().contains("c1"));
    }

    #[test]
    fn test_state_serializes_for_callers() {
        let mut state = ConversationState::new("abc").with_budget(BudgetSnapshot {
            owner_name: "Kean".to_string(),
            ..BudgetSnapshot::default()
        });
        state.budget.set_weekly_limit(ALL_CATEGORY, 3000.0);
        state.add_user_message("hello");

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["session_id"], "abc");
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json["messages"][0].get("calls").is_none());

        let back: ConversationState = serde_json::from_value(json).unwrap();
        assert_eq!(back.budget.weekly_limit(ALL_CATEGORY), Some(3000.0));
        assert_eq!(back.budget.owner_name, "Kean");
    }
}
