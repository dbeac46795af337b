//! Dispatch loop for one conversation turn
//!
//! PLANNING → (answer) done
//! PLANNING → (calls) EXECUTING → PLANNING ...
//!
//! Strictly sequential: one oracle decision, then its calls in order, then
//! back to the oracle. Bounded by round count, per-call timeouts and an
//! overall turn deadline.

use crate::config::LoopLimits;
use crate::error::OrchestrationError;
use crate::execution::ExecutionEngine;
use crate::memory::{ConversationState, ALL_CATEGORY};
use crate::models::{BudgetLookup, Decision, OperationCall};
use crate::oracle::{build_system_instruction, DecisionOracle, OracleRequest};
use crate::store::{today, FinanceStore};
use crate::tools::create_finance_registry;
use crate::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Final answer when a turn runs out of rounds or time
pub const COULD_NOT_COMPLETE: &str =
    "I'm sorry, I could not complete that request. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopPhase {
    Planning,
    Executing,
}

/// Result of a completed turn. `state` replaces the caller's copy.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub answer: String,
    pub state: ConversationState,
    pub rounds: u32,
    pub operations_run: usize,
}

pub struct Agent {
    oracle: Arc<dyn DecisionOracle>,
    execution_engine: ExecutionEngine,
    store: Arc<dyn FinanceStore>,
    limits: LoopLimits,
    currency: String,
}

impl Agent {
    /// Agent wired to the five finance operations over `store`.
    pub fn new(
        oracle: Arc<dyn DecisionOracle>,
        store: Arc<dyn FinanceStore>,
        limits: LoopLimits,
        currency: impl Into<String>,
    ) -> Self {
        let execution_engine = ExecutionEngine::new(
            create_finance_registry(store.clone()),
            limits.operation_timeout,
        );

        Self {
            oracle,
            execution_engine,
            store,
            limits,
            currency: currency.into(),
        }
    }

    /// Run one user message to a final answer.
    ///
    /// Takes the state by value and hands the updated state back in the
    /// outcome. On `Err` the caller should keep its previous state.
    pub async fn run_turn(
        &self,
        mut state: ConversationState,
        message: &str,
    ) -> Result<TurnOutcome> {
        let started = Instant::now();
        let deadline = started + self.limits.turn_deadline;
        let session_id = state.session_id.clone();

        info!(session_id = %session_id, "Turn started");

        self.refresh_budget_snapshot(&mut state).await;
        state.add_user_message(message);

        let system_instruction = build_system_instruction(&session_id, today());
        let catalog = self.execution_engine.catalog();

        let mut phase = LoopPhase::Planning;
        let mut pending: Vec<OperationCall> = Vec::new();
        let mut rounds: u32 = 0;
        let mut operations_run: usize = 0;

        loop {
            match phase {
                LoopPhase::Planning => {
                    if rounds >= self.limits.max_rounds {
                        warn!(session_id = %session_id, rounds, "Round limit reached");
                        return Ok(give_up(state, rounds, operations_run));
                    }

                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        warn!(session_id = %session_id, rounds, "Turn deadline reached");
                        return Ok(give_up(state, rounds, operations_run));
                    }
                    let oracle_budget = self.limits.oracle_timeout.min(remaining);

                    rounds += 1;
                    debug!(session_id = %session_id, round = rounds, "Requesting decision");

                    let request = OracleRequest {
                        system_instruction: system_instruction.clone(),
                        conversation: &state,
                        catalog: &catalog,
                    };

                    let decided =
                        tokio::time::timeout(oracle_budget, self.oracle.decide(&request)).await;

                    let decision = match decided {
                        Ok(result) => result?,
                        Err(_) if oracle_budget < self.limits.oracle_timeout => {
                            warn!(session_id = %session_id, round = rounds, "Turn deadline reached during decision");
                            return Ok(give_up(state, rounds, operations_run));
                        }
                        Err(_) => {
                            return Err(OrchestrationError::Timeout(format!(
                                "oracle did not respond within {}s",
                                self.limits.oracle_timeout.as_secs_f64()
                            )));
                        }
                    };

                    let decision = with_unique_call_ids(decision, &state);
                    state.add_decision(&decision);

                    if decision.is_final() {
                        let answer = decision.text.unwrap_or_default();
                        info!(
                            session_id = %session_id,
                            rounds,
                            operations_run,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Turn completed"
                        );
                        return Ok(TurnOutcome {
                            answer,
                            state,
                            rounds,
                            operations_run,
                        });
                    }

                    pending = decision.calls;
                    phase = LoopPhase::Executing;
                }
                LoopPhase::Executing => {
                    let observations = self
                        .execution_engine
                        .execute_round(
                            &pending,
                            &session_id,
                            &self.currency,
                            &state.budget,
                            deadline,
                        )
                        .await;

                    for observation in observations {
                        debug!(
                            session_id = %session_id,
                            round = rounds,
                            call_id = %observation.call.id,
                            operation = %observation.call.name,
                            status = ?observation.status,
                            execution_time_ms = observation.execution_time_ms,
                            "Observation recorded"
                        );
                        state.add_observation(&observation.call, observation.content)?;
                        operations_run += 1;
                    }

                    pending.clear();
                    phase = LoopPhase::Planning;
                }
            }
        }
    }

    /// Copy the stored overall weekly limit into the snapshot. Read-only;
    /// a missing or unavailable budget leaves the snapshot as it was.
    async fn refresh_budget_snapshot(&self, state: &mut ConversationState) {
        match self.store.get_budget(&state.session_id).await {
            BudgetLookup::Set(limits) => state.budget.set_weekly_limit(ALL_CATEGORY, limits.weekly),
            BudgetLookup::NotSet => {}
            BudgetLookup::Unavailable(reason) => {
                warn!(session_id = %state.session_id, %reason, "Could not refresh budget snapshot");
            }
        }
    }
}

fn give_up(mut state: ConversationState, rounds: u32, operations_run: usize) -> TurnOutcome {
    state.add_decision(&Decision::answer(COULD_NOT_COMPLETE));
    TurnOutcome {
        answer: COULD_NOT_COMPLETE.to_string(),
        state,
        rounds,
        operations_run,
    }
}

/// Replace empty or already-used call ids so every result pairs with
/// exactly one call.
fn with_unique_call_ids(mut decision: Decision, state: &ConversationState) -> Decision {
    let mut used: HashSet<String> = state
        .known_call_ids()
        .into_iter()
        .map(str::to_string)
        .collect();

    for call in &mut decision.calls {
        if call.id.trim().is_empty() || used.contains(&call.id) {
            let fresh = format!("call_{}", Uuid::new_v4().simple());
            debug!(old_id = %call.id, new_id = %fresh, "Reassigned call id");
            call.id = fresh;
        }
        used.insert(call.id.clone());
    }

    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MessageRole;
    use crate::models::{BudgetLimits, BudgetPeriod, NewTransaction};
    use crate::oracle::ScriptedOracle;
    use crate::store::InMemoryFinanceStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn call(id: &str, name: &str, arguments: serde_json::Value) -> OperationCall {
        OperationCall::new(id, name, arguments)
    }

    fn agent(oracle: Arc<ScriptedOracle>, store: Arc<InMemoryFinanceStore>) -> Agent {
        Agent::new(oracle, store, LoopLimits::default(), "₱")
    }

    fn assert_calls_paired(state: &ConversationState) {
        assert!(state.unanswered_calls().is_empty());
        let mut ids = HashSet::new();
        for message in state.messages() {
            for c in &message.calls {
                assert!(ids.insert(c.id.clone()), "duplicate call id {}", c.id);
            }
        }
    }

    #[tokio::test]
    async fn test_set_budget_turn() {
        let store = Arc::new(InMemoryFinanceStore::new());
        let oracle = Arc::new(ScriptedOracle::new(vec![
            Decision::call(vec![call(
                "c1",
                "set_budget",
                json!({"amount": 5000, "period": "weekly"}),
            )]),
            Decision::answer("Your weekly budget is now ₱5,000.00."),
        ]));
        let agent = agent(oracle.clone(), store.clone());

        let outcome = assert_ok!(
            agent
                .run_turn(ConversationState::new("user-1"), "Set my weekly budget to 5000")
                .await
        );

        assert_eq!(outcome.answer, "Your weekly budget is now ₱5,000.00.");
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.operations_run, 1);
        assert_eq!(
            oracle.observations_seen()[1],
            vec!["Budget set successfully!\nDaily: ₱714.29\nWeekly: ₱5,000.00\nMonthly: ₱21,500.00".to_string()]
        );
        assert_eq!(
            store.get_budget("user-1").await,
            BudgetLookup::Set(BudgetLimits::derive(5000.0, BudgetPeriod::Weekly))
        );
        assert_calls_paired(&outcome.state);
    }

    #[tokio::test]
    async fn test_record_then_check_budget() {
        let store = Arc::new(InMemoryFinanceStore::new());
        store
            .upsert_budget("user-2", BudgetLimits::derive(100.0, BudgetPeriod::Daily))
            .await;

        let oracle = Arc::new(ScriptedOracle::new(vec![
            Decision::call(vec![call(
                "r1",
                "record_transaction",
                json!({"amount": 150, "category": "food", "description": "lunch"}),
            )]),
            Decision::call(vec![call("b1", "check_budget", json!({}))]),
            Decision::answer("Recorded. You're over your daily budget."),
        ]));
        let agent = agent(oracle.clone(), store.clone());

        let outcome = agent
            .run_turn(ConversationState::new("user-2"), "I spent 150 on lunch")
            .await
            .unwrap();

        let seen = oracle.observations_seen();
        assert_eq!(seen.len(), 3);
        assert!(seen[1][0].starts_with("Transaction of ₱150.00 recorded successfully."));
        assert!(seen[2][0].contains("Daily: ₱150.00 / ₱100.00 ⚠️ (OVER)"));
        assert_eq!(outcome.operations_run, 2);
        assert_eq!(store.transaction_count().await, 1);
        assert_calls_paired(&outcome.state);
    }

    #[tokio::test]
    async fn test_no_expenses_for_date() {
        let store = Arc::new(InMemoryFinanceStore::new());
        let oracle = Arc::new(ScriptedOracle::new(vec![
            Decision::call(vec![call("l1", "list_expenses_by_date", json!({"date": "2026-01-05"}))]),
            Decision::answer("No expenses found for 2026-01-05."),
        ]));
        let agent = agent(oracle.clone(), store);

        let outcome = agent
            .run_turn(ConversationState::new("u"), "What did I spend on Jan 5?")
            .await
            .unwrap();

        assert_eq!(
            oracle.observations_seen()[1],
            vec!["No expenses found for 2026-01-05.".to_string()]
        );
        assert_eq!(outcome.state.last_answer(), Some("No expenses found for 2026-01-05."));
    }

    #[tokio::test]
    async fn test_unknown_operation_does_not_stop_the_loop() {
        let store = Arc::new(InMemoryFinanceStore::new());
        let oracle = Arc::new(ScriptedOracle::new(vec![
            Decision::call(vec![call("x", "transfer_funds", json!({"amount": 10}))]),
            Decision::answer("I can't transfer money."),
        ]));
        let agent = agent(oracle.clone(), store);

        let outcome = agent
            .run_turn(ConversationState::new("u"), "send 10 to Bob")
            .await
            .unwrap();

        assert_eq!(outcome.answer, "I can't transfer money.");
        assert!(oracle.observations_seen()[1][0].contains("unknown operation 'transfer_funds'"));
    }

    #[tokio::test]
    async fn test_store_failure_becomes_observation() {
        let store = Arc::new(InMemoryFinanceStore::new());
        store.set_failing(true);
        let oracle = Arc::new(ScriptedOracle::new(vec![
            Decision::call(vec![call(
                "r1",
                "record_transaction",
                json!({"amount": 20, "category": "transport"}),
            )]),
            Decision::answer("Sorry, I couldn't save that."),
        ]));
        let agent = agent(oracle.clone(), store);

        let outcome = agent
            .run_turn(ConversationState::new("u"), "Jeep fare 20")
            .await
            .unwrap();

        assert_eq!(
            oracle.observations_seen()[1],
            vec!["ERROR: Failed to record transaction due to a database error.".to_string()]
        );
        assert_eq!(outcome.answer, "Sorry, I couldn't save that.");
    }

    #[tokio::test]
    async fn test_runaway_oracle_stops_at_round_limit() {
        let store = Arc::new(InMemoryFinanceStore::new());
        let oracle = Arc::new(
            ScriptedOracle::new(vec![])
                .with_fallback(Decision::call(vec![call("same", "check_budget", json!({}))])),
        );
        let limits = LoopLimits {
            max_rounds: 3,
            ..LoopLimits::default()
        };
        let agent = Agent::new(oracle.clone(), store, limits, "₱");

        let outcome = agent
            .run_turn(ConversationState::new("u"), "loop forever")
            .await
            .unwrap();

        assert_eq!(outcome.answer, COULD_NOT_COMPLETE);
        assert_eq!(outcome.rounds, 3);
        assert_eq!(oracle.calls_made(), 3);
        assert_eq!(outcome.operations_run, 3);
        assert_eq!(outcome.state.last_answer(), Some(COULD_NOT_COMPLETE));
        // repeated "same" ids were replaced
        assert_calls_paired(&outcome.state);
    }

    #[tokio::test]
    async fn test_calls_run_in_listed_order() {
        let store = Arc::new(InMemoryFinanceStore::new());
        let oracle = Arc::new(ScriptedOracle::new(vec![
            Decision::call(vec![
                call("a", "record_transaction", json!({"amount": 10, "category": "food"})),
                call("b", "record_transaction", json!({"amount": -5, "category": "food"})),
                call("", "daily_summary", json!({})),
            ]),
            Decision::answer("ok"),
        ]));
        let agent = agent(oracle.clone(), store.clone());

        let outcome = agent
            .run_turn(ConversationState::new("u"), "batch")
            .await
            .unwrap();

        let results: Vec<(String, String)> = outcome
            .state
            .messages()
            .filter(|m| m.role == MessageRole::Operation)
            .map(|m| (m.call_id.clone().unwrap_or_default(), m.content.clone()))
            .collect();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "a");
        assert_eq!(results[1].0, "b");
        assert!(results[1].1.starts_with("Error: Amount must be positive"));
        assert!(results[2].0.starts_with("call_"));
        assert!(results[2].1.contains("Spent This Week: **₱10.00**"));
        assert_eq!(store.transaction_count().await, 1);
        assert_calls_paired(&outcome.state);
    }

    #[tokio::test]
    async fn test_snapshot_refreshed_from_stored_budget() {
        let store = Arc::new(InMemoryFinanceStore::new());
        store
            .upsert_budget("u", BudgetLimits::derive(3000.0, BudgetPeriod::Weekly))
            .await;
        store
            .insert_transaction(
                "u",
                &NewTransaction {
                    amount: 500.0,
                    category: "food".to_string(),
                    description: None,
                    expense_date: today(),
                },
            )
            .await;

        let oracle = Arc::new(ScriptedOracle::new(vec![
            Decision::call(vec![call("s", "daily_summary", json!({}))]),
            Decision::answer("Here is your summary."),
        ]));
        let agent = agent(oracle.clone(), store);

        let outcome = agent
            .run_turn(ConversationState::new("u"), "summary please")
            .await
            .unwrap();

        assert_eq!(outcome.state.budget.weekly_limit(ALL_CATEGORY), Some(3000.0));
        let summary = &oracle.observations_seen()[1][0];
        assert!(summary.contains("Weekly Budget: **₱3,000.00**"));
        assert!(summary.contains("Remaining: **₱2,500.00**"));
    }

    #[tokio::test]
    async fn test_oracle_error_aborts_turn() {
        let store = Arc::new(InMemoryFinanceStore::new());
        let oracle = Arc::new(ScriptedOracle::new(vec![]));
        let agent = agent(oracle, store);

        let result = agent.run_turn(ConversationState::new("u"), "hello").await;
        assert!(matches!(result, Err(OrchestrationError::PlanningError(_))));
    }

    struct StalledOracle;

    #[async_trait]
    impl DecisionOracle for StalledOracle {
        async fn decide(&self, _request: &OracleRequest<'_>) -> Result<Decision> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Decision::answer("too late"))
        }
    }

    #[tokio::test]
    async fn test_oracle_timeout_and_turn_deadline() {
        let store = Arc::new(InMemoryFinanceStore::new());

        let timeout_only = LoopLimits {
            oracle_timeout: Duration::from_millis(20),
            ..LoopLimits::default()
        };
        let agent = Agent::new(Arc::new(StalledOracle), store.clone(), timeout_only, "₱");
        let result = agent.run_turn(ConversationState::new("u"), "hi").await;
        assert!(matches!(result, Err(OrchestrationError::Timeout(_))));

        let short_deadline = LoopLimits {
            turn_deadline: Duration::from_millis(20),
            ..LoopLimits::default()
        };
        let agent = Agent::new(Arc::new(StalledOracle), store, short_deadline, "₱");
        let outcome = agent
            .run_turn(ConversationState::new("u"), "hi")
            .await
            .unwrap();
        assert_eq!(outcome.answer, COULD_NOT_COMPLETE);
        assert_eq!(outcome.rounds, 1);
    }

    /// Store whose spending sums take longer than a turn is allowed
    struct SlowSumStore {
        inner: InMemoryFinanceStore,
        delay: Duration,
    }

    #[async_trait]
    impl FinanceStore for SlowSumStore {
        async fn insert_transaction(&self, user_id: &str, tx: &NewTransaction) -> bool {
            self.inner.insert_transaction(user_id, tx).await
        }

        async fn sum_spending(
            &self,
            user_id: &str,
            period: crate::models::SpendingPeriod,
            category: Option<&str>,
        ) -> f64 {
            tokio::time::sleep(self.delay).await;
            self.inner.sum_spending(user_id, period, category).await
        }

        async fn list_expenses(
            &self,
            user_id: &str,
            date: chrono::NaiveDate,
        ) -> Result<Vec<crate::models::ExpenseLine>> {
            self.inner.list_expenses(user_id, date).await
        }

        async fn upsert_budget(&self, user_id: &str, limits: BudgetLimits) -> bool {
            self.inner.upsert_budget(user_id, limits).await
        }

        async fn get_budget(&self, user_id: &str) -> BudgetLookup {
            self.inner.get_budget(user_id).await
        }
    }

    #[tokio::test]
    async fn test_turn_deadline_bounds_slow_operations() {
        let store = Arc::new(SlowSumStore {
            inner: InMemoryFinanceStore::new(),
            delay: Duration::from_millis(150),
        });
        let calls: Vec<OperationCall> = (0..8)
            .map(|i| call(&format!("d{}", i), "daily_summary", json!({})))
            .collect();
        let oracle = Arc::new(ScriptedOracle::new(vec![
            Decision::call(calls),
            Decision::answer("never reached"),
        ]));
        let limits = LoopLimits {
            turn_deadline: Duration::from_millis(200),
            ..LoopLimits::default()
        };
        let agent = Agent::new(oracle.clone(), store, limits, "₱");

        let started = Instant::now();
        let outcome = assert_ok!(
            agent
                .run_turn(ConversationState::new("u"), "summaries, lots of them")
                .await
        );

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(outcome.answer, COULD_NOT_COMPLETE);
        assert_eq!(outcome.rounds, 1);
        assert_eq!(oracle.calls_made(), 1);
        assert_eq!(outcome.operations_run, 8);

        let results: Vec<&str> = outcome
            .state
            .messages()
            .filter(|m| m.role == MessageRole::Operation)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(results.len(), 8);
        assert_eq!(results[0], "Error executing daily_summary: turn deadline reached");
        for result in &results[1..] {
            assert_eq!(*result, "Error: 'daily_summary' was not run: turn deadline reached.");
        }
        assert_calls_paired(&outcome.state);
    }

    #[tokio::test]
    async fn test_history_carries_across_turns() {
        let store = Arc::new(InMemoryFinanceStore::new());
        let oracle = Arc::new(ScriptedOracle::new(vec![
            Decision::answer("Hi! How can I help?"),
            Decision::answer("Sure."),
        ]));
        let agent = agent(oracle.clone(), store);

        let first = agent
            .run_turn(ConversationState::new("u"), "hello")
            .await
            .unwrap();
        let second = agent.run_turn(first.state, "thanks").await.unwrap();

        assert_eq!(second.state.message_count(), 4);
        assert_eq!(second.answer, "Sure.");
    }
}
