//! Execution engine for one round of operation calls
//!
//! Calls run strictly in the order the oracle listed them. Every call yields
//! exactly one observation, whether it succeeds, fails or is never run.
//! No oracle access here.

use crate::error::OrchestrationError;
use crate::memory::BudgetSnapshot;
use crate::models::OperationCall;
use crate::tools::{OperationContext, OperationRegistry, OperationSpec};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Calls beyond this in a single decision are not executed
pub const MAX_CALLS_PER_ROUND: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
}

/// Result text for one call, ready to append to the conversation
#[derive(Debug, Clone)]
pub struct RoundObservation {
    pub call: OperationCall,
    pub content: String,
    pub status: ExecutionStatus,
    pub execution_time_ms: u64,
}

pub struct ExecutionEngine {
    registry: OperationRegistry,
    operation_timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(registry: OperationRegistry, operation_timeout: Duration) -> Self {
        Self {
            registry,
            operation_timeout,
        }
    }

    pub fn catalog(&self) -> Vec<OperationSpec> {
        self.registry.catalog()
    }

    /// Run every call of one decision, in order. Never fails as a whole.
    ///
    /// No call runs past `deadline`: each one gets at most the time left,
    /// and calls reached after it passes are answered without running.
    pub async fn execute_round(
        &self,
        calls: &[OperationCall],
        user_id: &str,
        currency: &str,
        budget: &BudgetSnapshot,
        deadline: Instant,
    ) -> Vec<RoundObservation> {
        let mut observations = Vec::with_capacity(calls.len());

        for (index, call) in calls.iter().enumerate() {
            if index >= MAX_CALLS_PER_ROUND {
                warn!(
                    call_id = %call.id,
                    operation = %call.name,
                    "Skipping call beyond per-round limit"
                );
                observations.push(skipped(
                    call,
                    format!(
                        "Error: too many operations in one step (limit {}). '{}' was not run.",
                        MAX_CALLS_PER_ROUND, call.name
                    ),
                ));
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(call_id = %call.id, operation = %call.name, "Skipping call after turn deadline");
                observations.push(skipped(
                    call,
                    format!("Error: '{}' was not run: turn deadline reached.", call.name),
                ));
                continue;
            }

            observations.push(
                self.execute_call(call, user_id, currency, budget, remaining)
                    .await,
            );
        }

        debug!(observation_count = observations.len(), "Round executed");
        observations
    }

    async fn execute_call(
        &self,
        call: &OperationCall,
        user_id: &str,
        currency: &str,
        budget: &BudgetSnapshot,
        remaining: Duration,
    ) -> RoundObservation {
        let Some(operation) = self.registry.get(&call.name) else {
            let err = OrchestrationError::ToolNotFound(call.name.clone());
            warn!(call_id = %call.id, error = %err, "Operation not registered");
            return skipped(
                call,
                format!(
                    "Error: {}. Available operations: {}",
                    err,
                    self.registry.list().join(", ")
                ),
            );
        };

        let context = OperationContext {
            user_id: user_id.to_string(),
            currency: currency.to_string(),
            budget: operation.needs_budget_snapshot().then(|| budget.clone()),
        };

        let limit = self.operation_timeout.min(remaining);
        let cut_by_deadline = limit < self.operation_timeout;

        debug!(call_id = %call.id, operation = %call.name, "Executing operation");

        let start = Instant::now();
        let result = tokio::time::timeout(limit, operation.execute(&context, &call.arguments)).await;
        let execution_time_ms = start.elapsed().as_millis() as u64;

        let (content, status) = match result {
            Ok(Ok(text)) => (text, ExecutionStatus::Success),
            Ok(Err(e)) => {
                warn!(call_id = %call.id, operation = %call.name, error = %e, "Operation failed");
                (
                    format!("Error executing {}: {}", call.name, e),
                    ExecutionStatus::Failed,
                )
            }
            Err(_) if cut_by_deadline => {
                warn!(call_id = %call.id, operation = %call.name, "Operation stopped at turn deadline");
                (
                    format!("Error executing {}: turn deadline reached", call.name),
                    ExecutionStatus::Failed,
                )
            }
            Err(_) => {
                warn!(
                    call_id = %call.id,
                    operation = %call.name,
                    timeout_ms = self.operation_timeout.as_millis() as u64,
                    "Operation timed out"
                );
                (
                    format!(
                        "Error executing {}: timed out after {}s",
                        call.name,
                        self.operation_timeout.as_secs_f64()
                    ),
                    ExecutionStatus::Failed,
                )
            }
        };

        RoundObservation {
            call: call.clone(),
            content,
            status,
            execution_time_ms,
        }
    }
}

fn skipped(call: &OperationCall, content: String) -> RoundObservation {
    RoundObservation {
        call: call.clone(),
        content,
        status: ExecutionStatus::Skipped,
        execution_time_ms: 0,
    }
}
