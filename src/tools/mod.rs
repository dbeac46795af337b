//! Operation trait and registry
//!
//! Operations are the only actions the oracle can request. Each one
//! validates its own arguments and returns display-ready text.

use crate::error::OrchestrationError;
use crate::memory::BudgetSnapshot;
use crate::store::FinanceStore;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub mod finance;
pub mod format;

pub use finance::{
    CheckBudgetOperation, DailySummaryOperation, ListExpensesByDateOperation,
    RecordTransactionOperation, SetBudgetOperation,
};

/// Fields the dispatch loop injects into every call
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub user_id: String,
    pub currency: String,
    /// Only present for operations that ask for it
    pub budget: Option<BudgetSnapshot>,
}

/// Catalog entry sent to the oracle
#[derive(Debug, Clone, Serialize)]
pub struct OperationSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Trait for a single agent-invocable operation
#[async_trait::async_trait]
pub trait Operation: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;

    /// JSON schema of the oracle-supplied arguments
    fn parameters(&self) -> Value;

    /// Whether the cached budget snapshot is injected into the context.
    fn needs_budget_snapshot(&self) -> bool {
        false
    }

    async fn execute(&self, context: &OperationContext, arguments: &Value) -> Result<String>;
}

/// Registry mapping operation names to handlers
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }

    pub fn register(&mut self, operation: Arc<dyn Operation>) {
        self.operations
            .insert(operation.name().to_string(), operation);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.operations.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Catalog for the oracle, sorted by name
    pub fn catalog(&self) -> Vec<OperationSpec> {
        self.list()
            .into_iter()
            .filter_map(|name| self.operations.get(name))
            .map(|op| OperationSpec {
                name: op.name().to_string(),
                description: op.description().to_string(),
                parameters: op.parameters(),
            })
            .collect()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Deserialize oracle arguments into an operation's typed argument struct.
pub(crate) fn parse_args<T: DeserializeOwned>(operation: &str, arguments: &Value) -> Result<T> {
    let arguments = if arguments.is_null() {
        Value::Object(Default::default())
    } else {
        arguments.clone()
    };

    if !arguments.is_object() {
        return Err(OrchestrationError::InvalidToolInput(format!(
            "{} arguments must be a JSON object",
            operation
        )));
    }

    serde_json::from_value(arguments).map_err(|e| {
        OrchestrationError::InvalidToolInput(format!("{}: {}", operation, e))
    })
}

/// Registry with the five finance operations bound to `store`.
pub fn create_finance_registry(store: Arc<dyn FinanceStore>) -> OperationRegistry {
    let mut registry = OperationRegistry::new();

    registry.register(Arc::new(RecordTransactionOperation::new(store.clone())));
    registry.register(Arc::new(CheckBudgetOperation::new(store.clone())));
    registry.register(Arc::new(SetBudgetOperation::new(store.clone())));
    registry.register(Arc::new(ListExpensesByDateOperation::new(store.clone())));
    registry.register(Arc::new(DailySummaryOperation::new(store)));

    registry
}
