//! Persistence for transactions and budgets
//!
//! Every method fails closed: backend faults become a sentinel value
//! (`false`, `0.0`, `BudgetLookup::Unavailable`) and are logged, because
//! callers render user-facing text rather than propagate errors.

use crate::error::OrchestrationError;
use crate::models::{
    BudgetLimits, BudgetLookup, ExpenseLine, NewTransaction, SpendingPeriod, Transaction,
};
use crate::Result;
use chrono::{Local, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

pub mod postgres;
pub use postgres::PgFinanceStore;

/// Category value meaning "no category filter"
pub const ALL_CATEGORIES: &str = "all";

/// Local calendar date used for spending windows and default expense dates
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// `None` or "all" (any case) means every category.
pub fn category_filter(category: Option<&str>) -> Option<&str> {
    category
        .map(str::trim)
        .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case(ALL_CATEGORIES))
}

/// Trait for finance persistence
#[async_trait::async_trait]
pub trait FinanceStore: Send + Sync {
    async fn insert_transaction(&self, user_id: &str, tx: &NewTransaction) -> bool;

    async fn sum_spending(
        &self,
        user_id: &str,
        period: SpendingPeriod,
        category: Option<&str>,
    ) -> f64;

    /// Expenses on `date`, oldest record first.
    async fn list_expenses(&self, user_id: &str, date: NaiveDate) -> Result<Vec<ExpenseLine>>;

    async fn upsert_budget(&self, user_id: &str, limits: BudgetLimits) -> bool;

    async fn get_budget(&self, user_id: &str) -> BudgetLookup;
}

/// In-memory store for development and tests
pub struct InMemoryFinanceStore {
    transactions: Arc<RwLock<Vec<Transaction>>>,
    budgets: Arc<RwLock<HashMap<String, BudgetLimits>>>,
    failing: AtomicBool,
}

impl InMemoryFinanceStore {
    pub fn new() -> Self {
        Self {
            transactions: Arc::new(RwLock::new(Vec::new())),
            budgets: Arc::new(RwLock::new(HashMap::new())),
            failing: AtomicBool::new(false),
        }
    }

    /// Simulate a backend outage: every call takes its failure path.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of stored transactions across all users
    pub async fn transaction_count(&self) -> usize {
        self.transactions.read().await.len()
    }

    fn check_available(&self, operation: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OrchestrationError::DatabaseError(format!(
                "simulated outage during {}",
                operation
            )));
        }
        Ok(())
    }
}

impl Default for InMemoryFinanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FinanceStore for InMemoryFinanceStore {
    async fn insert_transaction(&self, user_id: &str, tx: &NewTransaction) -> bool {
        if let Err(e) = self.check_available("insert_transaction") {
            warn!(error = %e, "Database error on insert");
            return false;
        }

        // Vec order is insertion order, which is the record_date tie-break.
        self.transactions.write().await.push(Transaction {
            user_id: user_id.to_string(),
            amount: tx.amount,
            category: tx.category.clone(),
            description: tx.description.clone(),
            expense_date: tx.expense_date,
            record_date: Utc::now(),
        });
        true
    }

    async fn sum_spending(
        &self,
        user_id: &str,
        period: SpendingPeriod,
        category: Option<&str>,
    ) -> f64 {
        if let Err(e) = self.check_available("sum_spending") {
            warn!(error = %e, "Database error on spending query");
            return 0.0;
        }

        let (start, end) = period.window(today());
        let category = category_filter(category);

        self.transactions
            .read()
            .await
            .iter()
            .filter(|t| t.user_id == user_id)
            .filter(|t| t.expense_date >= start && t.expense_date <= end)
            .filter(|t| category.map_or(true, |c| t.category.eq_ignore_ascii_case(c)))
            .map(|t| t.amount)
            .sum()
    }

    async fn list_expenses(&self, user_id: &str, date: NaiveDate) -> Result<Vec<ExpenseLine>> {
        self.check_available("list_expenses")?;

        Ok(self
            .transactions
            .read()
            .await
            .iter()
            .filter(|t| t.user_id == user_id && t.expense_date == date)
            .map(|t| ExpenseLine {
                category: t.category.clone(),
                amount: t.amount,
                description: t.description.clone(),
            })
            .collect())
    }

    async fn upsert_budget(&self, user_id: &str, limits: BudgetLimits) -> bool {
        if let Err(e) = self.check_available("upsert_budget") {
            warn!(error = %e, "Database error on upsert_budget");
            return false;
        }

        self.budgets.write().await.insert(user_id.to_string(), limits);
        true
    }

    async fn get_budget(&self, user_id: &str) -> BudgetLookup {
        if let Err(e) = self.check_available("get_budget") {
            warn!(error = %e, "Database error on get_budget");
            return BudgetLookup::Unavailable(e.to_string());
        }

        match self.budgets.read().await.get(user_id) {
            Some(limits) => BudgetLookup::Set(*limits),
            None => BudgetLookup::NotSet,
        }
    }
}
