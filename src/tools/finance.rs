//! Finance operations exposed to the oracle
//!
//! All results are plain text. Validation problems come back as fixed
//! error strings (an `Ok` observation), while malformed argument shapes
//! are `InvalidToolInput` errors for the execution engine to report.

use super::format::{format_money, round_cents};
use super::{parse_args, Operation, OperationContext};
use crate::memory::ALL_CATEGORY;
use crate::models::{
    BudgetLimits, BudgetLookup, BudgetPeriod, NewTransaction, SpendingPeriod, DATE_FORMAT,
};
use crate::store::{today, FinanceStore, ALL_CATEGORIES};
use crate::Result;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub const AMOUNT_NOT_POSITIVE: &str =
    "Error: Amount must be positive. Please specify a valid expense.";
pub const RECORD_FAILED: &str = "ERROR: Failed to record transaction due to a database error.";
pub const BAD_EXPENSE_DATE: &str = "Error: expense_date must be in YYYY-MM-DD format.";
pub const NO_BUDGET_SET: &str =
    "You haven't set a budget yet. Please tell me your daily, weekly, or monthly budget.";
pub const BUDGET_UNAVAILABLE: &str =
    "Error: Could not load your budget right now. Please try again shortly.";
pub const BAD_PERIOD: &str = "Error: Period must be 'daily', 'weekly', or 'monthly'.";
pub const BUDGET_NOT_POSITIVE: &str = "Error: Budget amount must be positive.";
pub const BUDGET_SAVE_FAILED: &str = "Failed to save budget to database.";
pub const BAD_DATE: &str = "Error: Date must be in YYYY-MM-DD format.";
pub const AMOUNT_TOO_LARGE: &str =
    "Error: Amount is too large. The maximum for one expense is 1,000,000,000,000.00.";
pub const BUDGET_TOO_LARGE: &str =
    "Error: Budget amount is too large. The maximum is 1,000,000,000,000.00.";

/// Largest expense or budget amount accepted from the oracle
pub const MAX_AMOUNT: f64 = 1_000_000_000_000.0;

/// Weekly budget assumed when the snapshot carries no overall limit
pub const DEFAULT_WEEKLY_BUDGET: f64 = 2000.0;

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

//
// ================= record_transaction =================
//

#[derive(Debug, Deserialize)]
struct RecordTransactionArgs {
    amount: f64,
    category: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    expense_date: Option<String>,
}

pub struct RecordTransactionOperation {
    store: Arc<dyn FinanceStore>,
}

impl RecordTransactionOperation {
    pub fn new(store: Arc<dyn FinanceStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Operation for RecordTransactionOperation {
    fn name(&self) -> &'static str {
        "record_transaction"
    }

    fn description(&self) -> &'static str {
        "Records a new expense for the user. Always follow up with check_budget."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "amount": { "type": "number", "description": "Positive amount spent" },
                "category": { "type": "string", "description": "Spending category, e.g. food" },
                "description": { "type": "string", "description": "Optional note" },
                "expense_date": { "type": "string", "description": "YYYY-MM-DD; defaults to today" }
            },
            "required": ["amount", "category"]
        })
    }

    async fn execute(&self, context: &OperationContext, arguments: &Value) -> Result<String> {
        let args: RecordTransactionArgs = parse_args(self.name(), arguments)?;

        if !(args.amount > 0.0) {
            return Ok(AMOUNT_NOT_POSITIVE.to_string());
        }
        if args.amount > MAX_AMOUNT {
            return Ok(AMOUNT_TOO_LARGE.to_string());
        }

        let expense_date = match args.expense_date.as_deref().filter(|d| !d.trim().is_empty()) {
            Some(raw) => match parse_date(raw) {
                Some(date) => date,
                None => return Ok(BAD_EXPENSE_DATE.to_string()),
            },
            None => today(),
        };

        let transaction = NewTransaction {
            amount: args.amount,
            category: args.category.trim().to_string(),
            description: args
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            expense_date,
        };

        if !self.store.insert_transaction(&context.user_id, &transaction).await {
            return Ok(RECORD_FAILED.to_string());
        }

        debug!(user_id = %context.user_id, amount = args.amount, "Transaction recorded");

        Ok(format!(
            "Transaction of {} recorded successfully. You MUST now use the check_budget tool.",
            format_money(&context.currency, args.amount)
        ))
    }
}

//
// ================= check_budget =================
//

pub struct CheckBudgetOperation {
    store: Arc<dyn FinanceStore>,
}

impl CheckBudgetOperation {
    pub fn new(store: Arc<dyn FinanceStore>) -> Self {
        Self { store }
    }
}

fn status_line(label: &str, currency: &str, spent: f64, limit: f64) -> String {
    let marker = if spent > limit { "⚠️ (OVER)" } else { "✅" };
    format!(
        "{}: {} / {} {}",
        label,
        format_money(currency, spent),
        format_money(currency, limit),
        marker
    )
}

#[async_trait::async_trait]
impl Operation for CheckBudgetOperation {
    fn name(&self) -> &'static str {
        "check_budget"
    }

    fn description(&self) -> &'static str {
        "Checks today's and this week's spending against the user's budget."
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, context: &OperationContext, _arguments: &Value) -> Result<String> {
        let limits = match self.store.get_budget(&context.user_id).await {
            BudgetLookup::Set(limits) => limits,
            BudgetLookup::NotSet => return Ok(NO_BUDGET_SET.to_string()),
            BudgetLookup::Unavailable(_) => return Ok(BUDGET_UNAVAILABLE.to_string()),
        };

        let daily_spend = self
            .store
            .sum_spending(&context.user_id, SpendingPeriod::Day, None)
            .await;
        let weekly_spend = self
            .store
            .sum_spending(&context.user_id, SpendingPeriod::Week, None)
            .await;

        Ok(format!(
            "📊 **Budget Status:**\n{}\n{}",
            status_line("Daily", &context.currency, daily_spend, limits.daily),
            status_line("Weekly", &context.currency, weekly_spend, limits.weekly),
        ))
    }
}

//
// ================= set_budget =================
//

#[derive(Debug, Deserialize)]
struct SetBudgetArgs {
    amount: f64,
    period: String,
}

pub struct SetBudgetOperation {
    store: Arc<dyn FinanceStore>,
}

impl SetBudgetOperation {
    pub fn new(store: Arc<dyn FinanceStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Operation for SetBudgetOperation {
    fn name(&self) -> &'static str {
        "set_budget"
    }

    fn description(&self) -> &'static str {
        "Sets the user's budget for one period; the other two periods are derived."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "amount": { "type": "number", "description": "Budget amount" },
                "period": {
                    "type": "string",
                    "enum": ["daily", "weekly", "monthly"],
                    "description": "Period the amount applies to"
                }
            },
            "required": ["amount", "period"]
        })
    }

    async fn execute(&self, context: &OperationContext, arguments: &Value) -> Result<String> {
        let args: SetBudgetArgs = parse_args(self.name(), arguments)?;

        let Ok(period) = args.period.parse::<BudgetPeriod>() else {
            return Ok(BAD_PERIOD.to_string());
        };

        if !(args.amount > 0.0) {
            return Ok(BUDGET_NOT_POSITIVE.to_string());
        }
        if args.amount > MAX_AMOUNT {
            return Ok(BUDGET_TOO_LARGE.to_string());
        }

        let limits = BudgetLimits::derive(args.amount, period);

        if !self.store.upsert_budget(&context.user_id, limits).await {
            return Ok(BUDGET_SAVE_FAILED.to_string());
        }

        debug!(user_id = %context.user_id, %period, "Budget updated");

        let money = |v| format_money(&context.currency, v);
        Ok(format!(
            "Budget set successfully!\nDaily: {}\nWeekly: {}\nMonthly: {}",
            money(limits.daily),
            money(limits.weekly),
            money(limits.monthly)
        ))
    }
}

//
// ================= list_expenses_by_date =================
//

#[derive(Debug, Deserialize)]
struct ListExpensesArgs {
    date: String,
}

pub struct ListExpensesByDateOperation {
    store: Arc<dyn FinanceStore>,
}

impl ListExpensesByDateOperation {
    pub fn new(store: Arc<dyn FinanceStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Operation for ListExpensesByDateOperation {
    fn name(&self) -> &'static str {
        "list_expenses_by_date"
    }

    fn description(&self) -> &'static str {
        "Lists the user's expenses for one date. The date MUST be YYYY-MM-DD."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "date": { "type": "string", "description": "Calendar date, YYYY-MM-DD" }
            },
            "required": ["date"]
        })
    }

    async fn execute(&self, context: &OperationContext, arguments: &Value) -> Result<String> {
        let args: ListExpensesArgs = parse_args(self.name(), arguments)?;

        let Some(date) = parse_date(&args.date) else {
            return Ok(BAD_DATE.to_string());
        };
        let label = date.format(DATE_FORMAT);

        let lines = match self.store.list_expenses(&context.user_id, date).await {
            Ok(lines) => lines,
            Err(e) => return Ok(format!("Error retrieving data: {}", e)),
        };

        if lines.is_empty() {
            return Ok(format!("No expenses found for {}.", label));
        }

        let mut report = format!("Expenses for {}:\n", label);
        let mut total = 0.0;

        for line in &lines {
            let note = line
                .description
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default();
            report.push_str(&format!(
                "- {}: {}{}\n",
                line.category,
                format_money(&context.currency, line.amount),
                note
            ));
            // sum what is shown, so the total matches the listed lines
            total += round_cents(line.amount);
        }

        report.push_str(&format!("\nTotal: {}", format_money(&context.currency, total)));
        Ok(report)
    }
}

//
// ================= daily_summary =================
//

pub struct DailySummaryOperation {
    store: Arc<dyn FinanceStore>,
}

impl DailySummaryOperation {
    pub fn new(store: Arc<dyn FinanceStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Operation for DailySummaryOperation {
    fn name(&self) -> &'static str {
        "daily_summary"
    }

    fn description(&self) -> &'static str {
        "Produces a dated weekly spending summary for the user."
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn needs_budget_snapshot(&self) -> bool {
        true
    }

    async fn execute(&self, context: &OperationContext, _arguments: &Value) -> Result<String> {
        let snapshot = context.budget.clone().unwrap_or_default();
        let currency = &context.currency;

        let spent = self
            .store
            .sum_spending(&context.user_id, SpendingPeriod::Week, Some(ALL_CATEGORIES))
            .await;
        let weekly_budget = snapshot
            .weekly_limit(ALL_CATEGORY)
            .unwrap_or(DEFAULT_WEEKLY_BUDGET);

        let mut summary = format!(
            "Hello {}!\n📅 {}\n\n",
            snapshot.owner_name,
            today().format("%A, %B %d, %Y")
        );
        summary.push_str("--- WEEKLY FINANCIAL STATUS ---\n");
        summary.push_str(&format!(
            "Weekly Budget: **{}**\n",
            format_money(currency, weekly_budget)
        ));
        summary.push_str(&format!(
            "Spent This Week: **{}**\n",
            format_money(currency, spent)
        ));
        summary.push_str(&format!(
            "Remaining: **{}**\n",
            format_money(currency, weekly_budget - spent)
        ));

        Ok(summary)
    }
}
