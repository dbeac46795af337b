//! Core data models for the budget agent

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical calendar format for expense dates
pub const DATE_FORMAT: &str = "%Y-%m-%d";

//
// ================= Transactions =================
//

/// A transaction about to be written. `amount` is validated upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    pub amount: f64,
    pub category: String,
    pub description: Option<String>,
    pub expense_date: NaiveDate,
}

/// A persisted transaction row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub user_id: String,
    pub amount: f64,
    pub category: String,
    pub description: Option<String>,
    pub expense_date: NaiveDate,
    pub record_date: DateTime<Utc>,
}

/// One itemized line of a by-date expense listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseLine {
    pub category: String,
    pub amount: f64,
    pub description: Option<String>,
}

//
// ================= Periods =================
//

/// Aggregation window for spending sums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpendingPeriod {
    Day,
    Week,
}

impl SpendingPeriod {
    /// Inclusive `[start, today]` window. Weeks start on Monday.
    pub fn window(self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        match self {
            SpendingPeriod::Day => (today, today),
            SpendingPeriod::Week => {
                let offset = today.weekday().num_days_from_monday() as i64;
                (today - Duration::days(offset), today)
            }
        }
    }
}

/// Period a caller states a budget in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl FromStr for BudgetPeriod {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daily" => Ok(BudgetPeriod::Daily),
            "weekly" => Ok(BudgetPeriod::Weekly),
            "monthly" => Ok(BudgetPeriod::Monthly),
            _ => Err(()),
        }
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BudgetPeriod::Daily => "daily",
            BudgetPeriod::Weekly => "weekly",
            BudgetPeriod::Monthly => "monthly",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Budgets =================
//

pub const DAYS_PER_WEEK: f64 = 7.0;
pub const DAYS_PER_MONTH: f64 = 30.0;
pub const WEEKS_PER_MONTH: f64 = 4.3;

/// Daily, weekly and monthly limits for one user
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
}

impl BudgetLimits {
    /// Derive the two unstated limits from the one the caller set.
    pub fn derive(amount: f64, period: BudgetPeriod) -> Self {
        match period {
            BudgetPeriod::Daily => Self {
                daily: amount,
                weekly: amount * DAYS_PER_WEEK,
                monthly: amount * DAYS_PER_MONTH,
            },
            BudgetPeriod::Weekly => Self {
                daily: amount / DAYS_PER_WEEK,
                weekly: amount,
                monthly: amount * WEEKS_PER_MONTH,
            },
            BudgetPeriod::Monthly => Self {
                daily: amount / DAYS_PER_MONTH,
                weekly: amount / WEEKS_PER_MONTH,
                monthly: amount,
            },
        }
    }
}

/// Outcome of a budget lookup. `NotSet` and `Unavailable` are distinct:
/// the first means the user never configured one, the second a backend fault.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetLookup {
    Set(BudgetLimits),
    NotSet,
    Unavailable(String),
}

//
// ================= Oracle I/O =================
//

/// One operation requested by the oracle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl OperationCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// What the oracle decided for the current round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub text: Option<String>,
    #[serde(default)]
    pub calls: Vec<OperationCall>,
}

impl Decision {
    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            calls: Vec::new(),
        }
    }

    pub fn call(calls: Vec<OperationCall>) -> Self {
        Self { text: None, calls }
    }

    pub fn is_final(&self) -> bool {
        self.calls.is_empty()
    }
}
