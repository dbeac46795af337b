//! Postgres-backed finance store
//!
//! Each public call is a single statement, so upserts are atomic without
//! read-then-write. All values, including the category filter, are bound
//! parameters.

use super::{category_filter, today, FinanceStore};
use crate::error::OrchestrationError;
use crate::models::{BudgetLimits, BudgetLookup, ExpenseLine, NewTransaction, SpendingPeriod};
use crate::Result;
use chrono::NaiveDate;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, info};

pub struct PgFinanceStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgFinanceStore {
    /// Build a lazily-connecting store. No connection is attempted here.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| {
                OrchestrationError::ConfigError(format!("Invalid DATABASE_URL: {}", e))
            })?;

        info!("Finance store backend: postgres");

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS transactions (
                      id BIGSERIAL PRIMARY KEY,
                      user_id TEXT NOT NULL,
                      amount DOUBLE PRECISION NOT NULL CHECK (amount > 0),
                      category TEXT NOT NULL,
                      description TEXT,
                      expense_date DATE NOT NULL DEFAULT CURRENT_DATE,
                      record_date TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_transactions_user_date
                    ON transactions (user_id, expense_date, record_date);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS budgets (
                      user_id TEXT PRIMARY KEY,
                      daily_limit DOUBLE PRECISION NOT NULL CHECK (daily_limit >= 0),
                      weekly_limit DOUBLE PRECISION NOT NULL CHECK (weekly_limit >= 0),
                      monthly_limit DOUBLE PRECISION NOT NULL CHECK (monthly_limit >= 0),
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!(
                    "Failed to initialize finance schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    async fn try_insert(&self, user_id: &str, tx: &NewTransaction) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO transactions (user_id, amount, category, description, expense_date)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user_id)
        .bind(tx.amount)
        .bind(&tx.category)
        .bind(&tx.description)
        .bind(tx.expense_date)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn try_sum(
        &self,
        user_id: &str,
        period: SpendingPeriod,
        category: Option<&str>,
    ) -> Result<f64> {
        self.ensure_schema().await?;

        let (start, end) = period.window(today());

        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0)::DOUBLE PRECISION AS total
            FROM transactions
            WHERE user_id = $1
              AND expense_date BETWEEN $2 AND $3
              AND ($4::TEXT IS NULL OR LOWER(category) = LOWER($4))
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .bind(category_filter(category))
        .fetch_one(&self.pool)
        .await?;

        let total: f64 = row.try_get("total")?;
        Ok(total.max(0.0))
    }

    async fn try_upsert(&self, user_id: &str, limits: BudgetLimits) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO budgets (user_id, daily_limit, weekly_limit, monthly_limit, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (user_id)
            DO UPDATE SET
                daily_limit = EXCLUDED.daily_limit,
                weekly_limit = EXCLUDED.weekly_limit,
                monthly_limit = EXCLUDED.monthly_limit,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(limits.daily)
        .bind(limits.weekly)
        .bind(limits.monthly)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn try_get_budget(&self, user_id: &str) -> Result<Option<BudgetLimits>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            "SELECT daily_limit, weekly_limit, monthly_limit FROM budgets WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<BudgetLimits> {
            Ok(BudgetLimits {
                daily: row.try_get("daily_limit")?,
                weekly: row.try_get("weekly_limit")?,
                monthly: row.try_get("monthly_limit")?,
            })
        })
        .transpose()
    }
}

#[async_trait::async_trait]
impl FinanceStore for PgFinanceStore {
    async fn insert_transaction(&self, user_id: &str, tx: &NewTransaction) -> bool {
        match self.try_insert(user_id, tx).await {
            Ok(()) => true,
            Err(e) => {
                error!(user_id, error = %e, "Database error on insert");
                false
            }
        }
    }

    async fn sum_spending(
        &self,
        user_id: &str,
        period: SpendingPeriod,
        category: Option<&str>,
    ) -> f64 {
        self.try_sum(user_id, period, category)
            .await
            .unwrap_or_else(|e| {
                error!(user_id, ?period, error = %e, "Database error on spending query");
                0.0
            })
    }

    async fn list_expenses(&self, user_id: &str, date: NaiveDate) -> Result<Vec<ExpenseLine>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT category, amount, description
            FROM transactions
            WHERE user_id = $1 AND expense_date = $2
            ORDER BY record_date ASC, id ASC
            "#,
        )
        .bind(user_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!(user_id, %date, error = %e, "Database error on expense listing");
            OrchestrationError::DatabaseError(e.to_string())
        })?;

        rows.iter()
            .map(|row| -> Result<ExpenseLine> {
                Ok(ExpenseLine {
                    category: row.try_get("category")?,
                    amount: row.try_get("amount")?,
                    description: row.try_get("description")?,
                })
            })
            .collect()
    }

    async fn upsert_budget(&self, user_id: &str, limits: BudgetLimits) -> bool {
        match self.try_upsert(user_id, limits).await {
            Ok(()) => true,
            Err(e) => {
                error!(user_id, error = %e, "Database error on upsert_budget");
                false
            }
        }
    }

    async fn get_budget(&self, user_id: &str) -> BudgetLookup {
        match self.try_get_budget(user_id).await {
            Ok(Some(limits)) => BudgetLookup::Set(limits),
            Ok(None) => BudgetLookup::NotSet,
            Err(e) => {
                error!(user_id, error = %e, "Database error on get_budget");
                BudgetLookup::Unavailable(e.to_string())
            }
        }
    }
}
