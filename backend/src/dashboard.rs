use std::collections::HashMap;

use axum::{extract::State, Extension, Json};
use chrono::{Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{AppError, AppResult};
use crate::extract::ApiQuery;
use crate::import::parse_date;
use crate::routes::AppState;
use crate::stats::{self, BudgetComparison, BudgetedCategory, HeatmapCell, LedgerRow, Period, Summary};

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl PeriodQuery {
    /// The requested period, or `default` unless both bounds were given.
    pub fn resolve(&self, default: Period) -> AppResult<Period> {
        match self.required() {
            Ok(p) => Ok(p),
            Err(e) if self.start_date.is_some() && self.end_date.is_some() => Err(e),
            Err(_) => Ok(default),
        }
    }

    pub fn required(&self) -> AppResult<Period> {
        let (Some(s), Some(e)) = (self.start_date.as_deref(), self.end_date.as_deref()) else {
            return Err(AppError::validation("startDate and endDate are required"));
        };
        let start = parse_date(s).ok_or_else(|| AppError::validation("startDate is not valid"))?;
        let end = parse_date(e).ok_or_else(|| AppError::validation("endDate is not valid"))?;
        Period::new(start, end)
            .ok_or_else(|| AppError::validation("startDate must not be after endDate"))
    }
}

pub async fn summary_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(q): ApiQuery<PeriodQuery>,
) -> AppResult<Json<Summary>> {
    let period = q.resolve(Period::year_of(today()))?;
    Ok(Json(summary_for(&state.pool, user.user_id, &period).await?))
}

pub async fn current_month_summary_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<Summary>> {
    let period = Period::month_of(today());
    Ok(Json(summary_for(&state.pool, user.user_id, &period).await?))
}

pub async fn current_year_summary_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<Summary>> {
    let period = Period::year_of(today());
    Ok(Json(summary_for(&state.pool, user.user_id, &period).await?))
}

pub async fn summary_for(
    pool: &PgPool,
    user_id: Uuid,
    period: &Period,
) -> Result<Summary, sqlx::Error> {
    tracing::debug!(%user_id, start = %period.start, end = %period.end, "building summary");
    let rows = sqlx::query_as::<_, LedgerRow>(
        r#"
        SELECT t.occurred_on, t.tx_type, t.amount, c.name AS category
        FROM transactions t
        LEFT JOIN categories c ON c.id = t.category_id
        WHERE t.user_id = $1 AND t.occurred_on BETWEEN $2 AND $3
        "#,
    )
    .bind(user_id)
    .bind(period.start)
    .bind(period.end)
    .fetch_all(pool)
    .await?;
    Ok(stats::summarize(&rows))
}

#[derive(Debug, Serialize)]
pub struct QuickTotals {
    pub income: Decimal,
    pub expenses: Decimal,
    pub net: Decimal,
    pub transactions: usize,
}

impl From<&Summary> for QuickTotals {
    fn from(s: &Summary) -> Self {
        Self {
            income: s.total_income,
            expenses: s.total_expenses,
            net: s.net_income,
            transactions: s.total_transactions,
        }
    }
}

pub async fn quick_stats_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<Value>> {
    let now = today();
    let month = summary_for(&state.pool, user.user_id, &Period::month_of(now)).await?;
    let year = summary_for(&state.pool, user.user_id, &Period::year_of(now)).await?;
    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transactions WHERE user_id = $1")
        .bind(user.user_id)
        .fetch_one(&state.pool)
        .await?;

    Ok(Json(json!({
        "currentMonth": QuickTotals::from(&month),
        "currentYear": QuickTotals::from(&year),
        "totalTransactions": total,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TopExpensesQuery {
    pub limit: Option<usize>,
}

pub async fn top_expenses_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(q): ApiQuery<TopExpensesQuery>,
) -> AppResult<Json<Vec<stats::Breakdown>>> {
    let limit = q.limit.unwrap_or(5).clamp(1, 50);
    let period = Period::trailing_months(today(), 12);

    let rows: Vec<(String, Decimal)> = sqlx::query_as(
        r#"
        SELECT COALESCE(c.name, 'Uncategorized') AS name, SUM(t.amount) AS amount
        FROM transactions t
        LEFT JOIN categories c ON c.id = t.category_id
        WHERE t.user_id = $1 AND t.tx_type = 'EXPENSE'
          AND t.occurred_on BETWEEN $2 AND $3
        GROUP BY 1
        "#,
    )
    .bind(user.user_id)
    .bind(period.start)
    .bind(period.end)
    .fetch_all(&state.pool)
    .await?;

    let mut top = stats::breakdown(rows.into_iter().collect::<HashMap<_, _>>());
    top.truncate(limit);
    Ok(Json(top))
}

#[derive(Debug, Deserialize)]
pub struct AverageQuery {
    pub months: Option<u32>,
}

pub async fn average_monthly_expenses_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(q): ApiQuery<AverageQuery>,
) -> AppResult<Json<Value>> {
    let months = q.months.unwrap_or(12);
    if months == 0 {
        return Err(AppError::validation("months must be at least 1"));
    }
    let period = Period::trailing_months(today(), months);

    let (total,): (Decimal,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(amount), 0)
        FROM transactions
        WHERE user_id = $1 AND tx_type = 'EXPENSE' AND occurred_on BETWEEN $2 AND $3
        "#,
    )
    .bind(user.user_id)
    .bind(period.start)
    .bind(period.end)
    .fetch_one(&state.pool)
    .await?;

    let average = (total.abs() / Decimal::from(months)).round_dp(2);
    Ok(Json(json!({
        "averageMonthlyExpenses": average,
        "period": format!("{months} months"),
    })))
}

pub async fn budget_comparison_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<Vec<BudgetComparison>>> {
    let period = Period::month_of(today());
    Ok(Json(
        budget_comparison_for(&state.pool, user.user_id, &period).await?,
    ))
}

pub async fn budget_comparison_period_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(q): ApiQuery<PeriodQuery>,
) -> AppResult<Json<Vec<BudgetComparison>>> {
    let period = q.required()?;
    Ok(Json(
        budget_comparison_for(&state.pool, user.user_id, &period).await?,
    ))
}

pub async fn budget_comparison_for(
    pool: &PgPool,
    user_id: Uuid,
    period: &Period,
) -> Result<Vec<BudgetComparison>, sqlx::Error> {
    let categories = sqlx::query_as::<_, BudgetedCategory>(
        r#"
        SELECT id, name, color, monthly_budget AS default_budget
        FROM categories
        WHERE user_id IS NULL OR user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    // Months are compared as year * 12 + month so ranges can span years.
    let first = period.start.year() * 12 + period.start.month() as i32;
    let last = period.end.year() * 12 + period.end.month() as i32;
    let budget_rows: Vec<(i64, i32, i32, Decimal)> = sqlx::query_as(
        r#"
        SELECT category_id, year, month, monthly_budget
        FROM user_category_budgets
        WHERE user_id = $1 AND year * 12 + month BETWEEN $2 AND $3
        "#,
    )
    .bind(user_id)
    .bind(first)
    .bind(last)
    .fetch_all(pool)
    .await?;
    let monthly: HashMap<(i64, i32, u32), Decimal> = budget_rows
        .into_iter()
        .map(|(cat, y, m, amount)| ((cat, y, m as u32), amount))
        .collect();

    let actual_rows: Vec<(i64, Decimal)> = sqlx::query_as(
        r#"
        SELECT category_id, SUM(amount)
        FROM transactions
        WHERE user_id = $1 AND tx_type = 'EXPENSE'
          AND occurred_on BETWEEN $2 AND $3
          AND category_id IS NOT NULL
        GROUP BY category_id
        "#,
    )
    .bind(user_id)
    .bind(period.start)
    .bind(period.end)
    .fetch_all(pool)
    .await?;
    let actual: HashMap<i64, Decimal> = actual_rows.into_iter().collect();

    Ok(stats::compare_budgets(&categories, &monthly, &actual, period))
}

pub async fn expense_heatmap_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(q): ApiQuery<PeriodQuery>,
) -> AppResult<Json<Vec<HeatmapCell>>> {
    let period = q.resolve(Period::trailing_months(today(), 12))?;
    tracing::info!(
        user_id = %user.user_id,
        start = %period.start,
        end = %period.end,
        "building expense heatmap"
    );

    let rows = sqlx::query_as::<_, stats::HeatmapRow>(
        r#"
        SELECT
            c.name AS category,
            EXTRACT(DOW FROM t.occurred_on)::INT AS dow,
            SUM(t.amount) AS amount
        FROM transactions t
        LEFT JOIN categories c ON c.id = t.category_id
        WHERE t.user_id = $1 AND t.tx_type = 'EXPENSE'
          AND t.occurred_on BETWEEN $2 AND $3
        GROUP BY c.name, dow
        ORDER BY c.name NULLS LAST, dow
        "#,
    )
    .bind(user.user_id)
    .bind(period.start)
    .bind(period.end)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(stats::heatmap(rows)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(start: Option<&str>, end: Option<&str>) -> PeriodQuery {
        PeriodQuery {
            start_date: start.map(str::to_string),
            end_date: end.map(str::to_string),
        }
    }

    fn fallback() -> Period {
        Period::year_of(NaiveDate::from_ymd_opt(2024, 5, 5).unwrap())
    }

    #[test]
    fn period_defaults_unless_both_bounds_given() {
        assert_eq!(q(None, None).resolve(fallback()).unwrap(), fallback());
        assert_eq!(
            q(Some("2023-01-01"), None).resolve(fallback()).unwrap(),
            fallback()
        );
        let p = q(Some("2023-01-01"), Some("2023-03-31"))
            .resolve(fallback())
            .unwrap();
        assert_eq!(p.start, NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
        assert_eq!(p.end, NaiveDate::from_ymd_opt(2023, 3, 31).unwrap());
    }

    #[test]
    fn bad_bounds_are_rejected() {
        assert!(q(Some("2023-05-01"), Some("2023-04-01"))
            .resolve(fallback())
            .is_err());
        assert!(q(Some("nope"), Some("2023-04-01"))
            .resolve(fallback())
            .is_err());
        assert!(q(None, Some("2023-04-01")).required().is_err());
    }
}
