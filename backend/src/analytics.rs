//! Local statistical analytics: per-category expense forecasts, spending
//! anomalies and rule-based insights. Everything is computed from the
//! user's own history; no external model is consulted.

use std::collections::HashMap;
use std::hash::Hash;

use axum::{extract::State, Extension, Json};
use chrono::{Datelike, Days, Months, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::categorizer::{self, FALLBACK_CATEGORY};
use crate::dashboard::{today, PeriodQuery};
use crate::error::{AppError, AppResult};
use crate::extract::{ApiJson, ApiQuery};
use crate::stats::{day_name, Period};
use crate::transactions::{TransactionDto, TransactionRow, SELECT_TX};
use crate::routes::AppState;

pub const HISTORY_DAYS: u64 = 90;
pub const MAX_DAYS_AHEAD: u32 = 365;
pub const ANOMALY_FACTOR: Decimal = Decimal::from_parts(25, 0, 0, false, 1);
pub const PREDICTION_MODEL: &str = "Linear Trend + Historical Average";

const HIGH_MONTHLY_SPENDING: Decimal = Decimal::from_parts(5000, 0, 0, false, 0);
const INSIGHT_MONTHS: u32 = 6;
const TREND_THRESHOLD: Decimal = Decimal::from_parts(1, 0, 0, false, 1);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpensePrediction {
    pub prediction_date: NaiveDate,
    pub predicted_amount: Decimal,
    pub category_name: String,
    pub confidence: f64,
    pub insights: Vec<String>,
    pub prediction_model: &'static str,
}

fn money(d: Decimal) -> Decimal {
    d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.iter().sum::<Decimal>() / Decimal::from(values.len())
}

/// Relative change between the mean of the later half of the history and
/// the mean of the earlier half.
pub fn half_split_trend(samples: &[(NaiveDate, Decimal)]) -> Decimal {
    if samples.len() < 2 {
        return Decimal::ZERO;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by_key(|(day, _)| *day);
    let amounts: Vec<Decimal> = sorted.iter().map(|(_, a)| a.abs()).collect();
    let (first, second) = amounts.split_at(amounts.len() / 2);
    let first = mean(first);
    if first <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (mean(second) - first) / first
}

pub fn confidence(samples: usize) -> f64 {
    match samples {
        0..=2 => 0.3,
        3..=9 => 0.6,
        _ => 0.8,
    }
}

/// Forecasts one category's spend over the next `days_ahead` days from its
/// expense history. `samples` must not be empty.
pub fn predict_category(
    name: &str,
    samples: &[(NaiveDate, Decimal)],
    days_ahead: u32,
    today: NaiveDate,
) -> ExpensePrediction {
    let total: Decimal = samples.iter().map(|(_, a)| a.abs()).sum();
    let first = samples.iter().map(|(d, _)| *d).min().unwrap_or(today);
    let last = samples.iter().map(|(d, _)| *d).max().unwrap_or(today);
    let days_covered = ((last - first).num_days() + 1).max(1);

    let daily = total / Decimal::from(days_covered);
    let trend = half_split_trend(samples);
    let adjusted = daily * (Decimal::ONE + trend);

    let pct = (trend * Decimal::ONE_HUNDRED).abs();
    let mut insights = vec![if trend > TREND_THRESHOLD {
        format!("Spending in {name} is trending upward by {pct:.1}%")
    } else if trend < -TREND_THRESHOLD {
        format!("Spending in {name} is trending downward by {pct:.1}%")
    } else {
        format!("Spending in {name} is relatively stable")
    }];
    let average = if samples.is_empty() {
        Decimal::ZERO
    } else {
        total / Decimal::from(samples.len())
    };
    insights.push(format!("Average transaction amount: ${:.2}", money(average)));

    ExpensePrediction {
        prediction_date: today
            .checked_add_days(Days::new(u64::from(days_ahead)))
            .unwrap_or(today),
        predicted_amount: money(adjusted * Decimal::from(days_ahead)),
        category_name: name.to_string(),
        confidence: confidence(samples.len()),
        insights,
        prediction_model: PREDICTION_MODEL,
    }
}

/// One forecast per category, largest predicted amount first.
pub fn predict_expenses(
    history: Vec<(NaiveDate, Decimal, Option<String>)>,
    days_ahead: u32,
    today: NaiveDate,
) -> Vec<ExpensePrediction> {
    let mut by_category: HashMap<String, Vec<(NaiveDate, Decimal)>> = HashMap::new();
    for (day, amount, category) in history {
        by_category
            .entry(category.unwrap_or_else(|| FALLBACK_CATEGORY.to_string()))
            .or_default()
            .push((day, amount));
    }

    let mut out: Vec<ExpensePrediction> = by_category
        .iter()
        .map(|(name, samples)| predict_category(name, samples, days_ahead, today))
        .collect();
    out.sort_by(|a, b| {
        b.predicted_amount
            .cmp(&a.predicted_amount)
            .then_with(|| a.category_name.cmp(&b.category_name))
    });
    out
}

/// Items whose magnitude exceeds 2.5x the mean of their group. Groups with a
/// single item never produce anomalies.
pub fn find_anomalies<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> (K, Decimal),
{
    let mut groups: HashMap<K, (Decimal, usize)> = HashMap::new();
    for item in &items {
        let (k, amount) = key(item);
        let entry = groups.entry(k).or_default();
        entry.0 += amount.abs();
        entry.1 += 1;
    }

    items
        .into_iter()
        .filter(|item| {
            let (k, amount) = key(item);
            match groups.get(&k) {
                Some(&(sum, count)) if count > 1 => {
                    let threshold = sum / Decimal::from(count) * ANOMALY_FACTOR;
                    amount.abs() > threshold
                }
                _ => false,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingInsight {
    pub insight_type: &'static str,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impact: Option<Decimal>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
}

/// Rule-based observations over roughly six months of expenses.
pub fn spending_insights(
    expenses: &[(NaiveDate, Decimal)],
    recent_anomalies: usize,
) -> Vec<SpendingInsight> {
    let mut insights = Vec::new();

    let mut by_day = [Decimal::ZERO; 7];
    for (day, amount) in expenses {
        by_day[day.weekday().num_days_from_sunday() as usize] += amount.abs();
    }
    // first weekday wins a tie
    let peak = by_day
        .iter()
        .enumerate()
        .fold(None::<(usize, Decimal)>, |best, (i, &amount)| match best {
            Some((_, b)) if b >= amount => best,
            _ => Some((i, amount)),
        });
    if let Some((dow, _)) = peak.filter(|_| !expenses.is_empty()) {
        let day = day_name(dow as i32).unwrap_or("Unknown");
        insights.push(SpendingInsight {
            insight_type: "SPENDING_PATTERN",
            title: "Peak Spending Day".into(),
            description: format!("You spend the most on {day}s"),
            severity: Severity::Low,
            confidence: Some(0.8),
            impact: None,
            recommendations: Vec::new(),
        });
    }

    let total: Decimal = expenses.iter().map(|(_, a)| a.abs()).sum();
    let monthly = total / Decimal::from(INSIGHT_MONTHS);
    if monthly > HIGH_MONTHLY_SPENDING {
        insights.push(SpendingInsight {
            insight_type: "BUDGET_ALERT",
            title: "High Monthly Spending".into(),
            description: format!("Your average monthly expenses are ${:.2}", money(monthly)),
            severity: Severity::High,
            confidence: None,
            impact: Some(money(monthly)),
            recommendations: vec![
                "Review your largest expense categories".into(),
                "Consider setting spending limits".into(),
                "Look for subscription services you might not need".into(),
            ],
        });
    }

    if recent_anomalies > 0 {
        insights.push(SpendingInsight {
            insight_type: "ANOMALY_DETECTION",
            title: "Unusual Spending Detected".into(),
            description: format!(
                "Found {recent_anomalies} unusual transactions in the last month"
            ),
            severity: Severity::Medium,
            confidence: Some(0.7),
            impact: None,
            recommendations: Vec::new(),
        });
    }

    insights
}

/// Up to five lowercase words longer than three characters.
pub fn extract_keywords(description: &str) -> Vec<String> {
    description
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 3)
        .take(5)
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionQuery {
    pub days_ahead: Option<u32>,
}

fn check_days_ahead(days: u32, field: &str) -> AppResult<u32> {
    if !(1..=MAX_DAYS_AHEAD).contains(&days) {
        return Err(AppError::validation(format!(
            "{field} must be between 1 and {MAX_DAYS_AHEAD}"
        )));
    }
    Ok(days)
}

pub async fn predict_expenses_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(q): ApiQuery<PredictionQuery>,
) -> AppResult<Json<Vec<ExpensePrediction>>> {
    let days_ahead = check_days_ahead(q.days_ahead.unwrap_or(30), "daysAhead")?;
    let predictions = predictions_for(&state.pool, user.user_id, days_ahead, today()).await?;
    tracing::info!(
        user_id = %user.user_id,
        days_ahead,
        categories = predictions.len(),
        "expense predictions generated"
    );
    Ok(Json(predictions))
}

pub async fn anomalies_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(q): ApiQuery<PeriodQuery>,
) -> AppResult<Json<Vec<TransactionDto>>> {
    let period = q.resolve(Period::trailing_months(today(), 3))?;
    let found = spending_anomalies(&state.pool, user.user_id, &period).await?;
    Ok(Json(found.into_iter().map(TransactionDto::from).collect()))
}

pub async fn insights_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<Vec<SpendingInsight>>> {
    Ok(Json(insights_for(&state.pool, user.user_id, today()).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComprehensiveQuery {
    pub prediction_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub total_predictions: usize,
    pub total_insights: usize,
    pub total_anomalies: usize,
    pub prediction_period: String,
    pub generated_at: NaiveDate,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComprehensiveAnalysis {
    pub expense_predictions: Vec<ExpensePrediction>,
    pub spending_insights: Vec<SpendingInsight>,
    pub recent_anomalies: Vec<TransactionDto>,
    pub summary: AnalysisSummary,
}

impl ComprehensiveAnalysis {
    pub fn new(
        expense_predictions: Vec<ExpensePrediction>,
        spending_insights: Vec<SpendingInsight>,
        recent_anomalies: Vec<TransactionDto>,
        prediction_days: u32,
        generated_at: NaiveDate,
    ) -> Self {
        let summary = AnalysisSummary {
            total_predictions: expense_predictions.len(),
            total_insights: spending_insights.len(),
            total_anomalies: recent_anomalies.len(),
            prediction_period: format!("{prediction_days} days"),
            generated_at,
        };
        Self {
            expense_predictions,
            spending_insights,
            recent_anomalies,
            summary,
        }
    }
}

/// Predictions, insights and the last 30 days of anomalies in one payload.
pub async fn comprehensive_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(q): ApiQuery<ComprehensiveQuery>,
) -> AppResult<Json<ComprehensiveAnalysis>> {
    let days = check_days_ahead(q.prediction_days.unwrap_or(30), "predictionDays")?;
    let now = today();

    let predictions = predictions_for(&state.pool, user.user_id, days, now).await?;
    let insights = insights_for(&state.pool, user.user_id, now).await?;
    let anomalies = spending_anomalies(&state.pool, user.user_id, &Period::trailing_days(now, 30))
        .await?
        .into_iter()
        .map(TransactionDto::from)
        .collect();

    let analysis = ComprehensiveAnalysis::new(predictions, insights, anomalies, days, now);
    tracing::info!(
        user_id = %user.user_id,
        predictions = analysis.summary.total_predictions,
        insights = analysis.summary.total_insights,
        anomalies = analysis.summary.total_anomalies,
        "comprehensive analysis generated"
    );
    Ok(Json(analysis))
}

async fn predictions_for(
    pool: &PgPool,
    user_id: Uuid,
    days_ahead: u32,
    now: NaiveDate,
) -> Result<Vec<ExpensePrediction>, sqlx::Error> {
    let start = now.checked_sub_days(Days::new(HISTORY_DAYS)).unwrap_or(now);
    let history = expense_history(pool, user_id, start, now).await?;
    Ok(predict_expenses(history, days_ahead, now))
}

async fn insights_for(
    pool: &PgPool,
    user_id: Uuid,
    now: NaiveDate,
) -> Result<Vec<SpendingInsight>, sqlx::Error> {
    let start = now
        .checked_sub_months(Months::new(INSIGHT_MONTHS))
        .unwrap_or(now);
    let expenses: Vec<(NaiveDate, Decimal)> = expense_history(pool, user_id, start, now)
        .await?
        .into_iter()
        .map(|(day, amount, _)| (day, amount))
        .collect();
    let recent = spending_anomalies(pool, user_id, &Period::trailing_months(now, 1))
        .await?
        .len();
    Ok(spending_insights(&expenses, recent))
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeReq {
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResp {
    pub transaction_description: String,
    pub suggested_category: &'static str,
    pub extracted_keywords: Vec<String>,
}

pub async fn analyze_transaction_handler(
    ApiJson(req): ApiJson<AnalyzeReq>,
) -> AppResult<Json<AnalyzeResp>> {
    let description = req
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .ok_or_else(|| AppError::validation("Description is required"))?;

    Ok(Json(AnalyzeResp {
        suggested_category: categorizer::categorize(&description),
        extracted_keywords: extract_keywords(&description),
        transaction_description: description,
    }))
}

async fn expense_history(
    pool: &PgPool,
    user_id: Uuid,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<(NaiveDate, Decimal, Option<String>)>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT t.occurred_on, t.amount, c.name
        FROM transactions t
        LEFT JOIN categories c ON c.id = t.category_id
        WHERE t.user_id = $1 AND t.tx_type = 'EXPENSE'
          AND t.occurred_on BETWEEN $2 AND $3
        "#,
    )
    .bind(user_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await
}

pub async fn spending_anomalies(
    pool: &PgPool,
    user_id: Uuid,
    period: &Period,
) -> Result<Vec<TransactionRow>, sqlx::Error> {
    let sql = format!(
        "{SELECT_TX} WHERE t.user_id = $1 AND t.tx_type = 'EXPENSE' \
         AND t.occurred_on BETWEEN $2 AND $3 ORDER BY t.occurred_on DESC"
    );
    let rows = sqlx::query_as::<_, TransactionRow>(&sql)
        .bind(user_id)
        .bind(period.start)
        .bind(period.end)
        .fetch_all(pool)
        .await?;

    Ok(find_anomalies(rows, |r| {
        (
            r.category_name
                .clone()
                .unwrap_or_else(|| FALLBACK_CATEGORY.to_string()),
            r.amount,
        )
    }))
}
