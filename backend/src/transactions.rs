use std::fmt;
use std::str::FromStr;

use axum::{
    extract::State,
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::categories::find_visible_category;
use crate::categorizer;
use crate::error::{AppError, AppResult};
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::import::parse_date;
use crate::routes::AppState;

pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Exclusive bound on a stored magnitude: 10^12 fills NUMERIC(14,2).
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(3_567_587_328, 232, 0, false, 0);

/// Rounds to cents (half away from zero) and rejects values the money
/// columns cannot hold.
pub fn money_amount(raw: Decimal) -> Option<Decimal> {
    let cents = raw.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    (cents.abs() < MAX_AMOUNT).then_some(cents)
}

fn checked_amount(raw: Decimal) -> AppResult<Decimal> {
    let amount = money_amount(raw)
        .ok_or_else(|| AppError::validation("Amount must be less than 1,000,000,000,000"))?;
    if amount.is_zero() {
        return Err(AppError::validation("Amount must be a non-zero number"));
    }
    Ok(amount)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxType {
    Income,
    Expense,
    Transfer,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Income => "INCOME",
            TxType::Expense => "EXPENSE",
            TxType::Transfer => "TRANSFER",
        }
    }

    /// Imported rows carry a signed amount: negative means money out.
    pub fn from_signed_amount(amount: Decimal) -> Self {
        if amount.is_sign_negative() && !amount.is_zero() {
            TxType::Expense
        } else {
            TxType::Income
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INCOME" => Ok(TxType::Income),
            "EXPENSE" => Ok(TxType::Expense),
            "TRANSFER" => Ok(TxType::Transfer),
            other => Err(AppError::validation(format!(
                "Unknown transaction type: {other}"
            ))),
        }
    }
}

/// A transaction ready to be written.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub occurred_on: NaiveDate,
    pub description: String,
    pub amount: Decimal,
    pub tx_type: TxType,
    pub category_id: Option<i64>,
    pub reference: Option<String>,
}

pub(crate) const SELECT_TX: &str = r#"
    SELECT
        t.id, t.occurred_on, t.description, t.amount, t.tx_type, t.reference,
        t.category_id, c.name AS category_name, c.color AS category_color,
        t.created_at, t.updated_at
    FROM transactions t
    LEFT JOIN categories c ON c.id = t.category_id
"#;

pub async fn insert_transaction<'e, E>(
    executor: E,
    user_id: Uuid,
    new_tx: &NewTransaction,
) -> Result<Uuid, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO transactions
            (id, user_id, category_id, occurred_on, description, amount, tx_type, reference)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(new_tx.category_id)
    .bind(new_tx.occurred_on)
    .bind(&new_tx.description)
    .bind(new_tx.amount.abs())
    .bind(new_tx.tx_type.as_str())
    .bind(&new_tx.reference)
    .fetch_one(executor)
    .await?;
    Ok(id)
}

pub async fn find_transaction(
    pool: &PgPool,
    user_id: Uuid,
    tx_id: Uuid,
) -> Result<Option<TransactionRow>, sqlx::Error> {
    let mut qb = QueryBuilder::<Postgres>::new(SELECT_TX);
    qb.push(" WHERE t.user_id = ");
    qb.push_bind(user_id);
    qb.push(" AND t.id = ");
    qb.push_bind(tx_id);
    qb.build_query_as::<TransactionRow>()
        .fetch_optional(pool)
        .await
}

pub async fn create_transaction_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiJson(req): ApiJson<TransactionReq>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let (Some(raw_date), Some(description), Some(amount), Some(raw_type)) = (
        req.date.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        req.description
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty()),
        req.amount,
        req.tx_type.as_deref().map(str::trim).filter(|s| !s.is_empty()),
    ) else {
        return Err(AppError::validation(
            "Date, description, amount, and type are required",
        ));
    };

    let occurred_on =
        parse_date(raw_date).ok_or_else(|| AppError::validation("Date is not valid"))?;
    let amount = checked_amount(amount)?;
    check_description(description)?;
    let tx_type: TxType = raw_type.parse()?;

    let category_id = match req.category_id {
        Some(id) => {
            find_visible_category(&state.pool, user.user_id, id)
                .await?
                .ok_or_else(|| AppError::validation("Category not found"))?;
            Some(id)
        }
        None => {
            categorizer::resolve_category_with_pool(&state.pool, user.user_id, description)
                .await?
        }
    };

    let new_tx = NewTransaction {
        occurred_on,
        description: description.to_string(),
        amount: amount.abs(),
        tx_type,
        category_id,
        reference: trimmed(req.reference),
    };
    let id = insert_transaction(&state.pool, user.user_id, &new_tx).await?;
    let row = find_transaction(&state.pool, user.user_id, id)
        .await?
        .ok_or_else(|| AppError::Internal("created transaction vanished".into()))?;

    tracing::info!(user_id = %user.user_id, tx_id = %id, "transaction created");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Transaction created successfully",
            "transaction": TransactionDto::from(row),
        })),
    ))
}

pub async fn get_transaction_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiPath(tx_id): ApiPath<Uuid>,
) -> AppResult<Json<Value>> {
    let row = find_transaction(&state.pool, user.user_id, tx_id)
        .await?
        .ok_or_else(|| AppError::not_found("Transaction not found"))?;
    Ok(Json(json!({
        "success": true,
        "transaction": TransactionDto::from(row),
    })))
}

pub async fn update_transaction_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiPath(tx_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<TransactionReq>,
) -> AppResult<Json<Value>> {
    let current = find_transaction(&state.pool, user.user_id, tx_id)
        .await?
        .ok_or_else(|| AppError::not_found("Transaction not found"))?;

    let mut occurred_on = current.occurred_on;
    if let Some(raw) = req.date.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        occurred_on = parse_date(raw).ok_or_else(|| AppError::validation("Date is not valid"))?;
    }
    let mut description = current.description;
    if let Some(d) = req.description.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        check_description(d)?;
        description = d.to_string();
    }
    let mut amount = current.amount;
    if let Some(a) = req.amount.filter(|a| !a.is_zero()) {
        amount = checked_amount(a)?.abs();
    }
    let mut tx_type = current.tx_type;
    if let Some(t) = req.tx_type.as_deref().filter(|s| !s.trim().is_empty()) {
        tx_type = t.parse::<TxType>()?.as_str().to_string();
    }
    let mut category_id = current.category_id;
    if let Some(id) = req.category_id {
        // Unknown categories leave the assignment unchanged.
        if find_visible_category(&state.pool, user.user_id, id)
            .await?
            .is_some()
        {
            category_id = Some(id);
        }
    }
    let reference = match req.reference {
        Some(r) => trimmed(Some(r)),
        None => current.reference,
    };

    let res = sqlx::query(
        r#"
        UPDATE transactions
        SET occurred_on = $1, description = $2, amount = $3, tx_type = $4,
            category_id = $5, reference = $6, updated_at = now()
        WHERE id = $7 AND user_id = $8
        "#,
    )
    .bind(occurred_on)
    .bind(&description)
    .bind(amount)
    .bind(&tx_type)
    .bind(category_id)
    .bind(&reference)
    .bind(tx_id)
    .bind(user.user_id)
    .execute(&state.pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(AppError::not_found("Transaction not found"));
    }

    let row = find_transaction(&state.pool, user.user_id, tx_id)
        .await?
        .ok_or_else(|| AppError::not_found("Transaction not found"))?;
    tracing::info!(user_id = %user.user_id, %tx_id, "transaction updated");
    Ok(Json(json!({
        "success": true,
        "message": "Transaction updated successfully",
        "transaction": TransactionDto::from(row),
    })))
}

pub async fn delete_transaction_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiPath(tx_id): ApiPath<Uuid>,
) -> AppResult<Json<Value>> {
    delete_transaction_db(&state.pool, user.user_id, tx_id)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => AppError::not_found("Transaction not found"),
            other => other.into(),
        })?;

    tracing::info!(user_id = %user.user_id, %tx_id, "transaction deleted");
    Ok(Json(json!({
        "success": true,
        "message": "Transaction deleted successfully",
    })))
}

pub async fn delete_transaction_db(
    pool: &PgPool,
    user_id: Uuid,
    tx_id: Uuid,
) -> Result<(), sqlx::Error> {
    let result = sqlx::query("DELETE FROM transactions WHERE user_id = $1 AND id = $2")
        .bind(user_id)
        .bind(tx_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(sqlx::Error::RowNotFound);
    }

    Ok(())
}

pub async fn list_transactions_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiQuery(q): ApiQuery<ListTxQuery>,
) -> AppResult<Json<Page<TransactionDto>>> {
    let filter = TxFilter::from_query(&q)?;
    let page = list_transactions_db(&state.pool, user.user_id, &filter).await?;
    Ok(Json(page))
}

/// Validated listing parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TxFilter {
    pub page: i64,
    pub size: i64,
    pub sort_col: &'static str,
    pub descending: bool,
    pub period: Option<(NaiveDate, NaiveDate)>,
    pub tx_type: Option<TxType>,
    pub category_id: Option<i64>,
}

impl TxFilter {
    pub fn from_query(q: &ListTxQuery) -> AppResult<Self> {
        let sort_col = match q.sort_by.as_deref() {
            Some("amount") => "t.amount",
            Some("description") => "t.description",
            Some("type") => "t.tx_type",
            Some("createdAt") | Some("created_at") => "t.created_at",
            _ => "t.occurred_on",
        };
        let descending = !matches!(q.sort_dir.as_deref(), Some(d) if d.eq_ignore_ascii_case("asc"));

        let period = match (q.start_date.as_deref(), q.end_date.as_deref()) {
            (Some(s), Some(e)) => {
                let start =
                    parse_date(s).ok_or_else(|| AppError::validation("startDate is not valid"))?;
                let end =
                    parse_date(e).ok_or_else(|| AppError::validation("endDate is not valid"))?;
                Some((start, end))
            }
            _ => None,
        };
        let tx_type = q
            .tx_type
            .as_deref()
            .map(str::parse::<TxType>)
            .transpose()?;

        let page = q.page.unwrap_or(0).max(0);
        let size = q.size.unwrap_or(50).clamp(1, 100);
        if page.checked_mul(size).is_none() {
            return Err(AppError::validation("page is out of range"));
        }

        Ok(Self {
            page,
            size,
            sort_col,
            descending,
            period,
            tx_type,
            category_id: q.category_id,
        })
    }

    /// Rows to skip; bounded by the check in [`TxFilter::from_query`].
    pub fn offset(&self) -> i64 {
        self.page.saturating_mul(self.size)
    }

    fn push_where(&self, qb: &mut QueryBuilder<'_, Postgres>, user_id: Uuid) {
        qb.push(" WHERE t.user_id = ");
        qb.push_bind(user_id);
        if let Some((start, end)) = self.period {
            qb.push(" AND t.occurred_on BETWEEN ");
            qb.push_bind(start);
            qb.push(" AND ");
            qb.push_bind(end);
        }
        if let Some(t) = self.tx_type {
            qb.push(" AND t.tx_type = ");
            qb.push_bind(t.as_str());
        }
        if let Some(c) = self.category_id {
            qb.push(" AND t.category_id = ");
            qb.push_bind(c);
        }
    }
}

pub async fn list_transactions_db(
    pool: &PgPool,
    user_id: Uuid,
    filter: &TxFilter,
) -> Result<Page<TransactionDto>, sqlx::Error> {
    let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM transactions t");
    filter.push_where(&mut count_qb, user_id);
    let (total,): (i64,) = count_qb.build_query_as().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Postgres>::new(SELECT_TX);
    filter.push_where(&mut qb, user_id);
    let dir = if filter.descending { "DESC" } else { "ASC" };
    qb.push(format!(" ORDER BY {} {}, t.created_at DESC", filter.sort_col, dir).as_str());
    qb.push(" LIMIT ");
    qb.push_bind(filter.size);
    qb.push(" OFFSET ");
    qb.push_bind(filter.offset());

    let rows: Vec<TransactionRow> = qb.build_query_as().fetch_all(pool).await?;
    Ok(Page::new(
        rows.into_iter().map(Into::into).collect(),
        total,
        filter.page,
        filter.size,
    ))
}

fn check_description(d: &str) -> AppResult<()> {
    if d.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(AppError::validation(format!(
            "Description must be at most {MAX_DESCRIPTION_LEN} characters"
        )));
    }
    Ok(())
}

fn trimmed(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReq {
    pub date: Option<String>,
    pub description: Option<String>,
    pub amount: Option<Decimal>,
    #[serde(rename = "type")]
    pub tx_type: Option<String>,
    pub category_id: Option<i64>,
    pub reference: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTxQuery {
    pub page: Option<i64>,
    pub size: Option<i64>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(rename = "type")]
    pub tx_type: Option<String>,
    pub category_id: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub size: i64,
    pub total_pages: i64,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, total: i64, page: i64, size: i64) -> Self {
        let total_pages = if size > 0 { (total + size - 1) / size } else { 0 };
        Self {
            data,
            total,
            page,
            size,
            total_pages,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TransactionRow {
    pub id: Uuid,
    pub occurred_on: NaiveDate,
    pub description: String,
    pub amount: Decimal, // NUMERIC(14,2), stored unsigned
    pub tx_type: String,
    pub reference: Option<String>,
    pub category_id: Option<i64>,
    pub category_name: Option<String>,
    pub category_color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryRef {
    pub id: i64,
    pub name: String,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDto {
    pub id: Uuid,
    pub date: NaiveDate,
    pub description: String,
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub tx_type: String,
    pub reference: Option<String>,
    pub category: Option<CategoryRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<TransactionRow> for TransactionDto {
    fn from(r: TransactionRow) -> Self {
        let category = match (r.category_id, r.category_name) {
            (Some(id), Some(name)) => Some(CategoryRef {
                id,
                name,
                color: r.category_color,
            }),
            _ => None,
        };
        Self {
            id: r.id,
            date: r.occurred_on,
            description: r.description,
            amount: r.amount,
            tx_type: r.tx_type,
            reference: r.reference,
            category,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}
