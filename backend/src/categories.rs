use axum::{
    extract::State,
    http::StatusCode,
    Extension, Json,
};
use chrono::{Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{AppError, AppResult};
use crate::extract::{ApiJson, ApiPath};
use crate::routes::AppState;
use crate::transactions::money_amount;

pub const DEFAULT_COLOR: &str = "#9E9E9E";

/// System categories shared by every user: (name, description, color).
pub const SYSTEM_CATEGORIES: &[(&str, &str, &str)] = &[
    ("Food & Dining", "Groceries, restaurants, and food expenses", "#FF6384"),
    ("Transportation", "Gas, public transit, and travel", "#36A2EB"),
    ("Shopping", "Clothing, electronics, and general shopping", "#FFCE56"),
    ("Bills & Utilities", "Electricity, water, internet, and phone bills", "#4BC0C0"),
    ("Entertainment", "Movies, games, and leisure activities", "#9966FF"),
    ("Healthcare", "Medical expenses and pharmacy", "#FF9F40"),
    ("Income", "Salary, freelance, and other income", "#4CAF50"),
    ("Transfer", "Money transfers and ATM withdrawals", "#757575"),
    ("Housing", "Rent, mortgage, and property expenses", "#795548"),
    ("Insurance", "Health, car, and life insurance", "#607D8B"),
    ("Other", "Miscellaneous expenses", "#9E9E9E"),
];

/// Inserts any missing system category. Safe to run on every startup.
pub async fn seed_system_categories(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let mut inserted = 0;
    for (name, description, color) in SYSTEM_CATEGORIES {
        let res = sqlx::query(
            r#"
            INSERT INTO categories (user_id, name, description, color)
            VALUES (NULL, $1, $2, $3)
            ON CONFLICT (name) WHERE user_id IS NULL DO NOTHING
            "#,
        )
        .bind(*name)
        .bind(*description)
        .bind(*color)
        .execute(pool)
        .await?;
        inserted += res.rows_affected();
    }
    Ok(inserted)
}

pub async fn list_categories_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<Vec<CategoryDto>>> {
    let rows = list_categories_db(&state.pool, user.user_id).await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// Categories visible to the user with the budget in effect this month.
pub async fn list_categories_db(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Vec<CategoryRow>, sqlx::Error> {
    let today = Utc::now().date_naive();
    sqlx::query_as::<_, CategoryRow>(
        r#"
        SELECT
            c.id, c.user_id, c.name, c.description, c.color,
            COALESCE(b.monthly_budget, c.monthly_budget) AS monthly_budget
        FROM categories c
        LEFT JOIN user_category_budgets b
            ON b.category_id = c.id AND b.user_id = $1 AND b.year = $2 AND b.month = $3
        WHERE c.user_id IS NULL OR c.user_id = $1
        ORDER BY c.name
        "#,
    )
    .bind(user_id)
    .bind(today.year())
    .bind(today.month() as i32)
    .fetch_all(pool)
    .await
}

pub async fn get_category_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiPath(category_id): ApiPath<i64>,
) -> AppResult<Json<CategoryDto>> {
    let row = find_visible_category(&state.pool, user.user_id, category_id)
        .await?
        .ok_or_else(|| AppError::not_found("Category not found"))?;
    Ok(Json(row.into()))
}

pub async fn find_visible_category(
    pool: &PgPool,
    user_id: Uuid,
    category_id: i64,
) -> Result<Option<CategoryRow>, sqlx::Error> {
    sqlx::query_as::<_, CategoryRow>(
        r#"
        SELECT id, user_id, name, description, color, monthly_budget
        FROM categories
        WHERE id = $1 AND (user_id IS NULL OR user_id = $2)
        "#,
    )
    .bind(category_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

async fn find_owned_category(
    pool: &PgPool,
    user_id: Uuid,
    category_id: i64,
) -> Result<Option<CategoryRow>, sqlx::Error> {
    sqlx::query_as::<_, CategoryRow>(
        r#"
        SELECT id, user_id, name, description, color, monthly_budget
        FROM categories
        WHERE id = $1 AND user_id = $2
        "#,
    )
    .bind(category_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

async fn visible_name_taken(
    pool: &PgPool,
    user_id: Uuid,
    name: &str,
    except_id: Option<i64>,
) -> Result<bool, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT id FROM categories
        WHERE name = $1
          AND (user_id IS NULL OR user_id = $2)
          AND ($3::BIGINT IS NULL OR id <> $3)
        LIMIT 1
        "#,
    )
    .bind(name)
    .bind(user_id)
    .bind(except_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

pub async fn create_category_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiJson(req): ApiJson<CategoryReq>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let name = req
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| AppError::validation("Category name is required"))?
        .to_string();
    let monthly_budget = req.monthly_budget.unwrap_or(Decimal::ZERO);
    check_budget(monthly_budget)?;
    if let Some(color) = req.color.as_deref() {
        check_color(color)?;
    }

    if visible_name_taken(&state.pool, user.user_id, &name, None).await? {
        return Err(AppError::validation("Category already exists"));
    }

    let row = sqlx::query_as::<_, CategoryRow>(
        r#"
        INSERT INTO categories (user_id, name, description, color, monthly_budget)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, user_id, name, description, color, monthly_budget
        "#,
    )
    .bind(user.user_id)
    .bind(&name)
    .bind(req.description)
    .bind(req.color.unwrap_or_else(|| DEFAULT_COLOR.to_string()))
    .bind(monthly_budget)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(user_id = %user.user_id, category_id = row.id, %name, "category created");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Category created successfully",
            "category": CategoryDto::from(row),
        })),
    ))
}

pub async fn update_category_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiPath(category_id): ApiPath<i64>,
    ApiJson(req): ApiJson<CategoryReq>,
) -> AppResult<Json<Value>> {
    let mut row = find_owned_category(&state.pool, user.user_id, category_id)
        .await?
        .ok_or_else(|| {
            AppError::not_found("Category not found or you do not have permission to update it")
        })?;

    if let Some(name) = req.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        if name != row.name {
            if visible_name_taken(&state.pool, user.user_id, name, Some(category_id)).await? {
                return Err(AppError::validation("Category name already exists"));
            }
            row.name = name.to_string();
        }
    }
    if let Some(description) = req.description {
        row.description = Some(description);
    }
    if let Some(color) = req.color {
        check_color(&color)?;
        row.color = color;
    }
    if let Some(budget) = req.monthly_budget {
        check_budget(budget)?;
        row.monthly_budget = budget;
    }

    let row = sqlx::query_as::<_, CategoryRow>(
        r#"
        UPDATE categories
        SET name = $1, description = $2, color = $3, monthly_budget = $4, updated_at = now()
        WHERE id = $5 AND user_id = $6
        RETURNING id, user_id, name, description, color, monthly_budget
        "#,
    )
    .bind(&row.name)
    .bind(&row.description)
    .bind(&row.color)
    .bind(row.monthly_budget)
    .bind(category_id)
    .bind(user.user_id)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(user_id = %user.user_id, category_id, "category updated");
    Ok(Json(json!({
        "success": true,
        "message": "Category updated successfully",
        "category": CategoryDto::from(row),
    })))
}

pub async fn set_budget_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiPath(category_id): ApiPath<i64>,
    ApiJson(req): ApiJson<BudgetReq>,
) -> AppResult<Json<Value>> {
    let amount = req
        .monthly_budget
        .ok_or_else(|| AppError::validation("monthlyBudget is required"))?;
    check_budget(amount)?;

    let today = Utc::now().date_naive();
    let year = req.year.unwrap_or(today.year());
    let month = req.month.unwrap_or(today.month() as i32);
    if !(1..=12).contains(&month) {
        return Err(AppError::validation("month must be between 1 and 12"));
    }

    let category = find_visible_category(&state.pool, user.user_id, category_id)
        .await?
        .ok_or_else(|| AppError::not_found("Category not found"))?;

    let budget = sqlx::query_as::<_, BudgetRow>(
        r#"
        INSERT INTO user_category_budgets (user_id, category_id, year, month, monthly_budget)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (user_id, category_id, year, month)
        DO UPDATE SET monthly_budget = EXCLUDED.monthly_budget, updated_at = now()
        RETURNING category_id, year, month, monthly_budget
        "#,
    )
    .bind(user.user_id)
    .bind(category_id)
    .bind(year)
    .bind(month)
    .bind(amount)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(
        user_id = %user.user_id,
        category = %category.name,
        year,
        month,
        budget = %amount,
        "budget updated"
    );
    Ok(Json(json!({
        "success": true,
        "message": "Budget updated successfully",
        "budget": budget,
    })))
}

pub async fn delete_category_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiPath(category_id): ApiPath<i64>,
) -> AppResult<Json<Value>> {
    find_owned_category(&state.pool, user.user_id, category_id)
        .await?
        .ok_or_else(|| {
            AppError::not_found("Category not found or you do not have permission to delete it")
        })?;

    let used = count_category_transactions(&state.pool, user.user_id, category_id).await?;
    if used > 0 {
        return Err(AppError::validation(format!(
            "Cannot delete category. It is used by {used} transaction(s)."
        )));
    }

    let mut tx = state.pool.begin().await?;
    sqlx::query("DELETE FROM user_category_budgets WHERE category_id = $1 AND user_id = $2")
        .bind(category_id)
        .bind(user.user_id)
        .execute(&mut *tx)
        .await?;
    let res = sqlx::query("DELETE FROM categories WHERE id = $1 AND user_id = $2")
        .bind(category_id)
        .bind(user.user_id)
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() == 0 {
        return Err(AppError::not_found("Category not found"));
    }
    tx.commit().await?;

    tracing::info!(user_id = %user.user_id, category_id, "category deleted");
    Ok(Json(json!({
        "success": true,
        "message": "Category deleted successfully",
    })))
}

pub async fn transaction_count_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ApiPath(category_id): ApiPath<i64>,
) -> AppResult<Json<Value>> {
    find_visible_category(&state.pool, user.user_id, category_id)
        .await?
        .ok_or_else(|| AppError::not_found("Category not found"))?;
    let count = count_category_transactions(&state.pool, user.user_id, category_id).await?;
    Ok(Json(json!({ "success": true, "transactionCount": count })))
}

async fn count_category_transactions(
    pool: &PgPool,
    user_id: Uuid,
    category_id: i64,
) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM transactions WHERE category_id = $1 AND user_id = $2")
            .bind(category_id)
            .bind(user_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

fn check_budget(amount: Decimal) -> AppResult<()> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(AppError::validation("monthlyBudget must not be negative"));
    }
    if money_amount(amount).is_none() {
        return Err(AppError::validation(
            "monthlyBudget must be less than 1,000,000,000,000",
        ));
    }
    Ok(())
}

/// Colors are CSS hex: `#RGB` or `#RRGGBB`.
fn check_color(color: &str) -> AppResult<()> {
    let valid = color.strip_prefix('#').is_some_and(|hex| {
        matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit())
    });
    if !valid {
        return Err(AppError::validation(
            "Color must be a hex color like #RGB or #RRGGBB",
        ));
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryReq {
    pub name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub monthly_budget: Option<Decimal>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetReq {
    pub monthly_budget: Option<Decimal>,
    pub year: Option<i32>,
    pub month: Option<i32>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CategoryRow {
    pub id: i64,
    pub user_id: Option<Uuid>, // NULL for system categories
    pub name: String,
    pub description: Option<String>,
    pub color: String,
    pub monthly_budget: Decimal,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BudgetRow {
    pub category_id: i64,
    pub year: i32,
    pub month: i32,
    pub monthly_budget: Decimal,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CategoryDto {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub color: String,
    pub monthly_budget: Decimal,
    pub is_system_category: bool,
}

impl From<CategoryRow> for CategoryDto {
    fn from(r: CategoryRow) -> Self {
        Self {
            id: r.id,
            name: r.name,
            description: r.description,
            color: r.color,
            monthly_budget: r.monthly_budget,
            is_system_category: r.user_id.is_none(),
        }
    }
}
