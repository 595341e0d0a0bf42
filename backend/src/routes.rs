use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::config::Config;
use crate::{analytics, auth, categories, dashboard, import, transactions};

/// Base64 inflates uploads by a third; this leaves room for a ~10 MB sheet.
pub const UPLOAD_BODY_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
}

pub fn app(state: AppState) -> Router {
    let protected = Router::<AppState>::new()
        // auth
        .route("/auth/me", get(auth::me))
        .route("/auth/signout", post(auth::signout))
        // categories
        .route(
            "/categories",
            get(categories::list_categories_handler).post(categories::create_category_handler),
        )
        .route(
            "/categories/:id",
            get(categories::get_category_handler)
                .put(categories::update_category_handler)
                .delete(categories::delete_category_handler),
        )
        .route("/categories/:id/budget", put(categories::set_budget_handler))
        .route(
            "/categories/:id/transaction-count",
            get(categories::transaction_count_handler),
        )
        // transactions
        .route(
            "/transactions",
            get(transactions::list_transactions_handler)
                .post(transactions::create_transaction_handler),
        )
        .route(
            "/transactions/:id",
            get(transactions::get_transaction_handler)
                .put(transactions::update_transaction_handler)
                .delete(transactions::delete_transaction_handler),
        )
        // import
        .route(
            "/upload/excel",
            post(import::upload_handler).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route("/upload/sample-format", get(import::sample_format_handler))
        // dashboard
        .route("/dashboard/summary", get(dashboard::summary_handler))
        .route(
            "/dashboard/summary/current-month",
            get(dashboard::current_month_summary_handler),
        )
        .route(
            "/dashboard/summary/current-year",
            get(dashboard::current_year_summary_handler),
        )
        .route(
            "/dashboard/transactions",
            get(transactions::list_transactions_handler),
        )
        .route("/dashboard/stats", get(dashboard::quick_stats_handler))
        .route("/dashboard/top-expenses", get(dashboard::top_expenses_handler))
        .route(
            "/dashboard/average-monthly-expenses",
            get(dashboard::average_monthly_expenses_handler),
        )
        .route(
            "/dashboard/budget-comparison",
            get(dashboard::budget_comparison_handler),
        )
        .route(
            "/dashboard/budget-comparison/period",
            get(dashboard::budget_comparison_period_handler),
        )
        .route(
            "/dashboard/expense-heatmap",
            get(dashboard::expense_heatmap_handler),
        )
        // analytics, also reachable under the older /ml-analytics prefix
        .nest("/analytics", analytics_routes())
        .nest("/ml-analytics", analytics_routes())
        .layer(from_fn_with_state(state.clone(), auth::auth_middleware));

    let api = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .merge(protected);

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .with_state(state)
}

fn analytics_routes() -> Router<AppState> {
    Router::new()
        .route("/predictions/expenses", get(analytics::predict_expenses_handler))
        .route("/anomalies/spending", get(analytics::anomalies_handler))
        .route("/insights/spending", get(analytics::insights_handler))
        .route(
            "/analyze/transaction",
            post(analytics::analyze_transaction_handler),
        )
        .route(
            "/analysis/comprehensive",
            get(analytics::comprehensive_handler),
        )
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "UP" }))
}
