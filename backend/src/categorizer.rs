//! Keyword based auto-categorization of transaction descriptions.

use sqlx::PgPool;
use uuid::Uuid;

pub const FALLBACK_CATEGORY: &str = "Other";

/// Category name -> keywords, in priority order for equal-length matches.
pub const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "Food & Dining",
        &[
            "grocery", "food", "restaurant", "cafe", "coffee", "lunch", "dinner", "breakfast",
            "pizza", "burger", "mcdonald", "starbucks", "subway",
        ],
    ),
    (
        "Transportation",
        &[
            "gas", "fuel", "uber", "lyft", "taxi", "metro", "bus", "train", "parking", "transit",
        ],
    ),
    (
        "Shopping",
        &[
            "amazon", "walmart", "target", "shop", "store", "mall", "clothing", "fashion",
        ],
    ),
    (
        "Bills & Utilities",
        &[
            "electric", "water", "gas bill", "internet", "phone", "mobile", "utility",
        ],
    ),
    (
        "Entertainment",
        &[
            "movie", "cinema", "netflix", "spotify", "game", "concert", "theater",
        ],
    ),
    (
        "Healthcare",
        &[
            "doctor", "hospital", "pharmacy", "medical", "health", "clinic", "prescription",
        ],
    ),
    (
        "Income",
        &[
            "salary", "payroll", "income", "deposit", "payment received", "transfer in",
        ],
    ),
    ("Transfer", &["transfer", "atm", "withdrawal", "cash"]),
    ("Housing", &["rent", "mortgage", "lease", "property"]),
    ("Insurance", &["insurance", "policy", "premium"]),
];

/// Picks a category name for a free-text description.
///
/// Every keyword contained in the lowercased description is a candidate and
/// the longest one wins, so "gas bill" beats "gas". Equal lengths keep table
/// order. Descriptions with no match fall back to [`FALLBACK_CATEGORY`].
pub fn categorize(description: &str) -> &'static str {
    let desc = description.to_lowercase();
    let mut best: Option<(&'static str, usize)> = None;

    for (category, keywords) in CATEGORY_KEYWORDS {
        for keyword in keywords.iter() {
            if desc.contains(keyword) {
                let better = match best {
                    Some((_, len)) => keyword.len() > len,
                    None => true,
                };
                if better {
                    best = Some((*category, keyword.len()));
                }
            }
        }
    }

    best.map(|(c, _)| c).unwrap_or(FALLBACK_CATEGORY)
}

/// Looks up a category visible to the user by name, preferring the user's
/// own category over the system one.
pub async fn find_category_id_by_name<'e, E>(
    executor: E,
    user_id: Uuid,
    name: &str,
) -> Result<Option<i64>, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT id FROM categories
        WHERE name = $1 AND (user_id = $2 OR user_id IS NULL)
        ORDER BY user_id NULLS LAST
        LIMIT 1
        "#,
    )
    .bind(name)
    .bind(user_id)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(|r| r.0))
}

/// Maps a description to a stored category id, falling back to "Other".
pub async fn resolve_category(
    conn: &mut sqlx::PgConnection,
    user_id: Uuid,
    description: &str,
) -> Result<Option<i64>, sqlx::Error> {
    let name = categorize(description);
    if let Some(id) = find_category_id_by_name(&mut *conn, user_id, name).await? {
        return Ok(Some(id));
    }
    if name != FALLBACK_CATEGORY {
        return find_category_id_by_name(&mut *conn, user_id, FALLBACK_CATEGORY).await;
    }
    Ok(None)
}

pub async fn resolve_category_with_pool(
    pool: &PgPool,
    user_id: Uuid,
    description: &str,
) -> Result<Option<i64>, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    resolve_category(&mut conn, user_id, description).await
}
