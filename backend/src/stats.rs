//! Aggregations behind the dashboard: period summaries, monthly rollups,
//! budget-vs-actual comparisons and weekday heatmaps.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, Days, Months, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::transactions::TxType;

pub const UNCATEGORIZED: &str = "Uncategorized";
pub const UNDER_BUDGET_COLOR: &str = "#52c41a";
pub const OVER_BUDGET_COLOR: &str = "#ff4d4f";

const MONTH_NAMES: [&str; 12] = [
    "January", "February", "March", "April", "May", "June", "July", "August", "September",
    "October", "November", "December",
];

/// Postgres `EXTRACT(DOW ...)` numbering: 0 = Sunday.
const DAY_NAMES: [&str; 7] = [
    "Sunday", "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday",
];

/// Every (year, month) from start to end inclusive.
pub fn expand_month_range(mut sy: i32, mut sm: u32, ey: i32, em: u32) -> Vec<(i32, u32)> {
    let mut result = Vec::new();

    while sy < ey || (sy == ey && sm <= em) {
        result.push((sy, sm));
        sm += 1;
        if sm > 12 {
            sm = 1;
            sy += 1;
        }
    }

    result
}

pub fn month_name(month: u32) -> &'static str {
    MONTH_NAMES
        .get(month.wrapping_sub(1) as usize)
        .copied()
        .unwrap_or("Unknown")
}

pub fn day_name(dow: i32) -> Option<&'static str> {
    usize::try_from(dow).ok().and_then(|i| DAY_NAMES.get(i).copied())
}

/// An inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn month_of(day: NaiveDate) -> Self {
        let start = day.with_day(1).unwrap_or(day);
        let end = start
            .checked_add_months(Months::new(1))
            .and_then(|d| d.pred_opt())
            .unwrap_or(day);
        Self { start, end }
    }

    pub fn year_of(day: NaiveDate) -> Self {
        let start = NaiveDate::from_ymd_opt(day.year(), 1, 1).unwrap_or(day);
        let end = NaiveDate::from_ymd_opt(day.year(), 12, 31).unwrap_or(day);
        Self { start, end }
    }

    /// The `months` months leading up to and including `day`.
    pub fn trailing_months(day: NaiveDate, months: u32) -> Self {
        let start = day.checked_sub_months(Months::new(months)).unwrap_or(day);
        Self { start, end: day }
    }

    pub fn trailing_days(day: NaiveDate, days: u64) -> Self {
        let start = day.checked_sub_days(Days::new(days)).unwrap_or(day);
        Self { start, end: day }
    }

    pub fn months(&self) -> Vec<(i32, u32)> {
        expand_month_range(
            self.start.year(),
            self.start.month(),
            self.end.year(),
            self.end.month(),
        )
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerRow {
    pub occurred_on: NaiveDate,
    pub tx_type: String,
    pub amount: Decimal,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakdown {
    pub name: String,
    pub amount: Decimal,
    pub percentage: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyTrend {
    pub month: String,
    pub year: i32,
    pub month_num: u32,
    pub month_name: &'static str,
    pub income: Decimal,
    pub expenses: Decimal,
    pub net_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_income: Decimal,
    pub total_expenses: Decimal,
    pub net_income: Decimal,
    pub total_transactions: usize,
    pub category_breakdown: Vec<Breakdown>,
    pub income_breakdown: Vec<Breakdown>,
    pub monthly_trends: Vec<MonthlyTrend>,
}

/// Folds the period's transactions into totals, per-category breakdowns and
/// a month-by-month rollup. Transfers count toward the transaction total only.
pub fn summarize(rows: &[LedgerRow]) -> Summary {
    let mut total_income = Decimal::ZERO;
    let mut total_expenses = Decimal::ZERO;
    let mut expense_by_cat: HashMap<String, Decimal> = HashMap::new();
    let mut income_by_cat: HashMap<String, Decimal> = HashMap::new();
    let mut months: BTreeMap<(i32, u32), (Decimal, Decimal)> = BTreeMap::new();

    for row in rows {
        let Ok(kind) = row.tx_type.parse::<TxType>() else {
            continue;
        };
        let amount = row.amount.abs();
        let category = row.category.as_deref().unwrap_or(UNCATEGORIZED).to_string();
        let bucket = months
            .entry((row.occurred_on.year(), row.occurred_on.month()))
            .or_default();
        match kind {
            TxType::Income => {
                total_income += amount;
                *income_by_cat.entry(category).or_default() += amount;
                bucket.0 += amount;
            }
            TxType::Expense => {
                total_expenses += amount;
                *expense_by_cat.entry(category).or_default() += amount;
                bucket.1 += amount;
            }
            TxType::Transfer => {}
        }
    }

    let monthly_trends = months
        .into_iter()
        .map(|((year, month), (income, expenses))| MonthlyTrend {
            month: format!("{year}-{month:02}"),
            year,
            month_num: month,
            month_name: month_name(month),
            income,
            expenses,
            net_amount: income - expenses,
        })
        .collect();

    Summary {
        total_income,
        total_expenses,
        net_income: total_income - total_expenses,
        total_transactions: rows.len(),
        category_breakdown: breakdown(expense_by_cat),
        income_breakdown: breakdown(income_by_cat),
        monthly_trends,
    }
}

/// Share of each entry in the grand total, largest first.
pub fn breakdown(totals: HashMap<String, Decimal>) -> Vec<Breakdown> {
    let grand: Decimal = totals.values().map(|a| a.abs()).sum();
    let mut out: Vec<Breakdown> = totals
        .into_iter()
        .map(|(name, amount)| Breakdown {
            percentage: percentage_of(amount.abs(), grand),
            name,
            amount,
        })
        .collect();
    out.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.name.cmp(&b.name)));
    out
}

fn percentage_of(part: Decimal, whole: Decimal) -> Decimal {
    if whole.is_zero() {
        return Decimal::ZERO;
    }
    ((part / whole).round_dp(4) * Decimal::ONE_HUNDRED).normalize()
}

/// A category as seen by the budget comparison.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BudgetedCategory {
    pub id: i64,
    pub name: String,
    pub color: String,
    pub default_budget: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetComparison {
    pub category_name: String,
    pub budget_amount: Decimal,
    pub actual_amount: Decimal,
    pub percentage_difference: Decimal,
    pub status_color: &'static str,
    pub category_color: String,
}

/// Budget vs actual for every category that has a positive budget over the
/// period.
///
/// A category's budget is the sum, over each calendar month the period
/// touches, of the user's budget for that month or the category default when
/// no monthly budget was set.
pub fn compare_budgets(
    categories: &[BudgetedCategory],
    monthly: &HashMap<(i64, i32, u32), Decimal>,
    actual: &HashMap<i64, Decimal>,
    period: &Period,
) -> Vec<BudgetComparison> {
    let months = period.months();
    let mut out: Vec<BudgetComparison> = categories
        .iter()
        .filter_map(|cat| {
            let budget: Decimal = months
                .iter()
                .map(|&(y, m)| {
                    monthly
                        .get(&(cat.id, y, m))
                        .copied()
                        .unwrap_or(cat.default_budget)
                })
                .sum();
            if budget <= Decimal::ZERO {
                return None;
            }
            let actual_amount = actual.get(&cat.id).copied().unwrap_or(Decimal::ZERO).abs();
            let percentage_difference =
                ((actual_amount - budget) / budget * Decimal::ONE_HUNDRED).round_dp(2);
            Some(BudgetComparison {
                category_name: cat.name.clone(),
                budget_amount: budget,
                actual_amount,
                percentage_difference,
                status_color: if actual_amount <= budget {
                    UNDER_BUDGET_COLOR
                } else {
                    OVER_BUDGET_COLOR
                },
                category_color: cat.color.clone(),
            })
        })
        .collect();
    out.sort_by(|a, b| a.category_name.cmp(&b.category_name));
    out
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HeatmapRow {
    pub category: Option<String>,
    pub dow: i32,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapCell {
    pub category: String,
    pub day_of_week: &'static str,
    pub amount: Decimal,
}

pub fn heatmap(rows: Vec<HeatmapRow>) -> Vec<HeatmapCell> {
    rows.into_iter()
        .filter_map(|r| {
            let day = day_name(r.dow)?;
            Some(HeatmapCell {
                category: r.category.unwrap_or_else(|| UNCATEGORIZED.to_string()),
                day_of_week: day,
                amount: r.amount.abs(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn row(date: NaiveDate, kind: &str, amount: Decimal, cat: Option<&str>) -> LedgerRow {
        LedgerRow {
            occurred_on: date,
            tx_type: kind.to_string(),
            amount,
            category: cat.map(str::to_string),
        }
    }

    #[test]
    fn month_range_crosses_years() {
        assert_eq!(
            expand_month_range(2023, 11, 2024, 2),
            vec![(2023, 11), (2023, 12), (2024, 1), (2024, 2)]
        );
        assert_eq!(expand_month_range(2024, 5, 2024, 5), vec![(2024, 5)]);
        assert!(expand_month_range(2024, 6, 2024, 5).is_empty());
    }

    #[test]
    fn period_bounds() {
        let feb = Period::month_of(d(2024, 2, 17));
        assert_eq!(feb.start, d(2024, 2, 1));
        assert_eq!(feb.end, d(2024, 2, 29));
        let year = Period::year_of(d(2024, 6, 3));
        assert_eq!(year.start, d(2024, 1, 1));
        assert_eq!(year.end, d(2024, 12, 31));
        assert_eq!(year.days(), 366);
        assert!(Period::new(d(2024, 2, 1), d(2024, 1, 1)).is_none());
        assert_eq!(
            Period::trailing_months(d(2024, 3, 31), 1).start,
            d(2024, 2, 29)
        );
        let recent = Period::trailing_days(d(2024, 3, 1), 30);
        assert_eq!(recent.start, d(2024, 1, 31));
        assert_eq!(recent.days(), 31);
    }

    #[test]
    fn day_names_follow_postgres_dow() {
        assert_eq!(day_name(0), Some("Sunday"));
        assert_eq!(day_name(6), Some("Saturday"));
        assert_eq!(day_name(7), None);
        assert_eq!(day_name(-1), None);
        assert_eq!(month_name(1), "January");
        assert_eq!(month_name(13), "Unknown");
        assert_eq!(month_name(0), "Unknown");
    }

    #[test]
    fn summary_totals_and_rollups() {
        let rows = vec![
            row(d(2024, 1, 5), "INCOME", dec("3000"), Some("Income")),
            row(d(2024, 1, 9), "EXPENSE", dec("120.50"), Some("Food & Dining")),
            row(d(2024, 1, 20), "EXPENSE", dec("79.50"), None),
            row(d(2024, 2, 1), "EXPENSE", dec("300"), Some("Food & Dining")),
            row(d(2024, 2, 2), "TRANSFER", dec("50"), Some("Transfer")),
        ];
        let s = summarize(&rows);

        assert_eq!(s.total_income, dec("3000"));
        assert_eq!(s.total_expenses, dec("500"));
        assert_eq!(s.net_income, dec("2500"));
        assert_eq!(s.total_transactions, 5);

        assert_eq!(s.category_breakdown.len(), 2);
        assert_eq!(s.category_breakdown[0].name, "Food & Dining");
        assert_eq!(s.category_breakdown[0].amount, dec("420.50"));
        assert_eq!(s.category_breakdown[0].percentage, dec("84.1"));
        assert_eq!(s.category_breakdown[1].name, UNCATEGORIZED);
        assert_eq!(s.income_breakdown[0].percentage, dec("100"));

        assert_eq!(s.monthly_trends.len(), 2);
        let jan = &s.monthly_trends[0];
        assert_eq!(jan.month, "2024-01");
        assert_eq!(jan.month_name, "January");
        assert_eq!(jan.net_amount, dec("2800"));
        let feb = &s.monthly_trends[1];
        assert_eq!(feb.month_num, 2);
        assert_eq!(feb.income, Decimal::ZERO);
        assert_eq!(feb.expenses, dec("300"));
    }

    #[test]
    fn empty_summary_is_zeroed() {
        let s = summarize(&[]);
        assert_eq!(s.total_income, Decimal::ZERO);
        assert!(s.category_breakdown.is_empty());
        assert!(s.monthly_trends.is_empty());
    }

    fn cats() -> Vec<BudgetedCategory> {
        vec![
            BudgetedCategory {
                id: 1,
                name: "Food & Dining".into(),
                color: "#FF6384".into(),
                default_budget: Decimal::ZERO,
            },
            BudgetedCategory {
                id: 2,
                name: "Hobbies".into(),
                color: "#123456".into(),
                default_budget: dec("100"),
            },
            BudgetedCategory {
                id: 3,
                name: "Shopping".into(),
                color: "#FFCE56".into(),
                default_budget: Decimal::ZERO,
            },
        ]
    }

    #[test]
    fn budgets_sum_over_months_with_default_fallback() {
        let period = Period::new(d(2024, 1, 10), d(2024, 3, 5)).unwrap();
        let mut monthly = HashMap::new();
        monthly.insert((1, 2024, 1), dec("400"));
        monthly.insert((1, 2024, 2), dec("400"));
        monthly.insert((2, 2024, 2), dec("50"));
        let mut actual = HashMap::new();
        actual.insert(1, dec("1000"));
        actual.insert(2, dec("200"));
        actual.insert(3, dec("75"));

        let out = compare_budgets(&cats(), &monthly, &actual, &period);
        assert_eq!(out.len(), 2, "shopping has no budget and is left out");

        let food = &out[0];
        assert_eq!(food.category_name, "Food & Dining");
        assert_eq!(food.budget_amount, dec("800"));
        assert_eq!(food.actual_amount, dec("1000"));
        assert_eq!(food.percentage_difference, dec("25"));
        assert_eq!(food.status_color, OVER_BUDGET_COLOR);

        let hobbies = &out[1];
        assert_eq!(hobbies.budget_amount, dec("250"));
        assert_eq!(hobbies.percentage_difference, dec("-20"));
        assert_eq!(hobbies.status_color, UNDER_BUDGET_COLOR);
        assert_eq!(hobbies.category_color, "#123456");
    }

    #[test]
    fn exactly_on_budget_is_green() {
        let period = Period::month_of(d(2024, 4, 1));
        let mut monthly = HashMap::new();
        monthly.insert((3, 2024, 4), dec("75"));
        let mut actual = HashMap::new();
        actual.insert(3, dec("75"));
        let out = compare_budgets(&cats(), &monthly, &actual, &period);
        let shopping = out.iter().find(|c| c.category_name == "Shopping").unwrap();
        assert_eq!(shopping.status_color, UNDER_BUDGET_COLOR);
        assert_eq!(shopping.percentage_difference, Decimal::ZERO);
    }

    #[test]
    fn heatmap_labels_days_and_defaults_category() {
        let cells = heatmap(vec![
            HeatmapRow {
                category: Some("Food & Dining".into()),
                dow: 1,
                amount: dec("12.5"),
            },
            HeatmapRow {
                category: None,
                dow: 0,
                amount: dec("-3"),
            },
            HeatmapRow {
                category: None,
                dow: 9,
                amount: dec("1"),
            },
        ]);
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].day_of_week, "Monday");
        assert_eq!(cells[1].category, UNCATEGORIZED);
        assert_eq!(cells[1].day_of_week, "Sunday");
        assert_eq!(cells[1].amount, dec("3"));
    }
}
