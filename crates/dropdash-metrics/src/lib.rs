//! Aggregation engine: time-bucketed and per-product profit metrics.
//!
//! Everything here is a pure transform over in-memory rows. The caller reads the
//! clock and passes `today`; all bucketing uses UTC calendar dates.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{Datelike, Days, NaiveDate};
use dropdash_core::{Expense, Order, Product};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dropdash-metrics";

pub const DEFAULT_WINDOW_DAYS: u32 = 30;
pub const DEFAULT_WINDOW_MONTHS: u32 = 12;
/// Length of the trailing window behind the dashboard's "monthly" profit.
pub const TRAILING_PROFIT_DAYS: u32 = 30;

/// Calendar month key, rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn prev(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl Serialize for YearMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One bucket of a time series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPoint<K> {
    pub period: K,
    pub revenue: Decimal,
    pub expenses: Decimal,
    pub profit: Decimal,
    pub orders: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    revenue: Decimal,
    order_costs: Decimal,
    extra_expenses: Decimal,
    orders: usize,
}

impl Accumulator {
    fn add_order(&mut self, order: &Order) {
        self.revenue += order.revenue;
        self.order_costs += order.cost;
        self.orders += 1;
    }

    fn add_expense(&mut self, expense: &Expense) {
        self.extra_expenses += expense.amount;
    }

    fn expenses(&self) -> Decimal {
        self.order_costs + self.extra_expenses
    }

    fn profit(&self) -> Decimal {
        self.revenue - self.expenses()
    }
}

fn bucketize<K, FO, FE>(
    mut buckets: BTreeMap<K, Accumulator>,
    orders: &[Order],
    expenses: &[Expense],
    order_key: FO,
    expense_key: FE,
) -> Vec<SeriesPoint<K>>
where
    K: Ord,
    FO: Fn(&Order) -> K,
    FE: Fn(&Expense) -> K,
{
    for order in orders {
        if let Some(bucket) = buckets.get_mut(&order_key(order)) {
            bucket.add_order(order);
        }
    }
    for expense in expenses {
        if let Some(bucket) = buckets.get_mut(&expense_key(expense)) {
            bucket.add_expense(expense);
        }
    }

    // Profit is derived only once every contribution is summed.
    buckets
        .into_iter()
        .map(|(period, acc)| SeriesPoint {
            period,
            revenue: acc.revenue,
            expenses: acc.expenses(),
            profit: acc.profit(),
            orders: acc.orders,
        })
        .collect()
}

fn window_start(today: NaiveDate, window_days: u32) -> NaiveDate {
    today
        .checked_sub_days(Days::new(u64::from(window_days.saturating_sub(1))))
        .unwrap_or(NaiveDate::MIN)
}

/// Per-day buckets for the `window_days` calendar days ending at `today`, inclusive.
///
/// Every day is present even when nothing happened on it. A window of 30 ending on
/// March 30th starts on March 1st.
pub fn daily_series(
    orders: &[Order],
    expenses: &[Expense],
    window_days: u32,
    today: NaiveDate,
) -> Vec<SeriesPoint<NaiveDate>> {
    if window_days == 0 {
        return Vec::new();
    }
    let buckets = window_start(today, window_days)
        .iter_days()
        .take(window_days as usize)
        .map(|day| (day, Accumulator::default()))
        .collect();
    bucketize(buckets, orders, expenses, Order::order_day, |e| e.expense_date)
}

/// Per-month buckets for the `window_months` months ending with the month of `today`.
pub fn monthly_series(
    orders: &[Order],
    expenses: &[Expense],
    window_months: u32,
    today: NaiveDate,
) -> Vec<SeriesPoint<YearMonth>> {
    let mut buckets = BTreeMap::new();
    let mut month = YearMonth::of(today);
    for _ in 0..window_months {
        buckets.insert(month, Accumulator::default());
        month = month.prev();
    }
    bucketize(
        buckets,
        orders,
        expenses,
        |o| YearMonth::of(o.order_day()),
        |e| YearMonth::of(e.expense_date),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductTotals {
    pub product_id: Uuid,
    pub product_name: String,
    pub revenue: Decimal,
    pub order_costs: Decimal,
    pub extra_expenses: Decimal,
    /// Order costs plus standalone expenses.
    pub expenses: Decimal,
    pub profit: Decimal,
    pub orders: usize,
}

/// Row of the products table: the product plus its all-time totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSummary {
    #[serde(flatten)]
    pub product: Product,
    pub total_revenue: Decimal,
    pub total_expenses: Decimal,
    pub total_profit: Decimal,
    pub order_count: usize,
}

fn accumulate_by_product(orders: &[Order], expenses: &[Expense]) -> HashMap<Uuid, Accumulator> {
    let mut by_product: HashMap<Uuid, Accumulator> = HashMap::new();
    for order in orders {
        by_product.entry(order.product_id).or_default().add_order(order);
    }
    for expense in expenses {
        by_product
            .entry(expense.product_id)
            .or_default()
            .add_expense(expense);
    }
    by_product
}

/// Totals for every visible product, highest revenue first.
///
/// Ties keep the order in which products were passed in.
pub fn per_product_totals(
    products: &[Product],
    orders: &[Order],
    expenses: &[Expense],
) -> Vec<ProductTotals> {
    let by_product = accumulate_by_product(orders, expenses);
    let mut totals = products
        .iter()
        .filter(|p| p.is_visible)
        .map(|product| {
            let acc = by_product.get(&product.id).copied().unwrap_or_default();
            ProductTotals {
                product_id: product.id,
                product_name: product.name.clone(),
                revenue: acc.revenue,
                order_costs: acc.order_costs,
                extra_expenses: acc.extra_expenses,
                expenses: acc.expenses(),
                profit: acc.profit(),
                orders: acc.orders,
            }
        })
        .collect::<Vec<_>>();
    totals.sort_by(|a, b| b.revenue.cmp(&a.revenue));
    totals
}

/// Visible products with their totals, newest product first.
pub fn product_summaries(
    products: &[Product],
    orders: &[Order],
    expenses: &[Expense],
) -> Vec<ProductSummary> {
    let by_product = accumulate_by_product(orders, expenses);
    let mut rows = products
        .iter()
        .filter(|p| p.is_visible)
        .map(|product| {
            let acc = by_product.get(&product.id).copied().unwrap_or_default();
            ProductSummary {
                product: product.clone(),
                total_revenue: acc.revenue,
                total_expenses: acc.expenses(),
                total_profit: acc.profit(),
                order_count: acc.orders,
            }
        })
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| b.product.created_at.cmp(&a.product.created_at));
    rows
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardMetrics {
    pub total_profit: Decimal,
    pub total_revenue: Decimal,
    pub total_expenses: Decimal,
    /// Profit over the trailing 30 calendar days, today included.
    pub monthly_profit: Decimal,
    /// Profit booked on `today`.
    pub daily_profit: Decimal,
    /// Percentage; zero when there is no revenue.
    pub profit_margin: Decimal,
    pub order_count: usize,
    pub product_count: usize,
}

pub fn profit_margin(profit: Decimal, revenue: Decimal) -> Decimal {
    if revenue.is_zero() {
        return Decimal::ZERO;
    }
    profit / revenue * Decimal::ONE_HUNDRED
}

pub fn dashboard_metrics(
    orders: &[Order],
    expenses: &[Expense],
    product_count: usize,
    today: NaiveDate,
) -> DashboardMetrics {
    let trailing_start = window_start(today, TRAILING_PROFIT_DAYS);
    let in_trailing = |day: NaiveDate| day >= trailing_start && day <= today;

    let mut total = Accumulator::default();
    let mut trailing = Accumulator::default();
    let mut daily = Accumulator::default();

    for order in orders {
        let day = order.order_day();
        total.add_order(order);
        if in_trailing(day) {
            trailing.add_order(order);
        }
        if day == today {
            daily.add_order(order);
        }
    }
    for expense in expenses {
        let day = expense.expense_date;
        total.add_expense(expense);
        if in_trailing(day) {
            trailing.add_expense(expense);
        }
        if day == today {
            daily.add_expense(expense);
        }
    }

    DashboardMetrics {
        total_profit: total.profit(),
        total_revenue: total.revenue,
        total_expenses: total.expenses(),
        monthly_profit: trailing.profit(),
        daily_profit: daily.profit(),
        profit_margin: profit_margin(total.profit(), total.revenue),
        order_count: total.orders,
        product_count,
    }
}

/// Optional inclusive date bounds applied before aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start.map_or(true, |start| day >= start) && self.end.map_or(true, |end| day <= end)
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn filter_orders(&self, orders: &[Order]) -> Vec<Order> {
        orders
            .iter()
            .filter(|o| self.contains(o.order_day()))
            .cloned()
            .collect()
    }

    pub fn filter_expenses(&self, expenses: &[Expense]) -> Vec<Expense> {
        expenses
            .iter()
            .filter(|e| self.contains(e.expense_date))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(date: NaiveDate, hour: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(&date.and_hms_opt(hour, 0, 0).unwrap())
    }

    fn dec(units: i64) -> Decimal {
        Decimal::new(units, 2)
    }

    fn order(product_id: Uuid, date: NaiveDate, revenue: i64, cost: i64) -> Order {
        Order {
            id: Uuid::new_v4(),
            product_id,
            external_order_id: None,
            order_date: at(date, 13),
            revenue: dec(revenue),
            cost: dec(cost),
            customer_email: None,
            order_number: None,
            created_at: at(date, 13),
        }
    }

    fn expense(product_id: Uuid, date: NaiveDate, amount: i64) -> Expense {
        Expense {
            id: Uuid::new_v4(),
            product_id,
            description: "ads".into(),
            amount: dec(amount),
            expense_date: date,
            created_at: at(date, 9),
        }
    }

    fn product(name: &str, visible: bool, created: NaiveDate) -> Product {
        Product {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            name: name.into(),
            product_cost: dec(1000),
            store_url: None,
            access_token: None,
            is_visible: visible,
            created_at: at(created, 8),
            updated_at: at(created, 8),
        }
    }

    #[test]
    fn daily_series_has_one_bucket_per_day_without_gaps() {
        let today = day(2026, 3, 10);
        let pid = Uuid::new_v4();
        let orders = vec![order(pid, day(2026, 3, 9), 5000, 2000)];
        let series = daily_series(&orders, &[], 30, today);

        assert_eq!(series.len(), 30);
        assert_eq!(series.first().unwrap().period, day(2026, 2, 9));
        assert_eq!(series.last().unwrap().period, today);
        for pair in series.windows(2) {
            assert_eq!(pair[0].period.succ_opt().unwrap(), pair[1].period);
        }
        let empty_days = series.iter().filter(|p| p.orders == 0).count();
        assert_eq!(empty_days, 29);
        assert!(series
            .iter()
            .filter(|p| p.orders == 0)
            .all(|p| p.revenue.is_zero() && p.expenses.is_zero() && p.profit.is_zero()));
    }

    #[test]
    fn oldest_bucket_of_thirty_day_window_collects_its_order() {
        let today = day(2026, 3, 30);
        let pid = Uuid::new_v4();
        let oldest = day(2026, 3, 1);
        let orders = vec![
            order(pid, oldest, 10000, 4000),
            order(pid, day(2026, 2, 28), 99900, 0),
        ];
        let series = daily_series(&orders, &[], 30, today);

        let first = &series[0];
        assert_eq!(first.period, oldest);
        assert_eq!(first.revenue, dec(10000));
        assert_eq!(first.expenses, dec(4000));
        assert_eq!(first.profit, dec(6000));
        assert_eq!(first.orders, 1);
        let total_revenue: Decimal = series.iter().map(|p| p.revenue).sum();
        assert_eq!(total_revenue, dec(10000));
    }

    #[test]
    fn daily_profit_subtracts_order_costs_and_expenses() {
        let today = day(2026, 3, 10);
        let pid = Uuid::new_v4();
        let orders = vec![
            order(pid, today, 3000, 1000),
            order(pid, today, 2000, 500),
        ];
        let expenses = vec![expense(pid, today, 4500)];
        let series = daily_series(&orders, &expenses, 7, today);
        let last = series.last().unwrap();
        assert_eq!(last.revenue, dec(5000));
        assert_eq!(last.expenses, dec(6000));
        assert_eq!(last.profit, dec(-1000));
        assert_eq!(last.orders, 2);
    }

    #[test]
    fn zero_day_window_is_empty() {
        assert!(daily_series(&[], &[], 0, day(2026, 1, 1)).is_empty());
        assert!(monthly_series(&[], &[], 0, day(2026, 1, 1)).is_empty());
    }

    #[test]
    fn monthly_series_spans_year_boundary() {
        let today = day(2026, 2, 15);
        let pid = Uuid::new_v4();
        let orders = vec![
            order(pid, day(2025, 3, 31), 1000, 100),
            order(pid, day(2025, 12, 1), 2000, 500),
            order(pid, day(2025, 2, 28), 7000, 0),
        ];
        let expenses = vec![expense(pid, day(2026, 2, 1), 300)];
        let series = monthly_series(&orders, &expenses, DEFAULT_WINDOW_MONTHS, today);

        assert_eq!(series.len(), 12);
        assert_eq!(series[0].period.to_string(), "2025-03");
        assert_eq!(series[11].period.to_string(), "2026-02");
        assert_eq!(series[0].revenue, dec(1000));
        assert_eq!(series[9].period.to_string(), "2025-12");
        assert_eq!(series[9].profit, dec(1500));
        assert_eq!(series[11].profit, dec(-300));
        let total_orders: usize = series.iter().map(|p| p.orders).sum();
        assert_eq!(total_orders, 2);
    }

    #[test]
    fn per_product_totals_sorted_by_revenue_and_skip_hidden() {
        let created = day(2026, 1, 1);
        let low = product("low", true, created);
        let high = product("high", true, created);
        let hidden = product("hidden", false, created);
        let tie = product("tie-with-low", true, created);
        let orders = vec![
            order(low.id, created, 1000, 400),
            order(high.id, created, 9000, 3000),
            order(hidden.id, created, 50000, 0),
            order(tie.id, created, 1000, 100),
        ];
        let expenses = vec![expense(high.id, created, 1500)];
        let products = vec![low.clone(), high.clone(), hidden, tie.clone()];

        let totals = per_product_totals(&products, &orders, &expenses);
        let names: Vec<_> = totals.iter().map(|t| t.product_name.as_str()).collect();
        assert_eq!(names, vec!["high", "low", "tie-with-low"]);
        let high_totals = &totals[0];
        assert_eq!(high_totals.order_costs, dec(3000));
        assert_eq!(high_totals.extra_expenses, dec(1500));
        assert_eq!(high_totals.expenses, dec(4500));
        assert_eq!(high_totals.profit, dec(4500));
        assert!(totals.windows(2).all(|w| w[0].revenue >= w[1].revenue));
    }

    #[test]
    fn product_summaries_are_newest_first() {
        let older = product("older", true, day(2026, 1, 1));
        let newer = product("newer", true, day(2026, 2, 1));
        let orders = vec![order(older.id, day(2026, 2, 2), 2500, 1000)];
        let rows = product_summaries(&[older.clone(), newer.clone()], &orders, &[]);
        assert_eq!(rows[0].product.id, newer.id);
        assert_eq!(rows[1].total_profit, dec(1500));
        assert_eq!(rows[1].order_count, 1);
        assert_eq!(rows[0].order_count, 0);
    }

    #[test]
    fn empty_dashboard_is_all_zero() {
        let metrics = dashboard_metrics(&[], &[], 0, day(2026, 3, 1));
        assert_eq!(
            metrics,
            DashboardMetrics {
                total_profit: Decimal::ZERO,
                total_revenue: Decimal::ZERO,
                total_expenses: Decimal::ZERO,
                monthly_profit: Decimal::ZERO,
                daily_profit: Decimal::ZERO,
                profit_margin: Decimal::ZERO,
                order_count: 0,
                product_count: 0,
            }
        );
    }

    #[test]
    fn dashboard_windows_and_margin() {
        let today = day(2026, 3, 30);
        let pid = Uuid::new_v4();
        let orders = vec![
            order(pid, today, 10000, 4000),
            order(pid, day(2026, 3, 1), 5000, 1000),
            order(pid, day(2026, 1, 10), 20000, 5000),
        ];
        let expenses = vec![
            expense(pid, today, 1000),
            expense(pid, day(2026, 2, 1), 2000),
        ];
        let metrics = dashboard_metrics(&orders, &expenses, 3, today);

        assert_eq!(metrics.total_revenue, dec(35000));
        assert_eq!(metrics.total_expenses, dec(13000));
        assert_eq!(metrics.total_profit, dec(22000));
        assert_eq!(metrics.monthly_profit, dec(9000));
        assert_eq!(metrics.daily_profit, dec(5000));
        assert_eq!(metrics.order_count, 3);
        assert_eq!(metrics.product_count, 3);
        assert_eq!(
            metrics.profit_margin,
            dec(22000) / dec(35000) * Decimal::ONE_HUNDRED
        );
    }

    #[test]
    fn margin_is_zero_without_revenue() {
        let pid = Uuid::new_v4();
        let today = day(2026, 3, 30);
        let expenses = vec![expense(pid, today, 1000)];
        let metrics = dashboard_metrics(&[], &expenses, 1, today);
        assert_eq!(metrics.profit_margin, Decimal::ZERO);
        assert_eq!(metrics.total_profit, dec(-1000));
        assert_eq!(profit_margin(dec(500), dec(2000)), Decimal::new(25, 0));
    }

    #[test]
    fn date_range_is_inclusive() {
        let pid = Uuid::new_v4();
        let range = DateRange {
            start: Some(day(2026, 3, 1)),
            end: Some(day(2026, 3, 31)),
        };
        let orders = vec![
            order(pid, day(2026, 2, 28), 100, 0),
            order(pid, day(2026, 3, 1), 200, 0),
            order(pid, day(2026, 3, 31), 300, 0),
            order(pid, day(2026, 4, 1), 400, 0),
        ];
        let kept = range.filter_orders(&orders);
        assert_eq!(kept.len(), 2);
        assert!(DateRange::default().is_unbounded());
        assert!(DateRange::default().contains(day(1999, 1, 1)));
        let expenses = vec![expense(pid, day(2026, 4, 1), 100)];
        assert!(range.filter_expenses(&expenses).is_empty());
    }
}
