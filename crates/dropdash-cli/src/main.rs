use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use dropdash_core::CallerId;
use dropdash_metrics::{daily_series, dashboard_metrics, per_product_totals, DashboardMetrics};
use dropdash_storage::{MemoryStore, PgStore, Store};
use dropdash_sync::AppConfig;
use dropdash_web::{AppState, TokenKeys, MAX_WINDOW_DAYS};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "dropdash")]
#[command(about = "Dropship profit dashboard command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve {
        /// Keep everything in process memory instead of PostgreSQL.
        #[arg(long)]
        in_memory: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Pull new orders for one product from its store.
    Sync {
        #[arg(long)]
        product: Uuid,
        #[arg(long)]
        user: Uuid,
    },
    /// Print a markdown profit summary for a user.
    Report {
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Mint a bearer token for a user id.
    Token {
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

async fn connect(config: &AppConfig) -> Result<PgStore> {
    PgStore::connect(config.database_url()?, 10).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    match cli.command {
        Commands::Serve { in_memory } => {
            let store: Arc<dyn Store> = if in_memory {
                tracing::warn!("serving from process memory; data is lost on exit");
                Arc::new(MemoryStore::new())
            } else {
                let store = connect(&config).await?;
                store.migrate().await.context("applying migrations")?;
                Arc::new(store)
            };
            let state = AppState::from_config(&config, store)?;
            dropdash_web::serve(&config, state).await?;
        }
        Commands::Migrate => {
            connect(&config)
                .await?
                .migrate()
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Sync { product, user } => {
            let store: Arc<dyn Store> = Arc::new(connect(&config).await?);
            let state = AppState::from_config(&config, store)?;
            let outcome = state
                .reconciler
                .reconcile_owned(CallerId(user), product)
                .await?;
            println!("sync complete: product={product} imported={}", outcome.imported_count);
        }
        Commands::Report { user, days } => {
            let store = connect(&config).await?;
            let caller = CallerId(user);
            let products = store.list_products(caller, true).await?;
            let ids: Vec<Uuid> = products.iter().map(|p| p.id).collect();
            let orders = store.list_orders(&ids).await?;
            let expenses = store.list_expenses(&ids).await?;
            let today = Utc::now().date_naive();

            let metrics = dashboard_metrics(&orders, &expenses, products.len(), today);
            let mut md = render_summary(&metrics, today);
            md.push_str("\n## Last days\n\n| Day | Revenue | Expenses | Profit | Orders |\n|---|---:|---:|---:|---:|\n");
            for point in daily_series(&orders, &expenses, report_window(days), today) {
                let _ = writeln!(
                    md,
                    "| {} | {} | {} | {} | {} |",
                    point.period, point.revenue, point.expenses, point.profit, point.orders
                );
            }
            md.push_str("\n## Products\n\n| Product | Revenue | Expenses | Profit | Orders |\n|---|---:|---:|---:|---:|\n");
            for row in per_product_totals(&products, &orders, &expenses) {
                let _ = writeln!(
                    md,
                    "| {} | {} | {} | {} | {} |",
                    row.product_name, row.revenue, row.expenses, row.profit, row.orders
                );
            }
            print!("{md}");
        }
        Commands::Token { user, hours } => {
            let token = TokenKeys::new(&config.auth_secret).issue(user, Duration::hours(hours))?;
            println!("{token}");
        }
    }

    Ok(())
}

fn report_window(days: u32) -> u32 {
    days.min(MAX_WINDOW_DAYS)
}

fn render_summary(metrics: &DashboardMetrics, today: NaiveDate) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# Profit summary ({today})\n");
    let _ = writeln!(md, "- Total revenue: {}", metrics.total_revenue);
    let _ = writeln!(md, "- Total expenses: {}", metrics.total_expenses);
    let _ = writeln!(md, "- Total profit: {}", metrics.total_profit);
    let _ = writeln!(md, "- Profit margin: {}%", metrics.profit_margin.round_dp(2));
    let _ = writeln!(md, "- Last 30 days profit: {}", metrics.monthly_profit);
    let _ = writeln!(md, "- Today's profit: {}", metrics.daily_profit);
    let _ = writeln!(md, "- Orders: {}", metrics.order_count);
    let _ = writeln!(md, "- Products: {}", metrics.product_count);
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn report_window_is_capped() {
        assert_eq!(report_window(7), 7);
        assert_eq!(report_window(MAX_WINDOW_DAYS), MAX_WINDOW_DAYS);
        assert_eq!(report_window(u32::MAX), MAX_WINDOW_DAYS);

        let user = Uuid::nil().to_string();
        let cli = Cli::try_parse_from([
            "dropdash", "report", "--user", &user, "--days", "4000000000",
        ])
        .unwrap();
        match cli.command {
            Commands::Report { days, .. } => assert_eq!(report_window(days), MAX_WINDOW_DAYS),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn summary_lists_headline_metrics() {
        let metrics = dashboard_metrics(&[], &[], 2, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        let md = render_summary(&metrics, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        assert!(md.starts_with("# Profit summary (2026-03-01)"));
        assert!(md.contains("- Products: 2"));
        assert!(md.contains("- Profit margin: 0%"));
    }
}
