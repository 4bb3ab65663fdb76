mod telemetry;

use clap::{Args, Parser, Subcommand};
use configuration::Config;
use core_types::{NewOrder, NewProduct, OrderStatus, ProductUpdate};
use database::{
    ConnectionManager, DbError, DbRepository, ErrorClassifier, Maintenance, Monitor, QueryRequest,
    RetryPolicy, create_pool, run_migrations,
};
use indicatif::ProgressStyle;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_indicatif::span_ext::IndicatifSpanExt;
use uuid::Uuid;

/// The entry point for the storekeeper command-line tool.
#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine; the environment and config.toml may carry everything.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

/// Prints a failure. Data-layer errors are classified first so driver text never leaks.
fn report(error: &anyhow::Error) {
    match error.downcast_ref::<DbError>() {
        Some(db_error) => {
            let classified = ErrorClassifier::classify(db_error);
            match serde_json::to_string_pretty(&classified) {
                Ok(json) => eprintln!("{json}"),
                Err(_) => eprintln!("Error: {}", classified.message),
            }
        }
        None => eprintln!("Error: {error:#}"),
    }
}

// ==============================================================================
// CLI Structure
// ==============================================================================

/// Resilient PostgreSQL data layer for a small online store.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the database answers.
    Health,
    /// Print query and connection counters.
    Metrics,
    /// Apply pending schema migrations.
    Migrate,
    /// Vacuum, reindex and purge old soft-deleted products.
    Maintenance(MaintenanceArgs),
    /// Manage the product catalog.
    Products {
        #[command(subcommand)]
        command: ProductCommands,
    },
    /// Place, inspect and progress orders.
    Orders {
        #[command(subcommand)]
        command: OrderCommands,
    },
}

#[derive(Args, Debug)]
struct MaintenanceArgs {
    /// Purge products soft-deleted more than this many days ago. Defaults to the configured retention.
    #[arg(long)]
    retention_days: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum ProductCommands {
    /// Create a product from a JSON document.
    Add {
        #[arg(long)]
        json: String,
    },
    /// List products page by page.
    List {
        #[command(flatten)]
        list: ListArgs,
        /// Include soft-deleted products.
        #[arg(long)]
        with_deleted: bool,
    },
    Show {
        id: Uuid,
        #[arg(long)]
        with_deleted: bool,
    },
    /// Change some fields of a product from a JSON document.
    Update {
        id: Uuid,
        #[arg(long)]
        json: String,
    },
    /// Soft-delete a product.
    Delete { id: Uuid },
    Restore { id: Uuid },
}

#[derive(Subcommand, Debug)]
enum OrderCommands {
    /// Place an order from a JSON document.
    Place {
        #[arg(long)]
        json: String,
    },
    Show { id: Uuid },
    List {
        #[command(flatten)]
        list: ListArgs,
    },
    /// Move an order to its next status, e.g. "processing" or "shipped".
    Status { id: Uuid, status: OrderStatus },
    /// Cancel an order that has not shipped and restock its items.
    Cancel { id: Uuid },
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Filters as a JSON object, e.g. '{"category":"lighting","price":{"lt":20}}'.
    #[arg(long, value_parser = parse_filter)]
    filter: Option<Map<String, JsonValue>>,
    /// "<field> <direction>", e.g. "createdAt DESC".
    #[arg(long)]
    order_by: Option<String>,
    #[arg(long)]
    page: Option<u32>,
    #[arg(long)]
    page_size: Option<u32>,
}

impl ListArgs {
    fn into_request(self, with_deleted: bool) -> QueryRequest {
        QueryRequest {
            filters: self.filter,
            order_by: self.order_by,
            page: self.page,
            page_size: self.page_size,
            with_deleted,
        }
    }
}

fn parse_filter(raw: &str) -> Result<Map<String, JsonValue>, String> {
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(_) => Err("filter must be a JSON object".to_string()),
        Err(e) => Err(format!("filter is not valid JSON: {e}")),
    }
}

// ==============================================================================
// Command Logic
// ==============================================================================

/// Bootstraps configuration, logging and the connection, runs one command, and
/// always closes the pool afterwards.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = configuration::load_config()?;
    let _log_guard = telemetry::init(&config.logging)?;

    let pool = create_pool(&config.database)?;
    let monitor = Arc::new(Monitor::new(
        pool.clone(),
        Duration::from_millis(config.monitor.slow_query_threshold_ms),
    ));
    monitor.setup_query_logging();

    let manager = ConnectionManager::new(pool, RetryPolicy::from(&config.retry))
        .with_monitor(monitor.clone());
    manager.connect_or_close().await?;

    let result = execute(cli.command, &config, &manager, monitor).await;
    manager.shutdown().await;
    result
}

async fn execute(
    command: Commands,
    config: &Config,
    manager: &ConnectionManager,
    monitor: Arc<Monitor>,
) -> anyhow::Result<()> {
    let pool = manager.backend().clone();
    let repo = DbRepository::new(pool.clone(), monitor.clone()).with_page_sizes(
        config.pagination.default_page_size,
        config.pagination.max_page_size,
    );

    match command {
        Commands::Health => {
            let healthy = manager.health_check().await;
            print_json(&serde_json::json!({
                "status": if healthy { "healthy" } else { "unhealthy" },
                "connection": manager.state(),
                "pool": monitor.pool_status(),
            }))?;
            if !healthy {
                anyhow::bail!("database health check failed");
            }
        }
        Commands::Metrics => print_json(&monitor.metrics())?,
        Commands::Migrate => {
            run_migrations(&pool).await?;
            tracing::info!("Database migrations are up to date.");
        }
        Commands::Maintenance(args) => {
            let days = args
                .retention_days
                .unwrap_or(config.maintenance.soft_delete_retention_days);
            handle_maintenance(Maintenance::new(pool, monitor), days).await?;
        }
        Commands::Products { command } => match command {
            ProductCommands::Add { json } => {
                let new_product: NewProduct = serde_json::from_str(&json)?;
                print_json(&repo.create_product(new_product).await?)?;
            }
            ProductCommands::List { list, with_deleted } => {
                print_json(&repo.list_products(list.into_request(with_deleted)).await?)?;
            }
            ProductCommands::Show { id, with_deleted } => {
                print_json(&repo.get_product(id, with_deleted).await?)?;
            }
            ProductCommands::Update { id, json } => {
                let update: ProductUpdate = serde_json::from_str(&json)?;
                print_json(&repo.update_product(id, update).await?)?;
            }
            ProductCommands::Delete { id } => print_json(&repo.soft_delete_product(id).await?)?,
            ProductCommands::Restore { id } => print_json(&repo.restore_product(id).await?)?,
        },
        Commands::Orders { command } => match command {
            OrderCommands::Place { json } => {
                let new_order: NewOrder = serde_json::from_str(&json)?;
                print_json(&repo.create_order(new_order).await?)?;
            }
            OrderCommands::Show { id } => print_json(&repo.get_order(id).await?)?,
            OrderCommands::List { list } => {
                print_json(&repo.list_orders(list.into_request(false)).await?)?;
            }
            OrderCommands::Status { id, status } => {
                print_json(&repo.update_order_status(id, status).await?)?;
            }
            OrderCommands::Cancel { id } => print_json(&repo.cancel_order(id).await?)?,
        },
    }

    Ok(())
}

/// Runs every maintenance step under a progress bar.
async fn handle_maintenance(maintenance: Maintenance, retention_days: u32) -> anyhow::Result<()> {
    let span = tracing::info_span!("maintenance");
    span.pb_set_style(
        &ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    span.pb_set_length(database::MaintenanceStep::ALL.len() as u64);
    let _entered = span.enter();

    let mut started = false;
    let report = maintenance
        .run(chrono::Duration::days(i64::from(retention_days)), |step| {
            if started {
                span.pb_inc(1);
            }
            started = true;
            span.pb_set_message(step.label());
        })
        .await?;
    span.pb_inc(1);

    tracing::info!(
        reindexed = report.reindexed.len(),
        purged_products = report.purged_products,
        "Maintenance completed."
    );
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
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
    fn list_flags_become_a_query_request() {
        let cli = Cli::try_parse_from([
            "storekeeper",
            "products",
            "list",
            "--filter",
            r#"{"category":"lighting"}"#,
            "--order-by",
            "createdAt DESC",
            "--page",
            "2",
            "--page-size",
            "5",
            "--with-deleted",
        ])
        .unwrap();

        let Commands::Products { command: ProductCommands::List { list, with_deleted } } = cli.command else {
            panic!("expected products list");
        };
        let request = list.into_request(with_deleted);
        assert_eq!(request.filters.unwrap()["category"], "lighting");
        assert_eq!(request.order_by.as_deref(), Some("createdAt DESC"));
        assert_eq!((request.page, request.page_size), (Some(2), Some(5)));
        assert!(request.with_deleted);
    }

    #[test]
    fn filters_must_be_json_objects() {
        assert!(parse_filter(r#"{"stock":{"gt":0}}"#).is_ok());
        assert!(parse_filter("[1,2]").is_err());
        assert!(parse_filter("not json").is_err());
        assert!(
            Cli::try_parse_from(["storekeeper", "orders", "list", "--filter", "nope"]).is_err()
        );
    }

    #[test]
    fn ids_are_parsed_as_uuids() {
        let id = Uuid::new_v4().to_string();
        let cli = Cli::try_parse_from(["storekeeper", "orders", "show", &id]).unwrap();
        assert!(matches!(cli.command, Commands::Orders { command: OrderCommands::Show { .. } }));
        assert!(Cli::try_parse_from(["storekeeper", "orders", "show", "42"]).is_err());
    }

    #[test]
    fn order_status_changes_take_a_known_status() {
        let id = Uuid::new_v4().to_string();
        let cli = Cli::try_parse_from(["storekeeper", "orders", "status", &id, "shipped"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Orders { command: OrderCommands::Status { status: OrderStatus::Shipped, .. } }
        ));
        assert!(Cli::try_parse_from(["storekeeper", "orders", "status", &id, "lost"]).is_err());

        let cli = Cli::try_parse_from(["storekeeper", "orders", "cancel", &id]).unwrap();
        assert!(matches!(cli.command, Commands::Orders { command: OrderCommands::Cancel { .. } }));
    }

    #[test]
    fn product_updates_carry_their_json() {
        let id = Uuid::new_v4().to_string();
        let cli = Cli::try_parse_from([
            "storekeeper",
            "products",
            "update",
            &id,
            "--json",
            r#"{"stock":12}"#,
        ])
        .unwrap();
        let Commands::Products { command: ProductCommands::Update { json, .. } } = cli.command else {
            panic!("expected products update");
        };
        let update: ProductUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(update.stock, Some(12));
    }

    #[test]
    fn maintenance_retention_is_optional() {
        let cli = Cli::try_parse_from(["storekeeper", "maintenance", "--retention-days", "30"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Maintenance(MaintenanceArgs { retention_days: Some(30) })
        ));
    }
}
