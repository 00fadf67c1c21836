// 分片存储管理工具
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use market_data_hub::common::logging_setup::init_logging;
use market_data_hub::federation::{FederatedQuery, QueryType};
use market_data_hub::maintenance::{TaskParams, TaskPriority, TaskTarget, TaskType};
use market_data_hub::router::RouteRequest;
use market_data_hub::{
    AppConfig, AssetClass, DataCategory, MaintenanceScheduler, QueryFederator, RoutingStrategy, ShardKeyClassifier,
    ShardManager, SourceRouter,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Shard store administration: classify, initialize, inspect, maintain and query shards.", long_about = None)]
struct Args {
    /// Path to the TOML configuration file (falls back to SHARD_CONFIG_PATH, then defaults).
    #[arg(short, long)]
    config: Option<String>,

    /// Override the shard root directory.
    #[arg(long)]
    root: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the asset class and shard file for each symbol.
    Classify {
        #[arg(required = true)]
        symbols: Vec<String>,
    },
    /// Create shards ("all" or a comma-separated list of asset classes).
    Init {
        #[arg(default_value = "all")]
        classes: String,
    },
    /// Per-shard record counts and sizes.
    Stats,
    /// Light health check of every known shard.
    Health,
    /// Run a maintenance task and wait for it to finish.
    Maintain {
        /// health_check, vacuum, backup, integrity_check, data_cleanup, statistics_update
        task: String,
        #[arg(long, default_value = "all")]
        target: String,
        #[arg(long, default_value = "normal")]
        priority: String,
        #[arg(long, default_value_t = false)]
        full_check: bool,
        #[arg(long, default_value_t = 365)]
        retention_days: u32,
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Run a federated query across shards.
    Query {
        #[arg(long, default_value = "historical_bar")]
        category: String,
        #[arg(long = "type", default_value = "select")]
        query_type: String,
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        classes: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
        #[arg(long)]
        start: Option<i64>,
        #[arg(long)]
        end: Option<i64>,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        offset: Option<i64>,
        #[arg(long, default_value_t = false)]
        best_quality: bool,
        #[arg(long, default_value_t = false)]
        sequential: bool,
    },
    /// Pick upstream data sources for a symbol.
    Route {
        symbol: String,
        #[arg(long, default_value = "historical_bar")]
        category: String,
        #[arg(long, default_value = "most_reliable")]
        strategy: String,
        #[arg(long)]
        frequency: Option<String>,
        #[arg(long, value_delimiter = ',')]
        prefer: Vec<String>,
    },
    /// Persist a new connection pool size (applies to pools created afterwards).
    SetPoolSize { size: u32 },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse::<T>().map_err(anyhow::Error::msg)
}

fn parse_classes(value: &str) -> Result<Vec<AssetClass>> {
    if value.trim().eq_ignore_ascii_case("all") {
        return Ok(AssetClass::shard_classes());
    }
    value.split(',').map(|s| parse::<AssetClass>(s)).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path).with_context(|| format!("加载配置文件 {} 失败", path))?,
        None => AppConfig::load_or_default()?,
    };
    if let Some(root) = &args.root {
        config.storage.root_path = root.clone();
    }
    let _guard = init_logging(&config.logging)?;

    let classifier = Arc::new(ShardKeyClassifier::new()?);
    let manager = Arc::new(ShardManager::new(config.storage.clone(), Arc::clone(&classifier))?);
    info!(target: "shard_admin", command = ?args.command, root = %config.storage.root_path, "执行管理命令");

    match args.command {
        Command::Classify { symbols } => {
            let rows: Vec<_> = symbols
                .iter()
                .map(|s| {
                    let class = classifier.classify(s);
                    serde_json::json!({
                        "symbol": s,
                        "asset_class": class,
                        "shard": manager.shard_path(class),
                    })
                })
                .collect();
            print_json(&rows)?;
        }
        Command::Init { classes } => {
            for class in parse_classes(&classes)? {
                let path = manager.get_or_create_shard(class)?;
                println!("{} -> {}", class, path.display());
            }
        }
        Command::Stats => print_json(&manager.get_statistics()?)?,
        Command::Health => {
            let scheduler = MaintenanceScheduler::new(Arc::clone(&manager), &config.maintenance);
            print_json(&scheduler.get_system_health_summary())?;
        }
        Command::Maintain { task, target, priority, full_check, retention_days, timeout_secs } => {
            let scheduler = MaintenanceScheduler::new(Arc::clone(&manager), &config.maintenance);
            let mut params = TaskParams::default().with_retention_days(retention_days);
            params.full_check = full_check;
            let id = scheduler.submit(
                parse::<TaskType>(&task)?,
                parse::<TaskTarget>(&target)?,
                parse::<TaskPriority>(&priority)?,
                params,
            );
            let _running = scheduler.spawn(&id);
            let finished = scheduler.wait_for(&id, Duration::from_secs(timeout_secs)).await?;
            print_json(&finished)?;
        }
        Command::Query {
            category,
            query_type,
            symbols,
            classes,
            fields,
            start,
            end,
            limit,
            offset,
            best_quality,
            sequential,
        } => {
            let mut query = FederatedQuery::new(parse::<QueryType>(&query_type)?, parse::<DataCategory>(&category)?);
            query.symbols = symbols;
            query.fields = fields;
            query.start = start;
            query.end = end;
            query.limit = limit;
            query.offset = offset;
            query.best_quality = best_quality;
            query.parallel = !sequential;
            for class in classes {
                query.asset_classes.push(parse::<AssetClass>(&class)?);
            }
            let federator = QueryFederator::new(Arc::clone(&manager), config.federation.clone());
            print_json(&federator.execute(query).await?)?;
        }
        Command::Route { symbol, category, strategy, frequency, prefer } => {
            let router = SourceRouter::new(Arc::clone(&manager), &config.router);
            let mut request = RouteRequest::new(&symbol, parse::<DataCategory>(&category)?, parse::<RoutingStrategy>(&strategy)?);
            if let Some(freq) = &frequency {
                request = request.with_frequency(freq);
            }
            let preferred: Vec<&str> = prefer.iter().map(String::as_str).collect();
            request = request.with_preferred(&preferred);
            print_json(&router.route_request(&request)?)?;
        }
        Command::SetPoolSize { size } => {
            manager.set_pool_size(size)?;
            println!("连接池大小已设置为 {}，新建的连接池生效", size);
        }
    }

    manager.close_all();
    Ok(())
}
