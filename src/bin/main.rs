//! Mantis Query CLI - run dataset requests against a SQLite database
//!
//! Usage:
//!   mantis-query run --catalog <catalog.toml> --dataset <dataset.json> --request <request.json> [--database <db>]
//!   mantis-query sql --catalog <catalog.toml> --dataset <dataset.json> --request <request.json> [--dialect <dialect>]
//!   mantis-query check --request <request.json> [--dataset <dataset.json>]
//!
//! Logging is controlled by `MANTIS_LOG` (e.g. `MANTIS_LOG=debug` prints the
//! compiled SQL and cache decisions).

use clap::{Parser, Subcommand, ValueEnum};
use mantis_query::cache::{CacheStore, MemoryCache, SqliteCache};
use mantis_query::config::{CacheBackend, Settings};
use mantis_query::engine::{DatasetEngine, SchemaContext};
use mantis_query::filter::{FilterNode, SecurityGuard};
use mantis_query::model::{Catalog, DatasetDefinition, QueryRequest};
use mantis_query::source::SqliteSource;
use mantis_query::sql::Dialect;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mantis-query")]
#[command(about = "Mantis Query - filter trees and semantic aggregations compiled to SQL")]
#[command(version)]
struct Cli {
    /// Config file (defaults to MANTIS_QUERY_CONFIG, ./mantis-query.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a request and print the result as JSON
    Run {
        /// Entity catalog (.toml or .json)
        #[arg(long)]
        catalog: PathBuf,

        /// Dataset definition (.json)
        #[arg(long)]
        dataset: PathBuf,

        /// Request payload (.json)
        #[arg(long)]
        request: PathBuf,

        /// SQLite database (overrides [source] database)
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Print the SQL a request compiles to without running it
    Sql {
        #[arg(long)]
        catalog: PathBuf,

        #[arg(long)]
        dataset: PathBuf,

        #[arg(long)]
        request: PathBuf,

        /// SQL dialect to render (defaults to [engine] dialect)
        #[arg(short, long)]
        dialect: Option<DialectArg>,
    },

    /// Run the security guard over a request's filter trees
    Check {
        #[arg(long)]
        request: PathBuf,

        /// Include the dataset's default and metric filters
        #[arg(long)]
        dataset: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DialectArg {
    Sqlite,
    Postgres,
    Duckdb,
    Mysql,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Sqlite => Dialect::Sqlite,
            DialectArg::Postgres => Dialect::Postgres,
            DialectArg::Duckdb => Dialect::DuckDb,
            DialectArg::Mysql => Dialect::MySql,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MANTIS_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    };
    let settings = match settings {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Run {
            catalog,
            dataset,
            request,
            database,
        } => cmd_run(settings, &catalog, &dataset, &request, database),
        Commands::Sql {
            catalog,
            dataset,
            request,
            dialect,
        } => cmd_sql(settings, &catalog, &dataset, &request, dialect),
        Commands::Check { request, dataset } => cmd_check(settings, &request, dataset.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{}", message);
            ExitCode::FAILURE
        }
    }
}

fn read(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("Error reading file '{}': {}", path.display(), e))
}

fn load_dataset(path: &Path) -> Result<DatasetDefinition, String> {
    DatasetDefinition::from_json_str(&read(path)?)
        .map_err(|e| format!("Invalid dataset '{}': {}", path.display(), e))
}

fn load_request(path: &Path) -> Result<QueryRequest, String> {
    QueryRequest::from_json_str(&read(path)?)
        .map_err(|e| format!("Invalid request '{}': {}", path.display(), e))
}

fn load_engine(
    settings: Settings,
    catalog: &Path,
    dataset: &Path,
    dialect: Dialect,
) -> Result<DatasetEngine, String> {
    let catalog = Catalog::from_file(catalog).map_err(|e| format!("Invalid catalog: {}", e))?;
    let context = Arc::new(SchemaContext::new(catalog, dialect));
    Ok(DatasetEngine::new(load_dataset(dataset)?, context, settings))
}

fn open_cache(settings: &Settings) -> Result<Option<Box<dyn CacheStore>>, String> {
    if !settings.cache.enabled {
        return Ok(None);
    }
    Ok(Some(match settings.cache.backend {
        CacheBackend::Memory => Box::new(MemoryCache::new()),
        CacheBackend::Sqlite => {
            let path = settings.cache.resolved_path().map_err(|e| e.to_string())?;
            Box::new(SqliteCache::open(&path).map_err(|e| format!("Cache error: {}", e))?)
        }
    }))
}

fn cmd_run(
    settings: Settings,
    catalog: &Path,
    dataset: &Path,
    request: &Path,
    database: Option<PathBuf>,
) -> Result<(), String> {
    let database = match database {
        Some(path) => path,
        None => settings
            .source
            .resolved_database()
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "No database given: pass --database or set [source] database".to_string())?,
    };
    let source = SqliteSource::open(&database).map_err(|e| e.to_string())?;
    let cache = open_cache(&settings)?;
    let engine = load_engine(settings, catalog, dataset, Dialect::Sqlite)?;
    let request = load_request(request)?;

    let result = engine
        .execute(&request, &source, cache.as_deref())
        .map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&result).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

fn cmd_sql(
    settings: Settings,
    catalog: &Path,
    dataset: &Path,
    request: &Path,
    dialect: Option<DialectArg>,
) -> Result<(), String> {
    let dialect = dialect.map(Dialect::from).unwrap_or(settings.engine.dialect);
    let engine = load_engine(settings, catalog, dataset, dialect)?;
    let request = load_request(request)?;

    let plan = engine.plan(&request).map_err(|e| e.to_string())?;
    for warning in &plan.warnings {
        eprintln!("warning: {}", warning);
    }
    println!("{}", plan.query.to_sql(dialect));
    Ok(())
}

fn cmd_check(settings: Settings, request: &Path, dataset: Option<&Path>) -> Result<(), String> {
    let request = load_request(request)?;
    let guard = SecurityGuard::new(settings.security);

    let mut trees = vec![("filters".to_string(), request.filters.clone())];
    trees.push(("having".to_string(), request.having.clone()));
    if let Some(path) = dataset {
        let dataset = load_dataset(path)?;
        trees.push(("default_filters".to_string(), dataset.default_filters.clone()));
        for metric in &dataset.metrics {
            let name = metric.name.clone().unwrap_or_else(|| metric.aggregation.clone());
            trees.push((format!("metric '{}'", name), metric.filter.clone()));
        }
    }

    let mut failed = false;
    for (label, tree) in trees {
        let Some(tree) = tree else { continue };
        let mut warnings = Vec::new();
        let node = FilterNode::parse(&tree, &mut warnings);
        for warning in warnings {
            println!("{}: warning: {}", label, warning);
        }
        match guard.validate(&node) {
            Ok(()) => println!("{}: ok ({} clauses)", label, node.clause_count()),
            Err(e) => {
                println!("{}: {}", label, e);
                failed = true;
            }
        }
    }

    if failed {
        Err("Security check failed".to_string())
    } else {
        Ok(())
    }
}
