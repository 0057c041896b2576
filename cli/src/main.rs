//! blockgraph CLI: inspect and manage dataset state.
//!
//! Usage:
//! ```bash
//! blockgraph status --db ./blockgraph.db
//! blockgraph status --db ./blockgraph.db --id uniswap --json
//! blockgraph unfail --db ./blockgraph.db --id uniswap
//! blockgraph reset  --db ./blockgraph.db --id uniswap
//! blockgraph info
//! ```

mod logging;

use std::env;
use std::process;

use anyhow::{bail, Context};
use serde::Serialize;
use tracing::info;

use blockgraph_core::checkpoint::{CheckpointManager, CheckpointStore};
use blockgraph_core::config::PipelineConfig;
use blockgraph_core::store::BlockStore;
use blockgraph_core::types::BlockPtr;
use blockgraph_storage::sqlite::SqliteStorage;

use logging::{init_tracing, LogConfig};

const DEFAULT_DB: &str = "blockgraph.db";

#[tokio::main]
async fn main() {
    init_tracing(&LogConfig::from_env());

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        process::exit(1);
    };
    let opts = Options::parse(&args[1..]);

    let result = match command.as_str() {
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("blockgraph {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        "status" => cmd_status(&opts).await,
        "unfail" => cmd_unfail(&opts).await,
        "reset" => cmd_reset(&opts).await,
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("blockgraph {}", env!("CARGO_PKG_VERSION"));
    println!("Reorg-safe blockchain indexer with block-versioned entity and graph stores\n");
    println!("USAGE:");
    println!("    blockgraph <COMMAND> [--db <PATH>] [--id <DATASET>] [--json]\n");
    println!("COMMANDS:");
    println!("    status   Show checkpoint, store heads and failures per dataset");
    println!("    unfail   Clear a dataset's recorded failure so it can restart");
    println!("    reset    Delete a dataset's entities, graph and checkpoint");
    println!("    info     Show default pipeline settings");
    println!("    version  Print version");
    println!("    help     Print this help\n");
    println!("ENVIRONMENT:");
    println!("    BLOCKGRAPH_DB        Database path (default: {DEFAULT_DB})");
    println!("    BLOCKGRAPH_LOG       Log filter, e.g. \"warn,blockgraph-storage=debug\"");
    println!("    BLOCKGRAPH_LOG_JSON  Emit JSON logs when set to 1");
}

#[derive(Debug, Default)]
struct Options {
    db: Option<String>,
    id: Option<String>,
    json: bool,
}

impl Options {
    fn parse(args: &[String]) -> Self {
        let mut opts = Self::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--db" => opts.db = iter.next().cloned(),
                "--id" => opts.id = iter.next().cloned(),
                "--json" => opts.json = true,
                other => eprintln!("Ignoring unknown argument: {other}"),
            }
        }
        opts
    }

    fn db(&self) -> String {
        self.db
            .clone()
            .or_else(|| env::var("BLOCKGRAPH_DB").ok())
            .unwrap_or_else(|| DEFAULT_DB.to_string())
    }

    fn dataset(&self) -> anyhow::Result<&str> {
        match self.id.as_deref() {
            Some(id) => Ok(id),
            None => bail!("--id <DATASET> is required"),
        }
    }

    async fn open(&self) -> anyhow::Result<SqliteStorage> {
        let db = self.db();
        SqliteStorage::open(&db)
            .await
            .with_context(|| format!("opening database {db}"))
    }
}

fn cmd_info() {
    let defaults = PipelineConfig::default();
    println!("blockgraph v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default reorg window: {} blocks", defaults.window_size);
    println!("  Default checkpoint interval: every {} blocks", defaults.checkpoint_interval);
    println!("  Default poll interval: {} ms", defaults.poll_interval_ms);
    println!("  Default retries: {}", defaults.retry.max_retries);
    println!("  Default deep reorg policy: {:?}", defaults.deep_reorg_policy);
    println!("  Storage backends: memory, SQLite (feature: sqlite), Postgres (feature: postgres)");
}

/// One dataset as reported by `status`.
#[derive(Debug, Serialize)]
struct DatasetReport {
    dataset: String,
    checkpoint: Option<BlockPtr>,
    entities_head: Option<BlockPtr>,
    graph_head: Option<BlockPtr>,
    staged: Option<BlockPtr>,
    fatal_error: Option<String>,
    updated_at: Option<String>,
}

async fn report(storage: &SqliteStorage, dataset: &str) -> anyhow::Result<DatasetReport> {
    let checkpoint = storage.load(dataset).await?;
    let entities = storage.entity_store(dataset);
    let graph = storage.graph_store(dataset);
    let staged = match entities.staged().await? {
        Some(block) => Some(block),
        None => graph.staged().await?,
    };
    Ok(DatasetReport {
        dataset: dataset.to_string(),
        checkpoint: checkpoint.as_ref().and_then(|cp| cp.cursor.as_ref()).map(|c| c.ptr()),
        entities_head: entities.head().await?,
        graph_head: graph.head().await?,
        staged,
        fatal_error: checkpoint.as_ref().and_then(|cp| cp.fatal_error.clone()),
        updated_at: checkpoint
            .as_ref()
            .and_then(|cp| chrono::DateTime::from_timestamp(cp.updated_at, 0))
            .map(|t| t.to_rfc3339()),
    })
}

async fn cmd_status(opts: &Options) -> anyhow::Result<()> {
    let storage = opts.open().await?;
    let datasets = match &opts.id {
        Some(id) => vec![id.clone()],
        None => storage.datasets().await?,
    };

    let mut reports = Vec::with_capacity(datasets.len());
    for dataset in &datasets {
        reports.push(report(&storage, dataset).await?);
    }

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }
    if reports.is_empty() {
        println!("No datasets in {}", opts.db());
        return Ok(());
    }
    let show = |ptr: &Option<BlockPtr>| ptr.as_ref().map_or_else(|| "-".to_string(), |p| p.to_string());
    for r in &reports {
        println!("{}", r.dataset);
        println!("  checkpoint:    {}", show(&r.checkpoint));
        println!("  entities head: {}", show(&r.entities_head));
        println!("  graph head:    {}", show(&r.graph_head));
        if r.staged.is_some() {
            println!("  staged:        {} (recovered on next start)", show(&r.staged));
        }
        if let Some(updated) = &r.updated_at {
            println!("  updated:       {updated}");
        }
        match &r.fatal_error {
            Some(reason) => println!("  state:         FAILED: {reason}"),
            None => println!("  state:         ok"),
        }
    }
    Ok(())
}

async fn cmd_unfail(opts: &Options) -> anyhow::Result<()> {
    let dataset = opts.dataset()?;
    let storage = opts.open().await?;
    let manager = CheckpointManager::new(Box::new(storage), dataset, 1);
    if manager.clear_failure().await? {
        info!(dataset, "Failure cleared");
        println!("Cleared failure for '{dataset}'");
    } else {
        println!("Dataset '{dataset}' has no recorded failure");
    }
    Ok(())
}

async fn cmd_reset(opts: &Options) -> anyhow::Result<()> {
    let dataset = opts.dataset()?;
    let storage = opts.open().await?;
    storage.drop_dataset(dataset).await?;
    info!(dataset, "Dataset reset");
    println!("Reset '{dataset}': it will reindex from its start block on next run");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_options() {
        let opts = Options::parse(&args(&["--db", "/tmp/x.db", "--id", "pairs", "--json"]));
        assert_eq!(opts.db(), "/tmp/x.db");
        assert_eq!(opts.dataset().unwrap(), "pairs");
        assert!(opts.json);
    }

    #[test]
    fn dataset_is_required() {
        let opts = Options::parse(&[]);
        assert!(opts.dataset().is_err());
    }
}
