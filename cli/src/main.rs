//! Gizmo CLI: command-line interface for the graph query client
//!
//! Thin layer over the `gizmo` library: connection inspection, single queries,
//! file and manifest bulk loads, and an interactive shell.

use clap::{Args, Parser, Subcommand};
use comfy_table::{ContentArrangement, Table};
use gizmo::{
    BulkLoadEngine, BulkOptions, BulkSummary, ConnectionManager, ConsoleSink, ExecutorKind, GizmoConfig,
    GizmoError, ProgressSink, ResultAggregate,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "gizmo", version, about = "Graph query client")]
struct Cli {
    /// Configuration file; defaults to ~/.gizmo/config.json overlaid by ./.gizmo/config.json
    #[arg(long, global = true, env = "GIZMO_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Output format for query results
    #[arg(long, default_value = "table", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum KindArg {
    Document,
    Graph,
}

impl From<KindArg> for ExecutorKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Document => ExecutorKind::Document,
            KindArg::Graph => ExecutorKind::Graph,
        }
    }
}

/// Which connection and back end to use
#[derive(Args, Clone)]
struct Target {
    /// Connection name; defaults to "default" or the first configured one
    #[arg(short = 'c', long)]
    connection: Option<String>,

    /// Back-end variant
    #[arg(short = 't', long = "type", value_enum, default_value = "document")]
    kind: KindArg,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect configured connections
    Connection {
        #[command(subcommand)]
        action: ConnectionAction,
    },
    /// Execute a single query
    Execute {
        /// Query text, sent verbatim
        query: String,

        #[command(flatten)]
        target: Target,
    },
    /// Bulk-load query files, one query per line
    Load {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        target: Target,

        /// Lines to skip at the start of each file
        #[arg(long, default_value_t = 0)]
        skip: usize,

        /// Lines to run after the skip (0 = all)
        #[arg(long, default_value_t = 0)]
        take: usize,

        /// Concurrent queries
        #[arg(long, default_value_t = 8)]
        parallel: usize,
    },
    /// Bulk-load the files listed in a manifest
    Bulk {
        manifest: PathBuf,

        #[command(flatten)]
        target: Target,

        /// Concurrent queries
        #[arg(long, default_value_t = 8)]
        parallel: usize,
    },
    /// Start an interactive shell
    Interactive {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Subcommand)]
enum ConnectionAction {
    /// List configured connections
    List,
    /// Show one connection with its credential masked
    Show { name: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let manager = Arc::new(ConnectionManager::with_remote(config));

    let result = match cli.command {
        Commands::Connection { action } => run_connection(&manager, action),
        Commands::Execute { query, target } => run_execute(&manager, &target, &query, cli.format).await,
        Commands::Load {
            files,
            target,
            skip,
            take,
            parallel,
        } => {
            let options = BulkOptions {
                skip,
                take,
                parallelism: parallel,
                ..BulkOptions::default()
            };
            run_load(&manager, &target, &files, &options).await
        }
        Commands::Bulk {
            manifest,
            target,
            parallel,
        } => {
            let options = BulkOptions {
                parallelism: parallel,
                ..BulkOptions::default()
            };
            run_bulk(&manager, &target, &manifest, &options).await
        }
        Commands::Interactive { target } => run_shell(&manager, &target, cli.format).await,
    };

    manager.reset().await;

    match result {
        Ok(()) => {}
        Err(e) if is_cancelled(e.as_ref()) => eprintln!("Cancelled"),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Ctrl-C is an early exit, not a failure
fn is_cancelled(err: &(dyn std::error::Error + 'static)) -> bool {
    err.downcast_ref::<GizmoError>().is_some_and(GizmoError::is_cancelled)
}

fn init_logging(level: &str) {
    let level = tracing::Level::from_str(level).unwrap_or(tracing::Level::WARN);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> CliResult<GizmoConfig> {
    let config = match path {
        Some(path) => GizmoConfig::load(path)?,
        None => GizmoConfig::load_default()?,
    };
    Ok(config)
}

fn connection_name(manager: &ConnectionManager, target: &Target) -> CliResult<String> {
    if let Some(name) = &target.connection {
        return Ok(name.clone());
    }
    manager
        .config()
        .default_connection()
        .map(str::to_string)
        .ok_or_else(|| GizmoError::Configuration("No connections configured".to_string()).into())
}

/// Cancel `cancel` on Ctrl-C while `fut` runs
async fn with_ctrl_c<F: Future>(cancel: &CancellationToken, fut: F) -> F::Output {
    let trigger = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            trigger.cancel();
        }
    });
    let output = fut.await;
    watcher.abort();
    output
}

fn run_connection(manager: &ConnectionManager, action: ConnectionAction) -> CliResult<()> {
    match action {
        ConnectionAction::List => {
            let connections = &manager.config().connections;
            if connections.is_empty() {
                println!("(no connections configured)");
                return Ok(());
            }

            let mut table = Table::new();
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["name", "document endpoint", "graph endpoint", "collection"]);
            for (name, profile) in connections {
                table.add_row(vec![
                    name.clone(),
                    profile.document_endpoint.clone(),
                    format!("{}:{}", profile.graph_endpoint, profile.graph_port),
                    profile.resource_path(),
                ]);
            }
            println!("{}", table);
        }
        ConnectionAction::Show { name } => {
            let profile = manager.config().profile(&name)?;
            println!("{}", serde_json::to_string_pretty(&profile.redacted())?);
        }
    }
    Ok(())
}

async fn run_execute(
    manager: &ConnectionManager,
    target: &Target,
    query: &str,
    format: OutputFormat,
) -> CliResult<()> {
    let name = connection_name(manager, target)?;
    let cancel = CancellationToken::new();
    let result = with_ctrl_c(&cancel, async {
        let executor = manager.open(&name, target.kind.into(), &cancel).await?;
        executor.execute_query(query, &cancel).await
    })
    .await?;

    print_result(&result, format)
}

async fn run_load(
    manager: &Arc<ConnectionManager>,
    target: &Target,
    files: &[PathBuf],
    options: &BulkOptions,
) -> CliResult<()> {
    let name = connection_name(manager, target)?;
    let engine = BulkLoadEngine::new(manager.clone());
    let sink: Arc<dyn ProgressSink> = Arc::new(ConsoleSink);
    let cancel = CancellationToken::new();

    let summary = with_ctrl_c(
        &cancel,
        engine.load_files(files, &name, target.kind.into(), options, sink, &cancel),
    )
    .await?;
    print_summary(&summary);
    Ok(())
}

async fn run_bulk(
    manager: &Arc<ConnectionManager>,
    target: &Target,
    manifest: &Path,
    options: &BulkOptions,
) -> CliResult<()> {
    let name = connection_name(manager, target)?;
    let engine = BulkLoadEngine::new(manager.clone());
    let sink: Arc<dyn ProgressSink> = Arc::new(ConsoleSink);
    let cancel = CancellationToken::new();

    let summary = with_ctrl_c(
        &cancel,
        engine.load_manifest(manifest, &name, target.kind.into(), options, sink, &cancel),
    )
    .await?;
    print_summary(&summary);
    Ok(())
}

async fn run_shell(manager: &Arc<ConnectionManager>, target: &Target, format: OutputFormat) -> CliResult<()> {
    let name = connection_name(manager, target)?;
    let mut kind: ExecutorKind = target.kind.into();

    println!("Gizmo Interactive Shell");
    println!("Type queries, or :help for commands. :quit to exit.\n");

    match manager.open(&name, kind, &CancellationToken::new()).await {
        Ok(executor) => println!("Connected to {}", executor.remote_message()),
        Err(e) => eprintln!("Error: {}", e),
    }

    let stdin = std::io::stdin();
    let mut line = String::new();

    loop {
        eprint!("gizmo:{}:{}> ", name, kind);

        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            break; // EOF
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut words = trimmed.split_whitespace();
        match words.next().unwrap_or_default() {
            ":quit" | ":exit" | ":q" => break,
            ":help" | ":h" => {
                println!("Commands:");
                println!("  :mode                              Switch between document and graph back ends");
                println!("  :load <file> [skip] [take] [par]   Bulk-load a query file");
                println!("  :bulk <manifest> [par]             Bulk-load every file in a manifest");
                println!("  :reset                             Close the current connection");
                println!("  :quit                              Exit shell");
                println!("  <query>                            Execute a query");
            }
            ":mode" => match manager.switch_kind(&CancellationToken::new()).await {
                Ok(executor) => {
                    kind = executor.kind();
                    println!("Switched to {}", executor.remote_message());
                }
                Err(e) => eprintln!("Error: {}", e),
            },
            ":reset" => {
                manager.reset().await;
                println!("Disconnected");
            }
            ":load" => {
                let Some(file) = words.next() else {
                    eprintln!("Usage: :load <file> [skip] [take] [parallel]");
                    continue;
                };
                let numbers: Vec<usize> = words.filter_map(|w| w.parse().ok()).collect();
                let options = BulkOptions {
                    skip: numbers.first().copied().unwrap_or(0),
                    take: numbers.get(1).copied().unwrap_or(0),
                    parallelism: numbers.get(2).copied().unwrap_or(8),
                    ..BulkOptions::default()
                };
                let shell_target = Target {
                    connection: Some(name.clone()),
                    kind: kind_arg(kind),
                };
                if let Err(e) = run_load(manager, &shell_target, &[PathBuf::from(file)], &options).await {
                    eprintln!("Error: {}", e);
                }
            }
            ":bulk" => {
                let Some(manifest) = words.next() else {
                    eprintln!("Usage: :bulk <manifest> [parallel]");
                    continue;
                };
                let options = BulkOptions {
                    parallelism: words.next().and_then(|w| w.parse().ok()).unwrap_or(8),
                    ..BulkOptions::default()
                };
                let shell_target = Target {
                    connection: Some(name.clone()),
                    kind: kind_arg(kind),
                };
                if let Err(e) = run_bulk(manager, &shell_target, Path::new(manifest), &options).await {
                    eprintln!("Error: {}", e);
                }
            }
            _ => {
                let shell_target = Target {
                    connection: Some(name.clone()),
                    kind: kind_arg(kind),
                };
                if let Err(e) = run_execute(manager, &shell_target, trimmed, format).await {
                    eprintln!("Error: {}", e);
                }
            }
        }
    }

    println!("Bye!");
    Ok(())
}

fn kind_arg(kind: ExecutorKind) -> KindArg {
    match kind {
        ExecutorKind::Document => KindArg::Document,
        ExecutorKind::Graph => KindArg::Graph,
    }
}

fn print_summary(summary: &BulkSummary) {
    println!(
        "{} queries: {} succeeded, {} failed, {} retries in {:.1}s{}",
        summary.total,
        summary.succeeded,
        summary.failed,
        summary.retries,
        summary.elapsed.as_secs_f64(),
        if summary.cancelled { " (cancelled)" } else { "" }
    );
}

fn print_result(result: &ResultAggregate, format: OutputFormat) -> CliResult<()> {
    println!("{}", result);

    match format {
        OutputFormat::Json => {
            println!("{}", result.records_json());
        }
        OutputFormat::Table => {
            if result.is_empty() {
                println!("(no results)");
                return Ok(());
            }

            let columns = record_columns(result.records());
            let mut table = Table::new();
            table.set_content_arrangement(ContentArrangement::Dynamic);

            if columns.is_empty() {
                table.set_header(vec!["value"]);
                for record in result.records() {
                    table.add_row(vec![format_table_value(record)]);
                }
            } else {
                table.set_header(&columns);
                for record in result.records() {
                    let cells: Vec<String> = columns
                        .iter()
                        .map(|c| record.get(c).map(format_table_value).unwrap_or_default())
                        .collect();
                    table.add_row(cells);
                }
            }

            println!("{}", table);
            println!("{} row(s)", result.len());
        }
    }

    Ok(())
}

/// Union of object keys, in first-seen order. Empty when records are not objects.
fn record_columns(records: &[serde_json::Value]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        let Some(map) = record.as_object() else {
            return Vec::new();
        };
        for key in map.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

fn format_table_value(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Object(map) => {
            // vertices and edges get a compact form
            if let Some(id) = map.get("id") {
                if let Some(label) = map.get("label") {
                    let kind = map.get("type").and_then(|t| t.as_str()).unwrap_or("vertex");
                    return if kind == "edge" {
                        format!("[{}:{}]", id, label)
                    } else {
                        format!("({}:{})", id, label)
                    };
                }
            }
            serde_json::to_string(v).unwrap_or_default()
        }
        serde_json::Value::Array(_) => serde_json::to_string(v).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_not_a_failure() {
        let cancelled: Box<dyn std::error::Error> = Box::new(GizmoError::Cancelled);
        assert!(is_cancelled(cancelled.as_ref()));

        let down: Box<dyn std::error::Error> = Box::new(GizmoError::Connection("down".to_string()));
        assert!(!is_cancelled(down.as_ref()));

        let other: Box<dyn std::error::Error> = "plain".into();
        assert!(!is_cancelled(other.as_ref()));
    }
}
