//! # sofadb - command line access to a sofadb database
//!
//! Opens (or creates) a database directory, runs one command and prints the result as JSON on
//! stdout. Logs go to stderr.

use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::filter::EnvFilter;

use sofadb::{
    AllDocsOptions, AutoCompaction, ChangesOptions, Database, DatabaseConfig, GetOptions,
};

/// An MVCC document store with revision trees, attachments and change feeds.
#[derive(Parser, Debug)]
#[command(name = "sofadb", version, about = "An MVCC document storage engine on sled")]
struct Args {
    /// Database name. Live change feeds are keyed by it.
    #[arg(long, default_value = "default")]
    name: String,

    /// Directory holding the database files.
    #[arg(long, default_value = "default.sofadb")]
    data_dir: PathBuf,

    /// Number of ancestor revisions kept per branch before older history is stemmed.
    #[arg(long, default_value_t = 1000)]
    revs_limit: usize,

    /// Auto compaction policy - 'disabled', 'inline' or 'deferred'.
    #[arg(long, default_value = "disabled")]
    auto_compaction: String,

    /// Backend page cache size in megabytes.
    #[arg(long, default_value_t = 256)]
    cache_size_mb: u64,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show document count, update sequence and storage details.
    Info,

    /// Read a document.
    Get {
        id: String,
        /// Read this revision instead of the winner.
        #[arg(long)]
        rev: Option<String>,
        #[arg(long)]
        conflicts: bool,
        /// Include the revision history.
        #[arg(long)]
        revs: bool,
        /// Inline attachment bodies.
        #[arg(long)]
        attachments: bool,
    },

    /// Write a document given as JSON, or '-' to read it from stdin.
    Put { doc: String },

    /// Delete a document at its current revision.
    Delete { id: String, rev: String },

    /// List documents in id order.
    AllDocs {
        #[arg(long)]
        startkey: Option<String>,
        #[arg(long)]
        endkey: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        descending: bool,
        #[arg(long)]
        include_docs: bool,
    },

    /// Print the change feed. With --live, keep following it until interrupted.
    Changes {
        #[arg(long, default_value_t = 0)]
        since: u64,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        include_docs: bool,
        #[arg(long)]
        live: bool,
    },

    /// Purge superseded revisions and orphaned attachments.
    Compact,

    /// Print a document's revision tree.
    RevTree { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    let config = build_database_config(&args)?;
    let db = Database::open(config)
        .with_context(|| format!("opening database at {:?}", args.data_dir))?;
    debug!(name = %args.name, "Running {:?}", args.command);

    let result = run(&db, args.command).await;
    db.close().await?;
    result
}

async fn run(db: &Database, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Info => print_json(&db.info().await?),
        Command::Get {
            id,
            rev,
            conflicts,
            revs,
            attachments,
        } => {
            let opts = GetOptions {
                rev,
                conflicts,
                revs,
                attachments,
                ..Default::default()
            };
            print_json(&db.get(&id, &opts).await?.doc)
        }
        Command::Put { doc } => {
            let doc = read_doc(&doc)?;
            let id = doc
                .get("_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            match id {
                Some(id) => {
                    let rev = db.put(doc).await?;
                    print_json(&json!({"ok": true, "id": id, "rev": rev}))
                }
                None => {
                    let (id, rev) = db.post(doc).await?;
                    print_json(&json!({"ok": true, "id": id, "rev": rev}))
                }
            }
        }
        Command::Delete { id, rev } => {
            let rev = db.remove(&id, &rev).await?;
            print_json(&json!({"ok": true, "id": id, "rev": rev}))
        }
        Command::AllDocs {
            startkey,
            endkey,
            limit,
            descending,
            include_docs,
        } => {
            let opts = AllDocsOptions {
                startkey,
                endkey,
                limit,
                descending,
                include_docs,
                ..Default::default()
            };
            print_json(&db.all_docs(&opts).await?)
        }
        Command::Changes {
            since,
            limit,
            include_docs,
            live,
        } => {
            let opts = ChangesOptions {
                since,
                limit,
                include_docs,
                ..Default::default()
            };
            if live {
                follow_changes(db, opts).await
            } else {
                print_json(&db.changes(&opts).await?)
            }
        }
        Command::Compact => print_json(&db.compact().await?),
        Command::RevTree { id } => {
            let tree = db.get_revision_tree(&id).await?;
            let mut nodes = Vec::new();
            tree.traverse(|visit| {
                nodes.push(json!({
                    "rev": visit.node.rev().to_string(),
                    "parent": visit.parent.map(|p| p.rev().to_string()),
                    "deleted": visit.node.deleted,
                    "status": visit.node.status.as_str(),
                    "leaf": visit.is_leaf,
                }));
            });
            print_json(&json!({
                "id": id,
                "winner": tree.winning_rev().map(|r| r.to_string()),
                "nodes": nodes,
            }))
        }
    }
}

/// Prints changes one JSON line at a time until the feed ends or Ctrl-C.
async fn follow_changes(db: &Database, opts: ChangesOptions) -> anyhow::Result<()> {
    let mut feed = db.live_changes(opts)?;
    info!("Following changes, press Ctrl-C to stop");
    loop {
        tokio::select! {
            change = feed.next() => match change {
                Some(change) => println!("{}", serde_json::to_string(&change)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, stopping change feed");
                feed.cancel();
                break;
            }
        }
    }
    Ok(())
}

fn read_doc(arg: &str) -> anyhow::Result<Value> {
    let text = if arg == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading document from stdin")?;
        buf
    } else {
        arg.to_string()
    };
    serde_json::from_str(&text).context("document is not valid JSON")
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" => EnvFilter::new("trace"),
        "debug" => EnvFilter::new("debug"),
        "info" => EnvFilter::new("info"),
        "warn" => EnvFilter::new("warn"),
        "error" => EnvFilter::new("error"),
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            EnvFilter::new("info")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// Build DatabaseConfig from CLI arguments.
fn build_database_config(args: &Args) -> anyhow::Result<DatabaseConfig> {
    let auto_compaction: AutoCompaction = args.auto_compaction.parse()?;
    let config = DatabaseConfig::new(args.name.clone(), args.data_dir.clone())
        .with_revs_limit(args.revs_limit)
        .with_auto_compaction(auto_compaction)
        .with_cache(args.cache_size_mb, 1000);
    config.validate()?;
    Ok(config)
}
