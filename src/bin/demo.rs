//! SpiteTrack Demo Binary
//!
//! Simulates an app and a widget sharing one history database: each side
//! writes transactions, notifies the other's coordinator, and receives what
//! the other wrote. Finishes with a cleanup pass and prints what remained.
//!
//! # Examples
//!
//! ```bash
//! cargo run --bin spitetrack-demo
//! RUST_LOG=spitetrack=debug cargo run --bin spitetrack-demo -- --writes 50
//! ```

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use spitetrack::sink::{self, TransactionStream};
use spitetrack::{Author, Change, CleanupStrategy, Coordinator, CoordinatorHandle, SqliteLog, TrackerConfig};
use tracing_subscriber::EnvFilter;

/// Demo configuration
struct Config {
    /// Transactions written by each author
    writes: usize,
    /// Path to database file (or temp if None)
    db_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            writes: 10,
            db_path: None,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--writes" | "-w" => {
                i += 1;
                config.writes = match args.get(i).and_then(|v| v.parse().ok()) {
                    Some(n) => n,
                    None => usage_error("invalid --writes value"),
                };
            }
            "--db" | "-d" => {
                i += 1;
                config.db_path = match args.get(i) {
                    Some(path) => Some(PathBuf::from(path)),
                    None => usage_error("--db needs a path"),
                };
            }
            "--help" | "-h" => {
                println!(
                    r#"SpiteTrack Demo

Usage: spitetrack-demo [OPTIONS]

Options:
  -w, --writes <N>  Transactions written per author (default: 10)
  -d, --db <PATH>   Database path (default: temp file)
  -h, --help        Show this help
"#
                );
                process::exit(0);
            }
            arg => usage_error(&format!("unknown argument: {arg}")),
        }
        i += 1;
    }

    config
}

fn usage_error(message: &str) -> ! {
    eprintln!("{message}");
    process::exit(1);
}

/// One simulated process: its own connection, coordinator, and stream.
struct Participant {
    author: Author,
    log: SqliteLog,
    handle: CoordinatorHandle,
    stream: TransactionStream,
}

impl Participant {
    fn start(author: &str, db_path: &Path, all_authors: &[&str]) -> spitetrack::Result<Self> {
        let log = SqliteLog::open(db_path)?;
        let (sink, stream) = sink::channel();
        let config = TrackerConfig::new(author, all_authors.iter().copied())
            .with_cleanup(CleanupStrategy::Disabled);
        let handle = Coordinator::with_sqlite(config, &log, Arc::new(sink))?.spawn();

        Ok(Self {
            author: Author::new(author),
            log,
            handle,
            stream,
        })
    }

    fn write(&self, n: usize) -> spitetrack::Result<()> {
        let batch = (0..n)
            .map(|i| {
                let key = format!("{}-{i}", self.author);
                vec![Change::insert("Event", key, format!("written by {}", self.author).into_bytes())]
            })
            .collect();
        self.log.append_batch(&self.author, batch)?;
        Ok(())
    }

    /// Drains batches until `expected` transactions arrived or the wait
    /// times out.
    async fn receive(&mut self, expected: usize) -> usize {
        let mut received = 0;
        while received < expected {
            match tokio::time::timeout(Duration::from_secs(5), self.stream.recv()).await {
                Ok(Some(batch)) => received += batch.len(),
                _ => break,
            }
        }
        received
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("spitetrack=info")))
        .init();

    let config = parse_args();
    if let Err(e) = run(config).await {
        eprintln!("demo failed: {e}");
        process::exit(1);
    }
}

async fn run(config: Config) -> spitetrack::Result<()> {
    let temp_dir = std::env::temp_dir().join(format!("spitetrack-demo-{}", process::id()));
    let db_path = match config.db_path {
        Some(path) => path,
        None => {
            std::fs::create_dir_all(&temp_dir)
                .map_err(|e| spitetrack::Error::Internal(format!("create temp dir: {e}")))?;
            temp_dir.join("history.db")
        }
    };

    println!("SpiteTrack Demo");
    println!("===============");
    println!("Writes:   {} per author", config.writes);
    println!("Database: {}", db_path.display());
    println!();

    let authors = ["app", "widget"];
    let mut app = Participant::start("app", &db_path, &authors)?;
    let mut widget = Participant::start("widget", &db_path, &authors)?;

    let start = Instant::now();

    app.write(config.writes)?;
    widget.write(config.writes)?;
    widget.handle.notify()?;
    app.handle.notify()?;

    let widget_received = widget.receive(config.writes).await;
    let app_received = app.receive(config.writes).await;

    println!("widget received {widget_received} transactions from app");
    println!("app received {app_received} transactions from widget");

    // Make sure both watermarks cover everything before cleaning.
    app.handle.sync_now().await?;
    widget.handle.sync_now().await?;

    let stats = app.handle.clean_now().await?;
    println!("cleanup removed {} transactions ({})", stats.removed, stats.point);
    println!("remaining in log: {}", app.log.len()?);
    println!("elapsed: {:?}", start.elapsed());

    for participant in [&app, &widget] {
        let metrics = participant.handle.metrics();
        println!(
            "{}: {} cycles, {} delivered",
            participant.author, metrics.cycles_completed, metrics.transactions_delivered
        );
        participant.handle.shutdown().await;
    }

    let _ = std::fs::remove_dir_all(&temp_dir);
    Ok(())
}
