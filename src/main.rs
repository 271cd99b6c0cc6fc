//! Tier routing engine driver.
//!
//! Reads one JSON request per stdin line and writes one JSON outcome per
//! stdout line.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tiergate::router::ThreadRngSampler;
use tiergate::{
    Engine, EngineConfig, InMemoryDomainRegistry, JsonLinesLedger, LedgerWriter, MemoryLedger,
    Submission, TrafficLedger,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tiergate")]
#[command(author, version, about = "Bot classification and tier routing engine")]
struct Args {
    /// Path to engine configuration file (JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to domain list (JSON or YAML)
    #[arg(short, long)]
    domains: PathBuf,

    /// Append traffic records to this JSON lines file instead of memory
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(json: bool, level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so stdout carries only outcomes
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, &args.log_level);

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let registry = Arc::new(InMemoryDomainRegistry::from_file(&args.domains)?);

    let ledger: Arc<dyn TrafficLedger> = match &args.ledger {
        Some(path) => {
            info!(path = %path.display(), "Writing traffic records to file");
            Arc::new(JsonLinesLedger::open(path).await?)
        }
        None => Arc::new(MemoryLedger::new()),
    };
    let (handle, writer) = LedgerWriter::spawn(ledger, config.routing.ledger_queue_capacity);

    let engine = Arc::new(Engine::new(
        &config,
        registry,
        handle,
        Arc::new(ThreadRngSampler),
    )?);
    let sweeper = engine.spawn_sweeper();

    info!("Reading requests from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut processed: u64 = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        // Unreadable lines still get an outcome, classified conservatively
        let submission = Submission::from_line(line);
        let outcome = engine.handle(&submission.domain, &submission.request).await;
        let mut out = serde_json::to_vec(&outcome)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        processed += 1;
    }
    stdout.flush().await?;

    sweeper.abort();
    drop(engine);
    writer.finish().await;

    info!(processed, "Input exhausted, shutting down");
    Ok(())
}
