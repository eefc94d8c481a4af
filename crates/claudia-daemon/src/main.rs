//! Claudia Memory Daemon
//!
//! Long-lived daemon beside an AI coding assistant:
//! - stdio JSON-RPC tool surface (memory.remember, memory.recall, ...)
//! - background scheduler (decay, consolidation, verification, backups,
//!   vault sync)
//! - health HTTP endpoint on loopback
//!
//! One daemon per database file, enforced by an advisory lock; a second
//! instance exits successfully so startup scripts can no-op.

mod health;
mod protocol;
mod scheduler;
mod server;
mod services;
mod tools;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use claudia_core::config::{project_hash, MemoryConfig};
use claudia_core::embeddings::migrate_embeddings;
use claudia_core::{DaemonLock, Store};

use crate::health::HealthState;
use crate::protocol::stdio::StdioTransport;
use crate::scheduler::Scheduler;
use crate::server::McpServer;
use crate::services::Services;

#[derive(Parser, Debug)]
#[command(
    name = "claudia-daemon",
    version,
    about = "Claudia memory daemon - personal memory engine for your AI assistant"
)]
struct Cli {
    /// Run without the stdio tool server (scheduler and health only)
    #[arg(long)]
    standalone: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Run one full consolidation and exit
    #[arg(long)]
    consolidate: bool,

    /// Probe the daemon health endpoint and exit
    #[arg(long)]
    check: bool,

    /// Project directory for per-project database isolation
    #[arg(long, value_name = "PATH")]
    project_dir: Option<PathBuf>,

    /// Render a one-shot terminal status snapshot and exit
    #[arg(long)]
    tui: bool,

    /// Rebuild the vector tables at the configured dimension and re-embed
    /// everything, then exit
    #[arg(long)]
    migrate_embeddings: bool,
}

/// Duplicates log lines to stderr and, when available, the daemon log file.
/// stdout stays reserved for the JSON-RPC channel.
struct TeeWriter {
    file: Option<std::fs::File>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = std::io::stderr().write(buf)?;
        if let Some(file) = &mut self.file {
            let _ = file.write_all(buf);
        }
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        if let Some(file) = &mut self.file {
            let _ = file.flush();
        }
        Ok(())
    }
}

fn setup_logging(config: &MemoryConfig, debug: bool) {
    let log_path = config.log_path();
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || TeeWriter {
            file: log_file.as_ref().and_then(|f| f.try_clone().ok()),
        })
        .with_target(false)
        .with_ansi(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let project_id = cli
        .project_dir
        .as_deref()
        .map(|dir| project_hash(&std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf())));
    let config = MemoryConfig::load(project_id.as_deref());

    setup_logging(&config, cli.debug);

    if cli.check {
        return run_check(&config);
    }

    // Every remaining path opens the store
    let store = Arc::new(Store::open(&config).context("failed to open database")?);
    info!("database ready at {}", store.path().display());

    // Services are built outside the async runtime: the embedding and LM
    // clients own blocking HTTP internals.
    let services = Arc::new(Services::new(config.clone(), store));

    if cli.migrate_embeddings {
        return run_embedding_migration(&services);
    }
    if cli.consolidate {
        let report = services.consolidator.run_full_consolidation();
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if cli.tui {
        return run_status_snapshot(&services);
    }

    // Daemon path: single instance per database
    let lock = match DaemonLock::acquire(services.store.path())? {
        Some(lock) => lock,
        None => {
            info!("another daemon already holds the lock; nothing to do");
            return Ok(());
        }
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run_daemon(&cli, project_id.as_deref(), services));

    drop(lock);
    result
}

async fn run_daemon(
    cli: &Cli,
    project_id: Option<&str>,
    services: Arc<Services>,
) -> anyhow::Result<()> {
    info!("Claudia memory daemon v{} starting", env!("CARGO_PKG_VERSION"));
    if let Some(pid) = project_id {
        info!("project isolation enabled: {}", pid);
    }
    if services.store.model_mismatch() {
        error!(
            "embedding shape mismatch detected; run --migrate-embeddings \
             to regenerate vectors"
        );
    }

    let vault_dir = services.config.vault_dir(project_id);
    let scheduler = Arc::new(Scheduler::new(services.clone(), vault_dir));
    scheduler.start();

    let health_state = HealthState {
        services: services.clone(),
        scheduler: scheduler.clone(),
    };
    let health_port = services.config.health_port;
    tokio::spawn(async move {
        health::serve(health_state, health_port).await;
    });

    if cli.standalone {
        info!("running in standalone mode (no stdio tool server)");
        tokio::signal::ctrl_c().await?;
    } else {
        info!("tool server listening on stdio");
        let server = McpServer::new(services.clone());
        StdioTransport::new().run(server).await?;
    }

    info!("shutting down");
    scheduler.stop();
    Ok(())
}

fn run_check(config: &MemoryConfig) -> anyhow::Result<()> {
    let url = format!("http://localhost:{}/status", config.health_port);
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;
    match client.get(&url).send() {
        Ok(response) => {
            let body: serde_json::Value = response.json()?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Health check failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn run_embedding_migration(services: &Arc<Services>) -> anyhow::Result<()> {
    info!("rebuilding vector tables and re-embedding all content");
    match migrate_embeddings(&services.store, &services.embeddings) {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            error!("embedding migration failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// One-shot terminal snapshot; the dashboard is a thin adapter over the
/// same queries the health endpoint serves.
fn run_status_snapshot(services: &Arc<Services>) -> anyhow::Result<()> {
    println!("Claudia memory status");
    println!("=====================");
    println!("database: {}", services.store.path().display());
    for table in [
        "memories",
        "entities",
        "relationships",
        "episodes",
        "patterns",
        "predictions",
        "reflections",
    ] {
        println!("{:>14}: {}", table, services.store.count(table)?);
    }
    println!(
        "{:>14}: {}",
        "embeddings",
        if services.embeddings.is_available() {
            "available"
        } else {
            "unavailable"
        }
    );
    if services.store.model_mismatch() {
        println!("{:>14}: run --migrate-embeddings", "attention");
    }
    Ok(())
}
