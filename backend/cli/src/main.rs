mod api;
mod cron_cmd;
mod trigger_cmd;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use jobforge_config::{load_and_prepare, resolve_config_path, validate, JobForgeConfig};
use jobforge_core::{BroadcastEventBus, Database, EventBus, Module};
use jobforge_executor::{ProcessResolver, Services};
use jobforge_logging::{init_logger, EventLogger};
use jobforge_scheduler::Engine;
use jobforge_store::{SqliteDatabase, SqliteStore};

use api::AppState;

const EVENT_BUS_CAPACITY: usize = 1024;
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "JobForge: durable cron and on-demand job engine")]
#[command(version)]
struct Cli {
    /// Config file (default: $JOBFORGE_CONFIG, then ~/.jobforge/jobforge.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine and its admin HTTP API
    Serve {
        /// Port to bind the admin API to
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Remove recurring registrations whose job no longer exists
    Reconcile,
    /// Check a cron expression and print its next fire times
    ValidateCron {
        expression: String,
        #[arg(short, long, default_value = "UTC")]
        timezone: String,
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
    /// Ask a running server to run a job now
    Trigger {
        job_id: String,
        #[arg(long)]
        priority: Option<i32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Needs neither config nor logging.
    if let Commands::ValidateCron {
        expression,
        timezone,
        count,
    } = &cli.command
    {
        return cron_cmd::run(expression, timezone, *count);
    }

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = load_and_prepare(&config_path).await?;
    init_logger(&config.logging.dir, &config.logging.level, config.logging.json)?;
    // Loading ran before the subscriber existed.
    for warning in validate(&config).warnings {
        warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    info!(config = %config_path.display(), "Configuration loaded");

    match cli.command {
        Commands::Serve { port } => {
            let mut config = config;
            if let Some(port) = port {
                config.admin.port = port;
            }
            run_server(config).await?;
        }
        Commands::Reconcile => {
            let store = open_store(&config)?;
            let engine = Engine::from_config(
                &config,
                store.into_stores(),
                Services::default(),
                Arc::new(ProcessResolver::new(config.executor.max_output_bytes)),
            );
            let report = engine.reconcile_orphans().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Trigger { job_id, priority } => {
            trigger_cmd::run(&config, &job_id, priority).await?;
        }
        Commands::ValidateCron { .. } => {}
    }

    Ok(())
}

fn is_memory(path: &Path) -> bool {
    path == Path::new(":memory:")
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

fn open_store(config: &JobForgeConfig) -> Result<Arc<SqliteStore>> {
    let path = &config.database.path;
    let store = if is_memory(path) {
        SqliteStore::in_memory()?
    } else {
        ensure_parent(path)?;
        SqliteStore::open(path)?
    };
    Ok(Arc::new(store))
}

/// Handlers query their own file, never the engine's tables or connection.
fn open_handler_database(config: &JobForgeConfig) -> Result<Arc<SqliteDatabase>> {
    let path = &config.database.handler_path;
    let database = if is_memory(path) {
        SqliteDatabase::in_memory()?
    } else {
        ensure_parent(path)?;
        SqliteDatabase::open(path)?
    };
    Ok(Arc::new(database))
}

async fn run_server(config: JobForgeConfig) -> Result<()> {
    info!(
        addr = %config.admin.address(),
        db = %config.database.path.display(),
        handler_db = %config.database.handler_path.display(),
        modules = %config.modules.root_dir.display(),
        "Starting JobForge engine"
    );

    let store = open_store(&config)?;
    let bus = Arc::new(BroadcastEventBus::new(EVENT_BUS_CAPACITY));
    let event_log = EventLogger::spawn(bus.subscribe());

    let database: Arc<dyn Database> = open_handler_database(&config)?;
    let events: Arc<dyn EventBus> = bus.clone();
    let services = Services::new(database, events);
    let resolver = Arc::new(ProcessResolver::new(config.executor.max_output_bytes));
    let engine = Arc::new(Engine::from_config(
        &config,
        store.into_stores(),
        services,
        resolver,
    ));

    register_module_dirs(&engine, &config.modules.root_dir).await?;
    engine.start().await?;

    let app = api::build_router(Arc::new(AppState {
        engine: Arc::clone(&engine),
    }))
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    let addr = config.admin.address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind admin API to {addr}"))?;
    info!(addr = %addr, "Admin API listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    engine.shutdown().await;
    drop(engine);
    drop(bus);
    // A handler that outlived its timeout may still hold the bus open.
    match tokio::time::timeout(EVENT_DRAIN_TIMEOUT, event_log).await {
        Ok(Err(e)) => error!(error = %e, "Event logger task ended abnormally"),
        Err(_) => warn!("Event logger still draining at exit"),
        Ok(Ok(())) => {}
    }
    served.context("Admin API server failed")
}

/// Each directory directly under the modules root is a module named after it.
/// Already-registered modules keep their stored settings.
async fn register_module_dirs(engine: &Engine, root: &Path) -> Result<()> {
    if !root.is_dir() {
        warn!(root = %root.display(), "Modules directory does not exist; no modules discovered");
        return Ok(());
    }
    let mut entries = tokio::fs::read_dir(root)
        .await
        .with_context(|| format!("Failed to read modules directory {}", root.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let id = entry.file_name().to_string_lossy().into_owned();
        if engine.stores().modules.get_module(&id).await?.is_some() {
            continue;
        }
        engine
            .register_module(Module::new(id.clone(), id, entry.path()))
            .await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
