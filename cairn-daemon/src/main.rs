mod bootstrap;

use std::path::PathBuf;

use anyhow::Context;
use cairn_config::{ConfigLoader, ConfigLoaderOptions, validation};
use cairn_core::runtime::SyncRuntime;
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bootstrap::{Bootstrap, connect_index, log_warnings};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "cairn", version)]
#[command(about = "Mirrors local source trees into a content-addressable blob store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ConfigArgs {
    /// Path to cairn.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
}

impl ConfigArgs {
    fn loader(&self) -> ConfigLoader {
        ConfigLoader::with_options(ConfigLoaderOptions {
            config_path: self.config.clone(),
            env_file: self.env_file.clone(),
        })
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch, reconcile and upload until interrupted (default)
    Run,
    /// Run one reconciliation scan, print its statistics and exit
    Scan,
    /// Scan, drain the upload queue, print statistics and exit
    SyncOnce,
    /// Print the effective configuration and any problems with it
    CheckConfig,
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&cli.config).await,
        Command::Scan => {
            let bootstrap = Bootstrap::prepare(&cli.config.loader()).await?;
            let stats = bootstrap.engine.scan().await?;
            print_json(&stats)
        }
        Command::SyncOnce => {
            let bootstrap = Bootstrap::prepare(&cli.config.loader()).await?;
            let owner = format!("sync-once-{}", std::process::id());
            let (scan, uploads) = bootstrap.engine.sync_once(&owner).await?;
            #[derive(Serialize)]
            struct Summary<T, U> {
                scan: T,
                uploads: U,
            }
            print_json(&Summary { scan, uploads })
        }
        Command::CheckConfig => check_config(&cli.config),
        Command::Migrate => migrate(&cli.config).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Quiet per-file logs by default. Override via RUST_LOG.
                "info,cairn::dispatch=info,cairn::scan=info,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(args: &ConfigArgs) -> anyhow::Result<()> {
    let bootstrap = Bootstrap::prepare(&args.loader()).await?;
    let runtime = SyncRuntime::start(bootstrap.engine)
        .await
        .context("failed to start sync runtime")?;

    shutdown_signal().await;
    info!("shutdown signal received");
    runtime.shutdown().await.context("sync runtime shutdown failed")?;
    Ok(())
}

fn check_config(args: &ConfigArgs) -> anyhow::Result<()> {
    let load = args.loader().resolve().context("failed to load configuration")?;
    let report = validation::validate(&load.config);

    let rendered = toml::to_string_pretty(&load.config.redacted())
        .context("failed to render configuration")?;
    match &load.config.metadata.config_path {
        Some(path) => println!("# source: {}", path.display()),
        None => println!("# source: environment only"),
    }
    println!("{rendered}");

    log_warnings(&load.warnings);
    log_warnings(&report.warnings);
    if report.is_ok() {
        info!("configuration is valid");
        return Ok(());
    }
    for problem in &report.errors {
        error!("{problem}");
    }
    anyhow::bail!("configuration has {} error(s)", report.errors.len())
}

async fn migrate(args: &ConfigArgs) -> anyhow::Result<()> {
    let load = args.loader().resolve().context("failed to load configuration")?;
    let index = connect_index(&load.config).await?;
    index.migrate().await.context("database migration failed")?;
    info!("database migrations applied");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
