//! tlsward - main entry point

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use tlsward_config::{Config, LogFormat};
use tlsward_daemon::App;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// tlsward - automatic ACME certificates with zero-downtime TLS swaps
#[derive(Parser, Debug)]
#[command(name = "tlsward")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "TLSWARD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon: challenge port, HTTPS listener and renewal scheduler (default)
    Run,
    /// Issue or renew one domain and exit
    Issue {
        /// Domain to issue for
        #[arg(short = 'd', long = "domain")]
        domain: String,
    },
    /// List stored certificates
    Status,
    /// Validate configuration file and exit
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config, cli.verbose);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => check_config(&config, cli.config.as_deref()),
        command => {
            config.validate().context("Configuration validation failed")?;
            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            runtime.block_on(run_command(config, command))
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration file {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn init_tracing(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

fn check_config(config: &Config, path: Option<&std::path::Path>) -> Result<()> {
    config.validate().context("Configuration validation failed")?;

    info!("Configuration test successful:");
    info!("  - {} domain(s)", config.acme.domains.len());
    info!("  - directory {}", config.acme.directory_url());
    info!("  - state dir {}", config.storage.state_dir.display());

    println!(
        "tlsward: configuration file {} test is successful",
        path.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults)".to_string())
    );
    Ok(())
}

async fn run_command(config: Config, command: Commands) -> Result<()> {
    let app = App::new(config).context("Failed to initialize")?;

    match command {
        Commands::Run => {
            if app.config().acme.domains.is_empty() {
                warn!("No domains configured; only the placeholder certificate will be served");
            }
            let (shutdown, watcher) = watch::channel(false);
            tokio::spawn(async move {
                wait_for_signal().await;
                let _ = shutdown.send(true);
            });
            app.run(watcher).await.context("Daemon failed")?;
        }
        Commands::Issue { domain } => {
            let record = app
                .issue_once(&domain)
                .await
                .with_context(|| format!("Failed to issue certificate for {}", domain))?;
            println!(
                "{}: {} until {} ({} days)",
                record.domain,
                record.status,
                record.expires_at.to_rfc3339(),
                record.days_remaining(Utc::now())
            );
        }
        Commands::Status => {
            let records = app.status().await.context("Failed to read certificate store")?;
            if records.is_empty() {
                println!("no certificates stored");
            }
            let now = Utc::now();
            for record in records {
                println!(
                    "{:<40} {:<8} {:>5}d  expires {}",
                    record.domain,
                    record.status,
                    record.days_remaining(now),
                    record.expires_at.to_rfc3339()
                );
            }
        }
        Commands::CheckConfig => bail!("check-config runs without the async runtime"),
    }

    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
