//! Vault Workflow - Main entry point.

use anyhow::{bail, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use vault_common::config::{config_path, Config};
use vault_common::logging::init_logging;
use vault_common::WorkZone;
use vault_workflow::{Fired, VaultService};

/// Task-lifecycle engine for a shared vault.
#[derive(Parser, Debug)]
#[command(name = "vault-workflow")]
#[command(version)]
#[command(about = "Claims, drafts, approves and executes vault records.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the vault directory layout
    Init,

    /// Run a worker loop for one zone
    Worker {
        /// Zone to run as (defaults to config or cloud-marker detection)
        #[arg(long)]
        zone: Option<WorkZone>,

        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Serve the approval dashboard and change feed
    Dashboard,

    /// Run the trigger scheduler
    Scheduler {
        /// Fire one trigger by name now and exit
        #[arg(long)]
        fire: Option<String>,

        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// Synchronise the vault with its git remote
    Sync {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Mint a dashboard token
    Token {
        /// Token subject (reviewer name)
        #[arg(long, default_value = "dashboard")]
        subject: String,
    },

    /// Repair status headers that disagree with their directory
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load_with_env()?;

    // Initialize logging
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    config.validate()?;
    tracing::info!(config = %config_path().display(), "Vault Workflow v{}", env!("CARGO_PKG_VERSION"));

    let service = VaultService::new(config)?;

    match cli.command {
        Commands::Init => {
            println!("Vault ready at {}", service.vault().root().display());
        }
        Commands::Worker { zone, once } => {
            let zone = zone.unwrap_or_else(|| service.config().zone());
            let worker = service.worker(zone)?;
            if once {
                let report = worker.run_pass().await;
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                worker.run(shutdown_signal()).await;
            }
        }
        Commands::Dashboard => {
            service.run_dashboard(shutdown_signal()).await?;
        }
        Commands::Scheduler { fire, once } => {
            let mut scheduler = service.scheduler()?;
            if let Some(name) = fire {
                match scheduler.fire(&name, Local::now())? {
                    Fired::Created(path) => println!("Created {}", path.display()),
                    Fired::Exists(path) => println!("Already exists: {}", path.display()),
                }
            } else if once {
                let report = scheduler.tick(Local::now());
                println!(
                    "Fired {} trigger(s), announced {} inbox drop(s), checked {} supervision(s)",
                    report.fired.len(),
                    report.dropped.len(),
                    report.checks.len()
                );
            } else if !service.config().scheduler.enabled {
                bail!("Scheduler is disabled in configuration");
            } else {
                scheduler.run(shutdown_signal()).await;
            }
        }
        Commands::Sync { once } => {
            let sync = service.sync();
            if once {
                let report = sync.pass().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if !service.config().sync.enabled {
                bail!("Sync is disabled in configuration");
            } else {
                sync.run(shutdown_signal()).await;
            }
        }
        Commands::Token { subject } => {
            let Some(auth) = service.auth() else {
                bail!("No JWT secret configured (set auth.jwt_secret or VAULT_JWT_SECRET)");
            };
            println!("{}", auth.generate_token(&subject, vec!["reviewer".into()])?);
        }
        Commands::Reconcile => {
            let report = service.lifecycle(service.config().zone()).reconcile()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Watch channel flipped to true on Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        tracing::info!("Shutdown requested, finishing current pass");
        let _ = tx.send(true);
    });
    rx
}
