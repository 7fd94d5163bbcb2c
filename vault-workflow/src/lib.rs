//! Vault Workflow - task-lifecycle engine for a shared vault of records.
//!
//! This crate provides:
//! - The record store and atomic claim coordinator
//! - The approval state machine and its audit trail
//! - Retry, circuit breaking and time limits for external calls
//! - Kind registries for draft generators and terminal executors
//! - Worker loops for the cloud and local zones
//! - The polling change feed and WebSocket fan-out
//! - Trigger scheduling, inbox intake and bounded supervision
//! - Git synchronisation between hosts
//! - The approval dashboard HTTP API

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod auth;
pub mod claim;
pub mod executor;
pub mod feed;
pub mod filter;
pub mod generator;
pub mod inbox;
pub mod lifecycle;
pub mod record;
pub mod resilience;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod sync;
pub mod worker;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use vault_common::{AuditLedger, Config, WorkZone};

pub use auth::{AuthState, Claims};
pub use claim::{claim, Claim};
pub use executor::{ExecutionReport, Executor, ExecutorRegistry};
pub use feed::{Broadcaster, ChangeAction, ChangeFeed, FeedEvent};
pub use filter::SenderFilter;
pub use generator::{DraftGenerator, GeneratorRegistry};
pub use inbox::InboxScanner;
pub use lifecycle::{Lifecycle, ReconcileReport};
pub use record::{Header, Record};
pub use resilience::{CircuitBreaker, CircuitState, Resilience, RetryPolicy};
pub use routes::{build_routes, ApiResponse, DashboardState};
pub use scheduler::{Fired, Scheduler};
pub use state::{Kind, Layout, State};
pub use store::{ListOrder, Vault};
pub use supervisor::Supervisor;
pub use sync::GitSync;
pub use worker::{PassReport, Worker};

const MAX_BODY_BYTES: usize = 1024 * 1024;

// ============================================================================
// Vault Service
// ============================================================================

/// Composition root: builds every component from one configuration.
pub struct VaultService {
    config: Config,
    vault: Vault,
    ledger: Arc<AuditLedger>,
    resilience: Arc<Resilience>,
}

impl VaultService {
    /// Open the vault named by `config`, creating its layout if needed.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let root = config.vault_root();
        let vault = Vault::open(&root).with_context(|| format!("opening vault at {}", root.display()))?;
        let ledger = Arc::new(AuditLedger::open(vault.layout().logs_dir())?);
        let resilience = Arc::new(Resilience::from_config(&config.resilience));
        Ok(Self {
            config,
            vault,
            ledger,
            resilience,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn ledger(&self) -> Arc<AuditLedger> {
        Arc::clone(&self.ledger)
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.config.resilience.call_timeout_secs)
    }

    pub fn lifecycle(&self, zone: WorkZone) -> Lifecycle {
        Lifecycle::new(self.vault.clone(), self.ledger(), zone)
            .with_approval_ttl_hours(self.config.worker.approval_ttl_hours)
    }

    /// Worker for `zone` with its configured or default roles.
    pub fn worker(&self, zone: WorkZone) -> anyhow::Result<Worker> {
        let roles = self
            .config
            .worker
            .roles
            .clone()
            .unwrap_or_else(|| vault_common::WorkerRole::defaults_for(zone));
        let executors = ExecutorRegistry::from_config(
            &self.config.executors,
            self.config.worker.dry_run,
            self.call_timeout(),
        )?;
        if self.config.worker.dry_run {
            tracing::info!("Executors running in dry-run mode");
        }

        Ok(Worker::new(self.lifecycle(zone), Arc::clone(&self.resilience))
            .with_roles(roles)
            .with_filter(SenderFilter::from_config(&self.config.filter))
            .with_generators(GeneratorRegistry::from_config(
                &self.config.generator,
                self.call_timeout(),
            ))
            .with_executors(executors)
            .with_interval(Duration::from_secs(self.config.worker.poll_interval_secs)))
    }

    pub fn scheduler(&self) -> anyhow::Result<Scheduler> {
        let scheduler = Scheduler::new(self.vault.clone(), self.ledger(), &self.config.scheduler.triggers)?;
        Ok(scheduler.with_tick(Duration::from_secs(self.config.scheduler.tick_secs.max(1))))
    }

    pub fn sync(&self) -> GitSync {
        GitSync::new(
            self.vault.root(),
            self.config.sync.clone(),
            Arc::clone(&self.resilience),
            self.ledger(),
        )
    }

    pub fn auth(&self) -> Option<AuthState> {
        AuthState::from_config(&self.config.auth)
    }

    /// Dashboard router bound to `broadcaster`.
    pub fn build_router(&self, broadcaster: Arc<Broadcaster>) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let state = DashboardState::new(
            self.lifecycle(self.config.zone()),
            broadcaster,
            Arc::clone(&self.resilience),
        )
        .with_auth(self.auth());

        build_routes(state)
            .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
            .layer(cors)
    }

    /// Serve the dashboard and run the change feed until shutdown.
    pub async fn run_dashboard(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let broadcaster = Arc::new(Broadcaster::new(self.config.feed.queue_capacity));
        let feed = ChangeFeed::new(self.vault.root())
            .with_interval(Duration::from_millis(self.config.feed.poll_interval_ms));
        let feed_task = tokio::spawn(feed.run(Arc::clone(&broadcaster), shutdown.clone()));

        if self.auth().is_none() {
            tracing::warn!("No JWT secret configured, dashboard API is open");
        }

        let app = self.build_router(broadcaster);
        let addr: SocketAddr = format!("{}:{}", self.config.dashboard.bind, self.config.dashboard.port)
            .parse()
            .context("Invalid dashboard bind address")?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        tracing::info!(address = %addr, "Dashboard listening");

        let mut server_shutdown = shutdown;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*server_shutdown.borrow() {
                    if server_shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .context("Dashboard server error")?;

        if let Err(e) = feed_task.await {
            tracing::warn!(error = %e, "Change feed task ended abnormally");
        }
        Ok(())
    }
}
