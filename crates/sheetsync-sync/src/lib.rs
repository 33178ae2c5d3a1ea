//! Pipeline wiring: configuration, catalog database, reconciliation and the polling loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod config;
pub mod db;
pub mod reconcile;
pub mod scheduler;

pub use config::{ConfigError, SyncConfig};
pub use db::CatalogDb;
pub use reconcile::{ReconcileError, ReconcileSummary, Reconciler};
pub use scheduler::{ChangeHandler, FetchScheduler};

pub const CRATE_NAME: &str = "sheetsync-sync";

pub struct SyncPipeline {
    config: SyncConfig,
    reconciler: Arc<Reconciler>,
    scheduler: Arc<FetchScheduler>,
}

impl SyncPipeline {
    /// Opens the catalog database and makes sure the schema exists.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let db = CatalogDb::connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        db.ensure_schema().await.context("creating catalog schema")?;

        let scheduler = FetchScheduler::from_config(&config)?;
        let reconciler = Reconciler::new(db, &config.artifact_path);
        Ok(Self {
            config,
            reconciler: Arc::new(reconciler),
            scheduler: Arc::new(scheduler),
        })
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn scheduler(&self) -> &FetchScheduler {
        &self.scheduler
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.scheduler.cancellation_token()
    }

    /// Downloads once; reconciles only if the artifact changed.
    pub async fn fetch_once(&self) -> Result<Option<ReconcileSummary>> {
        if !self.scheduler.fetch_once().await? {
            info!("artifact unchanged");
            return Ok(None);
        }
        Ok(Some(self.reconciler.reconcile().await?))
    }

    pub async fn reconcile_once(&self) -> Result<ReconcileSummary> {
        Ok(self.reconciler.reconcile().await?)
    }

    /// Reconciles the copy already on disk (when enabled), then polls until cancelled.
    pub async fn run(&self) -> Result<()> {
        if self.config.reconcile_on_startup {
            self.reconcile_existing().await;
        }
        let handler: Arc<dyn ChangeHandler> = self.reconciler.clone();
        self.scheduler.run_periodic(handler).await;
        Ok(())
    }

    async fn reconcile_existing(&self) {
        if !self.scheduler.artifact().exists().await {
            info!(
                path = %self.reconciler.artifact_path().display(),
                "no local artifact yet; waiting for first download"
            );
            return;
        }
        match self.reconciler.reconcile().await {
            Ok(summary) => info!(
                writes = summary.total_writes(),
                "startup reconciliation finished"
            ),
            Err(err) => warn!(error = %err, "startup reconciliation failed"),
        }
    }
}
