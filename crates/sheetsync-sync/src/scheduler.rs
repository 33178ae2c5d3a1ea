//! Periodic fetch loop that hands detected changes to a [`ChangeHandler`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sheetsync_storage::{ArtifactSource, FetchError, HttpArtifactSource, LocalArtifact};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::reconcile::Reconciler;

/// Invoked once per accepted artifact, after it has been swapped into place.
#[async_trait]
pub trait ChangeHandler: Send + Sync + 'static {
    async fn on_changed(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl ChangeHandler for Reconciler {
    async fn on_changed(&self) -> anyhow::Result<()> {
        self.reconcile().await?;
        Ok(())
    }
}

pub struct FetchScheduler {
    source: Arc<dyn ArtifactSource>,
    artifact: LocalArtifact,
    poll_interval: Duration,
    cancel: CancellationToken,
    last_update: Mutex<Option<DateTime<Utc>>>,
}

impl FetchScheduler {
    pub fn new(
        source: Arc<dyn ArtifactSource>,
        artifact_path: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            artifact: LocalArtifact::new(artifact_path),
            poll_interval,
            cancel: CancellationToken::new(),
            last_update: Mutex::new(None),
        }
    }

    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let source = HttpArtifactSource::new(&config.remote_url, config.http_client_config())?;
        Ok(Self::new(
            Arc::new(source),
            &config.artifact_path,
            config.poll_interval,
        ))
    }

    pub fn artifact(&self) -> &LocalArtifact {
        &self.artifact
    }

    /// Token observed between ticks; cancelling it never interrupts a running download or callback.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// When the last changed artifact was accepted by this scheduler.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        *self.last_update.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// One download + compare. `Ok(false)` means the bytes matched the accepted fingerprint;
    /// failures come back as `Err` and leave the accepted artifact untouched.
    pub async fn fetch_once(&self) -> Result<bool, FetchError> {
        let outcome = self.artifact.refresh_from(self.source.as_ref()).await?;
        debug!(
            fingerprint = outcome.fingerprint(),
            changed = outcome.is_changed(),
            "fetch finished"
        );
        if outcome.is_changed() {
            *self.last_update.lock().unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
        }
        Ok(outcome.is_changed())
    }

    /// Fetches immediately, then once per interval until cancelled.
    ///
    /// `on_changed` completes before the next sleep starts, so two reconciliations never overlap.
    pub async fn run_periodic(&self, on_changed: Arc<dyn ChangeHandler>) {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            source = %self.source.describe(),
            path = %self.artifact.path().display(),
            "starting artifact polling"
        );

        while !self.cancel.is_cancelled() {
            self.tick(&on_changed).await;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("artifact polling stopped");
    }

    pub fn spawn(self: Arc<Self>, on_changed: Arc<dyn ChangeHandler>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_periodic(on_changed).await })
    }

    async fn tick(&self, on_changed: &Arc<dyn ChangeHandler>) {
        match self.fetch_once().await {
            Ok(true) => {
                info!("artifact changed, running change handler");
                let handler = Arc::clone(on_changed);
                match tokio::spawn(async move { handler.on_changed().await }).await {
                    Ok(Ok(())) => debug!("change handler finished"),
                    Ok(Err(err)) => error!(error = %format!("{err:#}"), "change handler failed"),
                    Err(join_err) => error!(error = %join_err, "change handler panicked"),
                }
            }
            Ok(false) => debug!("no artifact change"),
            Err(err) => warn!(error = %err, "artifact fetch failed; keeping previous artifact"),
        }
    }
}
