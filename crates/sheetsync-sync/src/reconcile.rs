//! Merges one artifact into the catalog tables under a single transaction.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sheetsync_core::{
    ArtifactRecords, Category, City, NaturalKey, Neighborhood, Store, StoreRecord,
};
use sheetsync_workbook::{load_records, WorkbookError};
use sqlx::SqliteConnection;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::db::{self, CatalogDb};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("artifact not found at {0:?}")]
    ArtifactMissing(PathBuf),
    #[error("artifact could not be parsed: {0}")]
    Parse(#[from] WorkbookError),
    #[error("catalog write failed, transaction rolled back: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("artifact parser task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub inserted_categories: usize,
    pub inserted_cities: usize,
    pub inserted_neighborhoods: usize,
    pub inserted_stores: usize,
    pub updated_stores: usize,
    pub unchanged_stores: usize,
}

impl ReconcileSummary {
    pub fn total_writes(&self) -> usize {
        self.inserted_categories
            + self.inserted_cities
            + self.inserted_neighborhoods
            + self.inserted_stores
            + self.updated_stores
    }
}

/// Converges the catalog tables to the contents of the artifact at `artifact_path`.
///
/// Category, city and neighborhood rows are only ever added. Stores are added or have
/// their mutable columns overwritten. Nothing is deleted.
#[derive(Debug, Clone)]
pub struct Reconciler {
    db: CatalogDb,
    artifact_path: PathBuf,
}

impl Reconciler {
    pub fn new(db: CatalogDb, artifact_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            artifact_path: artifact_path.into(),
        }
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub fn db(&self) -> &CatalogDb {
        &self.db
    }

    /// Parses the local artifact, then merges it. Parsing finishes before any
    /// database work starts, so a malformed artifact never touches the catalog.
    pub async fn reconcile(&self) -> Result<ReconcileSummary, ReconcileError> {
        let path = self.artifact_path.clone();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            error!(path = %path.display(), "artifact file not found");
            return Err(ReconcileError::ArtifactMissing(path));
        }

        info!(path = %path.display(), "loading artifact");
        let records = tokio::task::spawn_blocking(move || load_records(&path))
            .await?
            .map_err(|err| {
                error!(error = %err, "artifact parse failed; catalog left untouched");
                ReconcileError::Parse(err)
            })?;

        self.reconcile_records(&records).await
    }

    pub async fn reconcile_records(
        &self,
        records: &ArtifactRecords,
    ) -> Result<ReconcileSummary, ReconcileError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id);
        async move {
            let now = Utc::now();
            let mut tx = self.db.pool().begin().await?;

            match merge_all(&mut tx, records, now).await {
                Ok(summary) => {
                    tx.commit().await?;
                    info!(
                        inserted_categories = summary.inserted_categories,
                        inserted_cities = summary.inserted_cities,
                        inserted_neighborhoods = summary.inserted_neighborhoods,
                        inserted_stores = summary.inserted_stores,
                        updated_stores = summary.updated_stores,
                        unchanged_stores = summary.unchanged_stores,
                        "catalog reconciliation committed"
                    );
                    Ok(summary)
                }
                Err(err) => {
                    error!(error = %err, "catalog reconciliation failed, rolling back");
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(
                            error = %rollback_err,
                            "explicit rollback failed; dropped transaction will roll back"
                        );
                    }
                    Err(ReconcileError::Persistence(err))
                }
            }
        }
        .instrument(span)
        .await
    }
}

async fn merge_all(
    conn: &mut SqliteConnection,
    records: &ArtifactRecords,
    now: DateTime<Utc>,
) -> Result<ReconcileSummary, sqlx::Error> {
    let mut summary = ReconcileSummary::default();

    let existing = db::category_keys(conn).await?;
    let categories: Vec<Category> = absent(&records.categories, &existing)
        .map(|r| {
            debug!(id = r.id, title = %r.title, "adding new category");
            Category {
                id: r.id,
                title: r.title.clone(),
                created_at: now,
            }
        })
        .collect();
    db::insert_categories(conn, &categories).await?;
    summary.inserted_categories = categories.len();

    let existing = db::city_keys(conn).await?;
    let cities: Vec<City> = absent(&records.cities, &existing)
        .map(|r| {
            debug!(id = r.id, name = %r.name, "adding new city");
            City {
                id: r.id,
                name: r.name.clone(),
                created_at: now,
            }
        })
        .collect();
    db::insert_cities(conn, &cities).await?;
    summary.inserted_cities = cities.len();

    let existing = db::neighborhood_keys(conn).await?;
    let neighborhoods: Vec<Neighborhood> = absent(&records.neighborhoods, &existing)
        .map(|r| {
            debug!(id = r.id, name = %r.name, city_id = r.city_id, "adding new neighborhood");
            Neighborhood {
                id: r.id,
                name: r.name.clone(),
                created_at: now,
                city_id: r.city_id,
            }
        })
        .collect();
    db::insert_neighborhoods(conn, &neighborhoods).await?;
    summary.inserted_neighborhoods = neighborhoods.len();

    merge_stores(conn, &records.stores, now, &mut summary).await?;

    Ok(summary)
}

/// Incoming records whose natural key is neither stored nor repeated earlier in `incoming`.
fn absent<'a, R: NaturalKey>(
    incoming: &'a [R],
    existing: &'a HashSet<R::Key>,
) -> impl Iterator<Item = &'a R> + 'a {
    let mut seen = HashSet::new();
    incoming.iter().filter(move |r| {
        let key = r.natural_key();
        !existing.contains(&key) && seen.insert(key)
    })
}

async fn merge_stores(
    conn: &mut SqliteConnection,
    incoming: &[StoreRecord],
    now: DateTime<Utc>,
    summary: &mut ReconcileSummary,
) -> Result<(), sqlx::Error> {
    let mut existing = db::stores_by_key(conn).await?;
    let mut staged: Vec<Store> = Vec::new();
    let mut staged_index: HashMap<(i64, String), usize> = HashMap::new();

    for record in incoming {
        let key = record.natural_key();
        if let Some(current) = existing.get_mut(&key) {
            if record.differs_from(current) {
                db::update_store(conn, record, now).await?;
                *current = Store {
                    created_at: current.created_at,
                    ..record.clone().into_row(now)
                };
                summary.updated_stores += 1;
            } else {
                summary.unchanged_stores += 1;
            }
        } else if let Some(&idx) = staged_index.get(&key) {
            // repeated within this artifact: the later row wins
            staged[idx] = record.clone().into_row(now);
        } else {
            staged_index.insert(key, staged.len());
            staged.push(record.clone().into_row(now));
        }
    }

    if summary.updated_stores > 0 {
        info!(count = summary.updated_stores, "updated existing stores");
    }
    if !staged.is_empty() {
        info!(count = staged.len(), "adding new stores");
        db::insert_stores(conn, &staged).await?;
    }
    summary.inserted_stores = staged.len();
    Ok(())
}
