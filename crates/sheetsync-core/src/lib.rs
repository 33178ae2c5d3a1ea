//! Core catalog model for sheetsync: persisted rows and the records parsed out of an artifact.
//!
//! Identifiers are assigned by whoever publishes the spreadsheet and are stored verbatim;
//! nothing in the pipeline generates them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "sheetsync-core";

/// Persisted `criminal_category` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted `city` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct City {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted `neighborhood` row. Always belongs to one [`City`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighborhood {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub city_id: i64,
}

/// Persisted `store` row, the only entity with an update path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub vote: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub full_vote: bool,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub category_id: i64,
    pub neighborhood_id: i64,
}

/// Incoming `category` sheet row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub id: i64,
    pub title: String,
}

/// Incoming `city` sheet row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityRecord {
    pub id: i64,
    pub name: String,
}

/// Incoming `neighborhood` sheet row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborhoodRecord {
    pub id: i64,
    pub name: String,
    pub city_id: i64,
}

/// Incoming `store` sheet row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub vote: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub full_vote: bool,
    pub comment: Option<String>,
    pub category_id: i64,
    pub neighborhood_id: i64,
}

/// Every record family of one artifact, in sheet order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecords {
    pub categories: Vec<CategoryRecord>,
    pub cities: Vec<CityRecord>,
    pub neighborhoods: Vec<NeighborhoodRecord>,
    pub stores: Vec<StoreRecord>,
}

/// Existence key for append-only families: `(id, label)` or `(id, label, parent)`.
pub trait NaturalKey {
    type Key: Eq + std::hash::Hash + Clone;

    fn natural_key(&self) -> Self::Key;
}

impl NaturalKey for CategoryRecord {
    type Key = (i64, String);

    fn natural_key(&self) -> Self::Key {
        (self.id, self.title.clone())
    }
}

impl NaturalKey for CityRecord {
    type Key = (i64, String);

    fn natural_key(&self) -> Self::Key {
        (self.id, self.name.clone())
    }
}

impl NaturalKey for NeighborhoodRecord {
    type Key = (i64, String, i64);

    fn natural_key(&self) -> Self::Key {
        (self.id, self.name.clone(), self.city_id)
    }
}

impl NaturalKey for StoreRecord {
    type Key = (i64, String);

    fn natural_key(&self) -> Self::Key {
        (self.id, self.name.clone())
    }
}

impl StoreRecord {
    /// True when any field a sync is allowed to overwrite differs from `existing`.
    pub fn differs_from(&self, existing: &Store) -> bool {
        self.address != existing.address
            || self.vote != existing.vote
            || self.latitude != existing.latitude
            || self.longitude != existing.longitude
            || self.full_vote != existing.full_vote
            || self.comment != existing.comment
            || self.category_id != existing.category_id
            || self.neighborhood_id != existing.neighborhood_id
    }

    pub fn into_row(self, now: DateTime<Utc>) -> Store {
        Store {
            id: self.id,
            name: self.name,
            address: self.address,
            vote: self.vote,
            latitude: self.latitude,
            longitude: self.longitude,
            full_vote: self.full_vote,
            comment: self.comment,
            created_at: now,
            updated_at: Some(now),
            category_id: self.category_id,
            neighborhood_id: self.neighborhood_id,
        }
    }
}
