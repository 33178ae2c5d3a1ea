//! SQLite catalog tables and the queries the reconciler runs against them.
//!
//! Table and column names match what the read-only query side expects
//! (`criminal_category`, `store.criminal_category_id`, ...). Identifiers are always
//! bound explicitly on insert.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sheetsync_core::{Category, City, Neighborhood, Store, StoreRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::info;

/// Rows per multi-row INSERT. Store batches bind 12 values per row, well under SQLite's limit.
const INSERT_CHUNK: usize = 500;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS criminal_category (
        id INTEGER PRIMARY KEY,
        title TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS city (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS neighborhood (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL,
        city_id INTEGER NOT NULL REFERENCES city(id)
    )",
    "CREATE TABLE IF NOT EXISTS store (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        address TEXT NOT NULL,
        vote REAL NOT NULL,
        latitude REAL,
        longitude REAL,
        full_vote BOOLEAN,
        comment TEXT,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP,
        criminal_category_id INTEGER NOT NULL REFERENCES criminal_category(id),
        neighborhood_id INTEGER NOT NULL REFERENCES neighborhood(id)
    )",
];

#[derive(Debug, Clone)]
pub struct CatalogDb {
    pool: SqlitePool,
}

impl CatalogDb {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the four catalog tables when absent. Existing tables are left alone.
    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("catalog schema ready");
        Ok(())
    }

    pub async fn categories(&self) -> Result<Vec<Category>, sqlx::Error> {
        let rows = sqlx::query("SELECT id, title, created_at FROM criminal_category ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Category {
                    id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    pub async fn cities(&self) -> Result<Vec<City>, sqlx::Error> {
        let rows = sqlx::query("SELECT id, name, created_at FROM city ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(City {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    pub async fn neighborhoods(&self) -> Result<Vec<Neighborhood>, sqlx::Error> {
        let rows =
            sqlx::query("SELECT id, name, created_at, city_id FROM neighborhood ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| {
                Ok(Neighborhood {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    created_at: row.try_get("created_at")?,
                    city_id: row.try_get("city_id")?,
                })
            })
            .collect()
    }

    pub async fn stores(&self) -> Result<Vec<Store>, sqlx::Error> {
        let rows = sqlx::query(&format!("{STORE_SELECT} ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(store_from_row).collect()
    }
}

const STORE_SELECT: &str = "SELECT id, name, address, vote, latitude, longitude, full_vote, \
     comment, created_at, updated_at, criminal_category_id, neighborhood_id FROM store";

fn store_from_row(row: &SqliteRow) -> Result<Store, sqlx::Error> {
    Ok(Store {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        vote: row.try_get("vote")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        full_vote: row.try_get::<Option<bool>, _>("full_vote")?.unwrap_or(false),
        comment: row.try_get("comment")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        category_id: row.try_get("criminal_category_id")?,
        neighborhood_id: row.try_get("neighborhood_id")?,
    })
}

// Everything below runs on the reconciliation transaction's connection.

pub(crate) async fn category_keys(
    conn: &mut SqliteConnection,
) -> Result<HashSet<(i64, String)>, sqlx::Error> {
    let rows = sqlx::query("SELECT id, title FROM criminal_category")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| Ok((row.try_get("id")?, row.try_get("title")?)))
        .collect()
}

pub(crate) async fn city_keys(
    conn: &mut SqliteConnection,
) -> Result<HashSet<(i64, String)>, sqlx::Error> {
    let rows = sqlx::query("SELECT id, name FROM city")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| Ok((row.try_get("id")?, row.try_get("name")?)))
        .collect()
}

pub(crate) async fn neighborhood_keys(
    conn: &mut SqliteConnection,
) -> Result<HashSet<(i64, String, i64)>, sqlx::Error> {
    let rows = sqlx::query("SELECT id, name, city_id FROM neighborhood")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| {
            Ok((
                row.try_get("id")?,
                row.try_get("name")?,
                row.try_get("city_id")?,
            ))
        })
        .collect()
}

pub(crate) async fn stores_by_key(
    conn: &mut SqliteConnection,
) -> Result<HashMap<(i64, String), Store>, sqlx::Error> {
    let rows = sqlx::query(STORE_SELECT).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| {
            let store = store_from_row(row)?;
            Ok(((store.id, store.name.clone()), store))
        })
        .collect()
}

pub(crate) async fn insert_categories(
    conn: &mut SqliteConnection,
    rows: &[Category],
) -> Result<(), sqlx::Error> {
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO criminal_category (id, title, created_at) ");
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(row.id)
                .push_bind(row.title.as_str())
                .push_bind(row.created_at);
        });
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

pub(crate) async fn insert_cities(
    conn: &mut SqliteConnection,
    rows: &[City],
) -> Result<(), sqlx::Error> {
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO city (id, name, created_at) ");
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(row.id)
                .push_bind(row.name.as_str())
                .push_bind(row.created_at);
        });
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

pub(crate) async fn insert_neighborhoods(
    conn: &mut SqliteConnection,
    rows: &[Neighborhood],
) -> Result<(), sqlx::Error> {
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO neighborhood (id, name, created_at, city_id) ");
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(row.id)
                .push_bind(row.name.as_str())
                .push_bind(row.created_at)
                .push_bind(row.city_id);
        });
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

pub(crate) async fn insert_stores(
    conn: &mut SqliteConnection,
    rows: &[Store],
) -> Result<(), sqlx::Error> {
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO store (id, name, address, vote, latitude, longitude, full_vote, comment, \
             created_at, updated_at, criminal_category_id, neighborhood_id) ",
        );
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(row.id)
                .push_bind(row.name.as_str())
                .push_bind(row.address.as_str())
                .push_bind(row.vote)
                .push_bind(row.latitude)
                .push_bind(row.longitude)
                .push_bind(row.full_vote)
                .push_bind(row.comment.as_deref())
                .push_bind(row.created_at)
                .push_bind(row.updated_at)
                .push_bind(row.category_id)
                .push_bind(row.neighborhood_id);
        });
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Overwrites the mutable columns of the store identified by `record.id` + `record.name`.
pub(crate) async fn update_store(
    conn: &mut SqliteConnection,
    record: &StoreRecord,
    updated_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE store SET address = ?, vote = ?, latitude = ?, longitude = ?, full_vote = ?, \
         comment = ?, updated_at = ?, criminal_category_id = ?, neighborhood_id = ? \
         WHERE id = ? AND name = ?",
    )
    .bind(record.address.as_str())
    .bind(record.vote)
    .bind(record.latitude)
    .bind(record.longitude)
    .bind(record.full_vote)
    .bind(record.comment.as_deref())
    .bind(updated_at)
    .bind(record.category_id)
    .bind(record.neighborhood_id)
    .bind(record.id)
    .bind(record.name.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_bootstrap_is_repeatable() {
        let db = CatalogDb::in_memory().await.expect("db");
        db.ensure_schema().await.expect("first");
        db.ensure_schema().await.expect("second");
        assert!(db.cities().await.expect("cities").is_empty());
        assert!(db.stores().await.expect("stores").is_empty());
    }

    #[tokio::test]
    async fn explicit_ids_are_kept() {
        let db = CatalogDb::in_memory().await.expect("db");
        db.ensure_schema().await.expect("schema");
        let now = Utc::now();

        let mut conn = db.pool().acquire().await.expect("conn");
        insert_cities(
            &mut conn,
            &[
                City {
                    id: 42,
                    name: "Roma".into(),
                    created_at: now,
                },
                City {
                    id: 7,
                    name: "Napoli".into(),
                    created_at: now,
                },
            ],
        )
        .await
        .expect("insert");
        let keys = city_keys(&mut conn).await.expect("keys");
        drop(conn);

        assert!(keys.contains(&(42, "Roma".to_string())));
        let ids: Vec<i64> = db.cities().await.expect("cities").iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![7, 42]);
    }

    #[tokio::test]
    async fn neighborhood_requires_existing_city() {
        let db = CatalogDb::in_memory().await.expect("db");
        db.ensure_schema().await.expect("schema");

        let mut conn = db.pool().acquire().await.expect("conn");
        let err = insert_neighborhoods(
            &mut conn,
            &[Neighborhood {
                id: 10,
                name: "Trastevere".into(),
                created_at: Utc::now(),
                city_id: 999,
            }],
        )
        .await
        .expect_err("foreign key");
        assert!(matches!(err, sqlx::Error::Database(_)));
    }
}
