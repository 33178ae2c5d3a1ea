//! Typed catalog records out of the four fixed tables.

use std::path::Path;

use sheetsync_core::{ArtifactRecords, CategoryRecord, CityRecord, NeighborhoodRecord, StoreRecord};

use crate::{Cell, Row, SheetTable, Workbook, WorkbookError};

pub const CATEGORY_TABLE: &str = "category";
pub const CITY_TABLE: &str = "city";
pub const NEIGHBORHOOD_TABLE: &str = "neighborhood";
pub const STORE_TABLE: &str = "store";

const CATEGORY_COLUMNS: &[&str] = &["id", "title"];
const CITY_COLUMNS: &[&str] = &["id", "name"];
const NEIGHBORHOOD_COLUMNS: &[&str] = &["id", "name", "city_id"];
const STORE_COLUMNS: &[&str] = &[
    "id",
    "name",
    "address",
    "vote",
    "full_vote",
    "criminal_category_id",
    "neighborhood_id",
];

static EMPTY_CELL: Cell = Cell::Empty;

/// Opens `path` and parses all four families. Any failure means nothing usable was read.
pub fn load_records(path: &Path) -> Result<ArtifactRecords, WorkbookError> {
    parse_records(&Workbook::open(path)?)
}

pub fn parse_records(workbook: &Workbook) -> Result<ArtifactRecords, WorkbookError> {
    let categories = parse_table(workbook, CATEGORY_TABLE, CATEGORY_COLUMNS, |r| {
        Ok(CategoryRecord {
            id: r.id("id")?,
            title: r.text("title")?,
        })
    })?;
    let cities = parse_table(workbook, CITY_TABLE, CITY_COLUMNS, |r| {
        Ok(CityRecord {
            id: r.id("id")?,
            name: r.text("name")?,
        })
    })?;
    let neighborhoods = parse_table(workbook, NEIGHBORHOOD_TABLE, NEIGHBORHOOD_COLUMNS, |r| {
        Ok(NeighborhoodRecord {
            id: r.id("id")?,
            name: r.text("name")?,
            city_id: r.id("city_id")?,
        })
    })?;
    let stores = parse_table(workbook, STORE_TABLE, STORE_COLUMNS, |r| {
        Ok(StoreRecord {
            id: r.id("id")?,
            name: r.text("name")?,
            address: r.text("address")?,
            vote: r.number("vote")?,
            latitude: r.optional_number("latitude")?,
            longitude: r.optional_number("longitude")?,
            full_vote: r.flag("full_vote")?,
            comment: r.optional_text("comment"),
            category_id: r.id("criminal_category_id")?,
            neighborhood_id: r.id("neighborhood_id")?,
        })
    })?;

    Ok(ArtifactRecords {
        categories,
        cities,
        neighborhoods,
        stores,
    })
}

fn parse_table<T>(
    workbook: &Workbook,
    name: &str,
    required: &[&str],
    parse_row: impl Fn(&RowReader<'_>) -> Result<T, WorkbookError>,
) -> Result<Vec<T>, WorkbookError> {
    let table = workbook.table(name)?;
    table.require_columns(required)?;
    table
        .rows
        .iter()
        .map(|row| parse_row(&RowReader { table, row }))
        .collect()
}

struct RowReader<'a> {
    table: &'a SheetTable,
    row: &'a Row,
}

impl RowReader<'_> {
    fn cell(&self, column: &str) -> &Cell {
        self.row.get(column).unwrap_or(&EMPTY_CELL)
    }

    fn invalid(&self, column: &str, reason: impl Into<String>) -> WorkbookError {
        WorkbookError::InvalidCell {
            table: self.table.name.clone(),
            row: self.row.number,
            column: column.to_string(),
            reason: reason.into(),
        }
    }

    fn id(&self, column: &str) -> Result<i64, WorkbookError> {
        match self.cell(column) {
            Cell::Int(v) => Ok(*v),
            Cell::Float(v) => integral(*v)
                .ok_or_else(|| self.invalid(column, format!("{v} is not an integer id"))),
            Cell::Text(s) => s
                .trim()
                .parse::<i64>()
                .ok()
                .or_else(|| s.trim().parse::<f64>().ok().and_then(integral))
                .ok_or_else(|| self.invalid(column, format!("{s:?} is not an integer id"))),
            other => Err(self.invalid(column, format!("expected an integer id, found {other}"))),
        }
    }

    fn number(&self, column: &str) -> Result<f64, WorkbookError> {
        self.optional_number(column)?
            .ok_or_else(|| self.invalid(column, "value is required"))
    }

    fn optional_number(&self, column: &str) -> Result<Option<f64>, WorkbookError> {
        match self.cell(column) {
            Cell::Empty => Ok(None),
            Cell::Int(v) => Ok(Some(*v as f64)),
            Cell::Float(v) if v.is_finite() => Ok(Some(*v)),
            Cell::Text(s) => s
                .trim()
                .replace(',', ".")
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Some)
                .ok_or_else(|| self.invalid(column, format!("{s:?} is not a number"))),
            other => Err(self.invalid(column, format!("expected a number, found {other}"))),
        }
    }

    fn text(&self, column: &str) -> Result<String, WorkbookError> {
        self.optional_text(column)
            .ok_or_else(|| self.invalid(column, "value is required"))
    }

    fn optional_text(&self, column: &str) -> Option<String> {
        match self.cell(column) {
            Cell::Empty | Cell::Error(_) => None,
            Cell::Text(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Cell::Int(v) => Some(v.to_string()),
            Cell::Float(v) => Some(
                integral(*v)
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| v.to_string()),
            ),
            Cell::Bool(v) => Some(v.to_string()),
        }
    }

    fn flag(&self, column: &str) -> Result<bool, WorkbookError> {
        match self.cell(column) {
            Cell::Empty => Ok(false),
            Cell::Bool(v) => Ok(*v),
            Cell::Int(0) => Ok(false),
            Cell::Int(1) => Ok(true),
            Cell::Float(v) if *v == 0.0 => Ok(false),
            Cell::Float(v) if *v == 1.0 => Ok(true),
            Cell::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                _ => Err(self.invalid(column, format!("{s:?} is not a boolean"))),
            },
            other => Err(self.invalid(column, format!("expected a boolean, found {other}"))),
        }
    }
}

fn integral(v: f64) -> Option<i64> {
    (v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64).then_some(v as i64)
}
