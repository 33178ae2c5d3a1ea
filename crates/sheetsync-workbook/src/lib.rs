//! Spreadsheet artifact reader: named sheets become tables of field -> [`Cell`] rows.
//!
//! [`Workbook::open`] only knows about sheets and cells. Turning rows into catalog
//! records happens in [`records`], which is also where the fixed table and column
//! names live.

pub mod records;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use thiserror::Error;

pub use records::{load_records, parse_records};

pub const CRATE_NAME: &str = "sheetsync-workbook";

#[derive(Debug, Error)]
pub enum WorkbookError {
    #[error("cannot open workbook {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: calamine::Error,
    },
    #[error("cannot read sheet `{table}`: {source}")]
    Sheet {
        table: String,
        source: calamine::Error,
    },
    #[error("missing table `{0}`")]
    MissingTable(String),
    #[error("table `{table}` has no `{column}` column")]
    MissingColumn { table: String, column: String },
    #[error("table `{table}` row {row} column `{column}`: {reason}")]
    InvalidCell {
        table: String,
        row: usize,
        column: String,
        reason: String,
    },
}

/// A single scalar as read from the sheet.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Error(String),
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        matches!(self, Cell::Empty)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Empty => f.write_str("<empty>"),
            Cell::Int(v) => write!(f, "{v}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Text(v) => write!(f, "{v:?}"),
            Cell::Bool(v) => write!(f, "{v}"),
            Cell::Error(v) => write!(f, "#{v}"),
        }
    }
}

impl From<&Data> for Cell {
    fn from(data: &Data) -> Self {
        match data {
            Data::Empty => Cell::Empty,
            Data::Int(v) => Cell::Int(*v),
            Data::Float(v) => Cell::Float(*v),
            Data::String(s) if s.trim().is_empty() => Cell::Empty,
            Data::String(s) => Cell::Text(s.clone()),
            Data::Bool(v) => Cell::Bool(*v),
            Data::DateTime(v) => Cell::Float(v.as_f64()),
            Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
            Data::Error(e) => Cell::Error(e.to_string()),
        }
    }
}

/// One data row; `number` is the 1-based spreadsheet row it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub number: usize,
    pub fields: BTreeMap<String, Cell>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.fields.get(column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetTable {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl SheetTable {
    /// Builds a table from a header and positional rows. Blank rows are dropped.
    pub fn new(name: impl Into<String>, columns: &[&str], rows: Vec<Vec<Cell>>) -> Self {
        let columns: Vec<Option<String>> = columns
            .iter()
            .map(|c| Some(c.trim().to_string()).filter(|c| !c.is_empty()))
            .collect();
        Self::from_positional(name.into(), columns, rows, 2)
    }

    fn from_positional(
        name: String,
        columns: Vec<Option<String>>,
        rows: Vec<Vec<Cell>>,
        first_row_number: usize,
    ) -> Self {
        let rows = rows
            .into_iter()
            .enumerate()
            .filter(|(_, cells)| cells.iter().any(|c| !c.is_empty()))
            .map(|(idx, cells)| {
                let fields = columns
                    .iter()
                    .enumerate()
                    .filter_map(|(col, header)| {
                        let header = header.as_ref()?;
                        let cell = cells.get(col).cloned().unwrap_or(Cell::Empty);
                        Some((header.clone(), cell))
                    })
                    .collect();
                Row {
                    number: first_row_number + idx,
                    fields,
                }
            })
            .collect();

        Self {
            name,
            columns: columns.into_iter().flatten().collect(),
            rows,
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn require_columns(&self, required: &[&str]) -> Result<(), WorkbookError> {
        match required.iter().find(|c| !self.has_column(c)) {
            Some(missing) => Err(WorkbookError::MissingColumn {
                table: self.name.clone(),
                column: (*missing).to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Every sheet of an artifact, keyed by trimmed sheet name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workbook {
    tables: BTreeMap<String, SheetTable>,
}

impl Workbook {
    pub fn from_tables(tables: impl IntoIterator<Item = SheetTable>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    /// Reads every sheet of an `.xlsx`/`.xls`/`.ods` file.
    /// The first row of each sheet is its header.
    pub fn open(path: &Path) -> Result<Self, WorkbookError> {
        let mut sheets = open_workbook_auto(path).map_err(|source| WorkbookError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let mut tables = BTreeMap::new();
        for sheet_name in sheets.sheet_names() {
            let range = sheets
                .worksheet_range(&sheet_name)
                .map_err(|source| WorkbookError::Sheet {
                    table: sheet_name.clone(),
                    source,
                })?;
            let name = sheet_name.trim().to_string();
            let start_row = range.start().map(|(row, _)| row as usize + 1).unwrap_or(1);

            let mut rows = range.rows();
            let columns = rows
                .next()
                .map(|header| header.iter().map(header_name).collect())
                .unwrap_or_default();
            let body = rows
                .map(|cells| cells.iter().map(Cell::from).collect())
                .collect();

            let table = SheetTable::from_positional(name.clone(), columns, body, start_row + 1);
            tables.insert(name, table);
        }

        Ok(Self { tables })
    }

    pub fn table(&self, name: &str) -> Result<&SheetTable, WorkbookError> {
        self.tables
            .get(name)
            .ok_or_else(|| WorkbookError::MissingTable(name.to_string()))
    }
}

fn header_name(data: &Data) -> Option<String> {
    let text = match data {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => return None,
        other => other.to_string().trim().to_string(),
    };
    (!text.is_empty()).then_some(text)
}
