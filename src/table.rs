use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, StepResult};

const NULL_MARKERS: &[&str] = &["", "NA", "N/A", "NaN", "nan", "null", "NULL", "None"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Numeric,
    Text,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric => f.write_str("numeric"),
            Self::Text => f.write_str("text"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    Numeric(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(values) => values.len(),
            Self::Text(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Numeric(_) => ColumnType::Numeric,
            Self::Text(_) => ColumnType::Text,
        }
    }

    pub fn null_count(&self) -> usize {
        match self {
            Self::Numeric(values) => values.iter().filter(|v| v.is_none()).count(),
            Self::Text(values) => values.iter().filter(|v| v.is_none()).count(),
        }
    }

    fn select(&self, rows: &[usize]) -> Self {
        match self {
            Self::Numeric(values) => Self::Numeric(rows.iter().map(|&r| values[r]).collect()),
            Self::Text(values) => Self::Text(rows.iter().map(|&r| values[r].clone()).collect()),
        }
    }

    fn render(&self, row: usize) -> String {
        match self {
            Self::Numeric(values) => values[row]
                .map(|v| format!("{v}"))
                .unwrap_or_else(|| "NaN".to_string()),
            Self::Text(values) => values[row].clone().unwrap_or_else(|| "NaN".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn numeric(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Numeric(values),
        }
    }

    pub fn text(name: impl Into<String>, values: Vec<Option<String>>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Text(values),
        }
    }

    pub fn null_count(&self) -> usize {
        self.data.null_count()
    }
}

/// Column-oriented table with nullable cells.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<Column>,
    rows: usize,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> StepResult<Self> {
        let rows = columns.first().map(|c| c.data.len()).unwrap_or(0);
        let mut seen = HashSet::new();
        for column in &columns {
            if column.data.len() != rows {
                return Err(PipelineError::Schema(format!(
                    "column '{}' has {} rows, expected {}",
                    column.name,
                    column.data.len(),
                    rows
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(PipelineError::Schema(format!(
                    "duplicate column '{}'",
                    column.name
                )));
            }
        }
        Ok(Self { columns, rows })
    }

    pub fn from_csv_path(path: &Path) -> StepResult<Self> {
        let file = File::open(path).map_err(|err| PipelineError::io(path, err))?;
        Self::from_csv_reader(file, path)
    }

    /// Parse a header-first CSV. `origin` is only used for error messages.
    pub fn from_csv_reader<R: Read>(reader: R, origin: &Path) -> StepResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(reader);
        let headers: Vec<String> = reader
            .headers()
            .map_err(|err| PipelineError::parse(origin, err.to_string()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
            return Err(PipelineError::parse(origin, "missing header row"));
        }
        if let Some(idx) = headers.iter().position(|h| h.is_empty()) {
            return Err(PipelineError::parse(
                origin,
                format!("header column {} has no name", idx + 1),
            ));
        }

        let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); headers.len()];
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|err| PipelineError::parse(origin, err.to_string()))?;
            if record.len() != headers.len() {
                return Err(PipelineError::parse(
                    origin,
                    format!(
                        "row {} has {} fields, header has {}",
                        line + 1,
                        record.len(),
                        headers.len()
                    ),
                ));
            }
            for (idx, field) in record.iter().enumerate() {
                cells[idx].push(parse_cell(field));
            }
        }

        let columns = headers
            .into_iter()
            .zip(cells)
            .map(|(name, values)| infer_column(name, values))
            .collect();
        Self::new(columns).map_err(|err| PipelineError::parse(origin, err.to_string()))
    }

    pub fn n_rows(&self) -> usize {
        self.rows
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.columns.len())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn columns_mut(&mut self) -> impl Iterator<Item = &mut Column> {
        self.columns.iter_mut()
    }

    /// Remove the named columns, returning how many were present.
    pub fn drop_columns(&mut self, names: &[String]) -> usize {
        let before = self.columns.len();
        self.columns.retain(|c| !names.contains(&c.name));
        before - self.columns.len()
    }

    pub fn null_counts(&self) -> Vec<(String, usize)> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.null_count()))
            .collect()
    }

    pub fn total_nulls(&self) -> usize {
        self.columns.iter().map(Column::null_count).sum()
    }

    pub fn dtypes(&self) -> Vec<(String, ColumnType)> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.data.column_type()))
            .collect()
    }

    /// Keep only the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    data: c.data.select(rows),
                })
                .collect(),
            rows: rows.len(),
        }
    }

    /// Plain-text rendering of the first `n` rows, one line per row.
    pub fn preview(&self, n: usize) -> String {
        let shown = n.min(self.rows);
        let mut grid: Vec<Vec<String>> = Vec::with_capacity(shown + 1);
        let mut header = vec![String::new()];
        header.extend(self.columns.iter().map(|c| c.name.clone()));
        grid.push(header);
        for row in 0..shown {
            let mut line = vec![row.to_string()];
            line.extend(self.columns.iter().map(|c| c.data.render(row)));
            grid.push(line);
        }

        let widths: Vec<usize> = (0..=self.columns.len())
            .map(|col| grid.iter().map(|line| line[col].len()).max().unwrap_or(0))
            .collect();
        grid.iter()
            .map(|line| {
                line.iter()
                    .zip(&widths)
                    .map(|(cell, &width)| format!("{cell:>width$}"))
                    .collect::<Vec<_>>()
                    .join("  ")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn parse_cell(field: &str) -> Option<String> {
    if NULL_MARKERS.contains(&field.trim()) {
        None
    } else {
        Some(field.to_string())
    }
}

fn infer_column(name: String, values: Vec<Option<String>>) -> Column {
    let parsed: Option<Vec<Option<f64>>> = values
        .iter()
        .map(|cell| match cell {
            None => Some(None),
            // Any spelling of NaN is a missing value; infinities are kept.
            Some(text) => text
                .trim()
                .parse::<f64>()
                .ok()
                .map(|v| if v.is_nan() { None } else { Some(v) }),
        })
        .collect();
    match parsed {
        Some(numbers) => Column::numeric(name, numbers),
        None => Column::text(name, values),
    }
}

pub fn format_null_counts(table: &Table) -> String {
    table
        .null_counts()
        .into_iter()
        .map(|(name, count)| format!("{name}: {count}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_dtypes(table: &Table) -> String {
    table
        .dtypes()
        .into_iter()
        .map(|(name, ty)| format!("{name}: {ty}"))
        .collect::<Vec<_>>()
        .join("\n")
}
