//! Column transforms used by the preprocessing step: empty-column removal,
//! label encoding, standard scaling and null imputation.

use std::collections::HashMap;

use crate::error::{PipelineError, StepResult};
use crate::table::{Column, ColumnData, Table};

/// Names of columns with no non-null cells.
pub fn empty_columns(table: &Table) -> Vec<String> {
    table
        .columns()
        .iter()
        .filter(|c| c.null_count() == table.n_rows())
        .map(|c| c.name.clone())
        .collect()
}

/// Ordered class values and their assigned codes.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMapping {
    pub classes: Vec<String>,
}

impl LabelMapping {
    pub fn describe(&self) -> String {
        self.classes
            .iter()
            .enumerate()
            .map(|(code, class)| format!("{class} -> {code}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Replace a column's values with integer codes assigned in ascending value
/// order. Nulls stay null.
pub fn label_encode(column: &mut Column) -> LabelMapping {
    let (codes, classes): (Vec<Option<f64>>, Vec<String>) = match &column.data {
        ColumnData::Text(values) => {
            let mut classes: Vec<&String> = values.iter().flatten().collect();
            classes.sort();
            classes.dedup();
            let lookup: HashMap<&String, usize> =
                classes.iter().enumerate().map(|(i, c)| (*c, i)).collect();
            let codes = values
                .iter()
                .map(|v| v.as_ref().map(|v| lookup[v] as f64))
                .collect();
            (codes, classes.into_iter().cloned().collect())
        }
        ColumnData::Numeric(values) => {
            let mut classes: Vec<f64> = values.iter().flatten().copied().collect();
            classes.sort_by(f64::total_cmp);
            classes.dedup();
            let codes = values
                .iter()
                .map(|v| {
                    (*v).and_then(|v| classes.iter().position(|c| *c == v))
                        .map(|code| code as f64)
                })
                .collect();
            (codes, classes.iter().map(|c| c.to_string()).collect())
        }
    };
    column.data = ColumnData::Numeric(codes);
    LabelMapping { classes }
}

/// Fitted scaling parameters of one column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnScale {
    pub mean: f64,
    pub std: f64,
}

/// Standardize a numeric column in place using population statistics of its
/// non-null cells. A zero-variance column is centred but not rescaled.
pub fn standardize(column: &mut Column) -> StepResult<ColumnScale> {
    let ColumnData::Numeric(values) = &mut column.data else {
        return Err(PipelineError::Schema(format!(
            "column '{}' is not numeric and cannot be standardized",
            column.name
        )));
    };
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        return Err(PipelineError::Compute(format!(
            "column '{}' has no values to standardize",
            column.name
        )));
    }
    if let Some(bad) = present.iter().find(|v| !v.is_finite()) {
        return Err(PipelineError::Compute(format!(
            "column '{}' contains a non-finite value ({bad})",
            column.name
        )));
    }
    let n = present.len() as f64;
    let mean = present.iter().sum::<f64>() / n;
    let variance = present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    if !mean.is_finite() || !std.is_finite() {
        return Err(PipelineError::Compute(format!(
            "column '{}' overflows while standardizing",
            column.name
        )));
    }
    let scale = if std > 0.0 { std } else { 1.0 };
    for value in values.iter_mut().flatten() {
        *value = (*value - mean) / scale;
    }
    Ok(ColumnScale { mean, std })
}

pub fn mean(values: &[Option<f64>]) -> Option<f64> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        None
    } else {
        Some(present.iter().sum::<f64>() / present.len() as f64)
    }
}

/// Most frequent value; the first one encountered wins a tie.
pub fn mode<T: PartialEq + Clone>(values: &[Option<T>]) -> Option<T> {
    let mut counts: Vec<(T, usize)> = Vec::new();
    for value in values.iter().flatten() {
        match counts.iter_mut().find(|(seen, _)| seen == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((value.clone(), 1)),
        }
    }
    let best = counts.iter().map(|(_, count)| *count).max()?;
    counts
        .into_iter()
        .find(|(_, count)| *count == best)
        .map(|(value, _)| value)
}

/// How a column's nulls were filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImputeStrategy {
    Mean,
    Mode,
}

/// Fill nulls column by column: numeric columns with their mean, text
/// columns (and the columns listed in `categorical`) with their mode.
/// Returns the number of filled cells.
pub fn impute(table: &mut Table, categorical: &[&str]) -> StepResult<usize> {
    let mut filled = 0;
    for column in table.columns_mut() {
        let missing = column.null_count();
        if missing == 0 {
            continue;
        }
        let strategy = match column.data {
            ColumnData::Numeric(_) if !categorical.contains(&column.name.as_str()) => {
                ImputeStrategy::Mean
            }
            _ => ImputeStrategy::Mode,
        };
        fill_column(column, strategy)?;
        filled += missing;
    }
    Ok(filled)
}

/// Fill only the numeric columns with their mean, leaving text columns alone.
pub fn fill_numeric_with_mean(table: &mut Table) -> StepResult<usize> {
    let mut filled = 0;
    for column in table.columns_mut() {
        if matches!(column.data, ColumnData::Numeric(_)) && column.null_count() > 0 {
            filled += column.null_count();
            fill_column(column, ImputeStrategy::Mean)?;
        }
    }
    Ok(filled)
}

fn fill_column(column: &mut Column, strategy: ImputeStrategy) -> StepResult<()> {
    let degenerate = || {
        PipelineError::Compute(format!(
            "column '{}' has no values to impute from",
            column.name
        ))
    };
    match &mut column.data {
        ColumnData::Numeric(values) => {
            let fill = match strategy {
                ImputeStrategy::Mean => mean(values),
                ImputeStrategy::Mode => mode(values),
            }
            .ok_or_else(degenerate)?;
            for value in values.iter_mut().filter(|v| v.is_none()) {
                *value = Some(fill);
            }
        }
        ColumnData::Text(values) => {
            let fill = mode(values).ok_or_else(degenerate)?;
            for value in values.iter_mut().filter(|v| v.is_none()) {
                *value = Some(fill.clone());
            }
        }
    }
    Ok(())
}
