use std::path::Path;

use tracing::info;

use super::{LOAD_DATA, Step, StepReport};
use crate::artifact::{ArtifactKind, ArtifactRef, write_table};
use crate::error::StepResult;
use crate::table::{Table, format_dtypes, format_null_counts};

const PREVIEW_ROWS: usize = 3;

/// Read the source CSV, log a profile of it and persist it unchanged.
pub fn load(input: &Path, output: &Path) -> StepResult<Table> {
    info!("Loading data from {}", input.display());
    let table = Table::from_csv_path(input)?;

    let (rows, cols) = table.shape();
    info!("Data shape: ({rows}, {cols})");
    info!("Null values per column:\n{}", format_null_counts(&table));
    info!("Column types:\n{}", format_dtypes(&table));
    info!("First {PREVIEW_ROWS} rows:\n{}", table.preview(PREVIEW_ROWS));

    write_table(output, ArtifactKind::LoadedTable, &table)?;
    info!("Data saved to {}", output.display());
    Ok(table)
}

pub struct LoadStep {
    pub source: ArtifactRef,
    pub output: ArtifactRef,
}

impl Step for LoadStep {
    fn id(&self) -> &'static str {
        LOAD_DATA
    }

    fn inputs(&self) -> Vec<ArtifactRef> {
        vec![self.source.clone()]
    }

    fn outputs(&self) -> Vec<ArtifactRef> {
        vec![self.output.clone()]
    }

    fn execute(&self) -> StepResult<StepReport> {
        let table = load(&self.source.path, &self.output.path)?;
        let (rows, cols) = table.shape();
        Ok(StepReport {
            step: LOAD_DATA,
            summary: format!("loaded {rows} rows x {cols} columns"),
        })
    }
}
