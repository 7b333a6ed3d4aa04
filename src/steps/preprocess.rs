use std::path::Path;

use tracing::{debug, info, warn};

use super::{PREPROCESS_DATA, Step, StepReport};
use crate::artifact::{ArtifactKind, ArtifactRef, read_table, write_table};
use crate::dataset::LABEL_COLUMN;
use crate::error::StepResult;
use crate::table::{Table, format_null_counts};
use crate::transform::{empty_columns, impute, label_encode, standardize};

const ID_COLUMN: &str = "id";

/// Clean the loaded table: drop empty and `id` columns, encode the label,
/// standardize the features and fill the remaining nulls. Nothing is written
/// unless every stage succeeds.
pub fn preprocess(input: &Path, output: &Path) -> StepResult<Table> {
    let mut table = read_table(input, ArtifactKind::LoadedTable)?;
    let (rows, cols) = table.shape();
    info!("Loaded data with shape ({rows}, {cols})");
    info!("Null values before preprocessing:\n{}", format_null_counts(&table));

    let empty = empty_columns(&table);
    if !empty.is_empty() {
        table.drop_columns(&empty);
        info!("Dropped empty columns: {}", empty.join(", "));
    }
    if table.drop_columns(&[ID_COLUMN.to_string()]) > 0 {
        info!("Dropped '{ID_COLUMN}' column");
    }
    info!("Null values after dropping columns:\n{}", format_null_counts(&table));

    match table.column_mut(LABEL_COLUMN) {
        Some(column) => {
            let mapping = label_encode(column);
            info!("Encoded '{LABEL_COLUMN}': {}", mapping.describe());
        }
        None => warn!("No '{LABEL_COLUMN}' column found; skipping label encoding"),
    }

    let mut scaled = 0;
    for column in table.columns_mut().filter(|c| c.name != LABEL_COLUMN) {
        let scale = standardize(column)?;
        debug!(
            column = column.name.as_str(),
            mean = scale.mean,
            std = scale.std,
            "Standardized column"
        );
        scaled += 1;
    }
    info!("Standardized {scaled} feature column(s)");
    info!("Null values after scaling:\n{}", format_null_counts(&table));

    let filled = impute(&mut table, &[LABEL_COLUMN])?;
    if filled > 0 {
        info!("Imputed {filled} missing value(s)");
    }
    info!("Null values after imputation:\n{}", format_null_counts(&table));

    write_table(output, ArtifactKind::CleanTable, &table)?;
    info!("Preprocessed data saved to {}", output.display());
    Ok(table)
}

pub struct PreprocessStep {
    pub input: ArtifactRef,
    pub output: ArtifactRef,
}

impl Step for PreprocessStep {
    fn id(&self) -> &'static str {
        PREPROCESS_DATA
    }

    fn inputs(&self) -> Vec<ArtifactRef> {
        vec![self.input.clone()]
    }

    fn outputs(&self) -> Vec<ArtifactRef> {
        vec![self.output.clone()]
    }

    fn execute(&self) -> StepResult<StepReport> {
        let table = preprocess(&self.input.path, &self.output.path)?;
        let (rows, cols) = table.shape();
        Ok(StepReport {
            step: PREPROCESS_DATA,
            summary: format!("cleaned table has {rows} rows x {cols} columns"),
        })
    }
}
