//! Feature/label partitions and the stratified train/test split.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use ndarray::{Array1, Array2, Axis};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::artifact::{TensorEntry, TensorFile, write_safetensors};
use crate::error::{PipelineError, StepResult};
use crate::table::{ColumnData, Table};

pub const LABEL_COLUMN: &str = "diagnosis";

/// Numeric features with their column names, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.values.ncols()
    }

    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            columns: self.columns.clone(),
            values: self.values.select(Axis(0), rows),
        }
    }

    pub fn save(&self, path: &Path) -> StepResult<()> {
        let mut metadata = HashMap::new();
        metadata.insert(
            "columns".to_string(),
            serde_json::to_string(&self.columns).unwrap_or_else(|_| "[]".into()),
        );
        let entry = TensorEntry::f64(
            "features",
            vec![self.n_rows(), self.n_features()],
            self.values.iter().copied(),
        );
        write_safetensors(path, &[entry], metadata)
    }

    pub fn load(path: &Path) -> StepResult<Self> {
        let file = TensorFile::open(path)?;
        let columns: Vec<String> = file.metadata_json("columns")?;
        let (shape, values) = file.f64_tensor("features")?;
        let [rows, cols] = shape[..] else {
            return Err(PipelineError::parse(
                path,
                format!("features must be 2-dimensional, got shape {shape:?}"),
            ));
        };
        if cols != columns.len() {
            return Err(PipelineError::parse(
                path,
                format!("{} columns named for {cols} feature columns", columns.len()),
            ));
        }
        let values = Array2::from_shape_vec((rows, cols), values)
            .map_err(|err| PipelineError::parse(path, err.to_string()))?;
        Ok(Self { columns, values })
    }
}

pub fn save_labels(labels: &Array1<i64>, path: &Path) -> StepResult<()> {
    let entry = TensorEntry::i64("labels", vec![labels.len()], labels.iter().copied());
    write_safetensors(path, &[entry], HashMap::new())
}

pub fn load_labels(path: &Path) -> StepResult<Array1<i64>> {
    let file = TensorFile::open(path)?;
    let (shape, values) = file.i64_tensor("labels")?;
    if shape.len() != 1 {
        return Err(PipelineError::parse(
            path,
            format!("labels must be 1-dimensional, got shape {shape:?}"),
        ));
    }
    Ok(Array1::from(values))
}

/// Split a clean table into the feature matrix and the 0/1 label vector.
pub fn features_and_labels(table: &Table) -> StepResult<(FeatureMatrix, Array1<i64>)> {
    let label_column = table.column(LABEL_COLUMN).ok_or_else(|| {
        PipelineError::Schema(format!("label column '{LABEL_COLUMN}' is missing"))
    })?;
    let ColumnData::Numeric(raw_labels) = &label_column.data else {
        return Err(PipelineError::Schema(format!(
            "label column '{LABEL_COLUMN}' is not encoded; expected integer classes"
        )));
    };
    let labels = raw_labels
        .iter()
        .enumerate()
        .map(|(row, value)| match value {
            Some(v) if *v == 0.0 || *v == 1.0 => Ok(*v as i64),
            Some(v) => Err(PipelineError::Schema(format!(
                "row {row}: label {v} is not a binary class code"
            ))),
            None => Err(PipelineError::Schema(format!("row {row}: label is null"))),
        })
        .collect::<StepResult<Vec<i64>>>()?;

    let feature_columns: Vec<_> = table
        .columns()
        .iter()
        .filter(|c| c.name != LABEL_COLUMN)
        .collect();
    let mut values = Array2::zeros((table.n_rows(), feature_columns.len()));
    for (col, column) in feature_columns.iter().enumerate() {
        let ColumnData::Numeric(cells) = &column.data else {
            return Err(PipelineError::Schema(format!(
                "feature column '{}' is not numeric",
                column.name
            )));
        };
        for (row, cell) in cells.iter().enumerate() {
            values[[row, col]] = cell.ok_or_else(|| {
                PipelineError::Schema(format!("feature column '{}' has nulls", column.name))
            })?;
        }
    }

    Ok((
        FeatureMatrix {
            columns: feature_columns.iter().map(|c| c.name.clone()).collect(),
            values,
        },
        Array1::from(labels),
    ))
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub features: FeatureMatrix,
    pub labels: Array1<i64>,
}

#[derive(Debug, Clone)]
pub struct DataSplit {
    pub train: Partition,
    pub test: Partition,
    /// Source rows of the test partition, in partition order.
    pub test_indices: Vec<usize>,
}

/// Count of rows per class, ordered by class.
pub fn class_counts(labels: &Array1<i64>) -> BTreeMap<i64, usize> {
    let mut counts = BTreeMap::new();
    for &label in labels {
        *counts.entry(label).or_insert(0) += 1;
    }
    counts
}

/// Stratified split holding out `ceil(test_size * n)` rows. Per-class test
/// counts follow the class proportions, rounded by largest remainder.
pub fn stratified_split(
    features: &FeatureMatrix,
    labels: &Array1<i64>,
    test_size: f64,
    seed: u64,
) -> StepResult<DataSplit> {
    if !(test_size > 0.0 && test_size < 1.0) {
        return Err(PipelineError::Fit(format!(
            "test_size must be in (0, 1), got {test_size}"
        )));
    }
    let n = labels.len();
    let counts = class_counts(labels);
    if counts.len() < 2 {
        return Err(PipelineError::Fit(format!(
            "stratified split needs at least 2 classes, found {}",
            counts.len()
        )));
    }
    if let Some((class, count)) = counts.iter().find(|(_, count)| **count < 2) {
        return Err(PipelineError::Fit(format!(
            "class {class} has only {count} member(s); stratified split needs at least 2"
        )));
    }
    let n_test = (test_size * n as f64).ceil() as usize;
    let n_train = n - n_test;
    if n_test < counts.len() || n_train < counts.len() {
        return Err(PipelineError::Fit(format!(
            "split of {n} rows into {n_train} train / {n_test} test cannot hold {} classes",
            counts.len()
        )));
    }

    let allocation = allocate_test_counts(&counts, n, n_test);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut train_indices = Vec::with_capacity(n_train);
    let mut test_indices = Vec::with_capacity(n_test);
    for (class, take) in &allocation {
        let mut members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, label)| *label == class)
            .map(|(idx, _)| idx)
            .collect();
        members.shuffle(&mut rng);
        test_indices.extend_from_slice(&members[..*take]);
        train_indices.extend_from_slice(&members[*take..]);
    }
    train_indices.shuffle(&mut rng);
    test_indices.shuffle(&mut rng);

    let partition = |rows: &[usize]| Partition {
        features: features.select_rows(rows),
        labels: labels.select(Axis(0), rows),
    };
    Ok(DataSplit {
        train: partition(&train_indices),
        test: partition(&test_indices),
        test_indices,
    })
}

fn allocate_test_counts(
    counts: &BTreeMap<i64, usize>,
    n: usize,
    n_test: usize,
) -> BTreeMap<i64, usize> {
    let mut allocation = BTreeMap::new();
    let mut remainders = Vec::with_capacity(counts.len());
    for (&class, &count) in counts {
        let exact = count as f64 * n_test as f64 / n as f64;
        let base = exact.floor() as usize;
        allocation.insert(class, base);
        remainders.push((class, exact - base as f64, count));
    }
    let assigned: usize = allocation.values().sum();
    // Largest remainder first, larger classes break ties.
    remainders.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.2.cmp(&a.2)));
    for (class, _, count) in remainders.into_iter().take(n_test - assigned) {
        if let Some(slot) = allocation.get_mut(&class)
            && *slot < count - 1
        {
            *slot += 1;
        }
    }
    allocation
}
