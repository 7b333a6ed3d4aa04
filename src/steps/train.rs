use std::path::Path;

use tracing::{debug, info, warn};

use super::{Step, StepReport, TRAIN_MODEL};
use crate::artifact::{ArtifactKind, ArtifactRef, read_table};
use crate::dataset::{
    Partition, class_counts, features_and_labels, save_labels, stratified_split,
};
use crate::error::StepResult;
use crate::model::LogisticRegression;
use crate::recipe::TrainingSpec;
use crate::transform::fill_numeric_with_mean;

#[derive(Debug, Clone)]
pub struct TrainOutput {
    pub model: LogisticRegression,
    pub test: Partition,
}

/// Split the clean table, fit the classifier on the training partition and
/// persist the model together with the held-out test partition.
pub fn train(
    input: &Path,
    model_path: &Path,
    test_features_path: &Path,
    test_labels_path: &Path,
    training: &TrainingSpec,
) -> StepResult<TrainOutput> {
    let mut table = read_table(input, ArtifactKind::CleanTable)?;
    let (rows, cols) = table.shape();
    info!("Loaded preprocessed data with shape ({rows}, {cols})");

    let nulls = table.total_nulls();
    if nulls > 0 {
        warn!(
            "{nulls} null value(s) remain after preprocessing; \
             filling numeric columns with their mean"
        );
        fill_numeric_with_mean(&mut table)?;
    }

    let (features, labels) = features_and_labels(&table)?;
    info!(
        "Features: {} column(s); class counts: {:?}",
        features.n_features(),
        class_counts(&labels)
    );

    let split = stratified_split(&features, &labels, training.test_size, training.seed)?;
    info!(
        "Train size: {}, test size: {} (test_size={}, seed={})",
        split.train.labels.len(),
        split.test.labels.len(),
        training.test_size,
        training.seed
    );
    debug!("Held-out source rows: {:?}", split.test_indices);

    let model = LogisticRegression::fit(
        &split.train.features,
        &split.train.labels,
        training.fit_params(),
    )?;
    let report = model.report();
    if report.converged {
        info!(
            "Model converged after {} iteration(s), loss {:.6}",
            report.iterations, report.final_loss
        );
    } else {
        warn!(
            "Model did not converge within {} iteration(s) (tol={}); keeping the last iterate",
            report.iterations, training.tol
        );
    }

    model.save(model_path)?;
    info!("Model saved to {}", model_path.display());
    split.test.features.save(test_features_path)?;
    save_labels(&split.test.labels, test_labels_path)?;
    info!(
        "Test partition saved to {} and {}",
        test_features_path.display(),
        test_labels_path.display()
    );

    Ok(TrainOutput {
        model,
        test: split.test,
    })
}

pub struct TrainStep {
    pub input: ArtifactRef,
    pub model: ArtifactRef,
    pub test_features: ArtifactRef,
    pub test_labels: ArtifactRef,
    pub training: TrainingSpec,
}

impl Step for TrainStep {
    fn id(&self) -> &'static str {
        TRAIN_MODEL
    }

    fn inputs(&self) -> Vec<ArtifactRef> {
        vec![self.input.clone()]
    }

    fn outputs(&self) -> Vec<ArtifactRef> {
        vec![
            self.model.clone(),
            self.test_features.clone(),
            self.test_labels.clone(),
        ]
    }

    fn execute(&self) -> StepResult<StepReport> {
        let output = train(
            &self.input.path,
            &self.model.path,
            &self.test_features.path,
            &self.test_labels.path,
            &self.training,
        )?;
        let report = output.model.report();
        Ok(StepReport {
            step: TRAIN_MODEL,
            summary: format!(
                "fitted on {} feature(s) in {} iteration(s), converged={}, {} test row(s)",
                output.model.feature_names().len(),
                report.iterations,
                report.converged,
                output.test.labels.len()
            ),
        })
    }
}
