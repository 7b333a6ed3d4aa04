use std::path::Path;

use tracing::{info, warn};

use super::{CALC_METRICS, Step, StepReport};
use crate::artifact::ArtifactRef;
use crate::dataset::{FeatureMatrix, load_labels};
use crate::error::{PipelineError, StepResult};
use crate::metrics::{MetricsRecord, classification_report, evaluate_predictions};
use crate::model::LogisticRegression;

/// Score the persisted model on the persisted test partition and write the
/// four headline metrics as JSON.
pub fn evaluate(
    model_path: &Path,
    test_features_path: &Path,
    test_labels_path: &Path,
    metrics_path: &Path,
) -> StepResult<MetricsRecord> {
    let model = LogisticRegression::load(model_path)?;
    let features = FeatureMatrix::load(test_features_path)?;
    let labels = load_labels(test_labels_path)?;
    info!(
        "Loaded model ({} feature(s)) and {} test row(s)",
        model.feature_names().len(),
        features.n_rows()
    );

    if labels.len() != features.n_rows() {
        return Err(PipelineError::Consistency(format!(
            "{} test labels for {} test feature rows",
            labels.len(),
            features.n_rows()
        )));
    }
    let predictions = model.predict(&features)?;

    let evaluation = evaluate_predictions(&predictions.to_vec(), &labels.to_vec())?;
    for metric in &evaluation.undefined {
        warn!("{metric} is ill-defined (zero denominator); reported as 0.0");
    }
    let record = evaluation.record;
    info!("{record}");
    info!(
        "Classification report:\n{}",
        classification_report(&evaluation.confusion)
    );

    record.save(metrics_path)?;
    info!("Metrics saved to {}", metrics_path.display());
    Ok(record)
}

pub struct EvaluateStep {
    pub model: ArtifactRef,
    pub test_features: ArtifactRef,
    pub test_labels: ArtifactRef,
    pub metrics: ArtifactRef,
}

impl Step for EvaluateStep {
    fn id(&self) -> &'static str {
        CALC_METRICS
    }

    fn inputs(&self) -> Vec<ArtifactRef> {
        vec![
            self.model.clone(),
            self.test_features.clone(),
            self.test_labels.clone(),
        ]
    }

    fn outputs(&self) -> Vec<ArtifactRef> {
        vec![self.metrics.clone()]
    }

    fn execute(&self) -> StepResult<StepReport> {
        let record = evaluate(
            &self.model.path,
            &self.test_features.path,
            &self.test_labels.path,
            &self.metrics.path,
        )?;
        Ok(StepReport {
            step: CALC_METRICS,
            summary: record.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::save_labels;
    use crate::model::FitParams;
    use ndarray::{Array1, array};
    use tempfile::tempdir;

    fn fitted() -> (LogisticRegression, FeatureMatrix, Array1<i64>) {
        let features = FeatureMatrix {
            columns: vec!["radius".into(), "texture".into()],
            values: array![
                [-2.0, -1.0],
                [-1.0, -0.5],
                [-0.5, -1.5],
                [0.5, 1.0],
                [1.0, 0.5],
                [2.0, 1.5],
            ],
        };
        let labels = array![0, 0, 0, 1, 1, 1];
        let model = LogisticRegression::fit(&features, &labels, FitParams::default()).unwrap();
        (model, features, labels)
    }

    #[test]
    fn writes_metrics_in_unit_range() {
        let temp = tempdir().unwrap();
        let (model, features, labels) = fitted();
        let model_path = temp.path().join("model.safetensors");
        let x_path = temp.path().join("X_test.safetensors");
        let y_path = temp.path().join("y_test.safetensors");
        let metrics_path = temp.path().join("results/metrics.json");
        model.save(&model_path).unwrap();
        features.save(&x_path).unwrap();
        save_labels(&labels, &y_path).unwrap();

        let record = evaluate(&model_path, &x_path, &y_path, &metrics_path).unwrap();
        assert_eq!(record.accuracy, 1.0);
        assert_eq!(MetricsRecord::load(&metrics_path).unwrap(), record);
    }

    #[test]
    fn renamed_feature_columns_are_fatal() {
        let temp = tempdir().unwrap();
        let (model, mut features, labels) = fitted();
        features.columns = vec!["texture".into(), "radius".into()];
        let model_path = temp.path().join("model.safetensors");
        let x_path = temp.path().join("X_test.safetensors");
        let y_path = temp.path().join("y_test.safetensors");
        model.save(&model_path).unwrap();
        features.save(&x_path).unwrap();
        save_labels(&labels, &y_path).unwrap();

        let err = evaluate(&model_path, &x_path, &y_path, &temp.path().join("m.json")).unwrap_err();
        assert!(matches!(err, PipelineError::Consistency(_)), "{err}");
        assert!(!err.is_retryable());
    }

    #[test]
    fn label_count_mismatch_is_fatal() {
        let temp = tempdir().unwrap();
        let (model, features, _) = fitted();
        let model_path = temp.path().join("model.safetensors");
        let x_path = temp.path().join("X_test.safetensors");
        let y_path = temp.path().join("y_test.safetensors");
        model.save(&model_path).unwrap();
        features.save(&x_path).unwrap();
        save_labels(&array![0, 1], &y_path).unwrap();

        let err = evaluate(&model_path, &x_path, &y_path, &temp.path().join("m.json")).unwrap_err();
        assert!(matches!(err, PipelineError::Consistency(_)));
    }
}
