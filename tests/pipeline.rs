use std::fs;
use std::path::Path;

use diagnosis_etl::PipelineError;
use diagnosis_etl::pipeline::PipelineExecutor;
use diagnosis_etl::recipe::Recipe;
use diagnosis_etl::scheduler::RetryPolicy;
use std::time::Duration;
use tempfile::tempdir;

const FEATURES: [&str; 5] = [
    "radius_mean",
    "texture_mean",
    "perimeter_mean",
    "area_mean",
    "smoothness_mean",
];

/// Ten rows, five features, an `id`, a fully empty trailing column and one
/// missing feature value.
fn write_dataset(path: &Path, diagnosis: impl Fn(usize) -> &'static str) {
    let mut csv = format!("id,diagnosis,{},Unnamed: 32\n", FEATURES.join(","));
    for row in 0..10 {
        let label = diagnosis(row);
        let shift = if label == "M" { 4.0 } else { 0.0 };
        let wobble = (row as f64 * 0.7).sin();
        let texture = if row == 3 {
            String::new()
        } else {
            format!("{:.3}", 18.0 + wobble * 3.0 + shift * 0.5)
        };
        csv.push_str(&format!(
            "{},{label},{:.3},{texture},{:.3},{:.1},{:.4},\n",
            8000 + row,
            12.0 + wobble + shift,
            80.0 + wobble * 5.0 + shift * 6.0,
            450.0 + wobble * 40.0 + shift * 90.0,
            0.09 + wobble * 0.01,
        ));
    }
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, csv).unwrap();
}

fn recipe_in(root: &Path) -> Recipe {
    let mut recipe = Recipe::default();
    let a = &mut recipe.artifacts;
    a.source_csv = root.join("data/data.csv");
    a.loaded = root.join("data/loaded.bin");
    a.preprocessed = root.join("data/preprocessed.bin");
    a.model = root.join("work/model.safetensors");
    a.test_features = root.join("data/X_test.safetensors");
    a.test_labels = root.join("data/y_test.safetensors");
    a.metrics = root.join("work/metrics.json");
    a.results_dir = root.join("results");
    recipe.logging.directory = root.join("logs");
    recipe
}

fn executor(recipe: &Recipe) -> PipelineExecutor {
    PipelineExecutor::from_recipe(recipe).with_policy(RetryPolicy::new(0, Duration::ZERO))
}

#[test]
fn end_to_end_run_publishes_model_and_metrics() {
    let temp = tempdir().unwrap();
    let recipe = recipe_in(temp.path());
    write_dataset(&recipe.artifacts.source_csv, |row| if row % 2 == 0 { "M" } else { "B" });

    let result = executor(&recipe).execute().expect("pipeline should succeed");
    assert_eq!(result.steps.len(), 5);
    assert!(result.steps.iter().all(|s| s.attempts == 1));

    let metrics_path = temp.path().join("results/metrics.json");
    let value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&metrics_path).unwrap()).unwrap();
    let object = value.as_object().unwrap();
    assert_eq!(object.len(), 4);
    for key in ["accuracy", "precision", "recall", "f1_score"] {
        let metric = object[key].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&metric), "{key} = {metric}");
    }

    let model = temp.path().join("results/model.safetensors");
    assert!(fs::metadata(&model).unwrap().len() > 0);
    assert!(recipe.artifacts.model.exists(), "publishing must not move the source");

    for step in ["load_data", "preprocess_data", "train_model", "calc_metrics", "save_results"] {
        let log = fs::read_to_string(temp.path().join(format!("logs/{step}.log"))).unwrap();
        assert!(!log.is_empty(), "{step} log is empty");
        assert!(log.starts_with('['), "{step} log: {log}");
    }
}

#[test]
fn single_class_stops_before_evaluation() {
    let temp = tempdir().unwrap();
    let recipe = recipe_in(temp.path());
    write_dataset(&recipe.artifacts.source_csv, |_| "M");

    let exec = executor(&recipe);
    let err = exec.execute().unwrap_err();
    assert!(err.to_string().contains("train_model"), "{err:#}");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Fit(_))
    ));

    assert!(!recipe.artifacts.metrics.exists());
    assert!(!temp.path().join("logs/calc_metrics.log").exists());
    let train_log = fs::read_to_string(temp.path().join("logs/train_model.log")).unwrap();
    assert!(train_log.contains("ERROR - fit error"), "{train_log}");

    let snapshot = exec.metrics().snapshot();
    assert_eq!(snapshot.runs_failed, 1);
    assert_eq!(snapshot.steps["train_model"].failures, 1);
    assert!(!snapshot.steps.contains_key("calc_metrics"));
}

#[test]
fn failed_step_is_retried_per_policy() {
    let temp = tempdir().unwrap();
    let recipe = recipe_in(temp.path());
    // No source CSV: the loader fails with an I/O error on every attempt.
    let exec =
        PipelineExecutor::from_recipe(&recipe).with_policy(RetryPolicy::new(2, Duration::ZERO));

    let err = exec.execute().unwrap_err();
    assert!(err.to_string().contains("after 3 attempt(s)"), "{err:#}");
    assert_eq!(exec.metrics().snapshot().steps["load_data"].attempts, 3);
}

#[test]
fn rerun_overwrites_artifacts() {
    let temp = tempdir().unwrap();
    let recipe = recipe_in(temp.path());
    write_dataset(&recipe.artifacts.source_csv, |row| if row < 5 { "B" } else { "M" });

    executor(&recipe).execute().unwrap();
    let first = fs::read(temp.path().join("results/metrics.json")).unwrap();
    executor(&recipe).execute().unwrap();
    let second = fs::read(temp.path().join("results/metrics.json")).unwrap();
    assert_eq!(first, second, "fixed seed must give identical metrics");
}
