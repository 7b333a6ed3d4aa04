use std::fs;
use std::path::Path;

use diagnosis_etl::dataset::{class_counts, features_and_labels, stratified_split};
use diagnosis_etl::steps::{load, preprocess, publish};
use diagnosis_etl::table::ColumnData;
use ndarray::Array1;
use tempfile::tempdir;

fn write_csv(path: &Path, rows: usize) {
    let mut csv = String::from("id,diagnosis,radius_mean,texture_mean,concavity_mean,empty\n");
    for row in 0..rows {
        let label = if row % 3 == 0 { "M" } else { "B" };
        let texture = if row % 4 == 1 {
            "NA".to_string()
        } else {
            format!("{}", 10.0 + row as f64 * 1.5)
        };
        csv.push_str(&format!(
            "{row},{label},{},{texture},{},\n",
            14.0 + (row as f64).sqrt(),
            0.05 * (row % 5) as f64,
        ));
    }
    fs::write(path, csv).unwrap();
}

fn population_moments(values: &[Option<f64>]) -> (f64, f64) {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    let n = present.len() as f64;
    let mean = present.iter().sum::<f64>() / n;
    let var = present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

#[test]
fn loader_preserves_row_and_column_counts() {
    let temp = tempdir().unwrap();
    let csv = temp.path().join("data.csv");
    write_csv(&csv, 12);

    let table = load(&csv, &temp.path().join("loaded.bin")).unwrap();
    assert_eq!(table.shape(), (12, 6));
}

#[test]
fn preprocessor_output_is_clean_and_scaled() {
    let temp = tempdir().unwrap();
    let csv = temp.path().join("data.csv");
    let loaded = temp.path().join("loaded.bin");
    let clean_path = temp.path().join("clean.bin");
    write_csv(&csv, 12);
    load(&csv, &loaded).unwrap();

    let clean = preprocess(&loaded, &clean_path).unwrap();
    assert_eq!(clean.total_nulls(), 0);
    assert!(!clean.has_column("empty"));
    assert!(!clean.has_column("id"));
    assert!(clean.has_column("texture_mean"), "partially null columns are kept");

    for name in ["radius_mean", "concavity_mean"] {
        let ColumnData::Numeric(values) = &clean.column(name).unwrap().data else {
            panic!("{name} should be numeric");
        };
        let (mean, std) = population_moments(values);
        assert!(mean.abs() < 1e-9, "{name} mean {mean}");
        assert!((std - 1.0).abs() < 1e-9, "{name} std {std}");
    }

    let ColumnData::Numeric(labels) = &clean.column("diagnosis").unwrap().data else {
        panic!("labels should be encoded");
    };
    assert!(labels.iter().all(|l| matches!(l, Some(v) if *v == 0.0 || *v == 1.0)));
}

#[test]
fn split_preserves_class_proportions() {
    let temp = tempdir().unwrap();
    let csv = temp.path().join("data.csv");
    let loaded = temp.path().join("loaded.bin");
    write_csv(&csv, 30);
    load(&csv, &loaded).unwrap();
    let clean = preprocess(&loaded, &temp.path().join("clean.bin")).unwrap();

    let (features, labels) = features_and_labels(&clean).unwrap();
    let split = stratified_split(&features, &labels, 0.2, 42).unwrap();
    assert_eq!(split.test.labels.len(), 6);
    assert_eq!(split.train.labels.len(), 24);

    let share = |labels: &Array1<i64>| {
        let counts = class_counts(labels);
        counts.get(&1).copied().unwrap_or(0) as f64 / labels.len() as f64
    };
    let overall = share(&labels);
    assert!((share(&split.test.labels) - overall).abs() <= 1.0 / 6.0);
    assert!((share(&split.train.labels) - overall).abs() <= 1.0 / 24.0);
}

#[test]
fn publisher_is_idempotent() {
    let temp = tempdir().unwrap();
    let results = temp.path().join("results");
    let model = temp.path().join("model.safetensors");
    let metrics = temp.path().join("metrics.json");
    fs::write(&model, b"model").unwrap();
    fs::write(&metrics, br#"{"accuracy":1.0}"#).unwrap();

    let first = publish(&model, &metrics, &results).unwrap();
    assert_eq!(first.copied.len(), 2);
    let second = publish(
        &results.join("model.safetensors"),
        &results.join("metrics.json"),
        &results,
    )
    .unwrap();
    assert!(second.copied.is_empty());
    assert_eq!(fs::read(results.join("metrics.json")).unwrap(), br#"{"accuracy":1.0}"#);
}
