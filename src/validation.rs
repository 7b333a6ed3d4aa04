use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::dataset::LABEL_COLUMN;
use crate::logging::parse_level;
use crate::recipe::{RECIPE_VERSION, Recipe};

const RETRY_WARNING_THRESHOLD: u32 = 10;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Checks the recipe's input data: the source CSV must be readable and its
/// header must carry the label column.
pub fn check_source(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();
    let path = &recipe.artifacts.source_csv;
    let headers = csv::Reader::from_path(path).and_then(|mut reader| reader.headers().cloned());
    match headers {
        Ok(headers) => {
            if !headers.iter().any(|h| h.trim() == LABEL_COLUMN) {
                report.errors.push(format!(
                    "source CSV {} has no '{LABEL_COLUMN}' column",
                    path.display()
                ));
            }
            if headers.len() < 2 {
                report.warnings.push(format!(
                    "source CSV {} has no feature columns besides the label",
                    path.display()
                ));
            }
        }
        Err(err) => report.errors.push(format!(
            "source CSV {} cannot be read: {err}",
            path.display()
        )),
    }
    report
}

pub fn validate_recipe(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != RECIPE_VERSION {
        report
            .errors
            .push(format!("Unsupported recipe version: {}", recipe.version));
    }

    report.merge(validate_training(recipe));
    report.merge(validate_artifacts(recipe));

    if parse_level(&recipe.logging.level).is_none() {
        report.errors.push(format!(
            "Unknown log level '{}' (expected trace, debug, info, warn or error)",
            recipe.logging.level
        ));
    }
    if recipe.logging.directory.as_os_str().is_empty() {
        report
            .errors
            .push("Log directory cannot be empty".into());
    }

    if recipe.retry.retries > RETRY_WARNING_THRESHOLD {
        report.warnings.push(format!(
            "{} retries per step; failing runs will take a long time to give up",
            recipe.retry.retries
        ));
    }

    report
}

fn validate_training(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();
    let training = &recipe.training;

    if !(training.test_size > 0.0 && training.test_size < 1.0) {
        report.errors.push(format!(
            "training.test_size must be in (0, 1), got {}",
            training.test_size
        ));
    }
    if !(training.c > 0.0) {
        report
            .errors
            .push(format!("training.c must be positive, got {}", training.c));
    }
    if training.max_iter == 0 {
        report
            .errors
            .push("training.max_iter must be at least 1".into());
    }
    if !(training.tol > 0.0) {
        report
            .errors
            .push(format!("training.tol must be positive, got {}", training.tol));
    }
    report
}

fn validate_artifacts(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();
    let artifacts = &recipe.artifacts;
    let outputs = artifacts.outputs();

    for (name, path) in &outputs {
        if path.as_os_str().is_empty() {
            report
                .errors
                .push(format!("Artifact path '{name}' cannot be empty"));
        }
    }
    if artifacts.source_csv.as_os_str().is_empty() {
        report
            .errors
            .push("Artifact path 'source_csv' cannot be empty".into());
    }
    if artifacts.results_dir.as_os_str().is_empty() {
        report
            .errors
            .push("Artifact path 'results_dir' cannot be empty".into());
    }

    let source = normalize(&artifacts.source_csv);
    for (idx, (name, path)) in outputs.iter().enumerate() {
        let normalized = normalize(path);
        if normalized == source {
            report.errors.push(format!(
                "Artifact '{name}' would overwrite the source CSV '{}'",
                artifacts.source_csv.display()
            ));
        }
        for (other, other_path) in &outputs[idx + 1..] {
            if normalized == normalize(other_path) {
                report.errors.push(format!(
                    "Artifacts '{name}' and '{other}' share the path '{}'",
                    path.display()
                ));
            }
        }
    }

    let results_dir = normalize(&artifacts.results_dir);
    for (name, path) in [("model", &artifacts.model), ("metrics", &artifacts.metrics)] {
        if !normalize(path).starts_with(&results_dir) {
            report.warnings.push(format!(
                "Artifact '{name}' ({}) lives outside results_dir '{}' and will be copied there",
                path.display(),
                artifacts.results_dir.display()
            ));
        }
    }
    report
}

/// Lexical normalization: drops `.` components and resolves `..` where
/// possible, without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
