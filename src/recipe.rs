use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

use crate::artifact::{ArtifactKind, ArtifactRef};
use crate::logging::parse_level;
use crate::model::FitParams;

pub const RECIPE_VERSION: u32 = 1;

/// Full pipeline configuration. Every field has a default, so an empty YAML
/// document describes the stock layout under the working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recipe {
    pub version: u32,
    pub artifacts: ArtifactPaths,
    pub logging: LoggingSpec,
    pub training: TrainingSpec,
    pub retry: RetrySpec,
}

impl Default for Recipe {
    fn default() -> Self {
        Self {
            version: RECIPE_VERSION,
            artifacts: ArtifactPaths::default(),
            logging: LoggingSpec::default(),
            training: TrainingSpec::default(),
            retry: RetrySpec::default(),
        }
    }
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;
        let recipe: Recipe = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse recipe YAML: {}", path.display()))?;
        Ok(recipe)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to render recipe YAML")
    }

    /// Path of the log file for `step_id`.
    pub fn log_path(&self, step_id: &str) -> PathBuf {
        self.logging.directory.join(format!("{step_id}.log"))
    }

    pub fn log_level(&self) -> LevelFilter {
        parse_level(&self.logging.level).unwrap_or(LevelFilter::INFO)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactPaths {
    pub source_csv: PathBuf,
    pub loaded: PathBuf,
    pub preprocessed: PathBuf,
    pub model: PathBuf,
    pub test_features: PathBuf,
    pub test_labels: PathBuf,
    pub metrics: PathBuf,
    pub results_dir: PathBuf,
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self {
            source_csv: PathBuf::from("data/data.csv"),
            loaded: PathBuf::from("data/loaded.bin"),
            preprocessed: PathBuf::from("data/preprocessed.bin"),
            model: PathBuf::from("results/model.safetensors"),
            test_features: PathBuf::from("data/X_test.safetensors"),
            test_labels: PathBuf::from("data/y_test.safetensors"),
            metrics: PathBuf::from("results/metrics.json"),
            results_dir: PathBuf::from("results"),
        }
    }
}

impl ArtifactPaths {
    pub fn source_csv(&self) -> ArtifactRef {
        ArtifactRef::new(&self.source_csv, ArtifactKind::SourceCsv)
    }

    pub fn loaded(&self) -> ArtifactRef {
        ArtifactRef::new(&self.loaded, ArtifactKind::LoadedTable)
    }

    pub fn preprocessed(&self) -> ArtifactRef {
        ArtifactRef::new(&self.preprocessed, ArtifactKind::CleanTable)
    }

    pub fn model(&self) -> ArtifactRef {
        ArtifactRef::new(&self.model, ArtifactKind::Model)
    }

    pub fn test_features(&self) -> ArtifactRef {
        ArtifactRef::new(&self.test_features, ArtifactKind::TestFeatures)
    }

    pub fn test_labels(&self) -> ArtifactRef {
        ArtifactRef::new(&self.test_labels, ArtifactKind::TestLabels)
    }

    pub fn metrics(&self) -> ArtifactRef {
        ArtifactRef::new(&self.metrics, ArtifactKind::Metrics)
    }

    /// Every path written by some step, labelled by artifact name.
    pub fn outputs(&self) -> Vec<(&'static str, &Path)> {
        vec![
            ("loaded", self.loaded.as_path()),
            ("preprocessed", self.preprocessed.as_path()),
            ("model", self.model.as_path()),
            ("test_features", self.test_features.as_path()),
            ("test_labels", self.test_labels.as_path()),
            ("metrics", self.metrics.as_path()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSpec {
    pub directory: PathBuf,
    pub level: String,
}

impl Default for LoggingSpec {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSpec {
    pub test_size: f64,
    pub seed: u64,
    pub c: f64,
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for TrainingSpec {
    fn default() -> Self {
        let fit = FitParams::default();
        Self {
            test_size: 0.2,
            seed: 42,
            c: fit.c,
            max_iter: fit.max_iter,
            tol: fit.tol,
        }
    }
}

impl TrainingSpec {
    pub fn fit_params(&self) -> FitParams {
        FitParams {
            c: self.c,
            max_iter: self.max_iter,
            tol: self.tol,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySpec {
    pub retries: u32,
    pub delay_secs: u64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            retries: 2,
            delay_secs: 120,
        }
    }
}

impl RetrySpec {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}
