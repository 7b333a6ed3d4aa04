//! The five pipeline steps.
//!
//! Each step exists twice: as a free function taking explicit paths (the
//! callable the CLI `step` subcommand and tests use) and as a [`Step`]
//! implementation bound to the artifact references of a recipe, which is
//! what the executor schedules.

use std::path::{Path, PathBuf};

use tracing_subscriber::filter::LevelFilter;

use crate::artifact::ArtifactRef;
use crate::error::StepResult;
use crate::logging::with_step_log;
use crate::recipe::Recipe;

pub mod evaluate;
pub mod load;
pub mod preprocess;
pub mod publish;
pub mod train;

pub use evaluate::{EvaluateStep, evaluate};
pub use load::{LoadStep, load};
pub use preprocess::{PreprocessStep, preprocess};
pub use publish::{PublishReport, PublishStep, publish};
pub use train::{TrainOutput, TrainStep, train};

pub const LOAD_DATA: &str = "load_data";
pub const PREPROCESS_DATA: &str = "preprocess_data";
pub const TRAIN_MODEL: &str = "train_model";
pub const CALC_METRICS: &str = "calc_metrics";
pub const SAVE_RESULTS: &str = "save_results";

/// Step ids in execution order.
pub const STEP_IDS: [&str; 5] = [
    LOAD_DATA,
    PREPROCESS_DATA,
    TRAIN_MODEL,
    CALC_METRICS,
    SAVE_RESULTS,
];

/// Where a step's log goes and how verbose it is.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub log_dir: PathBuf,
    pub log_level: LevelFilter,
}

impl StepContext {
    pub fn new(log_dir: impl Into<PathBuf>, log_level: LevelFilter) -> Self {
        Self {
            log_dir: log_dir.into(),
            log_level,
        }
    }

    pub fn from_recipe(recipe: &Recipe) -> Self {
        Self::new(&recipe.logging.directory, recipe.log_level())
    }

    pub fn log_path(&self, step_id: &str) -> PathBuf {
        self.log_dir.join(format!("{step_id}.log"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step: &'static str,
    pub summary: String,
}

pub trait Step {
    fn id(&self) -> &'static str;
    fn inputs(&self) -> Vec<ArtifactRef>;
    /// Artifacts that must exist once the step has succeeded.
    fn outputs(&self) -> Vec<ArtifactRef>;
    fn execute(&self) -> StepResult<StepReport>;
}

/// Run one step with its events routed to its own log file.
pub fn run_step(step: &dyn Step, ctx: &StepContext) -> StepResult<StepReport> {
    with_step_log(&ctx.log_path(step.id()), ctx.log_level, || step.execute())
}

/// Run a free-function step outside the executor, logging to `log_path`.
pub fn run_logged<T>(
    log_path: &Path,
    level: LevelFilter,
    body: impl FnOnce() -> StepResult<T>,
) -> StepResult<T> {
    with_step_log(log_path, level, body)
}

pub fn default_steps(recipe: &Recipe) -> Vec<Box<dyn Step>> {
    let artifacts = &recipe.artifacts;
    vec![
        Box::new(LoadStep {
            source: artifacts.source_csv(),
            output: artifacts.loaded(),
        }),
        Box::new(PreprocessStep {
            input: artifacts.loaded(),
            output: artifacts.preprocessed(),
        }),
        Box::new(TrainStep {
            input: artifacts.preprocessed(),
            model: artifacts.model(),
            test_features: artifacts.test_features(),
            test_labels: artifacts.test_labels(),
            training: recipe.training.clone(),
        }),
        Box::new(EvaluateStep {
            model: artifacts.model(),
            test_features: artifacts.test_features(),
            test_labels: artifacts.test_labels(),
            metrics: artifacts.metrics(),
        }),
        Box::new(PublishStep {
            model: artifacts.model(),
            metrics: artifacts.metrics(),
            results_dir: artifacts.results_dir.clone(),
        }),
    ]
}
