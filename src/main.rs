use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueHint};
use diagnosis_etl::artifact::ArtifactRef;
use diagnosis_etl::logging::parse_level;
use diagnosis_etl::observability::MetricsSnapshot;
use diagnosis_etl::pipeline::{PipelineExecutor, StepProgress};
use diagnosis_etl::presets::generate_recipe;
use diagnosis_etl::recipe::{Recipe, TrainingSpec};
use diagnosis_etl::steps::{self, STEP_IDS, run_logged};
use diagnosis_etl::validation::{ValidationReport, check_source, validate_recipe};
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Run {
            recipe,
            dry_run,
            retries,
            retry_delay_secs,
            print_metrics,
            metrics_json,
            metrics_prometheus,
        } => run_pipeline(
            recipe,
            dry_run,
            retries,
            retry_delay_secs,
            MetricsExport {
                print: print_metrics,
                json: metrics_json,
                prometheus: metrics_prometheus,
            },
        ),
        Commands::Step { log_level, step } => {
            let level = parse_level(&log_level)
                .ok_or_else(|| anyhow!("Unknown log level '{log_level}'"))?;
            step_command(step, level)
        }
        Commands::ListSteps => {
            list_steps();
            Ok(())
        }
        Commands::Validate { recipe } => validate_recipe_cmd(recipe),
        Commands::Recipe { action } => recipe_command(action),
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

struct MetricsExport {
    print: bool,
    json: Option<PathBuf>,
    prometheus: Option<PathBuf>,
}

fn run_pipeline(
    recipe_path: Option<PathBuf>,
    dry_run: bool,
    retries: Option<u32>,
    retry_delay_secs: Option<u64>,
    export: MetricsExport,
) -> Result<()> {
    let mut recipe = match &recipe_path {
        Some(path) => Recipe::load(path)?,
        None => Recipe::default(),
    };
    if let Some(retries) = retries {
        recipe.retry.retries = retries;
    }
    if let Some(delay) = retry_delay_secs {
        recipe.retry.delay_secs = delay;
    }

    let origin = recipe_path
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<default recipe>".to_string());
    let report = validate_recipe(&recipe);
    for warning in &report.warnings {
        warn!(recipe = %origin, "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(recipe = %origin, "{error_msg}");
        }
        bail!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        );
    }

    let executor = PipelineExecutor::from_recipe(&recipe);

    if dry_run {
        let policy = executor.policy();
        info!(
            "Recipe '{}' plans {} step(s); {} retr(ies) per step, {}s apart",
            origin,
            executor.steps().len(),
            policy.retries,
            policy.delay.as_secs()
        );
        for step in executor.steps() {
            let describe = |refs: Vec<ArtifactRef>| {
                refs.iter()
                    .map(|r| r.path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            info!(
                step = step.id(),
                inputs = %describe(step.inputs()),
                outputs = %describe(step.outputs()),
                log = %recipe.log_path(step.id()).display(),
                "Planned step"
            );
        }
        return Ok(());
    }

    let metrics_handle = executor.metrics();
    let progress = |progress: StepProgress<'_>| {
        info!(
            "[{}/{}] {} (attempt {})",
            progress.step_index + 1,
            progress.total_steps,
            progress.step_id,
            progress.attempt
        );
    };
    let outcome = executor.execute_with_progress(progress);

    export_metrics(&metrics_handle.snapshot(), &export)?;

    let result = outcome?;
    for step in &result.steps {
        info!(
            step = step.report.step,
            attempts = step.attempts,
            "{}",
            step.report.summary
        );
    }
    info!(
        metrics = %recipe.artifacts.metrics.display(),
        results = %recipe.artifacts.results_dir.display(),
        "Pipeline completed"
    );
    Ok(())
}

fn export_metrics(snapshot: &MetricsSnapshot, export: &MetricsExport) -> Result<()> {
    if export.print {
        snapshot.log();
    }
    if let Some(path) = &export.json {
        create_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &export.prometheus {
        create_parent(path)?;
        fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn step_command(command: StepCommands, level: LevelFilter) -> Result<()> {
    match command {
        StepCommands::Load { input, output, log } => {
            let log = log.unwrap_or_else(|| default_log(steps::LOAD_DATA));
            run_logged(&log, level, || steps::load(&input, &output))
                .context("Step 'load_data' failed")?;
        }
        StepCommands::Preprocess { input, output, log } => {
            let log = log.unwrap_or_else(|| default_log(steps::PREPROCESS_DATA));
            run_logged(&log, level, || steps::preprocess(&input, &output))
                .context("Step 'preprocess_data' failed")?;
        }
        StepCommands::Train {
            input,
            model,
            test_features,
            test_labels,
            test_size,
            seed,
            log,
        } => {
            let log = log.unwrap_or_else(|| default_log(steps::TRAIN_MODEL));
            let training = TrainingSpec {
                test_size,
                seed,
                ..TrainingSpec::default()
            };
            run_logged(&log, level, || {
                steps::train(&input, &model, &test_features, &test_labels, &training)
            })
            .context("Step 'train_model' failed")?;
        }
        StepCommands::Evaluate {
            model,
            test_features,
            test_labels,
            metrics,
            log,
        } => {
            let log = log.unwrap_or_else(|| default_log(steps::CALC_METRICS));
            run_logged(&log, level, || {
                steps::evaluate(&model, &test_features, &test_labels, &metrics)
            })
            .context("Step 'calc_metrics' failed")?;
        }
        StepCommands::Publish {
            model,
            metrics,
            dest,
            log,
        } => {
            let log = log.unwrap_or_else(|| default_log(steps::SAVE_RESULTS));
            run_logged(&log, level, || steps::publish(&model, &metrics, &dest))
                .context("Step 'save_results' failed")?;
        }
    }
    Ok(())
}

fn default_log(step_id: &str) -> PathBuf {
    Recipe::default().log_path(step_id)
}

fn list_steps() {
    println!("Pipeline steps:");
    for (idx, id) in STEP_IDS.iter().enumerate() {
        println!("{}. {id}", idx + 1);
    }
}

fn validate_recipe_cmd(recipe_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let report = validate_recipe(&recipe);
    if !log_findings(&recipe_path, &report) {
        bail!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        );
    }
    info!(file = %recipe_path.display(), "Recipe validation passed");
    Ok(())
}

/// Logs warnings and errors against `file`; true when there were no errors.
fn log_findings(file: &Path, report: &ValidationReport) -> bool {
    for warning in &report.warnings {
        warn!(file = %file.display(), "{warning}");
    }
    for problem in &report.errors {
        error!(file = %file.display(), "{problem}");
    }
    report.is_ok()
}

fn recipe_command(command: RecipeCommands) -> Result<()> {
    match command {
        RecipeCommands::New { output } => {
            let destination = output.unwrap_or_else(|| PathBuf::from("recipes/default.yaml"));
            let generated = generate_recipe(&destination)?;
            info!(path = %generated.display(), "Recipe generated");
            Ok(())
        }
        RecipeCommands::Lint { recipes } => lint_recipes(&recipes),
    }
}

/// Validation plus a look at each recipe's source data, so a run would not
/// fail on its first step.
fn lint_recipes(recipes: &[PathBuf]) -> Result<()> {
    if recipes.is_empty() {
        bail!("No recipe files supplied for linting");
    }

    let failed: Vec<String> = recipes
        .iter()
        .filter(|path| !lint_recipe(path))
        .map(|path| path.display().to_string())
        .collect();
    if !failed.is_empty() {
        bail!("Lint failed for {}", failed.join(", "));
    }
    info!("{} recipe(s) ready to run", recipes.len());
    Ok(())
}

fn lint_recipe(path: &Path) -> bool {
    let recipe = match Recipe::load(path) {
        Ok(recipe) => recipe,
        Err(err) => {
            error!(file = %path.display(), "{err:#}");
            return false;
        }
    };
    let mut report = validate_recipe(&recipe);
    report.merge(check_source(&recipe));
    log_findings(path, &report)
}

#[derive(Parser)]
#[command(
    name = "diagnosis-etl",
    version,
    about = "Breast-cancer diagnosis training pipeline: load, preprocess, train, evaluate, publish"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all five steps in order with retries.
    Run {
        #[arg(long, value_hint = ValueHint::FilePath)]
        recipe: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        retries: Option<u32>,
        #[arg(long = "retry-delay-secs")]
        retry_delay_secs: Option<u64>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
    },
    /// Run a single step against explicit paths.
    Step {
        #[arg(long, default_value = "info")]
        log_level: String,
        #[command(subcommand)]
        step: StepCommands,
    },
    ListSteps,
    Validate {
        recipe: PathBuf,
    },
    Recipe {
        #[command(subcommand)]
        action: RecipeCommands,
    },
}

#[derive(Subcommand)]
enum StepCommands {
    Load {
        #[arg(long, default_value = "data/data.csv")]
        input: PathBuf,
        #[arg(long, default_value = "data/loaded.bin")]
        output: PathBuf,
        #[arg(long)]
        log: Option<PathBuf>,
    },
    Preprocess {
        #[arg(long, default_value = "data/loaded.bin")]
        input: PathBuf,
        #[arg(long, default_value = "data/preprocessed.bin")]
        output: PathBuf,
        #[arg(long)]
        log: Option<PathBuf>,
    },
    Train {
        #[arg(long, default_value = "data/preprocessed.bin")]
        input: PathBuf,
        #[arg(long, default_value = "results/model.safetensors")]
        model: PathBuf,
        #[arg(long = "test-features", default_value = "data/X_test.safetensors")]
        test_features: PathBuf,
        #[arg(long = "test-labels", default_value = "data/y_test.safetensors")]
        test_labels: PathBuf,
        #[arg(long = "test-size", default_value_t = 0.2)]
        test_size: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long)]
        log: Option<PathBuf>,
    },
    Evaluate {
        #[arg(long, default_value = "results/model.safetensors")]
        model: PathBuf,
        #[arg(long = "test-features", default_value = "data/X_test.safetensors")]
        test_features: PathBuf,
        #[arg(long = "test-labels", default_value = "data/y_test.safetensors")]
        test_labels: PathBuf,
        #[arg(long, default_value = "results/metrics.json")]
        metrics: PathBuf,
        #[arg(long)]
        log: Option<PathBuf>,
    },
    Publish {
        #[arg(long, default_value = "results/model.safetensors")]
        model: PathBuf,
        #[arg(long, default_value = "results/metrics.json")]
        metrics: PathBuf,
        #[arg(long, default_value = "results")]
        dest: PathBuf,
        #[arg(long)]
        log: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    New {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Lint {
        #[arg(required = true)]
        recipes: Vec<PathBuf>,
    },
}
