use std::io;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::artifact::ArtifactRef;
use crate::error::{PipelineError, StepResult};
use crate::observability::MetricsCollector;
use crate::recipe::Recipe;
use crate::scheduler::{GiveUpReason, RetryDecision, RetryPolicy};
use crate::steps::{Step, StepContext, StepReport, default_steps, run_step};

/// Progress notification emitted before each step attempt.
#[derive(Debug, Clone, Copy)]
pub struct StepProgress<'a> {
    pub step_index: usize,
    pub total_steps: usize,
    pub step_id: &'a str,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub report: StepReport,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub steps: Vec<StepOutcome>,
}

/// Runs steps strictly in order. A step is retried per the [`RetryPolicy`];
/// once a step gives up no later step runs.
pub struct PipelineExecutor {
    steps: Vec<Box<dyn Step>>,
    ctx: StepContext,
    policy: RetryPolicy,
    metrics: MetricsCollector,
}

impl PipelineExecutor {
    pub fn new(steps: Vec<Box<dyn Step>>, ctx: StepContext, policy: RetryPolicy) -> Self {
        Self {
            steps,
            ctx,
            policy,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn from_recipe(recipe: &Recipe) -> Self {
        Self::new(
            default_steps(recipe),
            StepContext::from_recipe(recipe),
            RetryPolicy::from_spec(&recipe.retry),
        )
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn execute(&self) -> Result<PipelineResult> {
        self.execute_with_progress(|_| {})
    }

    pub fn execute_with_progress<F>(&self, mut progress: F) -> Result<PipelineResult>
    where
        F: FnMut(StepProgress<'_>),
    {
        self.metrics.reset();
        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(self.steps.len());

        for (index, step) in self.steps.iter().enumerate() {
            let outcome = self.run_with_retries(step.as_ref(), |attempt| {
                progress(StepProgress {
                    step_index: index,
                    total_steps: self.steps.len(),
                    step_id: step.id(),
                    attempt,
                })
            });
            match outcome {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    self.metrics.record_run(false, started.elapsed());
                    let skipped: Vec<&str> =
                        self.steps[index + 1..].iter().map(|s| s.id()).collect();
                    if !skipped.is_empty() {
                        warn!("Skipping downstream step(s): {}", skipped.join(", "));
                    }
                    return Err(err);
                }
            }
        }

        self.metrics.record_run(true, started.elapsed());
        Ok(PipelineResult { steps: outcomes })
    }

    #[instrument(skip_all, fields(step = step.id()))]
    fn run_with_retries(
        &self,
        step: &dyn Step,
        mut on_attempt: impl FnMut(u32),
    ) -> Result<StepOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            on_attempt(attempt);
            info!(attempt, max_attempts = self.policy.max_attempts(), "Starting step");

            let started = Instant::now();
            let result = run_step(step, &self.ctx).and_then(|report| {
                verify_outputs(&step.outputs())?;
                Ok(report)
            });
            self.metrics
                .record_attempt(step.id(), started.elapsed(), result.as_ref().map(|_| ()));

            let err = match result {
                Ok(report) => {
                    info!(attempt, summary = report.summary.as_str(), "Step succeeded");
                    return Ok(StepOutcome {
                        report,
                        attempts: attempt,
                    });
                }
                Err(err) => err,
            };

            match self.policy.decide(attempt, &err) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        attempt,
                        error = %err,
                        "Step failed; retrying in {}s",
                        delay.as_secs_f64()
                    );
                    thread::sleep(delay);
                }
                RetryDecision::GiveUp { reason } => {
                    if reason == GiveUpReason::NotRetryable {
                        warn!(
                            error = %err,
                            kind = err.kind(),
                            "Step failed with a non-retryable error"
                        );
                    }
                    return Err(anyhow::Error::new(err)).with_context(|| {
                        format!("Step '{}' failed after {attempt} attempt(s)", step.id())
                    });
                }
            }
        }
    }
}

fn verify_outputs(outputs: &[ArtifactRef]) -> StepResult<()> {
    match outputs.iter().find(|artifact| !artifact.exists()) {
        Some(missing) => Err(PipelineError::io(
            &missing.path,
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("declared {} output was not written", missing.kind),
            ),
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactKind;
    use std::cell::Cell;
    use std::path::PathBuf;
    use std::rc::Rc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tracing_subscriber::filter::LevelFilter;

    struct FlakyStep {
        id: &'static str,
        output: PathBuf,
        failures_left: Rc<Cell<u32>>,
        calls: Rc<Cell<u32>>,
        error: fn() -> PipelineError,
    }

    impl Step for FlakyStep {
        fn id(&self) -> &'static str {
            self.id
        }

        fn inputs(&self) -> Vec<ArtifactRef> {
            Vec::new()
        }

        fn outputs(&self) -> Vec<ArtifactRef> {
            vec![ArtifactRef::new(&self.output, ArtifactKind::Metrics)]
        }

        fn execute(&self) -> StepResult<StepReport> {
            self.calls.set(self.calls.get() + 1);
            if self.failures_left.get() > 0 {
                self.failures_left.set(self.failures_left.get() - 1);
                return Err((self.error)());
            }
            std::fs::write(&self.output, b"{}")
                .map_err(|err| PipelineError::io(&self.output, err))?;
            Ok(StepReport {
                step: self.id,
                summary: "ok".into(),
            })
        }
    }

    fn flaky(
        dir: &std::path::Path,
        id: &'static str,
        failures: u32,
        error: fn() -> PipelineError,
    ) -> (FlakyStep, Rc<Cell<u32>>) {
        let calls = Rc::new(Cell::new(0));
        (
            FlakyStep {
                id,
                output: dir.join(format!("{id}.out")),
                failures_left: Rc::new(Cell::new(failures)),
                calls: calls.clone(),
                error,
            },
            calls,
        )
    }

    fn executor(
        dir: &std::path::Path,
        steps: Vec<Box<dyn Step>>,
        retries: u32,
    ) -> PipelineExecutor {
        PipelineExecutor::new(
            steps,
            StepContext::new(dir.join("logs"), LevelFilter::INFO),
            RetryPolicy::new(retries, Duration::ZERO),
        )
    }

    #[test]
    fn transient_failure_is_retried() {
        let temp = tempdir().unwrap();
        let (step, calls) = flaky(temp.path(), "load_data", 1, || {
            PipelineError::Compute("transient".into())
        });
        let exec = executor(temp.path(), vec![Box::new(step)], 2);

        let result = exec.execute().unwrap();
        assert_eq!(result.steps[0].attempts, 2);
        assert_eq!(calls.get(), 2);
        let snapshot = exec.metrics().snapshot();
        assert_eq!(snapshot.steps["load_data"].attempts, 2);
        assert_eq!(snapshot.steps["load_data"].failures, 1);
        assert_eq!(snapshot.steps["load_data"].failures_by_kind["compute"], 1);
        assert!(snapshot.steps["load_data"].succeeded);
        assert_eq!(snapshot.runs_succeeded, 1);
    }

    #[test]
    fn exhausted_retries_halt_downstream_steps() {
        let temp = tempdir().unwrap();
        let (first, first_calls) =
            flaky(temp.path(), "train_model", 10, || PipelineError::Fit("single class".into()));
        let (second, second_calls) =
            flaky(temp.path(), "calc_metrics", 0, || PipelineError::Fit("unused".into()));
        let exec = executor(temp.path(), vec![Box::new(first), Box::new(second)], 2);

        let err = exec.execute().unwrap_err();
        assert!(err.to_string().contains("train_model"));
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Fit(_))
        ));
        assert_eq!(first_calls.get(), 3);
        assert_eq!(second_calls.get(), 0);
    }

    #[test]
    fn consistency_errors_fail_on_first_attempt() {
        let temp = tempdir().unwrap();
        let (step, calls) = flaky(temp.path(), "calc_metrics", 5, || {
            PipelineError::Consistency("feature mismatch".into())
        });
        let exec = executor(temp.path(), vec![Box::new(step)], 2);

        assert!(exec.execute().is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn progress_reports_every_attempt() {
        let temp = tempdir().unwrap();
        let (step, _) = flaky(temp.path(), "load_data", 1, || PipelineError::Compute("x".into()));
        let exec = executor(temp.path(), vec![Box::new(step)], 1);

        let mut seen = Vec::new();
        exec.execute_with_progress(|p| seen.push((p.step_id.to_string(), p.attempt)))
            .unwrap();
        assert_eq!(
            seen,
            vec![("load_data".to_string(), 1), ("load_data".to_string(), 2)]
        );
    }

    #[test]
    fn step_errors_reach_the_step_log() {
        let temp = tempdir().unwrap();
        let (step, _) = flaky(temp.path(), "train_model", 1, || {
            PipelineError::Fit("single class".into())
        });
        let exec = executor(temp.path(), vec![Box::new(step)], 0);
        assert!(exec.execute().is_err());

        let log = std::fs::read_to_string(temp.path().join("logs/train_model.log")).unwrap();
        assert!(log.contains("ERROR - fit error: single class"), "{log}");
    }
}
