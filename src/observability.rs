//! Run metrics. Every step attempt is folded into per-step totals as soon as
//! its outcome is known; a snapshot can be logged, dumped as JSON or rendered
//! in Prometheus text exposition format.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::PipelineError;

const PREFIX: &str = "diagnosis_etl";

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub steps: BTreeMap<String, StepMetrics>,
    pub total_duration_ms: f64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StepMetrics {
    pub attempts: u64,
    pub failures: u64,
    /// Failed attempts keyed by error kind (`io`, `fit`, ...).
    pub failures_by_kind: BTreeMap<String, u64>,
    /// Whether the most recent attempt succeeded.
    pub succeeded: bool,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

impl StepMetrics {
    pub fn retries(&self) -> u64 {
        self.attempts.saturating_sub(1)
    }
}

/// Shared handle; clones record into the same snapshot.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(
        &self,
        step_id: &str,
        elapsed: Duration,
        outcome: Result<(), &PipelineError>,
    ) {
        let elapsed_ms = elapsed.as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.inner.lock() {
            let step = guard.steps.entry(step_id.to_string()).or_default();
            step.attempts += 1;
            step.total_duration_ms += elapsed_ms;
            step.max_duration_ms = step.max_duration_ms.max(elapsed_ms);
            step.succeeded = outcome.is_ok();
            if let Err(err) = outcome {
                step.failures += 1;
                *step.failures_by_kind.entry(err.kind().to_string()).or_default() += 1;
            }
        }
        debug!(step = step_id, elapsed_ms, ok = outcome.is_ok(), "Attempt recorded");
    }

    pub fn record_run(&self, succeeded: bool, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
            if succeeded {
                guard.runs_succeeded += 1;
            } else {
                guard.runs_failed += 1;
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

impl MetricsSnapshot {
    pub fn log(&self) {
        let outcome = if self.runs_failed > 0 { "failed" } else { "succeeded" };
        info!(
            "Run {outcome} in {:.1} ms across {} step(s)",
            self.total_duration_ms,
            self.steps.len()
        );
        for (step, metrics) in &self.steps {
            info!(
                "{step}: {} attempt(s), {} retry(ies), {:.1} ms total, {:.1} ms slowest{}",
                metrics.attempts,
                metrics.retries(),
                metrics.total_duration_ms,
                metrics.max_duration_ms,
                if metrics.succeeded { "" } else { ", last attempt failed" }
            );
        }
    }

    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        family(
            &mut out,
            "runs_total",
            "counter",
            "Pipeline runs by outcome",
            vec![
                ("outcome=\"success\"".to_string(), self.runs_succeeded.to_string()),
                ("outcome=\"failure\"".to_string(), self.runs_failed.to_string()),
            ],
        );
        family(
            &mut out,
            "step_attempts_total",
            "counter",
            "Step attempts, retries included",
            self.by_step(|m| m.attempts.to_string()),
        );
        family(
            &mut out,
            "step_retries_total",
            "counter",
            "Attempts beyond the first",
            self.by_step(|m| m.retries().to_string()),
        );
        let failures = self
            .steps
            .iter()
            .flat_map(|(step, m)| {
                m.failures_by_kind.iter().map(move |(kind, n)| {
                    (format!("step=\"{step}\",kind=\"{kind}\""), n.to_string())
                })
            })
            .collect();
        family(
            &mut out,
            "step_failures_total",
            "counter",
            "Failed step attempts by error kind",
            failures,
        );
        family(
            &mut out,
            "step_duration_seconds_total",
            "counter",
            "Time spent in step attempts",
            self.by_step(|m| format!("{:.6}", m.total_duration_ms / 1_000.0)),
        );
        family(
            &mut out,
            "step_duration_seconds_max",
            "gauge",
            "Slowest single attempt",
            self.by_step(|m| format!("{:.6}", m.max_duration_ms / 1_000.0)),
        );
        family(
            &mut out,
            "pipeline_duration_seconds",
            "gauge",
            "Wall time of the last run",
            vec![(String::new(), format!("{:.6}", self.total_duration_ms / 1_000.0))],
        );
        out
    }

    fn by_step(&self, value: impl Fn(&StepMetrics) -> String) -> Vec<(String, String)> {
        self.steps
            .iter()
            .map(|(step, m)| (format!("step=\"{step}\""), value(m)))
            .collect()
    }
}

fn family(
    out: &mut String,
    name: &str,
    kind: &str,
    help: &str,
    samples: Vec<(String, String)>,
) {
    let _ = writeln!(out, "# HELP {PREFIX}_{name} {help}");
    let _ = writeln!(out, "# TYPE {PREFIX}_{name} {kind}");
    for (labels, value) in samples {
        if labels.is_empty() {
            let _ = writeln!(out, "{PREFIX}_{name} {value}");
        } else {
            let _ = writeln!(out, "{PREFIX}_{name}{{{labels}}} {value}");
        }
    }
}
