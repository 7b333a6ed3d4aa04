//! Binary logistic regression with an L2 penalty.
//!
//! The objective is `0.5 * |w|^2 + C * sum(log_loss)` with an unpenalized
//! intercept, minimised by Newton iterations with a backtracking line search.
//! Fitting is best-effort: when `max_iter` runs out before the gradient falls
//! under `tol`, the last iterate is kept and [`FitReport::converged`] is false.

use std::collections::HashMap;
use std::path::Path;

use ndarray::{Array1, Array2, Axis, s};
use serde::{Deserialize, Serialize};

use crate::artifact::{TensorEntry, TensorFile, write_safetensors};
use crate::dataset::FeatureMatrix;
use crate::error::{PipelineError, StepResult};

const MODEL_NAME: &str = "logistic_regression";
const ARMIJO: f64 = 1e-4;
const MAX_HALVINGS: usize = 50;
const HESSIAN_JITTER: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitParams {
    /// Inverse regularization strength.
    pub c: f64,
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            max_iter: 1000,
            tol: 1e-4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub iterations: usize,
    pub converged: bool,
    pub final_loss: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogisticRegression {
    feature_names: Vec<String>,
    coef: Array1<f64>,
    intercept: f64,
    c: f64,
    report: FitReport,
}

impl LogisticRegression {
    pub fn fit(
        features: &FeatureMatrix,
        labels: &Array1<i64>,
        params: FitParams,
    ) -> StepResult<Self> {
        let n = features.n_rows();
        let d = features.n_features();
        if n == 0 {
            return Err(PipelineError::Fit("cannot fit on an empty partition".into()));
        }
        if labels.len() != n {
            return Err(PipelineError::Fit(format!(
                "{} labels for {n} feature rows",
                labels.len()
            )));
        }
        if labels.iter().any(|&l| l != 0 && l != 1) {
            return Err(PipelineError::Fit("labels must be 0 or 1".into()));
        }
        if labels.iter().all(|&l| l == labels[0]) {
            return Err(PipelineError::Fit(
                "training partition contains a single class".into(),
            ));
        }

        if features.values.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::Fit(
                "feature matrix contains non-finite values".into(),
            ));
        }

        let bias = Array2::<f64>::ones((n, 1));
        let x = ndarray::concatenate(Axis(1), &[features.values.view(), bias.view()])
            .map_err(|err| PipelineError::Fit(format!("cannot build design matrix: {err}")))?;
        let y = labels.mapv(|l| l as f64);
        let mut w = Array1::<f64>::zeros(d + 1);
        let mut loss = objective(&x, &y, &w, params.c);
        if !loss.is_finite() {
            return Err(PipelineError::Fit(format!("initial loss is {loss}")));
        }
        let mut converged = false;
        let mut iterations = 0;

        while iterations < params.max_iter {
            let p = sigmoid(&x.dot(&w));
            let grad = gradient(&x, &y, &p, &w, params.c);
            let grad_norm = max_abs(&grad);
            if !grad_norm.is_finite() {
                return Err(PipelineError::Fit(format!(
                    "gradient is not finite after {iterations} iteration(s)"
                )));
            }
            if grad_norm <= params.tol {
                converged = true;
                break;
            }
            iterations += 1;

            let hessian = hessian(&x, &p, params.c);
            let direction = solve(hessian, grad.clone())?;
            let slope = grad.dot(&direction);

            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_HALVINGS {
                let candidate = &w - &(&direction * step);
                let candidate_loss = objective(&x, &y, &candidate, params.c);
                if candidate_loss <= loss - ARMIJO * step * slope {
                    accepted = Some((candidate, candidate_loss));
                    break;
                }
                step *= 0.5;
            }
            match accepted {
                Some((next, next_loss)) => {
                    w = next;
                    loss = next_loss;
                }
                // No descent along the Newton direction at this precision.
                None => break,
            }
        }

        if !converged && iterations >= params.max_iter {
            let p = sigmoid(&x.dot(&w));
            converged = max_abs(&gradient(&x, &y, &p, &w, params.c)) <= params.tol;
        }

        Ok(Self {
            feature_names: features.columns.clone(),
            coef: w.slice(s![..d]).to_owned(),
            intercept: w[d],
            c: params.c,
            report: FitReport {
                iterations,
                converged,
                final_loss: loss,
            },
        })
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coef
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn report(&self) -> FitReport {
        self.report
    }

    /// Fails when `features` was not laid out like the training matrix.
    pub fn check_features(&self, features: &FeatureMatrix) -> StepResult<()> {
        if features.columns.len() != self.feature_names.len() {
            return Err(PipelineError::Consistency(format!(
                "model expects {} features, got {}",
                self.feature_names.len(),
                features.columns.len()
            )));
        }
        if let Some((pos, (expected, got))) = self
            .feature_names
            .iter()
            .zip(&features.columns)
            .enumerate()
            .find(|(_, (expected, got))| expected != got)
        {
            return Err(PipelineError::Consistency(format!(
                "feature {pos} is '{got}', model was trained on '{expected}'"
            )));
        }
        if features.n_features() != self.coef.len() {
            return Err(PipelineError::Consistency(format!(
                "feature matrix has {} columns, model has {} coefficients",
                features.n_features(),
                self.coef.len()
            )));
        }
        Ok(())
    }

    pub fn decision_function(&self, features: &FeatureMatrix) -> StepResult<Array1<f64>> {
        self.check_features(features)?;
        Ok(features.values.dot(&self.coef) + self.intercept)
    }

    pub fn predict(&self, features: &FeatureMatrix) -> StepResult<Array1<i64>> {
        Ok(self
            .decision_function(features)?
            .mapv(|z| if z > 0.0 { 1 } else { 0 }))
    }

    pub fn save(&self, path: &Path) -> StepResult<()> {
        let mut metadata = HashMap::new();
        metadata.insert("model".to_string(), MODEL_NAME.to_string());
        metadata.insert(
            "feature_names".to_string(),
            serde_json::to_string(&self.feature_names).unwrap_or_else(|_| "[]".into()),
        );
        metadata.insert("classes".to_string(), "[0,1]".to_string());
        metadata.insert("penalty".to_string(), "l2".to_string());
        metadata.insert("c".to_string(), self.c.to_string());
        metadata.insert("iterations".to_string(), self.report.iterations.to_string());
        metadata.insert("converged".to_string(), self.report.converged.to_string());
        metadata.insert("final_loss".to_string(), self.report.final_loss.to_string());

        let entries = [
            TensorEntry::f64("coef", vec![self.coef.len()], self.coef.iter().copied()),
            TensorEntry::f64("intercept", vec![1], [self.intercept]),
        ];
        write_safetensors(path, &entries, metadata)
    }

    pub fn load(path: &Path) -> StepResult<Self> {
        let file = TensorFile::open(path)?;
        let kind = file.metadata("model")?;
        if kind != MODEL_NAME {
            return Err(PipelineError::parse(
                path,
                format!("unsupported model type '{kind}'"),
            ));
        }
        let feature_names: Vec<String> = file.metadata_json("feature_names")?;
        let (_, coef) = file.f64_tensor("coef")?;
        let (_, intercept) = file.f64_tensor("intercept")?;
        let intercept = *intercept
            .first()
            .ok_or_else(|| PipelineError::parse(path, "empty intercept tensor"))?;
        if coef.len() != feature_names.len() {
            return Err(PipelineError::parse(
                path,
                format!(
                    "{} coefficients for {} feature names",
                    coef.len(),
                    feature_names.len()
                ),
            ));
        }
        let number = |key: &str| -> StepResult<f64> {
            file.metadata(key)?.parse().map_err(|_| {
                PipelineError::parse(path, format!("metadata '{key}' is not a number"))
            })
        };
        let report = FitReport {
            iterations: number("iterations")? as usize,
            converged: file.metadata("converged")? == "true",
            final_loss: number("final_loss")?,
        };
        Ok(Self {
            feature_names,
            coef: Array1::from(coef),
            intercept,
            c: number("c")?,
            report,
        })
    }
}

fn sigmoid(z: &Array1<f64>) -> Array1<f64> {
    z.mapv(|v| {
        if v >= 0.0 {
            1.0 / (1.0 + (-v).exp())
        } else {
            let e = v.exp();
            e / (1.0 + e)
        }
    })
}

fn softplus(v: f64) -> f64 {
    if v > 0.0 {
        v + (-v).exp().ln_1p()
    } else {
        v.exp().ln_1p()
    }
}

fn penalty_mask(w: &Array1<f64>) -> Array1<f64> {
    let mut masked = w.clone();
    if let Some(last) = masked.last_mut() {
        *last = 0.0;
    }
    masked
}

fn objective(x: &Array2<f64>, y: &Array1<f64>, w: &Array1<f64>, c: f64) -> f64 {
    let z = x.dot(w);
    let data_loss: f64 = z
        .iter()
        .zip(y.iter())
        .map(|(&z, &y)| softplus(z) - y * z)
        .sum();
    let reg = penalty_mask(w);
    0.5 * reg.dot(&reg) + c * data_loss
}

fn gradient(
    x: &Array2<f64>,
    y: &Array1<f64>,
    p: &Array1<f64>,
    w: &Array1<f64>,
    c: f64,
) -> Array1<f64> {
    x.t().dot(&(p - y)) * c + penalty_mask(w)
}

fn hessian(x: &Array2<f64>, p: &Array1<f64>, c: f64) -> Array2<f64> {
    let weights = p.mapv(|v| v * (1.0 - v) * c);
    let weighted = x * &weights.insert_axis(Axis(1));
    let mut h = x.t().dot(&weighted);
    let dim = h.nrows();
    for i in 0..dim {
        // The intercept is not penalized.
        let penalty = if i + 1 < dim { 1.0 } else { 0.0 };
        h[[i, i]] += penalty + HESSIAN_JITTER;
    }
    h
}

/// NaN propagates instead of being dropped by `f64::max`.
fn max_abs(v: &Array1<f64>) -> f64 {
    if v.iter().any(|x| x.is_nan()) {
        return f64::NAN;
    }
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> StepResult<Array1<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))
            .unwrap_or(col);
        if a[[pivot, col]].abs() < 1e-14 {
            return Err(PipelineError::Fit(
                "Hessian is singular; features may be degenerate".into(),
            ));
        }
        if pivot != col {
            for k in 0..n {
                a.swap([col, k], [pivot, k]);
            }
            b.swap(col, pivot);
        }
        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = Array1::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[[row, k]] * x[k]).sum();
        x[row] = (b[row] - tail) / a[[row, row]];
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    fn separable() -> (FeatureMatrix, Array1<i64>) {
        let values = array![
            [-2.0, -1.0],
            [-1.5, -0.5],
            [-1.0, -1.5],
            [-0.5, 0.2],
            [0.4, -0.2],
            [1.0, 1.5],
            [1.5, 0.5],
            [2.0, 1.0],
        ];
        (
            FeatureMatrix {
                columns: vec!["x1".into(), "x2".into()],
                values,
            },
            array![0, 0, 0, 0, 1, 1, 1, 1],
        )
    }

    #[test]
    fn fits_and_predicts_separable_data() {
        let (features, labels) = separable();
        let model = LogisticRegression::fit(&features, &labels, FitParams::default()).unwrap();
        assert!(model.report().converged);
        assert!(model.report().iterations < 100);
        assert_eq!(model.predict(&features).unwrap(), labels);
        let margins = model.decision_function(&features).unwrap();
        assert!(margins.iter().all(|z| z.is_finite()));
    }

    #[test]
    fn stronger_regularization_shrinks_weights() {
        let (features, labels) = separable();
        let loose = LogisticRegression::fit(&features, &labels, FitParams::default()).unwrap();
        let tight = LogisticRegression::fit(
            &features,
            &labels,
            FitParams {
                c: 0.01,
                ..FitParams::default()
            },
        )
        .unwrap();
        let norm = |m: &LogisticRegression| m.coefficients().dot(m.coefficients());
        assert!(norm(&tight) < norm(&loose));
    }

    #[test]
    fn iteration_cap_is_best_effort() {
        let (features, labels) = separable();
        let model = LogisticRegression::fit(
            &features,
            &labels,
            FitParams {
                max_iter: 1,
                tol: 1e-12,
                ..FitParams::default()
            },
        )
        .unwrap();
        assert_eq!(model.report().iterations, 1);
        assert!(!model.report().converged);
    }

    #[test]
    fn non_finite_features_are_rejected() {
        let (mut features, labels) = separable();
        features.values[[2, 0]] = f64::INFINITY;
        features.values[[5, 1]] = f64::NAN;
        assert!(matches!(
            LogisticRegression::fit(&features, &labels, FitParams::default()),
            Err(PipelineError::Fit(_))
        ));
    }

    #[test]
    fn overflowing_gradient_is_a_fit_error() {
        // Five rows pull the gradient the same way; their sum exceeds f64::MAX.
        let features = FeatureMatrix {
            columns: vec!["area".into()],
            values: Array2::from_elem((6, 1), f64::MAX),
        };
        let labels = array![0, 0, 0, 0, 0, 1];
        let err = LogisticRegression::fit(&features, &labels, FitParams::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Fit(_)), "{err}");
    }

    #[test]
    fn max_abs_keeps_nan() {
        assert!(max_abs(&array![0.5, f64::NAN, -2.0]).is_nan());
        assert_eq!(max_abs(&array![0.5, -2.0]), 2.0);
    }

    #[test]
    fn single_class_is_rejected() {
        let (features, _) = separable();
        let labels = Array1::from(vec![1; 8]);
        assert!(matches!(
            LogisticRegression::fit(&features, &labels, FitParams::default()),
            Err(PipelineError::Fit(_))
        ));
    }

    #[test]
    fn column_order_mismatch_is_a_consistency_error() {
        let (features, labels) = separable();
        let model = LogisticRegression::fit(&features, &labels, FitParams::default()).unwrap();
        let mut swapped = features.clone();
        swapped.columns.reverse();
        assert!(matches!(
            model.predict(&swapped),
            Err(PipelineError::Consistency(_))
        ));
    }

    #[test]
    fn saved_model_predicts_identically() {
        let (features, labels) = separable();
        let model = LogisticRegression::fit(&features, &labels, FitParams::default()).unwrap();
        let temp = tempdir().unwrap();
        let path = temp.path().join("results/model.safetensors");
        model.save(&path).unwrap();

        let restored = LogisticRegression::load(&path).unwrap();
        assert_eq!(restored, model);
    }

    #[test]
    fn solver_handles_pivoting() {
        let a = array![[0.0, 2.0], [3.0, 1.0]];
        let b = array![4.0, 5.0];
        let x = solve(a, b).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
    }
}
