//! # Model Estimation via Penalized Least Squares and Marginal Likelihood
//!
//! This module fits the Gaussian additive model. For fixed log-smoothing
//! parameters `rho` the coefficients solve the penalized normal equations
//! `(X'X + S_lambda) beta = X'y` directly. The smoothing parameters are
//! chosen by maximizing the Laplace approximate marginal likelihood ("ML")
//! with the scale parameter profiled out:
//!
//! `-ML(rho) = 1/2 [ m log(2 pi D_p / m) + m + log|H_rr| - log|S_rr|_+ ]`
//!
//! where `D_p` is the penalized residual sum of squares and the `rr` blocks
//! are restricted to the penalized coefficients, so the intercept and factor
//! contrasts act as fixed effects. `m = n - M`, with `M` the dimension of the
//! null space left unpenalized inside the penalized block (zero with
//! `select`). The outer optimization is BFGS over a
//! bounded reparameterisation `rho = B tanh(z / B)` using the exact gradient.

// External Crate for Optimization
use wolfe_bfgs::{Bfgs, BfgsSolution};

use crate::basis;
use crate::construction::{DesignMatrices, build_design};
use crate::data::Observations;
use crate::model::{FittedModel, ModelError, ModelSpec};

use ndarray::{Array1, Array2, Axis, s};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Cholesky, Eigh, Inverse, Solve, UPLO};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A comprehensive error type for the model fitting process.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Underlying basis function generation failed: {0}")]
    BasisError(#[from] basis::BasisError),

    #[error("Design evaluation failed: {0}")]
    ModelError(#[from] ModelError),

    #[error("A linear system solve failed. The penalized Hessian may be singular. Error: {0}")]
    LinearSystemSolveFailed(#[from] LinalgError),

    #[error(
        "The parametric part of the design is rank deficient: rank {rank} for {columns} columns. Check for confounded factor levels."
    )]
    RankDeficient { rank: usize, columns: usize },

    #[error(
        "Term '{term}' asks for a basis dimension of {k}, but its covariate has only {unique} unique values."
    )]
    BasisDimensionExceedsData { term: String, k: usize, unique: usize },

    #[error("Term '{term}' has basis dimension {k}, which is too small for a degree {degree} spline.")]
    BasisDimensionTooSmall { term: String, k: usize, degree: usize },

    #[error("Only {n} observations are available for {required} parametric coefficients.")]
    TooFewObservations { n: usize, required: usize },

    #[error("Smoothing parameter optimization failed: {0}")]
    OptimizationFailed(String),
}

/// Settings for the smoothing parameter search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub max_iterations: usize,
    /// Gradient-norm tolerance of the BFGS search.
    pub tolerance: f64,
    /// Log smoothing parameters are kept inside `(-rho_bound, rho_bound)`.
    pub rho_bound: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-5,
            rho_bound: 20.0,
        }
    }
}

/// Fits the model described by `spec` to `obs`.
///
/// The observations are only read.
pub fn fit_model(
    obs: &Observations,
    spec: &ModelSpec,
    config: &FitConfig,
) -> Result<FittedModel, FitError> {
    log::info!(
        "Starting model fit by marginal likelihood. {} total samples.",
        obs.len()
    );

    // 1. Build the one-time matrices and define the model structure.
    let design = build_design(obs, spec)?;

    // 2. Set up the ML optimization problem.
    let ml_state = Arc::new(internal::MlState::new(&design, config.rho_bound)?);
    let num_penalties = design.penalties.len();

    let rho = if num_penalties == 0 {
        Array1::zeros(0)
    } else {
        optimize_smoothing_parameters(ml_state.clone(), num_penalties, config)?
    };

    // 3. Refit once at the chosen smoothing parameters.
    let final_fit = ml_state.final_fit(&rho)?;
    drop(ml_state);
    let lambdas = rho.mapv(f64::exp);
    log::info!(
        "Final estimated smoothing parameters (lambda): {:?}",
        lambdas.to_vec()
    );

    let n = design.y.len() as f64;
    let fitted_values = design.x.dot(&final_fit.beta);
    let residuals = &design.y - &fitted_values;
    let rss = residuals.dot(&residuals);
    let total_edf = final_fit.edf.sum();
    let scale = rss / (n - total_edf).max(1.0);
    log::info!(
        "Fit complete: edf = {:.3}, scale = {:.5}, -ML = {:.4}",
        total_edf,
        scale,
        final_fit.ml_score
    );

    let DesignMatrices {
        y, layout, frame, ..
    } = design;

    Ok(FittedModel {
        spec: spec.clone(),
        layout,
        coefficients: final_fit.beta,
        covariance: final_fit.h_inverse * scale,
        lambdas: lambdas.to_vec(),
        scale,
        edf: final_fit.edf,
        ml_score: final_fit.ml_score,
        training: frame,
        response: y,
        fitted_values,
        residuals,
    })
}

fn optimize_smoothing_parameters(
    ml_state: Arc<internal::MlState<'_>>,
    num_penalties: usize,
    config: &FitConfig,
) -> Result<Array1<f64>, FitError> {
    let bound = config.rho_bound;

    // Pick the best of a few uniform starting points.
    let initial_rho = internal::rho_candidates(num_penalties)
        .into_iter()
        .filter_map(|rho| match ml_state.compute_cost(&rho) {
            Ok(cost) if cost.is_finite() => Some((cost, rho)),
            _ => None,
        })
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(cost, rho)| {
            log::info!("Initial ML cost: {:.6} at rho = {:.1}", cost, rho[0]);
            rho
        })
        .ok_or_else(|| {
            FitError::OptimizationFailed(
                "No starting point gave a finite marginal likelihood.".to_string(),
            )
        })?;
    let initial_z = internal::to_unbounded(&initial_rho, bound);

    let state_for_closure = ml_state.clone();
    let cost_and_grad = move |z: &Array1<f64>| -> (f64, Array1<f64>) {
        let rho = internal::to_bounded(z, bound);

        let cost = match state_for_closure.compute_cost(&rho) {
            Ok(cost) if cost.is_finite() => cost,
            Ok(cost) => {
                log::warn!("Non-finite cost encountered: {}, returning large finite value", cost);
                1e10
            }
            Err(e) => {
                log::warn!("Cost computation failed: {}, returning large finite value", e);
                1e10
            }
        };

        let grad = match state_for_closure.compute_gradient(&rho) {
            // Chain rule through rho = B tanh(z / B).
            Ok(g) => &g * &rho.mapv(|r| 1.0 - (r / bound).powi(2)),
            Err(_) => Array1::zeros(rho.len()),
        };

        (cost, grad)
    };

    log::debug!("Starting BFGS optimization with {} parameters...", num_penalties);
    match Bfgs::new(initial_z, cost_and_grad)
        .with_tolerance(config.tolerance)
        .with_max_iterations(config.max_iterations)
        .run()
    {
        Ok(BfgsSolution {
            final_value,
            iterations,
            ..
        }) => log::info!(
            "BFGS optimization completed in {} iterations with final value: {:.6}",
            iterations,
            final_value
        ),
        Err(e) => log::warn!(
            "BFGS stopped before convergence ({:?}); using the best point evaluated.",
            e
        ),
    }

    ml_state
        .best_rho()
        .ok_or_else(|| FitError::OptimizationFailed("No finite optimum was found.".to_string()))
}

/// Internal module for estimation logic.
mod internal {
    use super::*;

    const LOG_2PI: f64 = 1.837_877_066_409_345_3;

    /// Uniform log smoothing parameter starting values.
    pub(super) fn rho_candidates(num_penalties: usize) -> Vec<Array1<f64>> {
        [0.0, 2.0, -2.0, 4.0]
            .iter()
            .map(|&v| Array1::from_elem(num_penalties, v))
            .collect()
    }

    pub(super) fn to_bounded(z: &Array1<f64>, bound: f64) -> Array1<f64> {
        z.mapv(|v| bound * (v / bound).tanh())
    }

    pub(super) fn to_unbounded(rho: &Array1<f64>, bound: f64) -> Array1<f64> {
        rho.mapv(|r| bound * (r / bound).clamp(-0.999_999, 0.999_999).atanh())
    }

    /// Penalized fit at one value of `rho`.
    #[derive(Clone)]
    pub(super) struct Evaluation {
        pub(super) beta: Array1<f64>,
        pub(super) penalized_deviance: f64,
        pub(super) log_det_h_rr: f64,
        pub(super) h_rr_inverse: Array2<f64>,
    }

    pub(super) struct FinalFit {
        pub(super) beta: Array1<f64>,
        pub(super) h_inverse: Array2<f64>,
        pub(super) edf: Array1<f64>,
        pub(super) ml_score: f64,
    }

    /// Holds the state for the outer ML optimization.
    pub(super) struct MlState<'a> {
        design: &'a DesignMatrices,
        xtx: Array2<f64>,
        xty: Array1<f64>,
        /// Penalized coefficient indices.
        penalized: Vec<usize>,
        /// Offset of each penalty's block inside the penalized index set.
        penalty_offsets: Vec<usize>,
        /// `sum_j log|S_j|_+` at unit smoothing parameters.
        log_det_s_const: f64,
        /// Dimension of the unpenalized null space inside the penalized block.
        null_space_dim: usize,
        cache: RefCell<HashMap<Vec<u64>, Evaluation>>,
        best: RefCell<Option<(f64, Array1<f64>)>>,
    }

    impl<'a> MlState<'a> {
        pub(super) fn new(design: &'a DesignMatrices, rho_bound: f64) -> Result<Self, FitError> {
            if !(rho_bound > 0.0) {
                return Err(FitError::OptimizationFailed(format!(
                    "rho_bound must be positive, got {rho_bound}"
                )));
            }
            let xtx = design.x.t().dot(&design.x);
            let xty = design.x.t().dot(&design.y);
            let penalized = design.layout.penalized_columns();

            let penalty_offsets = design
                .penalties
                .iter()
                .map(|p| {
                    penalized
                        .iter()
                        .position(|&c| c == p.columns.start)
                        .ok_or_else(|| {
                            FitError::OptimizationFailed(format!(
                                "penalty '{}' acts outside the penalized columns",
                                p.label
                            ))
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            // The penalties of one term act on orthogonal subspaces, so the
            // pseudo-determinant factorizes into per-penalty terms.
            let mut log_det_s_const = 0.0;
            for penalty in &design.penalties {
                let (eigenvalues, _) = penalty.matrix.eigh(UPLO::Lower)?;
                let mut sorted: Vec<f64> = eigenvalues.to_vec();
                sorted.sort_by(|a, b| b.total_cmp(a));
                log_det_s_const += sorted
                    .iter()
                    .take(penalty.rank)
                    .map(|v| v.max(f64::MIN_POSITIVE).ln())
                    .sum::<f64>();
            }

            let penalty_rank: usize = design.penalties.iter().map(|p| p.rank).sum();
            let null_space_dim = penalized.len().saturating_sub(penalty_rank);
            if null_space_dim > 0 {
                log::debug!(
                    "Penalized block keeps a null space of dimension {null_space_dim}."
                );
            }

            Ok(Self {
                design,
                xtx,
                xty,
                penalized,
                penalty_offsets,
                log_det_s_const,
                null_space_dim,
                cache: RefCell::new(HashMap::new()),
                best: RefCell::new(None),
            })
        }

        fn s_lambda(&self, lambdas: &Array1<f64>) -> Array2<f64> {
            let p = self.xtx.nrows();
            let mut s_lambda = Array2::zeros((p, p));
            for (penalty, &lambda) in self.design.penalties.iter().zip(lambdas.iter()) {
                s_lambda
                    .slice_mut(s![penalty.columns.clone(), penalty.columns.clone()])
                    .scaled_add(lambda, &penalty.matrix);
            }
            s_lambda
        }

        fn evaluate(&self, rho: &Array1<f64>) -> Result<Evaluation, FitError> {
            let key: Vec<u64> = rho.iter().map(|v| v.to_bits()).collect();
            if let Some(cached) = self.cache.borrow().get(&key) {
                return Ok(cached.clone());
            }

            let lambdas = rho.mapv(f64::exp);
            let s_lambda = self.s_lambda(&lambdas);
            let h = &self.xtx + &s_lambda;
            let beta = h.solve(&self.xty)?;

            let residuals = &self.design.y - &self.design.x.dot(&beta);
            let penalized_deviance =
                residuals.dot(&residuals) + beta.dot(&s_lambda.dot(&beta));

            let (log_det_h_rr, h_rr_inverse) = if self.penalized.is_empty() {
                (0.0, Array2::zeros((0, 0)))
            } else {
                let h_rr = h
                    .select(Axis(0), &self.penalized)
                    .select(Axis(1), &self.penalized);
                let l = h_rr.cholesky(UPLO::Lower)?;
                let log_det = 2.0 * l.diag().mapv(f64::ln).sum();
                (log_det, h_rr.inv()?)
            };

            let evaluation = Evaluation {
                beta,
                penalized_deviance,
                log_det_h_rr,
                h_rr_inverse,
            };
            let mut cache = self.cache.borrow_mut();
            if cache.len() > 256 {
                cache.clear();
            }
            cache.insert(key, evaluation.clone());
            Ok(evaluation)
        }

        /// Observations left for the scale once the null space of the
        /// penalized block is integrated out, `n - M`.
        pub(super) fn profiled_n(&self) -> f64 {
            (self.design.y.len() as f64 - self.null_space_dim as f64).max(1.0)
        }

        /// Negative log marginal likelihood with the scale profiled out.
        pub(super) fn compute_cost(&self, rho: &Array1<f64>) -> Result<f64, FitError> {
            let eval = self.evaluate(rho)?;
            let n = self.profiled_n();
            let dp = eval.penalized_deviance.max(f64::MIN_POSITIVE);

            let log_det_s: f64 = self
                .design
                .penalties
                .iter()
                .zip(rho.iter())
                .map(|(penalty, &r)| penalty.rank as f64 * r)
                .sum::<f64>()
                + self.log_det_s_const;

            let cost = 0.5 * (n * (LOG_2PI + (dp / n).ln()) + n + eval.log_det_h_rr - log_det_s);

            if cost.is_finite() {
                let mut best = self.best.borrow_mut();
                let improved = match best.as_ref() {
                    Some((best_cost, _)) => cost < *best_cost,
                    None => true,
                };
                if improved {
                    *best = Some((cost, rho.clone()));
                }
            }
            Ok(cost)
        }

        /// Exact gradient of [`Self::compute_cost`] with respect to `rho`.
        pub(super) fn compute_gradient(&self, rho: &Array1<f64>) -> Result<Array1<f64>, FitError> {
            let eval = self.evaluate(rho)?;
            let n = self.profiled_n();
            let dp = eval.penalized_deviance.max(f64::MIN_POSITIVE);

            let mut gradient = Array1::zeros(rho.len());
            for (j, penalty) in self.design.penalties.iter().enumerate() {
                let lambda = rho[j].exp();
                let beta_j = eval.beta.slice(s![penalty.columns.clone()]);
                let quadratic = beta_j.dot(&penalty.matrix.dot(&beta_j));

                let offset = self.penalty_offsets[j];
                let size = penalty.columns.len();
                let h_inv_block = eval
                    .h_rr_inverse
                    .slice(s![offset..offset + size, offset..offset + size]);
                let trace = (&h_inv_block * &penalty.matrix).sum();

                gradient[j] = 0.5
                    * (n * lambda * quadratic / dp + lambda * trace - penalty.rank as f64);
            }
            Ok(gradient)
        }

        pub(super) fn best_rho(&self) -> Option<Array1<f64>> {
            self.best.borrow().as_ref().map(|(_, rho)| rho.clone())
        }

        /// Coefficients, inverse penalized Hessian and edf at `rho`.
        pub(super) fn final_fit(&self, rho: &Array1<f64>) -> Result<FinalFit, FitError> {
            let ml_score = self.compute_cost(rho)?;
            if !ml_score.is_finite() {
                return Err(FitError::OptimizationFailed(format!(
                    "marginal likelihood is not finite at the optimum ({ml_score})"
                )));
            }
            let eval = self.evaluate(rho)?;
            let h = &self.xtx + &self.s_lambda(&rho.mapv(f64::exp));
            let h_inverse = h.inv()?;
            let edf = h_inverse.dot(&self.xtx).diag().to_owned();
            Ok(FinalFit {
                beta: eval.beta,
                h_inverse,
                edf,
                ml_score,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Covariate;
    use crate::model::TermSpec;
    use crate::test_fixtures::{SyntheticStudy, linear_trend_study};
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_ml_gradient_matches_finite_differences() {
        let obs = SyntheticStudy::new().build().unwrap();
        let design = build_design(&obs, &ModelSpec::default()).unwrap();
        let state = internal::MlState::new(&design, 20.0).unwrap();

        let rho = Array1::from_iter((0..design.penalties.len()).map(|j| -1.0 + 0.5 * j as f64));
        let analytic = state.compute_gradient(&rho).unwrap();

        let h = 1e-5;
        for j in 0..rho.len() {
            let mut plus = rho.clone();
            let mut minus = rho.clone();
            plus[j] += h;
            minus[j] -= h;
            let numeric =
                (state.compute_cost(&plus).unwrap() - state.compute_cost(&minus).unwrap()) / (2.0 * h);
            assert!(
                (numeric - analytic[j]).abs() < 1e-4 * numeric.abs().max(1.0),
                "gradient mismatch for penalty {}: analytic {} vs numeric {}",
                j,
                analytic[j],
                numeric
            );
        }
    }

    #[test]
    fn test_unselected_ml_gradient_matches_finite_differences() {
        let obs = SyntheticStudy::new().build().unwrap();
        let spec = ModelSpec {
            select: false,
            ..ModelSpec::default()
        };
        let design = build_design(&obs, &spec).unwrap();
        let state = internal::MlState::new(&design, 20.0).unwrap();

        // Null spaces of the time (2), age (1) and pool temperature (1) smooths.
        assert_abs_diff_eq!(state.profiled_n(), obs.len() as f64 - 4.0, epsilon = 1e-12);

        let rho = Array1::from_iter((0..design.penalties.len()).map(|j| 0.5 - 0.75 * j as f64));
        let analytic = state.compute_gradient(&rho).unwrap();
        let h = 1e-5;
        for j in 0..rho.len() {
            let mut plus = rho.clone();
            let mut minus = rho.clone();
            plus[j] += h;
            minus[j] -= h;
            let numeric =
                (state.compute_cost(&plus).unwrap() - state.compute_cost(&minus).unwrap()) / (2.0 * h);
            assert!(
                (numeric - analytic[j]).abs() < 1e-4 * numeric.abs().max(1.0),
                "gradient mismatch for penalty {}: analytic {} vs numeric {}",
                j,
                analytic[j],
                numeric
            );
        }
    }

    #[test]
    fn test_selected_penalties_leave_no_null_space() {
        let obs = SyntheticStudy::new().build().unwrap();
        let design = build_design(&obs, &ModelSpec::default()).unwrap();
        let state = internal::MlState::new(&design, 20.0).unwrap();
        assert_abs_diff_eq!(state.profiled_n(), obs.len() as f64, epsilon = 1e-12);
    }

    #[test]
    fn smoke_test_full_model_fit() {
        let obs = SyntheticStudy::new().build().unwrap();
        let model = fit_model(&obs, &ModelSpec::default(), &FitConfig::default()).unwrap();

        assert_eq!(model.coefficients.len(), model.layout.total_coeffs);
        assert_eq!(model.lambdas.len(), 7);
        assert!(model.coefficients.iter().all(|c| c.is_finite()));
        assert!(model.ml_score.is_finite());

        // Noise sd is 0.1, so the scale should be close to 0.01.
        assert!(model.scale > 0.002 && model.scale < 0.05, "scale = {}", model.scale);
        assert!(model.total_edf() > 2.0);
        assert!(model.total_edf() < model.layout.total_coeffs as f64);

        for i in 0..obs.len() {
            assert_abs_diff_eq!(
                model.fitted_values[i] + model.residuals[i],
                obs.oxygen_cons[i],
                epsilon = 1e-10
            );
        }
        // Bayesian covariance is symmetric.
        assert_abs_diff_eq!(model.covariance, model.covariance.t(), epsilon = 1e-10);
    }

    #[test]
    fn test_fit_does_not_mutate_observations() {
        let obs = linear_trend_study(7).unwrap();
        let before = obs.clone();
        let spec = ModelSpec {
            terms: vec![
                TermSpec::Smooth {
                    covariate: Covariate::Time,
                    by: Some(Covariate::Proportion),
                    k: 10,
                },
                TermSpec::RandomEffect,
            ],
            ..ModelSpec::default()
        };
        let model = fit_model(&obs, &spec, &FitConfig::default()).unwrap();
        assert_eq!(model.n_obs(), obs.len());
        assert_eq!(obs, before);
    }

    #[test]
    fn test_bounded_reparameterisation_round_trips() {
        let rho = Array1::from_vec(vec![-5.0, 0.0, 3.5, 19.0]);
        let back = internal::to_bounded(&internal::to_unbounded(&rho, 20.0), 20.0);
        for (a, b) in rho.iter().zip(back.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }
}
