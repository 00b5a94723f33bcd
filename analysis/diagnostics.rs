//! Post-fit diagnostics for the additive model.
//!
//! Three checks are run against an already fitted model, none of which refit
//! or modify it:
//!
//! 1. Basis adequacy: for every smooth the k-index compares the mean squared
//!    difference of neighbouring residuals (ordered by the smooth's covariate)
//!    with the residual variance. A permutation test gives its p-value.
//!
//! 2. Simulated residuals: responses are drawn from the fitted Gaussian model
//!    and each observation's scaled residual is the fraction of simulated
//!    values below it. Uniformity, dispersion and outlier tests follow.
//!
//! 3. Residual autocorrelation in data order, with the usual white-noise band.
//!
//! Every finding is a warning. Nothing here turns a fitted model into an error.

use crate::model::{FittedModel, TermBasis};
use ndarray::{Array1, ArrayView1};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Binomial, ContinuousCDF, DiscreteCDF, Normal};
use std::fmt;
use thiserror::Error;

/// Share of `k'` at which the effective degrees of freedom count as close to it.
const EDF_NEAR_K_FRACTION: f64 = 0.8;
const SIGNIFICANCE: f64 = 0.05;

#[derive(Error, Debug)]
pub enum DiagnosticsError {
    #[error("Invalid diagnostics configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to build a reference distribution: {0}")]
    Distribution(String),
}

/// Configuration for the diagnostics run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Number of simulated response vectors for the scaled residuals.
    pub n_simulations: usize,
    /// Number of residual permutations for each k-index p-value.
    pub k_check_replicates: usize,
    /// Largest autocorrelation lag. Defaults to `min(floor(10 log10 n), n - 1)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lag: Option<usize>,
    pub seed: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            n_simulations: 250,
            k_check_replicates: 400,
            max_lag: None,
            seed: 42,
        }
    }
}

/// Basis-dimension check for one smooth term.
#[derive(Clone, Debug, PartialEq)]
pub struct BasisCheck {
    pub term: String,
    /// Number of coefficients of the term.
    pub k_prime: usize,
    pub edf: f64,
    /// `None` for random-effect terms and for constant residuals.
    pub k_index: Option<f64>,
    pub p_value: Option<f64>,
    pub edf_near_k: bool,
    pub suspect: bool,
}

impl fmt::Display for BasisCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.k_index, self.p_value) {
            (Some(k_index), Some(p)) => write!(
                f,
                "{:<28} k'={:>3} edf={:>7.3} k-index={:.3} p={:.4}",
                self.term, self.k_prime, self.edf, k_index, p
            ),
            _ => write!(
                f,
                "{:<28} k'={:>3} edf={:>7.3}",
                self.term, self.k_prime, self.edf
            ),
        }
    }
}

/// Kolmogorov-Smirnov test of the scaled residuals against Uniform(0, 1).
#[derive(Clone, Debug, PartialEq)]
pub struct UniformityTest {
    pub statistic: f64,
    pub p_value: f64,
}

/// Observed versus simulated residual sum of squares.
#[derive(Clone, Debug, PartialEq)]
pub struct DispersionTest {
    pub ratio: f64,
    pub p_value: f64,
}

/// Observations outside the whole simulation envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct OutlierTest {
    pub count: usize,
    pub expected_probability: f64,
    pub p_value: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Autocorrelation {
    /// Autocorrelation at lags `0..=max_lag`.
    pub acf: Vec<f64>,
    /// Half-width of the white-noise band.
    pub band: f64,
    /// Lags (>= 1) whose autocorrelation falls outside the band.
    pub flagged_lags: Vec<usize>,
}

/// Complete diagnostics report for a fitted model.
#[derive(Clone, Debug, PartialEq)]
pub struct DiagnosticsReport {
    pub basis_checks: Vec<BasisCheck>,
    pub scaled_residuals: Vec<f64>,
    pub uniformity: UniformityTest,
    pub dispersion: DispersionTest,
    pub outliers: OutlierTest,
    pub autocorrelation: Autocorrelation,
}

impl DiagnosticsReport {
    /// Human-readable warnings for every check that flagged a problem.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for check in &self.basis_checks {
            if check.suspect {
                warnings.push(format!(
                    "Basis dimension of '{}' may be too low: edf {:.2} of k' {} with k-index p = {:.3}.",
                    check.term,
                    check.edf,
                    check.k_prime,
                    check.p_value.unwrap_or(f64::NAN)
                ));
            } else if check.edf_near_k {
                warnings.push(format!(
                    "Effective degrees of freedom of '{}' ({:.2}) are close to k' = {}.",
                    check.term, check.edf, check.k_prime
                ));
            }
        }
        if self.uniformity.p_value < SIGNIFICANCE {
            warnings.push(format!(
                "Scaled residuals deviate from uniformity (KS D = {:.3}, p = {:.4}).",
                self.uniformity.statistic, self.uniformity.p_value
            ));
        }
        if self.dispersion.p_value < SIGNIFICANCE {
            warnings.push(format!(
                "Residual dispersion differs from the fitted model (ratio = {:.3}, p = {:.4}).",
                self.dispersion.ratio, self.dispersion.p_value
            ));
        }
        if self.outliers.p_value < SIGNIFICANCE {
            warnings.push(format!(
                "{} observations lie outside the simulation envelope (p = {:.4}).",
                self.outliers.count, self.outliers.p_value
            ));
        }
        if !self.autocorrelation.flagged_lags.is_empty() {
            warnings.push(format!(
                "Residual autocorrelation exceeds +/-{:.3} at lag(s) {:?}.",
                self.autocorrelation.band, self.autocorrelation.flagged_lags
            ));
        }
        warnings
    }

    pub fn has_issues(&self) -> bool {
        !self.warnings().is_empty()
    }
}

impl fmt::Display for DiagnosticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Basis dimension (k) checking results:")?;
        for check in &self.basis_checks {
            writeln!(f, "  {check}")?;
        }
        writeln!(
            f,
            "Simulated residuals: KS D = {:.4} (p = {:.4}); dispersion ratio = {:.4} (p = {:.4}); outliers = {} (p = {:.4})",
            self.uniformity.statistic,
            self.uniformity.p_value,
            self.dispersion.ratio,
            self.dispersion.p_value,
            self.outliers.count,
            self.outliers.p_value
        )?;
        write!(
            f,
            "Autocorrelation band +/-{:.4}; flagged lags: {:?}",
            self.autocorrelation.band, self.autocorrelation.flagged_lags
        )
    }
}

/// Runs every diagnostic against `model`. Flags are logged as warnings.
pub fn run_diagnostics(
    model: &FittedModel,
    config: &DiagnosticsConfig,
) -> Result<DiagnosticsReport, DiagnosticsError> {
    if config.n_simulations == 0 || config.k_check_replicates == 0 {
        return Err(DiagnosticsError::InvalidConfig(
            "n_simulations and k_check_replicates must be positive".to_string(),
        ));
    }
    let mut rng = StdRng::seed_from_u64(config.seed);
    let residuals = model.residuals.view();

    let basis_checks = check_basis_dimensions(model, config.k_check_replicates, &mut rng);

    let simulations = simulate_responses(model, config.n_simulations, &mut rng);
    let scaled_residuals = scaled_residuals(model.response.view(), &simulations);
    let uniformity = ks_uniformity_test(&scaled_residuals);
    let dispersion = dispersion_test(model, &simulations);
    let outliers = outlier_test(&scaled_residuals, config.n_simulations)?;

    let n = residuals.len();
    let default_lag = ((10.0 * (n as f64).log10()).floor() as usize).min(n.saturating_sub(1));
    let max_lag = config.max_lag.unwrap_or(default_lag).min(n.saturating_sub(1));
    let autocorrelation = autocorrelation(residuals, max_lag)?;

    let report = DiagnosticsReport {
        basis_checks,
        scaled_residuals,
        uniformity,
        dispersion,
        outliers,
        autocorrelation,
    };
    for warning in report.warnings() {
        log::warn!("{warning}");
    }
    Ok(report)
}

fn check_basis_dimensions(
    model: &FittedModel,
    replicates: usize,
    rng: &mut StdRng,
) -> Vec<BasisCheck> {
    let residuals = model.residuals.to_vec();
    let mut checks = Vec::new();
    for term in &model.layout.terms {
        let k_prime = term.columns.len();
        let edf = model.term_edf(term);
        let edf_near_k = edf >= EDF_NEAR_K_FRACTION * k_prime as f64;
        match &term.basis {
            TermBasis::Spline { covariate, .. } => {
                let x = model.training.covariate(*covariate);
                let mut order: Vec<usize> = (0..x.len()).collect();
                order.sort_by(|&a, &b| x[a].total_cmp(&x[b]));

                let permutation = k_index_permutation_test(&residuals, &order, replicates, rng);
                let p_value = permutation.map(|(_, p)| p);
                checks.push(BasisCheck {
                    term: term.label.clone(),
                    k_prime,
                    edf,
                    k_index: permutation.map(|(k, _)| k),
                    p_value,
                    edf_near_k,
                    suspect: edf_near_k && p_value.is_some_and(|p| p < SIGNIFICANCE),
                });
            }
            TermBasis::RandomEffect { .. } => checks.push(BasisCheck {
                term: term.label.clone(),
                k_prime,
                edf,
                k_index: None,
                p_value: None,
                edf_near_k: false,
                suspect: false,
            }),
            TermBasis::Intercept | TermBasis::Contrast { .. } => {}
        }
    }
    checks
}

/// Observed k-index and the share of residual permutations falling below it.
/// `None` when the k-index is undefined, as for constant residuals.
fn k_index_permutation_test(
    residuals: &[f64],
    order: &[usize],
    replicates: usize,
    rng: &mut StdRng,
) -> Option<(f64, f64)> {
    let observed = k_index(residuals, order);
    if !observed.is_finite() {
        return None;
    }
    let mut permuted = residuals.to_vec();
    let mut below = 0;
    for _ in 0..replicates {
        permuted.shuffle(rng);
        if k_index(&permuted, order) < observed {
            below += 1;
        }
    }
    Some((observed, below as f64 / replicates as f64))
}

/// `mean(diff(r[order])^2) / (2 var(r))`. Near one when no pattern is left.
fn k_index(residuals: &[f64], order: &[usize]) -> f64 {
    let n = residuals.len();
    if n < 2 {
        return f64::NAN;
    }
    let mean = residuals.iter().sum::<f64>() / n as f64;
    let variance = residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let squared_differences: f64 = order
        .windows(2)
        .map(|w| (residuals[w[1]] - residuals[w[0]]).powi(2))
        .sum();
    let mean_squared_difference = squared_differences / (n - 1) as f64;
    if variance > 0.0 {
        mean_squared_difference / (2.0 * variance)
    } else {
        f64::NAN
    }
}

/// `n_sim` response vectors drawn from `N(fitted, scale)`.
fn simulate_responses(model: &FittedModel, n_sim: usize, rng: &mut StdRng) -> Vec<Array1<f64>> {
    let sd = model.scale.max(0.0).sqrt();
    (0..n_sim)
        .map(|_| {
            model
                .fitted_values
                .mapv(|mu| mu + sd * rng.sample::<f64, _>(StandardNormal))
        })
        .collect()
}

fn scaled_residuals(observed: ArrayView1<f64>, simulations: &[Array1<f64>]) -> Vec<f64> {
    let n_sim = simulations.len() as f64;
    observed
        .iter()
        .enumerate()
        .map(|(i, &y)| simulations.iter().filter(|sim| sim[i] < y).count() as f64 / n_sim)
        .collect()
}

fn ks_uniformity_test(values: &[f64]) -> UniformityTest {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len() as f64;
    let statistic = sorted
        .iter()
        .enumerate()
        .map(|(i, &u)| {
            let above = (i + 1) as f64 / n - u;
            let below = u - i as f64 / n;
            above.max(below)
        })
        .fold(0.0_f64, f64::max);
    let sqrt_n = n.sqrt();
    let lambda = (sqrt_n + 0.12 + 0.11 / sqrt_n) * statistic;
    UniformityTest {
        statistic,
        p_value: kolmogorov_survival(lambda),
    }
}

/// `P(K > lambda)` for the Kolmogorov distribution.
fn kolmogorov_survival(lambda: f64) -> f64 {
    let a2 = -2.0 * lambda * lambda;
    let mut factor = 2.0;
    let mut sum = 0.0;
    let mut previous_term = 0.0_f64;
    for j in 1..=100 {
        let jf = j as f64;
        let term = factor * (a2 * jf * jf).exp();
        sum += term;
        if term.abs() <= 1e-3 * previous_term || term.abs() <= 1e-8 * sum {
            return sum.clamp(0.0, 1.0);
        }
        factor = -factor;
        previous_term = term.abs();
    }
    // The series only fails to converge for tiny lambda.
    1.0
}

fn dispersion_test(model: &FittedModel, simulations: &[Array1<f64>]) -> DispersionTest {
    let fitted = &model.fitted_values;
    let observed = model.residuals.dot(&model.residuals);
    let simulated: Vec<f64> = simulations
        .iter()
        .map(|sim| {
            let r = sim - fitted;
            r.dot(&r)
        })
        .collect();
    let n_sim = simulated.len() as f64;
    let mean_simulated = simulated.iter().sum::<f64>() / n_sim;
    let at_least = simulated.iter().filter(|&&s| s >= observed).count() as f64 / n_sim;
    let at_most = simulated.iter().filter(|&&s| s <= observed).count() as f64 / n_sim;
    DispersionTest {
        ratio: if mean_simulated > 0.0 {
            observed / mean_simulated
        } else {
            f64::NAN
        },
        p_value: (2.0 * at_least.min(at_most)).min(1.0),
    }
}

fn outlier_test(scaled: &[f64], n_sim: usize) -> Result<OutlierTest, DiagnosticsError> {
    let n = scaled.len() as u64;
    let count = scaled.iter().filter(|&&u| u <= 0.0 || u >= 1.0).count();
    let expected_probability = 2.0 / (n_sim as f64 + 1.0);
    let binomial = Binomial::new(expected_probability, n)
        .map_err(|e| DiagnosticsError::Distribution(e.to_string()))?;

    let k = count as u64;
    let expected = expected_probability * n as f64;
    let one_sided = if count as f64 >= expected {
        if k == 0 { 1.0 } else { binomial.sf(k - 1) }
    } else {
        binomial.cdf(k)
    };
    Ok(OutlierTest {
        count,
        expected_probability,
        p_value: (2.0 * one_sided).min(1.0),
    })
}

fn autocorrelation(
    residuals: ArrayView1<f64>,
    max_lag: usize,
) -> Result<Autocorrelation, DiagnosticsError> {
    let n = residuals.len();
    let mean = residuals.mean().unwrap_or(0.0);
    let centred: Vec<f64> = residuals.iter().map(|r| r - mean).collect();
    let c0: f64 = centred.iter().map(|r| r * r).sum::<f64>() / n.max(1) as f64;

    let acf: Vec<f64> = (0..=max_lag)
        .map(|lag| {
            let c: f64 = centred
                .iter()
                .zip(centred.iter().skip(lag))
                .map(|(a, b)| a * b)
                .sum::<f64>()
                / n as f64;
            if c0 > 0.0 { c / c0 } else { 0.0 }
        })
        .collect();

    let z = Normal::new(0.0, 1.0)
        .map_err(|e| DiagnosticsError::Distribution(e.to_string()))?
        .inverse_cdf(1.0 - SIGNIFICANCE / 2.0);
    let band = z / (n.max(1) as f64).sqrt();
    let flagged_lags = acf
        .iter()
        .enumerate()
        .skip(1)
        .filter(|&(_, &r)| r.abs() > band)
        .map(|(lag, _)| lag)
        .collect();

    Ok(Autocorrelation {
        acf,
        band,
        flagged_lags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::{FitConfig, fit_model};
    use crate::model::ModelSpec;
    use crate::test_fixtures::SyntheticStudy;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_diagnostics_complete_for_well_specified_model() {
        let obs = SyntheticStudy::new().build().unwrap();
        let model = fit_model(&obs, &ModelSpec::default(), &FitConfig::default()).unwrap();
        let config = DiagnosticsConfig {
            n_simulations: 100,
            k_check_replicates: 100,
            ..DiagnosticsConfig::default()
        };
        let report = run_diagnostics(&model, &config).unwrap();

        // Three smooths with a k-index and one random effect without.
        assert_eq!(report.basis_checks.len(), 4);
        let re = report
            .basis_checks
            .iter()
            .find(|c| c.term == "s(animal)")
            .unwrap();
        assert!(re.k_index.is_none());
        assert!(report.basis_checks.iter().filter(|c| c.k_index.is_some()).count() == 3);

        assert_eq!(report.scaled_residuals.len(), obs.len());
        assert!(report.scaled_residuals.iter().all(|u| (0.0..=1.0).contains(u)));
        assert!((0.0..=1.0).contains(&report.uniformity.p_value));
        assert!(report.dispersion.ratio > 0.5 && report.dispersion.ratio < 2.0);

        // n = 120 gives floor(10 * log10(120)) = 20 lags.
        assert_eq!(report.autocorrelation.acf.len(), 21);
        assert_abs_diff_eq!(report.autocorrelation.acf[0], 1.0, epsilon = 1e-12);
        assert!(!report.to_string().is_empty());
    }

    #[test]
    fn test_diagnostics_do_not_modify_model() {
        let obs = SyntheticStudy::new().with_animals(4).build().unwrap();
        let model = fit_model(&obs, &ModelSpec::default(), &FitConfig::default()).unwrap();
        let before = model.clone();
        let _ = run_diagnostics(&model, &DiagnosticsConfig::default()).unwrap();
        assert_eq!(model, before);
    }

    #[test]
    fn test_k_index_detects_residual_pattern() {
        // Smoothly varying residuals have tiny neighbour differences.
        let patterned: Vec<f64> = (0..50).map(|i| (i as f64 / 8.0).sin()).collect();
        let order: Vec<usize> = (0..50).collect();
        assert!(k_index(&patterned, &order) < 0.1);

        // Alternating residuals look like white noise or worse.
        let alternating: Vec<f64> = (0..50).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert!(k_index(&alternating, &order) > 1.5);
    }

    #[test]
    fn test_constant_residuals_do_not_flag_basis_dimension() {
        let order: Vec<usize> = (0..30).collect();
        let mut rng = StdRng::seed_from_u64(7);
        assert!(k_index_permutation_test(&[0.25; 30], &order, 50, &mut rng).is_none());

        let obs = SyntheticStudy::new().build().unwrap();
        let mut model = fit_model(&obs, &ModelSpec::default(), &FitConfig::default()).unwrap();
        model.residuals.fill(0.0);
        let checks = check_basis_dimensions(&model, 50, &mut rng);
        assert_eq!(checks.len(), 4);
        for check in &checks {
            assert!(check.k_index.is_none(), "{} has a k-index", check.term);
            assert!(check.p_value.is_none());
            assert!(!check.suspect);
        }
    }

    #[test]
    fn test_ks_statistic_for_perfectly_uniform_values() {
        let values: Vec<f64> = (0..100).map(|i| (i as f64 + 0.5) / 100.0).collect();
        let test = ks_uniformity_test(&values);
        assert_abs_diff_eq!(test.statistic, 0.005, epsilon = 1e-12);
        assert_abs_diff_eq!(test.p_value, 1.0, epsilon = 1e-12);

        let clustered = vec![0.01; 50];
        assert!(ks_uniformity_test(&clustered).p_value < 1e-6);
    }

    #[test]
    fn test_autocorrelation_of_alternating_series_is_flagged() {
        let residuals = Array1::from_iter((0..40).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }));
        let acf = autocorrelation(residuals.view(), 3).unwrap();
        assert_abs_diff_eq!(acf.acf[1], -39.0 / 40.0, epsilon = 1e-12);
        assert_eq!(acf.flagged_lags, vec![1, 2, 3]);
        assert_abs_diff_eq!(acf.band, 1.959_963_984_540_054 / 40f64.sqrt(), epsilon = 1e-6);

        let flat = autocorrelation(array![1.0, 1.0, 1.0].view(), 2).unwrap();
        assert!(flat.flagged_lags.is_empty());
    }

    #[test]
    fn test_outlier_test_counts_envelope_exceedances() {
        let scaled = vec![0.0, 1.0, 0.5, 0.3, 0.7, 0.0, 1.0, 1.0, 0.2, 0.9];
        let test = outlier_test(&scaled, 9).unwrap();
        assert_eq!(test.count, 5);
        assert_abs_diff_eq!(test.expected_probability, 0.2, epsilon = 1e-12);
        assert!(test.p_value < 0.1);
    }
}
