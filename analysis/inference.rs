//! Term-level inference: the model summary and the ANOVA-style table.
//!
//! Parametric coefficients get t-tests with the residual degrees of freedom
//! `n - edf`. Smooth terms get an approximate Wald test using the rank-`r`
//! pseudo-inverse of their Bayesian covariance block, where `r` is the
//! term's effective degrees of freedom rounded to an integer.

use crate::model::{FittedModel, TermBasis, TermLayout};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Eigh, Inverse, UPLO};
use statrs::distribution::{ContinuousCDF, FisherSnedecor, StudentsT};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Covariance decomposition failed: {0}")]
    LinalgError(#[from] LinalgError),
    #[error("Failed to build a reference distribution: {0}")]
    Distribution(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParametricRow {
    pub term: String,
    pub estimate: f64,
    pub std_error: f64,
    pub t_value: f64,
    pub p_value: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SmoothRow {
    pub term: String,
    pub edf: f64,
    /// Rank used for the Wald test.
    pub ref_df: f64,
    pub f_value: f64,
    pub p_value: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelSummary {
    pub parametric: Vec<ParametricRow>,
    pub smooths: Vec<SmoothRow>,
    pub r_squared_adj: f64,
    pub deviance_explained: f64,
    /// Minimised negative log marginal likelihood.
    pub ml_score: f64,
    pub scale: f64,
    pub n: usize,
    pub residual_df: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnovaParametricRow {
    pub term: String,
    pub df: usize,
    pub f_value: f64,
    pub p_value: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnovaTable {
    pub parametric: Vec<AnovaParametricRow>,
    pub smooths: Vec<SmoothRow>,
}

/// Builds the summary table of a fitted model.
pub fn summarize(model: &FittedModel) -> Result<ModelSummary, InferenceError> {
    let residual_df = model.residual_df();
    let t_dist = StudentsT::new(0.0, 1.0, residual_df)
        .map_err(|e| InferenceError::Distribution(e.to_string()))?;

    let mut parametric = Vec::new();
    for term in model.layout.terms.iter().filter(|t| !t.is_penalized()) {
        for (label, col) in term.coefficient_labels().into_iter().zip(term.columns.clone()) {
            let estimate = model.coefficients[col];
            let std_error = model.covariance[[col, col]].max(0.0).sqrt();
            let t_value = estimate / std_error;
            parametric.push(ParametricRow {
                term: label,
                estimate,
                std_error,
                t_value,
                p_value: 2.0 * t_dist.sf(t_value.abs()),
            });
        }
    }

    let smooths = smooth_tests(model)?;

    let n = model.n_obs();
    let y = &model.response;
    let mean_y = y.mean().unwrap_or(0.0);
    let tss: f64 = y.iter().map(|v| (v - mean_y).powi(2)).sum();
    let rss = model.residuals.dot(&model.residuals);
    let (r_squared_adj, deviance_explained) = if tss > 0.0 {
        (
            1.0 - (rss / residual_df) / (tss / (n as f64 - 1.0)),
            1.0 - rss / tss,
        )
    } else {
        (f64::NAN, f64::NAN)
    };

    Ok(ModelSummary {
        parametric,
        smooths,
        r_squared_adj,
        deviance_explained,
        ml_score: model.ml_score,
        scale: model.scale,
        n,
        residual_df,
    })
}

/// Builds the ANOVA-style table: a joint Wald test for every non-intercept
/// parametric term and the smooth-term tests of the summary.
pub fn anova(model: &FittedModel) -> Result<AnovaTable, InferenceError> {
    let residual_df = model.residual_df();
    let mut parametric = Vec::new();
    for term in &model.layout.terms {
        if term.is_penalized() || matches!(term.basis, TermBasis::Intercept) {
            continue;
        }
        let df = term.columns.len();
        let beta = model.coefficients.slice(s![term.columns.clone()]);
        let v = covariance_block(model, term);
        let statistic = beta.dot(&v.inv()?.dot(&beta));
        let f_value = statistic / df as f64;
        parametric.push(AnovaParametricRow {
            term: term.label.clone(),
            df,
            f_value,
            p_value: f_survival(f_value, df as f64, residual_df)?,
        });
    }

    Ok(AnovaTable {
        parametric,
        smooths: smooth_tests(model)?,
    })
}

fn covariance_block(model: &FittedModel, term: &TermLayout) -> Array2<f64> {
    model
        .covariance
        .slice(s![term.columns.clone(), term.columns.clone()])
        .to_owned()
}

fn smooth_tests(model: &FittedModel) -> Result<Vec<SmoothRow>, InferenceError> {
    let residual_df = model.residual_df();
    model
        .layout
        .terms
        .iter()
        .filter(|t| t.is_penalized())
        .map(|term| {
            let edf = model.term_edf(term);
            let size = term.columns.len();
            let rank = (edf.round() as usize).clamp(1, size.max(1));
            let beta = model.coefficients.slice(s![term.columns.clone()]);
            let v = covariance_block(model, term);
            let statistic = wald_statistic(beta, v.view(), rank)?;
            let f_value = statistic / rank as f64;
            Ok(SmoothRow {
                term: term.label.clone(),
                edf,
                ref_df: rank as f64,
                f_value,
                p_value: f_survival(f_value, rank as f64, residual_df)?,
            })
        })
        .collect()
}

/// `beta' V^{r-} beta` with the rank-`r` eigen pseudo-inverse of `V`.
fn wald_statistic(
    beta: ArrayView1<f64>,
    v: ArrayView2<f64>,
    rank: usize,
) -> Result<f64, InferenceError> {
    let (eigenvalues, eigenvectors) = v.eigh(UPLO::Lower)?;
    let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
    order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));

    let mut statistic = 0.0;
    for &idx in order.iter().take(rank) {
        let value = eigenvalues[idx];
        if value <= 0.0 {
            break;
        }
        let projection = eigenvectors.index_axis(Axis(1), idx).dot(&beta);
        statistic += projection * projection / value;
    }
    Ok(statistic)
}

fn f_survival(f_value: f64, df1: f64, df2: f64) -> Result<f64, InferenceError> {
    if !f_value.is_finite() {
        return Ok(f64::NAN);
    }
    let dist = FisherSnedecor::new(df1, df2)
        .map_err(|e| InferenceError::Distribution(e.to_string()))?;
    Ok(dist.sf(f_value.max(0.0)))
}

fn format_p(p: f64) -> String {
    if p < 2e-16 {
        "<2e-16".to_string()
    } else if p < 1e-4 {
        format!("{p:.2e}")
    } else {
        format!("{p:.4}")
    }
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Parametric coefficients:")?;
        writeln!(
            f,
            "{:<28} {:>12} {:>12} {:>9} {:>10}",
            "", "Estimate", "Std. Error", "t value", "Pr(>|t|)"
        )?;
        for row in &self.parametric {
            writeln!(
                f,
                "{:<28} {:>12.5} {:>12.5} {:>9.3} {:>10}",
                row.term,
                row.estimate,
                row.std_error,
                row.t_value,
                format_p(row.p_value)
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Approximate significance of smooth terms:")?;
        write_smooth_rows(f, &self.smooths)?;
        writeln!(f)?;
        writeln!(
            f,
            "R-sq.(adj) = {:.4}   Deviance explained = {:.1}%",
            self.r_squared_adj,
            100.0 * self.deviance_explained
        )?;
        write!(
            f,
            "-ML = {:.4}  Scale est. = {:.6}  n = {}",
            self.ml_score, self.scale, self.n
        )
    }
}

impl fmt::Display for AnovaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Parametric Terms:")?;
        writeln!(f, "{:<28} {:>5} {:>9} {:>10}", "", "df", "F", "p-value")?;
        for row in &self.parametric {
            writeln!(
                f,
                "{:<28} {:>5} {:>9.3} {:>10}",
                row.term,
                row.df,
                row.f_value,
                format_p(row.p_value)
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Approximate significance of smooth terms:")?;
        write_smooth_rows(f, &self.smooths)
    }
}

fn write_smooth_rows(f: &mut fmt::Formatter<'_>, rows: &[SmoothRow]) -> fmt::Result {
    writeln!(
        f,
        "{:<28} {:>8} {:>8} {:>9} {:>10}",
        "", "edf", "Ref.df", "F", "p-value"
    )?;
    for row in rows {
        writeln!(
            f,
            "{:<28} {:>8.3} {:>8.0} {:>9.3} {:>10}",
            row.term,
            row.edf,
            row.ref_df,
            row.f_value,
            format_p(row.p_value)
        )?;
    }
    Ok(())
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
    fn test_wald_statistic_uses_top_eigenvalues() {
        let v = array![[4.0, 0.0], [0.0, 1e-12]];
        let beta = array![2.0, 5.0];
        // Rank one keeps only the dominant direction: 2^2 / 4.
        assert_abs_diff_eq!(
            wald_statistic(beta.view(), v.view(), 1).unwrap(),
            1.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_summary_and_anova_on_synthetic_study() {
        let obs = SyntheticStudy::new().build().unwrap();
        let model = fit_model(&obs, &ModelSpec::default(), &FitConfig::default()).unwrap();

        let summary = summarize(&model).unwrap();
        let labels: Vec<&str> = summary.parametric.iter().map(|r| r.term.as_str()).collect();
        assert_eq!(labels, vec!["(Intercept)", "sexM"]);
        assert_eq!(summary.smooths.len(), 4);
        assert_eq!(summary.n, obs.len());
        assert!(summary.deviance_explained > 0.8);
        assert!(summary.r_squared_adj <= summary.deviance_explained);

        // The strong heat increment signal is clearly significant.
        let time = &summary.smooths[0];
        assert_eq!(time.term, "s(exact):percentdailytotal");
        assert!(time.p_value < 1e-6);
        for row in &summary.smooths {
            assert!(row.ref_df >= 1.0);
            assert!((0.0..=1.0).contains(&row.p_value));
        }

        let table = anova(&model).unwrap();
        assert_eq!(table.parametric.len(), 1);
        assert_eq!(table.parametric[0].term, "sex");
        assert_eq!(table.parametric[0].df, 1);
        // A one-column Wald F equals the squared t value.
        let sex_t = summary.parametric[1].t_value;
        assert_abs_diff_eq!(table.parametric[0].f_value, sex_t * sex_t, epsilon = 1e-6);
        assert_eq!(table.smooths, summary.smooths);

        assert!(summary.to_string().contains("Parametric coefficients"));
        assert!(table.to_string().contains("s(pool_temp)"));
    }
}
