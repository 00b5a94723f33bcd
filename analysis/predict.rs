//! Prediction engine: partial effects, conditional predictions and
//! marginal-mean predictions over a time grid.
//!
//! Every operation reads the fitted model and never changes it. Subject
//! random effects are always excluded, so curves describe the population.

use crate::data::{Covariate, Factor};
use crate::model::{CovariateFrame, FittedModel, ModelError, TermBasis, TermLayout};
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Invalid prediction grid: {0}")]
    InvalidGrid(String),
    #[error("The model has no smooth term for '{0}'.")]
    TermNotInModel(String),
    #[error("Level '{level}' of factor '{factor}' was not seen when the model was fitted.")]
    UnknownLevel { factor: &'static str, level: String },
    #[error("Confidence level must lie strictly between 0 and 1, got {0}.")]
    InvalidLevel(f64),
    #[error("Model evaluation failed: {0}")]
    ModelError(#[from] ModelError),
    #[error("Failed to build the normal quantile: {0}")]
    Distribution(String),
}

/// How the values of a prediction axis are chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GridSpec {
    /// The sorted unique observed values.
    Observed,
    /// `points` evenly spaced values over the observed range.
    Span { points: usize },
    /// `start, start + step, ...` up to and including `end`.
    Range { start: f64, end: f64, step: f64 },
}

impl Default for GridSpec {
    fn default() -> Self {
        GridSpec::Range {
            start: 0.0,
            end: 130.0,
            step: 1.0,
        }
    }
}

impl GridSpec {
    /// Resolves the grid against the observed values of its covariate.
    pub fn resolve(&self, observed: ArrayView1<f64>) -> Result<Array1<f64>, PredictionError> {
        match *self {
            GridSpec::Observed => {
                let mut values: Vec<f64> = observed.to_vec();
                values.sort_by(f64::total_cmp);
                values.dedup();
                if values.is_empty() {
                    return Err(PredictionError::InvalidGrid(
                        "no observed values to build a grid from".to_string(),
                    ));
                }
                Ok(Array1::from_vec(values))
            }
            GridSpec::Span { points } => {
                if points < 2 {
                    return Err(PredictionError::InvalidGrid(format!(
                        "a span needs at least 2 points, got {points}"
                    )));
                }
                let (lo, hi) = observed
                    .iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                        (lo.min(v), hi.max(v))
                    });
                if !(lo.is_finite() && hi.is_finite()) {
                    return Err(PredictionError::InvalidGrid(
                        "no observed values to span".to_string(),
                    ));
                }
                Ok(Array1::linspace(lo, hi, points))
            }
            GridSpec::Range { start, end, step } => {
                if !(start.is_finite() && end.is_finite() && step.is_finite()) {
                    return Err(PredictionError::InvalidGrid(
                        "range bounds and step must be finite".to_string(),
                    ));
                }
                if step <= 0.0 {
                    return Err(PredictionError::InvalidGrid(format!(
                        "step must be positive, got {step}"
                    )));
                }
                if end < start {
                    return Err(PredictionError::InvalidGrid(format!(
                        "end ({end}) is before start ({start})"
                    )));
                }
                let count = ((end - start) / step + 1e-9).floor() as usize + 1;
                Ok(Array1::from_iter(
                    (0..count).map(|i| start + i as f64 * step),
                ))
            }
        }
    }
}

/// Values at which the non-time covariates are held for a conditional
/// prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionAt {
    pub proportion: f64,
    pub age: f64,
    pub pool_temp: f64,
    /// `None` selects the most frequent level in the training data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
}

impl Default for ConditionAt {
    fn default() -> Self {
        Self {
            proportion: 0.23,
            age: 21.4,
            pool_temp: 22.8,
            sex: None,
        }
    }
}

impl ConditionAt {
    /// Observed means of the continuous covariates and the modal sex.
    pub fn typical(model: &FittedModel) -> Self {
        let mean = |c: Covariate| model.training.covariate(c).mean().unwrap_or(0.0);
        Self {
            proportion: mean(Covariate::Proportion),
            age: mean(Covariate::Age),
            pool_temp: mean(Covariate::PoolTemp),
            sex: model.training.modal_sex(),
        }
    }
}

/// A predicted curve with pointwise confidence limits.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionCurve {
    /// Name of the axis variable.
    pub x_name: String,
    pub x: Array1<f64>,
    pub fit: Array1<f64>,
    pub se: Array1<f64>,
    pub lower: Array1<f64>,
    pub upper: Array1<f64>,
    pub level: f64,
    /// `(name, value)` pairs describing how other covariates were held.
    pub conditioning: Vec<(String, String)>,
}

impl PredictionCurve {
    fn from_rows(
        model: &FittedModel,
        x_name: &str,
        x: Array1<f64>,
        rows: &Array2<f64>,
        columns: std::ops::Range<usize>,
        level: f64,
        conditioning: Vec<(String, String)>,
    ) -> Result<Self, PredictionError> {
        let z = z_value(level)?;
        let beta = model.coefficients.slice(s![columns.clone()]);
        let v = model.covariance.slice(s![columns.clone(), columns]);
        let fit = rows.dot(&beta);
        let se = (rows.dot(&v) * rows)
            .sum_axis(Axis(1))
            .mapv(|var| var.max(0.0).sqrt());
        let lower = &fit - &(&se * z);
        let upper = &fit + &(&se * z);
        Ok(Self {
            x_name: x_name.to_string(),
            x,
            fit,
            se,
            lower,
            upper,
            level,
            conditioning,
        })
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

fn z_value(level: f64) -> Result<f64, PredictionError> {
    if !(level > 0.0 && level < 1.0) {
        return Err(PredictionError::InvalidLevel(level));
    }
    let normal =
        Normal::new(0.0, 1.0).map_err(|e| PredictionError::Distribution(e.to_string()))?;
    Ok(normal.inverse_cdf(0.5 + level / 2.0))
}

fn find_smooth(
    model: &FittedModel,
    covariate: Covariate,
    by: Option<Covariate>,
) -> Option<&TermLayout> {
    model.layout.terms.iter().find(|t| match &t.basis {
        TermBasis::Spline {
            covariate: c,
            by: b,
            ..
        } => *c == covariate && (by.is_none() || *b == by),
        _ => false,
    })
}

/// A copy of `frame` with `covariate` replaced by ones.
fn with_unit(frame: &CovariateFrame, covariate: Covariate) -> CovariateFrame {
    let mut unit = frame.clone();
    let ones = Array1::ones(frame.len());
    match covariate {
        Covariate::Time => unit.exact = ones,
        Covariate::Proportion => unit.percent_daily_total = ones,
        Covariate::Age => unit.age = ones,
        Covariate::PoolTemp => unit.pool_temp = ones,
    }
    unit
}

fn population_frame(model: &FittedModel) -> CovariateFrame {
    CovariateFrame {
        animal: None,
        ..model.training.clone()
    }
}

/// Centred partial effect of one smooth component on a grid.
///
/// `Time`, `Age` and `PoolTemp` select the smooth of that covariate (the
/// time smooth is evaluated with its `by` variable set to one). `Proportion`
/// selects the proportion profile of the time-by-proportion smooth,
/// `p * mean_i f_t(exact_i)`. Each curve is centred so that its contribution
/// averages to zero over the observed covariate values.
pub fn partial_effect(
    model: &FittedModel,
    covariate: Covariate,
    grid: &GridSpec,
    level: f64,
) -> Result<PredictionCurve, PredictionError> {
    let observed = model.training.covariate(covariate);
    let x = grid.resolve(observed)?;
    let training = population_frame(model);

    let (term, rows) = match covariate {
        Covariate::Proportion => {
            let term = find_smooth(model, Covariate::Time, Some(Covariate::Proportion))
                .ok_or_else(|| PredictionError::TermNotInModel(covariate.to_string()))?;
            let unit_block = term.basis.evaluate(&with_unit(&training, Covariate::Proportion))?;
            let mean_row = column_means(&unit_block);
            let mean_p = observed.mean().unwrap_or(0.0);
            let mut rows = Array2::zeros((x.len(), mean_row.len()));
            for (mut row, &p) in rows.axis_iter_mut(Axis(0)).zip(x.iter()) {
                row.assign(&(&mean_row * (p - mean_p)));
            }
            (term, rows)
        }
        _ => {
            let term = find_smooth(model, covariate, None)
                .ok_or_else(|| PredictionError::TermNotInModel(covariate.to_string()))?;
            let by = match &term.basis {
                TermBasis::Spline { by, .. } => *by,
                _ => None,
            };

            let mut grid_frame = CovariateFrame {
                exact: Array1::zeros(x.len()),
                percent_daily_total: Array1::zeros(x.len()),
                age: Array1::zeros(x.len()),
                pool_temp: Array1::zeros(x.len()),
                sex: vec![String::new(); x.len()],
                animal: None,
            };
            match covariate {
                Covariate::Time => grid_frame.exact = x.clone(),
                Covariate::Age => grid_frame.age = x.clone(),
                Covariate::PoolTemp => grid_frame.pool_temp = x.clone(),
                Covariate::Proportion => {}
            }
            let (grid_frame, training) = match by {
                Some(b) => (with_unit(&grid_frame, b), with_unit(&training, b)),
                None => (grid_frame, training),
            };

            let grid_block = term.basis.evaluate(&grid_frame)?;
            let mean_row = column_means(&term.basis.evaluate(&training)?);
            (term, grid_block - &mean_row)
        }
    };

    PredictionCurve::from_rows(
        model,
        covariate.column_name(),
        x,
        &rows,
        term.columns.clone(),
        level,
        vec![("term".to_string(), term.label.clone())],
    )
}

fn column_means(block: &Array2<f64>) -> Array1<f64> {
    block
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(block.ncols()))
}

fn check_sex_level(model: &FittedModel, sex: &str) -> Result<(), PredictionError> {
    if model.training.sex.iter().any(|s| s == sex) {
        Ok(())
    } else {
        Err(PredictionError::UnknownLevel {
            factor: "sex",
            level: sex.to_string(),
        })
    }
}

/// Predicted response over the time grid with every other covariate held
/// at `condition`. The subject effect is excluded.
pub fn predict_fixed(
    model: &FittedModel,
    grid: &GridSpec,
    condition: &ConditionAt,
    level: f64,
) -> Result<PredictionCurve, PredictionError> {
    let times = grid.resolve(model.training.exact.view())?;
    let sex = match &condition.sex {
        Some(sex) => sex.clone(),
        None => model
            .training
            .modal_sex()
            .ok_or_else(|| PredictionError::InvalidGrid("training data has no rows".to_string()))?,
    };
    check_sex_level(model, &sex)?;

    let frame = CovariateFrame::at_times(
        times.view(),
        condition.proportion,
        condition.age,
        condition.pool_temp,
        &sex,
    );
    let rows = model.layout.design_matrix(&frame)?;
    let conditioning = vec![
        ("percentdailytotal".to_string(), format!("{}", condition.proportion)),
        ("age".to_string(), format!("{}", condition.age)),
        ("pool_temp".to_string(), format!("{}", condition.pool_temp)),
        ("sex".to_string(), sex),
        ("animal".to_string(), "excluded".to_string()),
    ];
    PredictionCurve::from_rows(
        model,
        Covariate::Time.column_name(),
        times,
        &rows,
        0..model.layout.total_coeffs,
        level,
        conditioning,
    )
}

/// Marginal-mean prediction over the time grid.
///
/// Continuous covariates are held at their observed means and the sex
/// contrast is averaged with the observed level frequencies. The subject
/// effect is excluded.
pub fn predict_marginal(
    model: &FittedModel,
    grid: &GridSpec,
    level: f64,
) -> Result<PredictionCurve, PredictionError> {
    let times = grid.resolve(model.training.exact.view())?;
    let mean = |c: Covariate| model.training.covariate(c).mean().unwrap_or(0.0);
    let (proportion, age, pool_temp) = (
        mean(Covariate::Proportion),
        mean(Covariate::Age),
        mean(Covariate::PoolTemp),
    );

    let sex = Factor::from_labels(model.training.sex.iter().cloned());
    let mut rows = Array2::zeros((times.len(), model.layout.total_coeffs));
    for (label, weight) in sex.levels().iter().zip(sex.frequencies()) {
        let frame = CovariateFrame::at_times(times.view(), proportion, age, pool_temp, label);
        rows.scaled_add(weight, &model.layout.design_matrix(&frame)?);
    }

    let weights = sex
        .levels()
        .iter()
        .zip(sex.frequencies())
        .map(|(l, w)| format!("{l}:{w:.3}"))
        .collect::<Vec<_>>()
        .join(",");
    let conditioning = vec![
        ("percentdailytotal".to_string(), format!("mean={proportion:.4}")),
        ("age".to_string(), format!("mean={age:.4}")),
        ("pool_temp".to_string(), format!("mean={pool_temp:.4}")),
        ("sex".to_string(), format!("weighted({weights})")),
        ("animal".to_string(), "excluded".to_string()),
    ];
    PredictionCurve::from_rows(
        model,
        Covariate::Time.column_name(),
        times,
        &rows,
        0..model.layout.total_coeffs,
        level,
        conditioning,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::{FitConfig, fit_model};
    use crate::model::{ModelSpec, TermSpec};
    use crate::test_fixtures::{SyntheticStudy, linear_trend_study};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn study_model() -> FittedModel {
        let obs = SyntheticStudy::new().build().unwrap();
        fit_model(&obs, &ModelSpec::default(), &FitConfig::default()).unwrap()
    }

    #[test]
    fn test_grid_resolution() {
        let observed = array![30.0, 0.0, 10.0, 10.0, 130.0];
        let range = GridSpec::default().resolve(observed.view()).unwrap();
        assert_eq!(range.len(), 131);
        assert_abs_diff_eq!(range[130], 130.0, epsilon = 1e-12);

        let unique = GridSpec::Observed.resolve(observed.view()).unwrap();
        assert_eq!(unique, array![0.0, 10.0, 30.0, 130.0]);

        let span = GridSpec::Span { points: 5 }.resolve(observed.view()).unwrap();
        assert_eq!(span, array![0.0, 32.5, 65.0, 97.5, 130.0]);

        let fractional = GridSpec::Range {
            start: 0.0,
            end: 1.0,
            step: 0.1,
        }
        .resolve(observed.view())
        .unwrap();
        assert_eq!(fractional.len(), 11);
    }

    #[test]
    fn test_invalid_grids_and_levels_are_rejected() {
        let observed = array![0.0, 1.0];
        for grid in [
            GridSpec::Span { points: 1 },
            GridSpec::Range {
                start: 0.0,
                end: 10.0,
                step: 0.0,
            },
            GridSpec::Range {
                start: 10.0,
                end: 0.0,
                step: 1.0,
            },
        ] {
            assert!(matches!(
                grid.resolve(observed.view()),
                Err(PredictionError::InvalidGrid(_))
            ));
        }
        assert!(matches!(z_value(1.0), Err(PredictionError::InvalidLevel(_))));
        assert_abs_diff_eq!(z_value(0.95).unwrap(), 1.959_963_984_540_054, epsilon = 1e-6);
    }

    #[test]
    fn test_partial_effects_average_to_zero_over_observed_values() {
        let model = study_model();
        for covariate in [
            Covariate::Time,
            Covariate::Proportion,
            Covariate::Age,
            Covariate::PoolTemp,
        ] {
            // Evaluate at every observed value, duplicates included.
            let observed = model.training.covariate(covariate).to_owned();
            let curve = partial_effect(&model, covariate, &GridSpec::Observed, 0.95).unwrap();
            let mut total = 0.0;
            for &v in observed.iter() {
                let idx = curve.x.iter().position(|&x| x == v).unwrap();
                total += curve.fit[idx];
            }
            assert_abs_diff_eq!(total / observed.len() as f64, 0.0, epsilon = 1e-8);
            assert!(curve.lower.iter().zip(curve.upper.iter()).all(|(l, u)| l <= u));
        }
    }

    #[test]
    fn test_fixed_and_marginal_differ_with_unbalanced_sexes() {
        let model = study_model();
        let grid = GridSpec::Range {
            start: 0.0,
            end: 0.0,
            step: 1.0,
        };
        let typical = ConditionAt::typical(&model);
        assert_eq!(typical.sex.as_deref(), Some("F"));

        let fixed = predict_fixed(&model, &grid, &typical, 0.95).unwrap();
        let marginal = predict_marginal(&model, &grid, 0.95).unwrap();
        let sex_effect = model.coefficients[model.layout.term("sex").unwrap().columns.start];
        // Marginal mixes in a third of males; fixed uses females only.
        assert_abs_diff_eq!(marginal.fit[0] - fixed.fit[0], sex_effect / 3.0, epsilon = 1e-8);
        assert!((marginal.fit[0] - fixed.fit[0]).abs() > 1e-6);
        assert_eq!(fixed.conditioning[3], ("sex".to_string(), "F".to_string()));
    }

    #[test]
    fn test_fixed_and_marginal_coincide_for_single_valued_covariates() {
        let obs = linear_trend_study(11).unwrap();
        let spec = ModelSpec {
            terms: vec![
                TermSpec::Smooth {
                    covariate: Covariate::Time,
                    by: Some(Covariate::Proportion),
                    k: 10,
                },
                TermSpec::Sex,
                TermSpec::RandomEffect,
            ],
            ..ModelSpec::default()
        };
        let model = fit_model(&obs, &spec, &FitConfig::default()).unwrap();
        let grid = GridSpec::default();
        let fixed = predict_fixed(&model, &grid, &ConditionAt::typical(&model), 0.95).unwrap();
        let marginal = predict_marginal(&model, &grid, 0.95).unwrap();
        for i in 0..grid.resolve(model.training.exact.view()).unwrap().len() {
            assert_abs_diff_eq!(fixed.fit[i], marginal.fit[i], epsilon = 1e-10);
            assert_abs_diff_eq!(fixed.se[i], marginal.se[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_unknown_sex_and_missing_term_are_errors() {
        let model = study_model();
        let condition = ConditionAt {
            sex: Some("X".to_string()),
            ..ConditionAt::default()
        };
        assert!(matches!(
            predict_fixed(&model, &GridSpec::default(), &condition, 0.95),
            Err(PredictionError::UnknownLevel { factor: "sex", .. })
        ));

        let obs = linear_trend_study(3).unwrap();
        let spec = ModelSpec {
            terms: vec![TermSpec::Smooth {
                covariate: Covariate::Time,
                by: None,
                k: 10,
            }],
            ..ModelSpec::default()
        };
        let time_only = fit_model(&obs, &spec, &FitConfig::default()).unwrap();
        assert!(matches!(
            partial_effect(&time_only, Covariate::Age, &GridSpec::Observed, 0.95),
            Err(PredictionError::TermNotInModel(_))
        ));
    }
}
