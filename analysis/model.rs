use crate::basis::{self, create_bspline_basis_with_knots};
use crate::data::{Covariate, Observations};
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the public, human-readable format of the fitted model
// when serialized to a TOML file.

/// One model term, in formula order. The intercept is always present and is
/// not listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TermSpec {
    /// A penalized spline of `covariate` with maximum basis dimension `k`.
    /// With `by`, the smooth is multiplied by that covariate and left
    /// unconstrained unless the covariate is constant.
    Smooth {
        covariate: Covariate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        by: Option<Covariate>,
        k: usize,
    },
    /// Sex as a treatment-contrast factor.
    Sex,
    /// Subject-level random intercepts.
    RandomEffect,
}

impl TermSpec {
    /// mgcv-style label of the term, e.g. `s(exact):percentdailytotal`.
    pub fn label(&self) -> String {
        match self {
            TermSpec::Smooth {
                covariate, by: None, ..
            } => format!("s({covariate})"),
            TermSpec::Smooth {
                covariate,
                by: Some(by),
                ..
            } => format!("s({covariate}):{by}"),
            TermSpec::Sex => "sex".to_string(),
            TermSpec::RandomEffect => "s(animal)".to_string(),
        }
    }
}

/// The model formula and basis settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    /// B-spline polynomial degree.
    pub degree: usize,
    /// Order of the difference penalty.
    pub penalty_order: usize,
    /// Add a null-space penalty to every smooth so it can be removed entirely.
    pub select: bool,
    pub terms: Vec<TermSpec>,
}

impl Default for ModelSpec {
    /// `oxygen_cons ~ s(exact, by = percentdailytotal, k = 10) + s(age, k = 4)
    /// + sex + s(pool_temp, k = 4) + s(animal, bs = "re")`
    fn default() -> Self {
        Self {
            degree: 3,
            penalty_order: 2,
            select: true,
            terms: vec![
                TermSpec::Smooth {
                    covariate: Covariate::Time,
                    by: Some(Covariate::Proportion),
                    k: 10,
                },
                TermSpec::Smooth {
                    covariate: Covariate::Age,
                    by: None,
                    k: 4,
                },
                TermSpec::Sex,
                TermSpec::Smooth {
                    covariate: Covariate::PoolTemp,
                    by: None,
                    k: 4,
                },
                TermSpec::RandomEffect,
            ],
        }
    }
}

/// The concrete basis of a term, frozen at fit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TermBasis {
    Intercept,
    /// Treatment contrasts: one column per non-reference level.
    Contrast { levels: Vec<String> },
    Spline {
        covariate: Covariate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        by: Option<Covariate>,
        degree: usize,
        knots: Array1<f64>,
        /// The `Z` matrix of the sum-to-zero constraint, when the term has one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        constraint: Option<Array2<f64>>,
    },
    /// One indicator column per subject.
    RandomEffect { levels: Vec<String> },
}

impl TermBasis {
    pub fn num_columns(&self) -> usize {
        match self {
            TermBasis::Intercept => 1,
            TermBasis::Contrast { levels } => levels.len().saturating_sub(1),
            TermBasis::Spline {
                degree,
                knots,
                constraint,
                ..
            } => match constraint {
                Some(z) => z.ncols(),
                None => knots.len() - degree - 1,
            },
            TermBasis::RandomEffect { levels } => levels.len(),
        }
    }

    /// Evaluates the term's design block on `frame`.
    ///
    /// The random-effect block is all zeros when the frame carries no subject
    /// labels, which removes subject effects from population-level predictions.
    pub fn evaluate(&self, frame: &CovariateFrame) -> Result<Array2<f64>, ModelError> {
        let n = frame.len();
        match self {
            TermBasis::Intercept => Ok(Array2::ones((n, 1))),
            TermBasis::Contrast { levels } => {
                let mut block = Array2::zeros((n, levels.len().saturating_sub(1)));
                for (row, label) in frame.sex.iter().enumerate() {
                    match levels.iter().position(|l| l == label) {
                        Some(0) => {}
                        Some(code) => block[[row, code - 1]] = 1.0,
                        None => {
                            return Err(ModelError::UnknownLevel {
                                factor: "sex",
                                level: label.clone(),
                            });
                        }
                    }
                }
                Ok(block)
            }
            TermBasis::Spline {
                covariate,
                by,
                degree,
                knots,
                constraint,
            } => {
                let raw = create_bspline_basis_with_knots(
                    frame.covariate(*covariate),
                    knots.view(),
                    *degree,
                )?;
                let mut block = match constraint {
                    Some(z) => raw.dot(z),
                    None => raw,
                };
                if let Some(by) = by {
                    let by_values = frame.covariate(*by);
                    for (mut row, &value) in block.axis_iter_mut(Axis(0)).zip(by_values.iter()) {
                        row *= value;
                    }
                }
                Ok(block)
            }
            TermBasis::RandomEffect { levels } => {
                let mut block = Array2::zeros((n, levels.len()));
                if let Some(animals) = &frame.animal {
                    for (row, label) in animals.iter().enumerate() {
                        let code = levels.iter().position(|l| l == label).ok_or_else(|| {
                            ModelError::UnknownLevel {
                                factor: "animal",
                                level: label.clone(),
                            }
                        })?;
                        block[[row, code]] = 1.0;
                    }
                }
                Ok(block)
            }
        }
    }
}

/// Placement of one term in the coefficient vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermLayout {
    pub label: String,
    /// `None` for the intercept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<TermSpec>,
    pub basis: TermBasis,
    pub columns: Range<usize>,
    /// Indices into the smoothing parameter vector of this term's penalties.
    pub penalties: Vec<usize>,
}

impl TermLayout {
    pub fn is_penalized(&self) -> bool {
        !self.penalties.is_empty()
    }

    pub fn is_random_effect(&self) -> bool {
        matches!(self.basis, TermBasis::RandomEffect { .. })
    }

    /// Names of the term's coefficients, in column order.
    pub fn coefficient_labels(&self) -> Vec<String> {
        match &self.basis {
            TermBasis::Intercept => vec!["(Intercept)".to_string()],
            TermBasis::Contrast { levels } => {
                levels.iter().skip(1).map(|l| format!("sex{l}")).collect()
            }
            _ => (1..=self.columns.len())
                .map(|j| format!("{}.{}", self.label, j))
                .collect(),
        }
    }
}

/// Column layout of the whole model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLayout {
    pub terms: Vec<TermLayout>,
    pub total_coeffs: usize,
    /// One label per smoothing parameter.
    pub penalty_labels: Vec<String>,
}

impl ModelLayout {
    pub fn term(&self, label: &str) -> Option<&TermLayout> {
        self.terms.iter().find(|t| t.label == label)
    }

    /// Coefficient indices that carry no penalty (intercept and factor contrasts).
    pub fn fixed_columns(&self) -> Vec<usize> {
        self.terms
            .iter()
            .filter(|t| !t.is_penalized())
            .flat_map(|t| t.columns.clone())
            .collect()
    }

    pub fn penalized_columns(&self) -> Vec<usize> {
        self.terms
            .iter()
            .filter(|t| t.is_penalized())
            .flat_map(|t| t.columns.clone())
            .collect()
    }

    /// Evaluates the full design matrix on `frame`.
    pub fn design_matrix(&self, frame: &CovariateFrame) -> Result<Array2<f64>, ModelError> {
        let mut x = Array2::zeros((frame.len(), self.total_coeffs));
        for term in &self.terms {
            let block = term.basis.evaluate(frame)?;
            if block.ncols() != term.columns.len() {
                return Err(ModelError::InternalStackingError);
            }
            x.slice_mut(s![.., term.columns.clone()]).assign(&block);
        }
        Ok(x)
    }
}

/// Covariate values at which the model is evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateFrame {
    pub exact: Array1<f64>,
    pub percent_daily_total: Array1<f64>,
    pub age: Array1<f64>,
    pub pool_temp: Array1<f64>,
    pub sex: Vec<String>,
    /// Subject labels. `None` evaluates the population-level model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animal: Option<Vec<String>>,
}

impl CovariateFrame {
    pub fn from_observations(obs: &Observations) -> Self {
        let labels = |factor: &crate::data::Factor| -> Vec<String> {
            (0..factor.len()).map(|i| factor.label(i).to_string()).collect()
        };
        Self {
            exact: obs.exact.clone(),
            percent_daily_total: obs.percent_daily_total.clone(),
            age: obs.age.clone(),
            pool_temp: obs.pool_temp.clone(),
            sex: labels(&obs.sex),
            animal: Some(labels(&obs.animal)),
        }
    }

    /// A population-level frame with every non-time covariate held fixed.
    pub fn at_times(
        times: ArrayView1<f64>,
        proportion: f64,
        age: f64,
        pool_temp: f64,
        sex: &str,
    ) -> Self {
        let n = times.len();
        Self {
            exact: times.to_owned(),
            percent_daily_total: Array1::from_elem(n, proportion),
            age: Array1::from_elem(n, age),
            pool_temp: Array1::from_elem(n, pool_temp),
            sex: vec![sex.to_string(); n],
            animal: None,
        }
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    pub fn covariate(&self, covariate: Covariate) -> ArrayView1<'_, f64> {
        match covariate {
            Covariate::Time => self.exact.view(),
            Covariate::Proportion => self.percent_daily_total.view(),
            Covariate::Age => self.age.view(),
            Covariate::PoolTemp => self.pool_temp.view(),
        }
    }

    /// Most frequent sex label; ties go to the label that sorts first.
    pub fn modal_sex(&self) -> Option<String> {
        crate::data::Factor::from_labels(self.sex.iter().cloned())
            .modal_level()
            .map(str::to_string)
    }
}

/// The fitted additive model. Immutable once produced by the fitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub spec: ModelSpec,
    pub layout: ModelLayout,
    pub coefficients: Array1<f64>,
    /// Bayesian posterior covariance `(X'X + S)^-1 * scale`.
    pub covariance: Array2<f64>,
    /// Smoothing parameters, aligned with `layout.penalty_labels`.
    pub lambdas: Vec<f64>,
    pub scale: f64,
    /// Effective degrees of freedom per coefficient.
    pub edf: Array1<f64>,
    /// Minimised negative log marginal likelihood.
    pub ml_score: f64,
    pub training: CovariateFrame,
    pub response: Array1<f64>,
    pub fitted_values: Array1<f64>,
    pub residuals: Array1<f64>,
}

/// Custom error type for model loading, saving, and evaluation.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Underlying basis function generation failed: {0}")]
    BasisError(#[from] basis::BasisError),
    #[error("Level '{level}' of factor '{factor}' was not seen when the model was fitted.")]
    UnknownLevel { factor: &'static str, level: String },
    #[error("Internal error: a term's design block does not match its column range.")]
    InternalStackingError,
}

impl FittedModel {
    pub fn n_obs(&self) -> usize {
        self.response.len()
    }

    /// Total effective degrees of freedom of the fit.
    pub fn total_edf(&self) -> f64 {
        self.edf.sum()
    }

    /// Residual degrees of freedom `n - edf`, floored at one.
    pub fn residual_df(&self) -> f64 {
        (self.n_obs() as f64 - self.total_edf()).max(1.0)
    }

    pub fn term_edf(&self, term: &TermLayout) -> f64 {
        self.edf.slice(s![term.columns.clone()]).sum()
    }

    /// Linear predictor on `frame`.
    pub fn predict(&self, frame: &CovariateFrame) -> Result<Array1<f64>, ModelError> {
        let x = self.layout.design_matrix(frame)?;
        Ok(x.dot(&self.coefficients))
    }

    /// Saves the fitted model to a file in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a fitted model from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::{create_bspline_basis, sum_to_zero_constraint};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn frame() -> CovariateFrame {
        CovariateFrame {
            exact: array![0.0, 30.0, 60.0, 90.0],
            percent_daily_total: array![0.2, 0.2, 0.3, 0.3],
            age: array![10.0, 20.0, 30.0, 40.0],
            pool_temp: array![22.0, 23.0, 24.0, 25.0],
            sex: vec!["F".into(), "M".into(), "F".into(), "M".into()],
            animal: Some(vec!["a".into(), "b".into(), "a".into(), "b".into()]),
        }
    }

    #[test]
    fn test_default_spec_labels_follow_formula_order() {
        let labels: Vec<String> = ModelSpec::default().terms.iter().map(TermSpec::label).collect();
        assert_eq!(
            labels,
            vec![
                "s(exact):percentdailytotal",
                "s(age)",
                "sex",
                "s(pool_temp)",
                "s(animal)"
            ]
        );
    }

    #[test]
    fn test_contrast_and_random_effect_blocks() {
        let frame = frame();
        let contrast = TermBasis::Contrast {
            levels: vec!["F".into(), "M".into()],
        };
        assert_eq!(contrast.evaluate(&frame).unwrap(), array![[0.0], [1.0], [0.0], [1.0]]);

        let re = TermBasis::RandomEffect {
            levels: vec!["a".into(), "b".into()],
        };
        let block = re.evaluate(&frame).unwrap();
        assert_eq!(block.row(2).to_vec(), vec![1.0, 0.0]);

        let population = CovariateFrame {
            animal: None,
            ..frame
        };
        assert!(re.evaluate(&population).unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_unknown_level_is_rejected() {
        let mut frame = frame();
        frame.sex[0] = "U".into();
        let contrast = TermBasis::Contrast {
            levels: vec!["F".into(), "M".into()],
        };
        match contrast.evaluate(&frame).unwrap_err() {
            ModelError::UnknownLevel { factor, level } => {
                assert_eq!(factor, "sex");
                assert_eq!(level, "U");
            }
            other => panic!("Expected UnknownLevel, got {:?}", other),
        }
    }

    #[test]
    fn test_by_spline_scales_rows() {
        let frame = frame();
        let (_, knots) = create_bspline_basis(frame.exact.view(), (0.0, 90.0), 5, 3).unwrap();
        let plain = TermBasis::Spline {
            covariate: Covariate::Time,
            by: None,
            degree: 3,
            knots: knots.clone(),
            constraint: None,
        };
        let by = TermBasis::Spline {
            covariate: Covariate::Time,
            by: Some(Covariate::Proportion),
            degree: 3,
            knots,
            constraint: None,
        };
        let plain_block = plain.evaluate(&frame).unwrap();
        let by_block = by.evaluate(&frame).unwrap();
        for row in 0..frame.len() {
            for col in 0..5 {
                assert_abs_diff_eq!(
                    by_block[[row, col]],
                    plain_block[[row, col]] * frame.percent_daily_total[row],
                    epsilon = 1e-12
                );
            }
        }
    }

    #[test]
    fn test_model_toml_round_trip_preserves_predictions() {
        let frame = frame();
        let (raw, knots) = create_bspline_basis(frame.age.view(), (10.0, 40.0), 4, 3).unwrap();
        let z = sum_to_zero_constraint(raw.view()).unwrap();
        let spec = ModelSpec {
            terms: vec![
                TermSpec::Smooth {
                    covariate: Covariate::Age,
                    by: None,
                    k: 4,
                },
                TermSpec::Sex,
            ],
            ..ModelSpec::default()
        };
        let layout = ModelLayout {
            terms: vec![
                TermLayout {
                    label: "(Intercept)".into(),
                    spec: None,
                    basis: TermBasis::Intercept,
                    columns: 0..1,
                    penalties: vec![],
                },
                TermLayout {
                    label: "s(age)".into(),
                    spec: Some(spec.terms[0].clone()),
                    basis: TermBasis::Spline {
                        covariate: Covariate::Age,
                        by: None,
                        degree: 3,
                        knots,
                        constraint: Some(z),
                    },
                    columns: 1..4,
                    penalties: vec![0],
                },
                TermLayout {
                    label: "sex".into(),
                    spec: Some(TermSpec::Sex),
                    basis: TermBasis::Contrast {
                        levels: vec!["F".into(), "M".into()],
                    },
                    columns: 4..5,
                    penalties: vec![],
                },
            ],
            total_coeffs: 5,
            penalty_labels: vec!["s(age)".into()],
        };
        let model = FittedModel {
            spec,
            layout,
            coefficients: array![1.0, 0.5, -0.25, 0.1, 0.3],
            covariance: Array2::eye(5),
            lambdas: vec![2.5],
            scale: 0.2,
            edf: array![1.0, 0.8, 0.7, 0.5, 1.0],
            ml_score: 12.5,
            training: frame.clone(),
            response: array![1.0, 2.0, 3.0, 4.0],
            fitted_values: array![1.1, 1.9, 3.0, 4.0],
            residuals: array![-0.1, 0.1, 0.0, 0.0],
        };

        let file = tempfile::NamedTempFile::new().unwrap();
        model.save(file.path()).unwrap();
        let loaded = FittedModel::load(file.path()).unwrap();

        let original = model.predict(&frame).unwrap();
        let reloaded = loaded.predict(&frame).unwrap();
        for (a, b) in original.iter().zip(reloaded.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        assert_eq!(loaded.layout.penalty_labels, model.layout.penalty_labels);
        assert_abs_diff_eq!(loaded.total_edf(), 4.0, epsilon = 1e-12);
    }
}
