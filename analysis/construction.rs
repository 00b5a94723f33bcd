use crate::basis::{
    create_bspline_basis, create_difference_penalty_matrix, null_space_penalty,
    sum_to_zero_constraint,
};
use crate::data::{Covariate, Observations};
use crate::estimate::FitError;
use crate::model::{CovariateFrame, ModelLayout, ModelSpec, TermBasis, TermLayout, TermSpec};
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use ndarray_linalg::SVD;
use std::ops::Range;

/// One smoothing-parameter penalty, stored at the size of its term's block.
#[derive(Clone, Debug)]
pub struct Penalty {
    pub label: String,
    /// Index of the owning term in `ModelLayout::terms`.
    pub term: usize,
    pub columns: Range<usize>,
    pub matrix: Array2<f64>,
    /// Rank of `matrix`.
    pub rank: usize,
}

impl Penalty {
    /// Embeds the block penalty into a `p x p` matrix.
    pub fn embed(&self, p: usize) -> Array2<f64> {
        let mut full = Array2::zeros((p, p));
        full.slice_mut(s![self.columns.clone(), self.columns.clone()])
            .assign(&self.matrix);
        full
    }
}

/// Everything the fitter needs, built once from the observations.
#[derive(Clone, Debug)]
pub struct DesignMatrices {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub penalties: Vec<Penalty>,
    pub layout: ModelLayout,
    pub frame: CovariateFrame,
}

/// Builds the design matrix, the penalty list and the column layout.
///
/// Term order follows the `ModelSpec` with the intercept first. Smooths without a
/// `by` variable are reparameterised to sum to zero over the data; each
/// penalty is rescaled so its Frobenius norm equals that of `X_j' X_j` for
/// its own block.
pub fn build_design(obs: &Observations, spec: &ModelSpec) -> Result<DesignMatrices, FitError> {
    let frame = CovariateFrame::from_observations(obs);
    let n_samples = obs.len();

    let mut terms = vec![TermLayout {
        label: "(Intercept)".to_string(),
        spec: None,
        basis: TermBasis::Intercept,
        columns: 0..1,
        penalties: Vec::new(),
    }];
    // Block penalties, with the owning term index.
    let mut raw_penalties: Vec<(String, usize, Array2<f64>, usize)> = Vec::new();
    let mut current_col = 1;

    for term_spec in &spec.terms {
        let label = term_spec.label();
        let term_index = terms.len();
        let (basis, block_penalties) = match term_spec {
            TermSpec::Smooth { covariate, by, k } => {
                smooth_term(obs, &label, *covariate, *by, *k, spec)?
            }
            TermSpec::Sex => {
                if obs.sex.num_levels() < 2 {
                    log::info!("Only one sex level is present; dropping the '{label}' term.");
                    continue;
                }
                let basis = TermBasis::Contrast {
                    levels: obs.sex.levels().to_vec(),
                };
                (basis, Vec::new())
            }
            TermSpec::RandomEffect => {
                let levels = obs.animal.levels().to_vec();
                let num_levels = levels.len();
                (
                    TermBasis::RandomEffect { levels },
                    vec![(label.clone(), Array2::eye(num_levels), num_levels)],
                )
            }
        };

        let num_cols = basis.num_columns();
        let columns = current_col..current_col + num_cols;
        current_col += num_cols;

        let mut penalty_indices = Vec::with_capacity(block_penalties.len());
        for (penalty_label, matrix, rank) in block_penalties {
            penalty_indices.push(raw_penalties.len());
            raw_penalties.push((penalty_label, term_index, matrix, rank));
        }

        terms.push(TermLayout {
            label,
            spec: Some(term_spec.clone()),
            basis,
            columns,
            penalties: penalty_indices,
        });
    }

    let layout = ModelLayout {
        penalty_labels: raw_penalties.iter().map(|(l, ..)| l.clone()).collect(),
        terms,
        total_coeffs: current_col,
    };
    let x = layout.design_matrix(&frame)?;

    let penalties = raw_penalties
        .into_iter()
        .map(|(label, term, matrix, rank)| {
            let columns = layout.terms[term].columns.clone();
            let block = x.slice(s![.., columns.clone()]);
            let matrix = scale_to_block(matrix, block);
            Penalty {
                label,
                term,
                columns,
                matrix,
                rank,
            }
        })
        .collect();

    check_parametric_rank(x.view(), &layout.fixed_columns(), n_samples)?;
    log_layout_info(&layout);

    Ok(DesignMatrices {
        x,
        y: obs.oxygen_cons.clone(),
        penalties,
        layout,
        frame,
    })
}

type BlockPenalties = Vec<(String, Array2<f64>, usize)>;

fn smooth_term(
    obs: &Observations,
    label: &str,
    covariate: Covariate,
    by: Option<Covariate>,
    k: usize,
    spec: &ModelSpec,
) -> Result<(TermBasis, BlockPenalties), FitError> {
    if k <= spec.degree || k <= spec.penalty_order {
        return Err(FitError::BasisDimensionTooSmall {
            term: label.to_string(),
            k,
            degree: spec.degree,
        });
    }
    let values = obs.covariate(covariate);
    let unique = count_unique(values.iter().copied());
    if unique < k {
        return Err(FitError::BasisDimensionExceedsData {
            term: label.to_string(),
            k,
            unique,
        });
    }

    let range = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let (raw_basis, knots) = create_bspline_basis(values, range, k, spec.degree)?;
    let difference_penalty = create_difference_penalty_matrix(k, spec.penalty_order)?;

    // A varying by-variable already makes the smooth identifiable; a
    // constant one does not.
    let identifiable_by =
        by.is_some_and(|b| count_unique(obs.covariate(b).iter().copied()) > 1);
    let (constraint, penalty) = if identifiable_by {
        (None, difference_penalty)
    } else {
        let z = sum_to_zero_constraint(raw_basis.view())?;
        let constrained = z.t().dot(&difference_penalty).dot(&z);
        (Some(z), constrained)
    };

    let num_cols = penalty.nrows();
    let mut penalties = Vec::with_capacity(2);
    match null_space_penalty(penalty.view())? {
        Some((null_penalty, null_dim)) => {
            penalties.push((label.to_string(), penalty, num_cols - null_dim));
            if spec.select {
                penalties.push((format!("{label} [null space]"), null_penalty, null_dim));
            }
        }
        None => penalties.push((label.to_string(), penalty, num_cols)),
    }

    let basis = TermBasis::Spline {
        covariate,
        by,
        degree: spec.degree,
        knots,
        constraint,
    };
    Ok((basis, penalties))
}

/// Number of distinct values, treating values within a relative `1e-10` as equal.
pub(crate) fn count_unique(values: impl Iterator<Item = f64>) -> usize {
    let mut sorted: Vec<f64> = values.collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted.dedup_by(|a, b| (*a - *b).abs() <= 1e-10 * b.abs().max(1.0));
    sorted.len()
}

fn frobenius_norm(matrix: ArrayView2<f64>) -> f64 {
    matrix.iter().map(|v| v * v).sum::<f64>().sqrt()
}

fn scale_to_block(penalty: Array2<f64>, block: ArrayView2<f64>) -> Array2<f64> {
    let target = frobenius_norm(block.t().dot(&block).view());
    let current = frobenius_norm(penalty.view());
    if current > 0.0 && target > 0.0 {
        penalty * (target / current)
    } else {
        penalty
    }
}

/// Rejects a parametric design that is rank deficient or larger than the data.
fn check_parametric_rank(
    x: ArrayView2<f64>,
    fixed_columns: &[usize],
    n_samples: usize,
) -> Result<(), FitError> {
    if n_samples < fixed_columns.len() {
        return Err(FitError::TooFewObservations {
            n: n_samples,
            required: fixed_columns.len(),
        });
    }
    let fixed = x.select(Axis(1), fixed_columns);
    let (_, singular_values, _) = fixed.svd(false, false)?;
    let max_sv = singular_values.iter().fold(0.0_f64, |m, &v| m.max(v));
    let tolerance = max_sv * (n_samples.max(fixed_columns.len()) as f64) * f64::EPSILON;
    let rank = singular_values.iter().filter(|&&v| v > tolerance).count();
    if rank < fixed_columns.len() {
        return Err(FitError::RankDeficient {
            rank,
            columns: fixed_columns.len(),
        });
    }
    Ok(())
}

/// Helper to log the final model structure.
fn log_layout_info(layout: &ModelLayout) {
    log::info!("Model structure has {} total coefficients.", layout.total_coeffs);
    for term in &layout.terms {
        log::info!(
            "  - {}: {} coefficient(s), {} penalt{}.",
            term.label,
            term.columns.len(),
            term.penalties.len(),
            if term.penalties.len() == 1 { "y" } else { "ies" }
        );
    }
    log::info!("Total smoothing parameters: {}", layout.penalty_labels.len());
}
