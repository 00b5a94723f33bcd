use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::{Eigh, UPLO};
use thiserror::Error;

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Spline degree must be at least 1, but was {0}.")]
    InvalidDegree(usize),

    #[error("Data range is invalid: start ({0}) must be strictly less than end ({1}).")]
    InvalidRange(f64, f64),

    #[error(
        "Basis dimension {num_basis} is too small for a degree {degree} spline; it must exceed the degree."
    )]
    BasisDimensionTooSmall { num_basis: usize, degree: usize },

    #[error(
        "Penalty order ({order}) must be positive and less than the number of basis functions ({num_basis})."
    )]
    InvalidPenaltyOrder { order: usize, num_basis: usize },

    #[error("Knot vector of length {found} does not match a basis of {num_basis} functions of degree {degree}.")]
    KnotVectorMismatch {
        found: usize,
        num_basis: usize,
        degree: usize,
    },

    #[error("Sum-to-zero constraint is undefined: the basis columns sum to zero.")]
    DegenerateConstraint,

    #[error("Eigendecomposition failed while building a null-space penalty: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
}

/// Creates a P-spline basis matrix and its extended knot vector.
///
/// The knots are evenly spaced with spacing `h = (max - min) / (k - degree)`
/// and extend `degree` intervals beyond either end of `data_range`, so every
/// basis function has full support and the knot vector has
/// `num_basis + degree + 1` entries. Data outside the range are clamped to
/// the boundary before evaluation.
///
/// # Arguments
///
/// * `data`: the covariate values to evaluate.
/// * `data_range`: `(min, max)` of the *training* covariate. Prediction must
///   reuse the training range to get a consistent basis.
/// * `num_basis`: the basis dimension `k`.
/// * `degree`: the polynomial degree (3 for cubic).
pub fn create_bspline_basis(
    data: ArrayView1<f64>,
    data_range: (f64, f64),
    num_basis: usize,
    degree: usize,
) -> Result<(Array2<f64>, Array1<f64>), BasisError> {
    if degree < 1 {
        return Err(BasisError::InvalidDegree(degree));
    }
    if !(data_range.0 < data_range.1) {
        return Err(BasisError::InvalidRange(data_range.0, data_range.1));
    }
    if num_basis <= degree {
        return Err(BasisError::BasisDimensionTooSmall { num_basis, degree });
    }

    let knot_vector = internal::generate_extended_knot_vector(data_range, num_basis, degree);
    let basis_matrix = create_bspline_basis_with_knots(data, knot_vector.view(), degree)?;
    Ok((basis_matrix, knot_vector))
}

/// Evaluates a basis on a previously generated extended knot vector.
///
/// Values outside the interior of the knot vector are clamped to the
/// training range it was built on.
pub fn create_bspline_basis_with_knots(
    data: ArrayView1<f64>,
    knots: ArrayView1<f64>,
    degree: usize,
) -> Result<Array2<f64>, BasisError> {
    if degree < 1 {
        return Err(BasisError::InvalidDegree(degree));
    }
    if knots.len() < 2 * degree + 2 {
        return Err(BasisError::KnotVectorMismatch {
            found: knots.len(),
            num_basis: knots.len().saturating_sub(degree + 1),
            degree,
        });
    }
    let num_basis = knots.len() - degree - 1;

    let mut basis_matrix = Array2::zeros((data.len(), num_basis));
    for (i, &x) in data.iter().enumerate() {
        let (start, values) = internal::evaluate_splines_at_point(x, degree, knots);
        basis_matrix
            .slice_mut(s![i, start..start + degree + 1])
            .assign(&values);
    }
    Ok(basis_matrix)
}

/// Creates a penalty matrix `S` for a B-spline basis from a difference matrix `D`.
/// The penalty is of the form `S = D' * D`, penalizing the squared `order`-th
/// differences of the spline coefficients. This is the core of P-splines.
///
/// # Arguments
/// * `num_basis_functions`: The number of basis functions (i.e., columns in the basis matrix).
/// * `order`: The order of the difference penalty (e.g., 2 for second differences).
pub fn create_difference_penalty_matrix(
    num_basis_functions: usize,
    order: usize,
) -> Result<Array2<f64>, BasisError> {
    if order == 0 || order >= num_basis_functions {
        return Err(BasisError::InvalidPenaltyOrder {
            order,
            num_basis: num_basis_functions,
        });
    }

    let mut d = Array2::<f64>::eye(num_basis_functions);
    // Each pass drops one row.
    for _ in 0..order {
        d = &d.slice(s![1.., ..]) - &d.slice(s![..-1, ..]);
    }

    Ok(d.t().dot(&d))
}

/// Builds the sum-to-zero reparameterisation of a basis.
///
/// With `c = B' 1`, a Householder reflection `H = I - 2 v v' / v'v`,
/// `v = c + sign(c_1) ||c|| e_1`, maps `c` onto the first axis, so the last
/// `k - 1` columns of `H` span the orthogonal complement of `c`. These
/// columns form `Z` (shape `k x (k - 1)`, orthonormal columns) and the
/// constrained basis `B Z` has columns that sum to zero over the data.
pub fn sum_to_zero_constraint(basis_matrix: ArrayView2<f64>) -> Result<Array2<f64>, BasisError> {
    let k = basis_matrix.ncols();
    let c = basis_matrix.sum_axis(Axis(0));
    let norm = c.dot(&c).sqrt();
    if norm <= f64::EPSILON || k < 2 {
        return Err(BasisError::DegenerateConstraint);
    }

    let mut v = c;
    v[0] += if v[0] >= 0.0 { norm } else { -norm };
    let vtv = v.dot(&v);

    let mut z = Array2::zeros((k, k - 1));
    for i in 0..k {
        for j in 1..k {
            let identity = if i == j { 1.0 } else { 0.0 };
            z[[i, j - 1]] = identity - 2.0 * v[i] * v[j] / vtv;
        }
    }
    Ok(z)
}

/// Builds the penalty on the null space of `penalty`.
///
/// Returns `U0 U0'` where the columns of `U0` are the eigenvectors of
/// `penalty` whose eigenvalues are numerically zero, together with the
/// dimension of that null space. A full-rank penalty yields `None`.
pub fn null_space_penalty(
    penalty: ArrayView2<f64>,
) -> Result<Option<(Array2<f64>, usize)>, BasisError> {
    let (eigenvalues, eigenvectors) = penalty.to_owned().eigh(UPLO::Lower)?;
    let max_eigenvalue = eigenvalues.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));
    let tolerance = max_eigenvalue.max(1.0) * 1e-8;

    let null_columns: Vec<usize> = eigenvalues
        .iter()
        .enumerate()
        .filter(|&(_, &value)| value.abs() <= tolerance)
        .map(|(idx, _)| idx)
        .collect();
    if null_columns.is_empty() {
        return Ok(None);
    }

    let u0 = eigenvectors.select(Axis(1), &null_columns);
    Ok(Some((u0.dot(&u0.t()), null_columns.len())))
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    /// Evenly spaced knots extended `degree` intervals past both boundaries.
    pub(super) fn generate_extended_knot_vector(
        data_range: (f64, f64),
        num_basis: usize,
        degree: usize,
    ) -> Array1<f64> {
        let (min_val, max_val) = data_range;
        let h = (max_val - min_val) / (num_basis - degree) as f64;
        Array1::from_iter(
            (0..num_basis + degree + 1).map(|i| min_val + (i as f64 - degree as f64) * h),
        )
    }

    /// Evaluates the `degree + 1` non-zero basis functions at `x`.
    ///
    /// Returns the index of the first non-zero function and their values.
    pub(super) fn evaluate_splines_at_point(
        x: f64,
        degree: usize,
        knots: ArrayView1<f64>,
    ) -> (usize, Array1<f64>) {
        let num_basis = knots.len() - degree - 1;
        let lower = knots[degree];
        let upper = knots[num_basis];
        let x = x.clamp(lower, upper);

        // knots[mu] <= x < knots[mu + 1], with the right boundary folded
        // into the last interval.
        let mu = match knots.iter().rposition(|&k| k <= x) {
            Some(pos) => pos.clamp(degree, num_basis - 1),
            None => degree,
        };

        let mut n = Array1::zeros(degree + 1);
        let mut left = vec![0.0; degree + 1];
        let mut right = vec![0.0; degree + 1];
        n[0] = 1.0;
        for j in 1..=degree {
            left[j] = x - knots[mu + 1 - j];
            right[j] = knots[mu + j] - x;
            let mut saved = 0.0;
            for r in 0..j {
                let denom = right[r + 1] + left[j - r];
                let temp = if denom.abs() > 1e-12 { n[r] / denom } else { 0.0 };
                n[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            n[j] = saved;
        }

        (mu - degree, n)
    }
}
