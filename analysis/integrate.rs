//! Cumulative trapezoid integration of a predicted response curve.

use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum IntegrationError {
    #[error("Times and responses differ in length ({times} vs {responses}).")]
    LengthMismatch { times: usize, responses: usize },
    #[error("At least two points are needed to integrate, got {0}.")]
    TooFewPoints(usize),
    #[error("Times must be strictly increasing: t[{index}] = {current} follows {previous}.")]
    NotIncreasing {
        index: usize,
        previous: f64,
        current: f64,
    },
    #[error("Non-finite value at position {0}.")]
    NonFinite(usize),
}

/// Running area under a curve. `cumulative[0]` is always zero.
#[derive(Debug, Clone, PartialEq)]
pub struct AucSeries {
    pub times: Array1<f64>,
    pub cumulative: Array1<f64>,
}

impl AucSeries {
    /// Area over the whole time range.
    pub fn total(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

pub fn cumulative_auc(
    times: ArrayView1<f64>,
    response: ArrayView1<f64>,
) -> Result<AucSeries, IntegrationError> {
    if times.len() != response.len() {
        return Err(IntegrationError::LengthMismatch {
            times: times.len(),
            responses: response.len(),
        });
    }
    if times.len() < 2 {
        return Err(IntegrationError::TooFewPoints(times.len()));
    }
    if let Some(index) = times
        .iter()
        .zip(response.iter())
        .position(|(t, r)| !(t.is_finite() && r.is_finite()))
    {
        return Err(IntegrationError::NonFinite(index));
    }

    let mut cumulative = Vec::with_capacity(times.len());
    cumulative.push(0.0);
    let mut area = 0.0;
    for (i, ((t0, r0), (t1, r1))) in times
        .iter()
        .zip(response.iter())
        .tuple_windows()
        .enumerate()
    {
        if t1 <= t0 {
            return Err(IntegrationError::NotIncreasing {
                index: i + 1,
                previous: *t0,
                current: *t1,
            });
        }
        area += (t1 - t0) * (r1 + r0) / 2.0;
        cumulative.push(area);
    }

    Ok(AucSeries {
        times: times.to_owned(),
        cumulative: Array1::from_vec(cumulative),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_constant_response_on_three_points() {
        let auc = cumulative_auc(array![0.0, 10.0, 20.0].view(), array![1.0, 1.0, 1.0].view())
            .unwrap();
        assert_eq!(auc.cumulative, array![0.0, 10.0, 20.0]);
        assert_eq!(auc.total(), 20.0);
    }

    #[test]
    fn test_constant_response_grows_linearly() {
        let (h, r) = (2.5, 3.2);
        let times = Array1::from_iter((0..40).map(|i| i as f64 * h));
        let response = Array1::from_elem(40, r);
        let auc = cumulative_auc(times.view(), response.view()).unwrap();
        for (i, value) in auc.cumulative.iter().enumerate() {
            assert_abs_diff_eq!(*value, i as f64 * h * r, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_linear_response_is_exact() {
        let times = Array1::linspace(0.0, 130.0, 131);
        let response = times.mapv(|t| 2.0 + 0.05 * t);
        let auc = cumulative_auc(times.view(), response.view()).unwrap();
        assert_abs_diff_eq!(auc.total(), 2.0 * 130.0 + 0.025 * 130.0 * 130.0, epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(
            cumulative_auc(array![0.0, 10.0, 5.0].view(), array![1.0, 1.0, 1.0].view()),
            Err(IntegrationError::NotIncreasing {
                index: 2,
                previous: 10.0,
                current: 5.0
            })
        );
        assert!(matches!(
            cumulative_auc(array![0.0, 0.0].view(), array![1.0, 1.0].view()),
            Err(IntegrationError::NotIncreasing { .. })
        ));
        assert_eq!(
            cumulative_auc(array![0.0].view(), array![1.0].view()),
            Err(IntegrationError::TooFewPoints(1))
        );
        assert!(matches!(
            cumulative_auc(array![0.0, 1.0].view(), array![1.0].view()),
            Err(IntegrationError::LengthMismatch { .. })
        ));
        assert_eq!(
            cumulative_auc(array![0.0, 1.0].view(), array![1.0, f64::NAN].view()),
            Err(IntegrationError::NonFinite(1))
        );
    }
}
