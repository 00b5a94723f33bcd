//! Test fixtures and builders for hifgam tests and benchmarks.
//!
//! This module provides seeded synthetic respirometry studies, reducing
//! boilerplate across unit tests, integration tests and benches.

use crate::data::{Factor, LoadError, Observations};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::Path;

/// Heat-increment shape used to generate responses: a gamma-like pulse
/// peaking at `peak` minutes with height `height`.
pub fn hif_pulse(t: f64, peak: f64, height: f64) -> f64 {
    let u = t / peak;
    height * u * (1.0 - u).exp()
}

/// Builder for a synthetic multi-animal feeding study.
///
/// Every animal contributes `sessions` observations. Measurement times
/// cycle through `0, 10, ..., 130` minutes, the fed proportion through four
/// levels, and one animal in three is male so the sexes are unbalanced.
#[derive(Clone, Debug)]
pub struct SyntheticStudy {
    n_animals: usize,
    sessions: usize,
    distinct_ages: usize,
    noise_sd: f64,
    seed: u64,
}

impl Default for SyntheticStudy {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticStudy {
    /// Create a new builder with defaults: 6 animals x 20 sessions.
    pub fn new() -> Self {
        Self {
            n_animals: 6,
            sessions: 20,
            distinct_ages: 8,
            noise_sd: 0.1,
            seed: 42,
        }
    }

    pub fn with_animals(mut self, n: usize) -> Self {
        self.n_animals = n.max(1);
        self
    }

    pub fn with_sessions(mut self, n: usize) -> Self {
        self.sessions = n.max(1);
        self
    }

    /// Set how many distinct ages occur in the study.
    pub fn with_distinct_ages(mut self, n: usize) -> Self {
        self.distinct_ages = n.max(1);
        self
    }

    pub fn with_noise(mut self, sd: f64) -> Self {
        self.noise_sd = sd.abs();
        self
    }

    /// Set the random seed for reproducibility.
    pub fn seed(mut self, s: u64) -> Self {
        self.seed = s;
        self
    }

    pub fn build(&self) -> Result<Observations, LoadError> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let animal_effects: Vec<f64> = (0..self.n_animals)
            .map(|_| 0.2 * rng.sample::<f64, _>(StandardNormal))
            .collect();
        let proportions = [0.15, 0.2, 0.25, 0.3];

        let n = self.n_animals * self.sessions;
        let mut animal = Vec::with_capacity(n);
        let mut sex = Vec::with_capacity(n);
        let mut exact = Vec::with_capacity(n);
        let mut prop = Vec::with_capacity(n);
        let mut age = Vec::with_capacity(n);
        let mut pool_temp = Vec::with_capacity(n);
        let mut kcal = Vec::with_capacity(n);
        let mut response = Vec::with_capacity(n);

        for a in 0..self.n_animals {
            let is_male = a % 3 == 0;
            for session in 0..self.sessions {
                let t = (session % 14) as f64 * 10.0;
                let p = proportions[(a + session) % proportions.len()];
                let years = 8.0 + 3.0 * ((a + session / 3) % self.distinct_ages) as f64;
                let temp = 21.0 + 0.25 * ((session * 7 + a) % 12) as f64;
                let mean = 1.5
                    + if is_male { 0.4 } else { 0.0 }
                    + animal_effects[a]
                    + p * hif_pulse(t, 40.0, 8.0)
                    + 0.02 * (years - 15.0)
                    + 0.05 * (temp - 23.0);

                animal.push(format!("{}", a + 1));
                sex.push(if is_male { "M" } else { "F" });
                exact.push(t);
                prop.push(p);
                age.push(years);
                pool_temp.push(temp);
                kcal.push(if (a + session) % 17 == 5 { None } else { Some(p * 20_000.0) });
                response.push(mean + self.noise_sd * rng.sample::<f64, _>(StandardNormal));
            }
        }

        Observations::new(
            Factor::from_labels(animal),
            Array1::from_vec(exact),
            Array1::from_vec(response),
            Array1::from_vec(prop),
            Array1::from_vec(age),
            Factor::from_labels(sex),
            Array1::from_vec(pool_temp),
            kcal,
        )
    }
}

/// Twenty observations across two subjects with a linear time trend
/// `y = 2 + 0.05 t + N(0, 0.1)` over `0..=130` minutes and a constant fed
/// proportion of one.
pub fn linear_trend_study(seed: u64) -> Result<Observations, LoadError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = 20;
    let exact: Vec<f64> = (0..n).map(|i| i as f64 * 130.0 / (n - 1) as f64).collect();
    let response: Vec<f64> = exact
        .iter()
        .map(|&t| 2.0 + 0.05 * t + 0.1 * rng.sample::<f64, _>(StandardNormal))
        .collect();

    Observations::new(
        Factor::from_labels((0..n).map(|i| if i % 2 == 0 { "A" } else { "B" })),
        Array1::from_vec(exact),
        Array1::from_vec(response),
        Array1::ones(n),
        Array1::from_elem(n, 20.0),
        Factor::from_labels(vec!["F"; n]),
        Array1::from_elem(n, 23.0),
        vec![Some(5000.0); n],
    )
}

/// Writes observations as a comma-separated file in the loader's layout.
pub fn write_observations_csv(obs: &Observations, path: &Path) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([
        "Animal",
        "exact",
        "Oxygen Cons",
        "percentDailyTotal",
        "age",
        "Sex",
        "pool_temp",
        "kcal",
    ])?;
    for i in 0..obs.len() {
        writer.write_record([
            obs.animal.label(i).to_string(),
            obs.exact[i].to_string(),
            obs.oxygen_cons[i].to_string(),
            obs.percent_daily_total[i].to_string(),
            obs.age[i].to_string(),
            obs.sex.label(i).to_string(),
            obs.pool_temp[i].to_string(),
            obs.kcal[i].map_or_else(|| "NA".to_string(), |v| v.to_string()),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
