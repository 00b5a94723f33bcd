//! End-to-end analysis: load, fit, diagnose, summarise, predict and
//! integrate, in that order. Any error aborts the run.

use crate::data::{Covariate, LoadError, Observations, load_observations};
use crate::diagnostics::{DiagnosticsConfig, DiagnosticsError, DiagnosticsReport, run_diagnostics};
use crate::estimate::{FitConfig, FitError, fit_model};
use crate::inference::{AnovaTable, InferenceError, ModelSummary, anova, summarize};
use crate::integrate::{AucSeries, IntegrationError, cumulative_auc};
use crate::model::{FittedModel, ModelError, ModelSpec};
use crate::predict::{
    ConditionAt, GridSpec, PredictionCurve, PredictionError, partial_effect, predict_fixed,
    predict_marginal,
};
use crate::report::{PlotStyle, ReportError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to load observations: {0}")]
    Load(#[from] LoadError),
    #[error("Model fitting failed: {0}")]
    Fit(#[from] FitError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Diagnostics failed: {0}")]
    Diagnostics(#[from] DiagnosticsError),
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("Prediction failed: {0}")]
    Prediction(#[from] PredictionError),
    #[error("AUC integration failed: {0}")]
    Integration(#[from] IntegrationError),
    #[error("Failed to write the report: {0}")]
    Report(#[from] ReportError),
    #[error("Failed to read configuration file '{path}': {source}")]
    ConfigIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Every setting of an analysis run. Missing TOML keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Coverage of the pointwise confidence bands.
    pub confidence_level: f64,
    /// Hold the fixed prediction at the observed means and modal sex
    /// instead of `condition`.
    pub typical_condition: bool,
    /// Grid size for the partial effects of the non-time covariates.
    pub partial_points: usize,
    pub model: ModelSpec,
    pub fit: FitConfig,
    pub diagnostics: DiagnosticsConfig,
    pub grid: GridSpec,
    pub condition: ConditionAt,
    pub style: PlotStyle,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            typical_condition: false,
            partial_points: 100,
            model: ModelSpec::default(),
            fit: FitConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            grid: GridSpec::default(),
            condition: ConditionAt::default(),
            style: PlotStyle::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, PipelineError> {
        let contents = std::fs::read_to_string(path).map_err(|source| PipelineError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }
}

/// Fixed and marginal predictions with their cumulative AUC.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionSet {
    pub fixed: PredictionCurve,
    pub marginal: PredictionCurve,
    pub fixed_auc: AucSeries,
    pub marginal_auc: AucSeries,
}

#[derive(Debug, Clone)]
pub struct AnalysisResults {
    pub observations: Observations,
    pub model: FittedModel,
    pub summary: ModelSummary,
    pub anova: AnovaTable,
    pub diagnostics: DiagnosticsReport,
    pub partials: Vec<PredictionCurve>,
    pub predictions: PredictionSet,
}

/// Loads `data_path` and fits the configured model.
pub fn fit_from_path(
    data_path: &Path,
    config: &AnalysisConfig,
) -> Result<(Observations, FittedModel), PipelineError> {
    let observations = load_observations(data_path)?;
    let model = fit_model(&observations, &config.model, &config.fit)?;
    Ok((observations, model))
}

/// Fixed and marginal predictions on the configured grid, integrated.
pub fn predict_curves(
    model: &FittedModel,
    config: &AnalysisConfig,
) -> Result<PredictionSet, PipelineError> {
    let condition = if config.typical_condition {
        ConditionAt::typical(model)
    } else {
        config.condition.clone()
    };
    let fixed = predict_fixed(model, &config.grid, &condition, config.confidence_level)?;
    let marginal = predict_marginal(model, &config.grid, config.confidence_level)?;
    let fixed_auc = cumulative_auc(fixed.x.view(), fixed.fit.view())?;
    let marginal_auc = cumulative_auc(marginal.x.view(), marginal.fit.view())?;
    log::info!(
        "AUC over the grid: fixed = {:.4}, marginal = {:.4}",
        fixed_auc.total(),
        marginal_auc.total()
    );
    Ok(PredictionSet {
        fixed,
        marginal,
        fixed_auc,
        marginal_auc,
    })
}

/// Partial effects of every covariate the model has a smooth for.
pub fn partial_curves(
    model: &FittedModel,
    config: &AnalysisConfig,
) -> Result<Vec<PredictionCurve>, PipelineError> {
    let span = GridSpec::Span {
        points: config.partial_points,
    };
    let mut curves = Vec::new();
    for covariate in [
        Covariate::Time,
        Covariate::Proportion,
        Covariate::Age,
        Covariate::PoolTemp,
    ] {
        let grid = match covariate {
            Covariate::Time => &config.grid,
            _ => &span,
        };
        match partial_effect(model, covariate, grid, config.confidence_level) {
            Ok(curve) => curves.push(curve),
            Err(PredictionError::TermNotInModel(name)) => {
                log::debug!("No smooth for '{name}', skipping its partial effect");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(curves)
}

/// Runs the whole analysis on the observations in `data_path`.
pub fn run_analysis(
    data_path: &Path,
    config: &AnalysisConfig,
) -> Result<AnalysisResults, PipelineError> {
    let (observations, model) = fit_from_path(data_path, config)?;
    analyze_fitted(observations, model, config)
}

/// Everything after the fit, for callers that already hold a model.
pub fn analyze_fitted(
    observations: Observations,
    model: FittedModel,
    config: &AnalysisConfig,
) -> Result<AnalysisResults, PipelineError> {
    log::info!("Running diagnostics");
    let diagnostics = run_diagnostics(&model, &config.diagnostics)?;

    let summary = summarize(&model)?;
    let anova = anova(&model)?;
    let partials = partial_curves(&model, config)?;
    let predictions = predict_curves(&model, config)?;

    Ok(AnalysisResults {
        observations,
        model,
        summary,
        anova,
        diagnostics,
        partials,
        predictions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_defaults_fill_missing_keys() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "confidence_level = 0.9\n\n[grid]\nkind = \"range\"\nstart = 0.0\nend = 60.0\nstep = 5.0\n\n[condition]\nsex = \"M\"\n"
        )
        .unwrap();
        let config = AnalysisConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.confidence_level, 0.9);
        assert_eq!(
            config.grid,
            GridSpec::Range {
                start: 0.0,
                end: 60.0,
                step: 5.0
            }
        );
        assert_eq!(config.condition.sex.as_deref(), Some("M"));
        assert_eq!(config.condition.proportion, 0.23);
        assert_eq!(config.model, ModelSpec::default());
        assert_eq!(config.fit, FitConfig::default());
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = AnalysisConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: AnalysisConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_missing_config_file_is_reported() {
        let err = AnalysisConfig::from_toml_file(Path::new("/nonexistent/hifgam.toml"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::ConfigIo { .. }));
    }
}
