//! Writes analysis results to disk: tab-separated tables, a plain-text
//! summary and a `figures.toml` manifest describing each figure.
//!
//! Nothing is rendered here. The manifest names the table behind every
//! figure, its aesthetics and the `PlotStyle` so an external plotting tool
//! can draw them.

use crate::data::Observations;
use crate::diagnostics::DiagnosticsReport;
use crate::inference::{AnovaTable, ModelSummary};
use crate::integrate::AucSeries;
use crate::model::FittedModel;
use crate::pipeline::{AnalysisResults, PredictionSet};
use crate::predict::PredictionCurve;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("I/O error while writing the report: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to write a table: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Failed to serialize the figure manifest: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Presentation settings handed to whatever draws the figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlotStyle {
    pub theme: String,
    pub line_width: f64,
    pub ribbon_alpha: f64,
    /// Observation column mapped to point colour.
    pub colour_column: String,
    pub palette: Vec<String>,
    /// Point shapes per animal, recycled when there are more animals.
    pub shapes: Vec<String>,
}

impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            theme: "classic".to_string(),
            line_width: 0.8,
            ribbon_alpha: 0.2,
            colour_column: "kcal".to_string(),
            palette: ["#440154", "#3b528b", "#21918c", "#5ec962", "#fde725"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            shapes: ["circle", "triangle", "square", "diamond", "cross", "star"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Figure {
    pub name: String,
    /// `points`, `line`, `line_ribbon` or `bars`.
    pub kind: String,
    pub table: String,
    pub x: String,
    pub y: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ymin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ymax: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colour: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conditioning: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureManifest {
    pub style: PlotStyle,
    pub figures: Vec<Figure>,
}

pub const MANIFEST_FILE: &str = "figures.toml";
pub const SUMMARY_FILE: &str = "summary.txt";

fn num(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        "NA".to_string()
    }
}

struct ReportWriter {
    dir: PathBuf,
    written: Vec<PathBuf>,
    figures: Vec<Figure>,
}

impl ReportWriter {
    fn new(dir: &Path) -> Result<Self, ReportError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            written: Vec::new(),
            figures: Vec::new(),
        })
    }

    fn table<I>(&mut self, name: &str, header: &[&str], rows: I) -> Result<String, ReportError>
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        let file_name = format!("{name}.tsv");
        let path = self.dir.join(&file_name);
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(&path)?;
        writer.write_record(header)?;
        for row in rows {
            writer.write_record(&row)?;
        }
        writer.flush()?;
        self.written.push(path);
        Ok(file_name)
    }

    fn curve(&mut self, name: &str, curve: &PredictionCurve) -> Result<(), ReportError> {
        let rows = (0..curve.len()).map(|i| {
            vec![
                num(curve.x[i]),
                num(curve.fit[i]),
                num(curve.se[i]),
                num(curve.lower[i]),
                num(curve.upper[i]),
            ]
        });
        let table = self.table(
            name,
            &[curve.x_name.as_str(), "fit", "se", "lower", "upper"],
            rows,
        )?;
        let mut conditioning: BTreeMap<String, String> =
            curve.conditioning.iter().cloned().collect();
        conditioning.insert("level".to_string(), curve.level.to_string());
        self.figures.push(Figure {
            name: name.to_string(),
            kind: "line_ribbon".to_string(),
            table,
            x: curve.x_name.clone(),
            y: "fit".to_string(),
            ymin: Some("lower".to_string()),
            ymax: Some("upper".to_string()),
            colour: None,
            conditioning,
        });
        Ok(())
    }

    fn auc(&mut self, name: &str, auc: &AucSeries) -> Result<(), ReportError> {
        let rows = auc
            .times
            .iter()
            .zip(auc.cumulative.iter())
            .map(|(t, a)| vec![num(*t), num(*a)]);
        let table = self.table(name, &["exact", "cumulative_auc"], rows)?;
        self.figures.push(Figure {
            name: name.to_string(),
            kind: "line".to_string(),
            table,
            x: "exact".to_string(),
            y: "cumulative_auc".to_string(),
            ymin: None,
            ymax: None,
            colour: None,
            conditioning: BTreeMap::new(),
        });
        Ok(())
    }

    fn predictions(&mut self, set: &PredictionSet) -> Result<(), ReportError> {
        self.curve("prediction_fixed", &set.fixed)?;
        self.curve("prediction_marginal", &set.marginal)?;
        self.auc("auc_fixed", &set.fixed_auc)?;
        self.auc("auc_marginal", &set.marginal_auc)
    }

    fn observations(
        &mut self,
        obs: &Observations,
        model: &FittedModel,
        style: &PlotStyle,
    ) -> Result<(), ReportError> {
        let rows = (0..obs.len()).map(|i| {
            vec![
                obs.animal.label(i).to_string(),
                num(obs.exact[i]),
                num(obs.oxygen_cons[i]),
                num(obs.percent_daily_total[i]),
                num(obs.age[i]),
                obs.sex.label(i).to_string(),
                num(obs.pool_temp[i]),
                obs.kcal[i].map_or_else(|| "NA".to_string(), num),
                num(model.fitted_values[i]),
                num(model.residuals[i]),
            ]
        });
        let table = self.table(
            "observations",
            &[
                "animal",
                "exact",
                "oxygen_cons",
                "percentdailytotal",
                "age",
                "sex",
                "pool_temp",
                "kcal",
                "fitted",
                "residual",
            ],
            rows,
        )?;
        self.figures.push(Figure {
            name: "observations".to_string(),
            kind: "points".to_string(),
            table,
            x: "exact".to_string(),
            y: "oxygen_cons".to_string(),
            ymin: None,
            ymax: None,
            colour: Some(style.colour_column.clone()),
            conditioning: BTreeMap::new(),
        });
        Ok(())
    }

    fn inference(
        &mut self,
        summary: &ModelSummary,
        anova: &AnovaTable,
    ) -> Result<(), ReportError> {
        self.table(
            "parametric",
            &["term", "estimate", "std_error", "t_value", "p_value"],
            summary.parametric.iter().map(|r| {
                vec![
                    r.term.clone(),
                    num(r.estimate),
                    num(r.std_error),
                    num(r.t_value),
                    num(r.p_value),
                ]
            }),
        )?;
        self.table(
            "smooths",
            &["term", "edf", "ref_df", "f_value", "p_value"],
            summary.smooths.iter().map(|r| {
                vec![
                    r.term.clone(),
                    num(r.edf),
                    num(r.ref_df),
                    num(r.f_value),
                    num(r.p_value),
                ]
            }),
        )?;
        let parametric = anova.parametric.iter().map(|r| {
            vec![
                "parametric".to_string(),
                r.term.clone(),
                r.df.to_string(),
                num(r.f_value),
                num(r.p_value),
            ]
        });
        let smooth = anova.smooths.iter().map(|r| {
            vec![
                "smooth".to_string(),
                r.term.clone(),
                num(r.ref_df),
                num(r.f_value),
                num(r.p_value),
            ]
        });
        self.table(
            "anova",
            &["kind", "term", "df", "f_value", "p_value"],
            parametric.chain(smooth),
        )?;
        Ok(())
    }

    fn diagnostics(
        &mut self,
        report: &DiagnosticsReport,
        model: &FittedModel,
    ) -> Result<(), ReportError> {
        let opt = |v: Option<f64>| v.map_or_else(|| "NA".to_string(), num);
        self.table(
            "basis_checks",
            &["term", "k_prime", "edf", "k_index", "p_value", "suspect"],
            report.basis_checks.iter().map(|c| {
                vec![
                    c.term.clone(),
                    c.k_prime.to_string(),
                    num(c.edf),
                    opt(c.k_index),
                    opt(c.p_value),
                    c.suspect.to_string(),
                ]
            }),
        )?;

        let acf = &report.autocorrelation;
        let table = self.table(
            "autocorrelation",
            &["lag", "acf", "band", "flagged"],
            acf.acf.iter().enumerate().map(|(lag, value)| {
                vec![
                    lag.to_string(),
                    num(*value),
                    num(acf.band),
                    acf.flagged_lags.contains(&lag).to_string(),
                ]
            }),
        )?;
        self.figures.push(Figure {
            name: "autocorrelation".to_string(),
            kind: "bars".to_string(),
            table,
            x: "lag".to_string(),
            y: "acf".to_string(),
            ymin: None,
            ymax: None,
            colour: None,
            conditioning: BTreeMap::new(),
        });

        let table = self.table(
            "scaled_residuals",
            &["row", "exact", "fitted", "scaled_residual"],
            report.scaled_residuals.iter().enumerate().map(|(i, r)| {
                vec![
                    (i + 1).to_string(),
                    num(model.training.exact[i]),
                    num(model.fitted_values[i]),
                    num(*r),
                ]
            }),
        )?;
        self.figures.push(Figure {
            name: "scaled_residuals_vs_fitted".to_string(),
            kind: "points".to_string(),
            table,
            x: "fitted".to_string(),
            y: "scaled_residual".to_string(),
            ymin: None,
            ymax: None,
            colour: None,
            conditioning: BTreeMap::new(),
        });
        Ok(())
    }

    fn text(&mut self, name: &str, contents: &str) -> Result<(), ReportError> {
        let path = self.dir.join(name);
        let mut file = BufWriter::new(File::create(&path)?);
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        self.written.push(path);
        Ok(())
    }

    fn finish(mut self, style: &PlotStyle) -> Result<Vec<PathBuf>, ReportError> {
        let manifest = FigureManifest {
            style: style.clone(),
            figures: std::mem::take(&mut self.figures),
        };
        let contents = toml::to_string_pretty(&manifest)?;
        self.text(MANIFEST_FILE, &contents)?;
        Ok(self.written)
    }
}

fn summary_text(results: &AnalysisResults) -> String {
    let mut text = String::new();
    text.push_str(&format!("{}\n\n", results.summary));
    text.push_str(&format!("{}\n\n", results.anova));
    text.push_str(&format!("{}\n\n", results.diagnostics));
    let warnings = results.diagnostics.warnings();
    if warnings.is_empty() {
        text.push_str("Diagnostics: no issues flagged.\n");
    } else {
        text.push_str("Diagnostic warnings:\n");
        for warning in warnings {
            text.push_str(&format!("  - {warning}\n"));
        }
    }
    let set = &results.predictions;
    text.push_str(&format!(
        "\nAUC over [{}, {}]: fixed = {:.4}, marginal = {:.4}\n",
        num(set.fixed_auc.times[0]),
        num(set.fixed_auc.times[set.fixed_auc.len() - 1]),
        set.fixed_auc.total(),
        set.marginal_auc.total()
    ));
    text.push_str("Fixed prediction held at:");
    for (name, value) in &set.fixed.conditioning {
        text.push_str(&format!(" {name}={value}"));
    }
    text.push('\n');
    text
}

/// Writes every table, `summary.txt` and `figures.toml` into `out_dir`.
/// Returns the paths written.
pub fn write_report(
    results: &AnalysisResults,
    style: &PlotStyle,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, ReportError> {
    let mut writer = ReportWriter::new(out_dir)?;
    writer.observations(&results.observations, &results.model, style)?;
    writer.inference(&results.summary, &results.anova)?;
    writer.diagnostics(&results.diagnostics, &results.model)?;
    for curve in &results.partials {
        writer.curve(&format!("partial_{}", curve.x_name), curve)?;
    }
    writer.predictions(&results.predictions)?;
    writer.text(SUMMARY_FILE, &summary_text(results))?;
    writer.finish(style)
}

/// Writes only the fixed and marginal predictions with their AUC series.
pub fn write_predictions(
    set: &PredictionSet,
    style: &PlotStyle,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, ReportError> {
    let mut writer = ReportWriter::new(out_dir)?;
    writer.predictions(set)?;
    writer.finish(style)
}
