use clap::{Args, Parser, Subcommand};
use hifgam::data::Covariate;
use hifgam::model::{FittedModel, ModelSpec, TermSpec};
use hifgam::pipeline::{
    AnalysisConfig, PipelineError, analyze_fitted, fit_from_path, predict_curves,
};
use hifgam::predict::GridSpec;
use hifgam::report::{write_predictions, write_report};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(
    name = "hifgam",
    version,
    about = "Fit additive models of the heat increment of feeding",
    long_about = "Fits oxygen consumption after feeding with a penalized additive model \
                 (time-by-meal-size smooth, age, sex, pool temperature and a per-animal \
                 random effect), then writes diagnostics, inference tables, predictions \
                 and the cumulative area under the predicted curve."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full analysis on a data file
    #[command(about = "Fit, diagnose, summarise and predict (outputs: tables, summary.txt, figures.toml)")]
    Analyze {
        /// Workbook (first sheet) or delimited text file with animal, exact, oxygen_cons, percentdailytotal, age, sex, pool_temp, kcal
        data: PathBuf,

        /// Directory that receives every output
        #[arg(long, default_value = "hifgam_results")]
        out_dir: PathBuf,

        #[command(flatten)]
        settings: Settings,
    },

    /// Fit the model and save it
    #[command(about = "Fit the additive model (outputs: model.toml)")]
    Fit {
        data: PathBuf,

        /// Where to save the fitted model
        #[arg(long, default_value = "model.toml")]
        out: PathBuf,

        #[command(flatten)]
        settings: Settings,
    },

    /// Predict from a saved model
    #[command(about = "Fixed and marginal predictions with AUC from a saved model")]
    Predict {
        /// Path to a fitted model file (.toml)
        #[arg(long)]
        model: PathBuf,

        #[arg(long, default_value = "hifgam_predictions")]
        out_dir: PathBuf,

        #[command(flatten)]
        settings: Settings,
    },
}

#[derive(Args)]
struct Settings {
    /// TOML analysis configuration. When given, the flags below are ignored.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Basis dimension of the time smooth
    #[arg(long, default_value = "10")]
    k_time: usize,

    /// Basis dimension of the age smooth
    #[arg(long, default_value = "4")]
    k_age: usize,

    /// Basis dimension of the pool temperature smooth
    #[arg(long, default_value = "4")]
    k_temp: usize,

    /// Disable the extra null-space penalties
    #[arg(long)]
    no_select: bool,

    /// Confidence level of the prediction bands
    #[arg(long, default_value = "0.95")]
    level: f64,

    /// First time point of the prediction grid (minutes)
    #[arg(long, default_value = "0")]
    grid_start: f64,

    /// Last time point of the prediction grid (minutes)
    #[arg(long, default_value = "130")]
    grid_end: f64,

    /// Spacing of the prediction grid (minutes)
    #[arg(long, default_value = "1")]
    grid_step: f64,

    /// Hold the fixed prediction at the observed means and modal sex
    #[arg(long)]
    typical: bool,
}

impl Settings {
    fn resolve(&self) -> Result<AnalysisConfig, PipelineError> {
        if let Some(path) = &self.config {
            println!("Reading configuration from: {}", path.display());
            return AnalysisConfig::from_toml_file(path);
        }
        let model = ModelSpec {
            select: !self.no_select,
            terms: vec![
                TermSpec::Smooth {
                    covariate: Covariate::Time,
                    by: Some(Covariate::Proportion),
                    k: self.k_time,
                },
                TermSpec::Smooth {
                    covariate: Covariate::Age,
                    by: None,
                    k: self.k_age,
                },
                TermSpec::Sex,
                TermSpec::Smooth {
                    covariate: Covariate::PoolTemp,
                    by: None,
                    k: self.k_temp,
                },
                TermSpec::RandomEffect,
            ],
            ..ModelSpec::default()
        };
        Ok(AnalysisConfig {
            confidence_level: self.level,
            typical_condition: self.typical,
            model,
            grid: GridSpec::Range {
                start: self.grid_start,
                end: self.grid_end,
                step: self.grid_step,
            },
            ..AnalysisConfig::default()
        })
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Analyze {
            data,
            out_dir,
            settings,
        } => analyze_command(&data, &out_dir, &settings),
        Commands::Fit {
            data,
            out,
            settings,
        } => fit_command(&data, &out, &settings),
        Commands::Predict {
            model,
            out_dir,
            settings,
        } => predict_command(&model, &out_dir, &settings),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn analyze_command(
    data: &Path,
    out_dir: &Path,
    settings: &Settings,
) -> Result<(), PipelineError> {
    let config = settings.resolve()?;
    println!("Loading data from: {}", data.display());
    let (observations, model) = fit_from_path(data, &config)?;
    println!(
        "Fitted {} coefficients to {} observations (edf {:.2})",
        model.layout.total_coeffs,
        model.n_obs(),
        model.total_edf()
    );

    let results = analyze_fitted(observations, model, &config)?;
    println!("{}", results.summary);
    if results.diagnostics.has_issues() {
        println!(
            "Diagnostics raised {} warning(s); see the log and basis_checks.tsv.",
            results.diagnostics.warnings().len()
        );
    }

    let model_path = out_dir.join("model.toml");
    let written = write_report(&results, &config.style, out_dir)?;
    results.model.save(&model_path)?;
    println!(
        "Wrote {} files and the fitted model to: {}",
        written.len(),
        out_dir.display()
    );
    Ok(())
}

fn fit_command(data: &Path, out: &Path, settings: &Settings) -> Result<(), PipelineError> {
    let config = settings.resolve()?;
    println!("Loading data from: {}", data.display());
    let (_, model) = fit_from_path(data, &config)?;
    model.save(out)?;
    println!("Model saved to: {}", out.display());
    Ok(())
}

fn predict_command(
    model_path: &Path,
    out_dir: &Path,
    settings: &Settings,
) -> Result<(), PipelineError> {
    let config = settings.resolve()?;
    println!("Loading model from: {}", model_path.display());
    let model = FittedModel::load(model_path)?;

    let set = predict_curves(&model, &config)?;
    println!(
        "AUC: fixed = {:.4}, marginal = {:.4}",
        set.fixed_auc.total(),
        set.marginal_auc.total()
    );
    let written = write_predictions(&set, &config.style, out_dir)?;
    println!("Wrote {} files to: {}", written.len(), out_dir.display());
    Ok(())
}
