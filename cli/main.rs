#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use creditrisk::artifact::ModelBundle;
use creditrisk::config::TrainingConfig;
use creditrisk::data::load_prediction_data;
use creditrisk::ensemble::progress::{FitProgressObserver, FitProgressStage, StageEvent};
use creditrisk::report::write_predictions;
use creditrisk::service::ServiceHandle;
use creditrisk::train::{TrainingPaths, fit_base_estimators, run_training};

#[derive(Args)]
pub struct TuningArgs {
    /// TOML training configuration; omitted settings keep their defaults
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Master seed for the holdout split and the stacking folds
    #[arg(long)]
    pub seed: Option<u64>,

    /// Worker threads for forest building (0 = all cores)
    #[arg(long = "n-jobs", value_name = "N")]
    pub n_jobs: Option<usize>,
}

#[derive(Args)]
pub struct FitBaseArgs {
    /// Labelled training dataset (.csv, or .tsv for tab separated)
    #[arg(long, value_name = "PATH")]
    pub train: PathBuf,

    /// Directory receiving the three base estimator files
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

#[derive(Args)]
pub struct TrainArgs {
    /// Labelled training dataset (.csv, or .tsv for tab separated)
    #[arg(long, value_name = "PATH")]
    pub train: PathBuf,

    /// Unlabelled test dataset to score after training
    #[arg(long, value_name = "PATH")]
    pub test: Option<PathBuf>,

    /// Directory written by `fit-base`; base estimators are fitted here when omitted
    #[arg(long = "base-dir", value_name = "DIR")]
    pub base_dir: Option<PathBuf>,

    /// Output directory for the model bundle and reports
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,

    /// Number of stratified folds for the stacking cross-validation
    #[arg(long)]
    pub folds: Option<usize>,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Model bundle directory
    #[arg(long, value_name = "DIR")]
    pub model: PathBuf,

    /// JSON request file; reads standard input when omitted
    #[arg(long, value_name = "FILE")]
    pub input: Option<PathBuf>,
}

#[derive(Args)]
pub struct InferArgs {
    /// Dataset to score (.csv, or .tsv for tab separated)
    pub data: PathBuf,

    /// Model bundle directory
    #[arg(long, value_name = "DIR")]
    pub model: PathBuf,

    /// Output table with id and probability columns
    #[arg(long, value_name = "FILE", default_value = "predictions.tsv")]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct HealthArgs {
    /// Model bundle directory
    #[arg(long, value_name = "DIR")]
    pub model: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "creditrisk",
    version,
    about = "Credit default risk: preprocessing pipeline and stacking ensemble"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the base estimators from configured hyperparameters
    #[command(name = "fit-base")]
    FitBase(FitBaseArgs),

    /// Fit preprocessing and the stacking ensemble, write the bundle and reports
    Train(TrainArgs),

    /// Score one JSON request, answering with the serving contract
    Predict(PredictArgs),

    /// Score a dataset with a trained bundle
    Infer(InferArgs),

    /// Report whether a bundle loads, and its version
    Health(HealthArgs),
}

/// Renders fit stages as terminal progress bars.
#[derive(Default)]
struct TerminalProgress {
    bar: Option<ProgressBar>,
}

impl TerminalProgress {
    fn start(&mut self, stage: FitProgressStage, total: usize) {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(total as u64), draw_target);
        bar.set_style(
            ProgressStyle::with_template(
                "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {prefix} ({eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        bar.set_prefix(stage.unit());
        bar.set_message(stage.describe());
        self.bar = Some(bar);
    }
}

impl FitProgressObserver for TerminalProgress {
    fn on_event(&mut self, stage: FitProgressStage, event: StageEvent) {
        match event {
            StageEvent::Started { total } => self.start(stage, total),
            StageEvent::Advanced { completed } => {
                if let Some(bar) = &self.bar {
                    bar.set_position(completed as u64);
                }
            }
            StageEvent::Finished { completed } => {
                if let Some(bar) = self.bar.take() {
                    bar.finish_and_clear();
                }
                println!("Finished: {stage} ({completed} {})", stage.unit());
            }
        }
    }
}

fn load_config(
    tuning: &TuningArgs,
    folds: Option<usize>,
) -> Result<TrainingConfig, Box<dyn std::error::Error>> {
    let config = TrainingConfig::load_or_default(tuning.config.as_deref())?
        .with_overrides(tuning.seed, folds, tuning.n_jobs)?;
    Ok(config)
}

fn run_fit_base(args: FitBaseArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args.tuning, None)?;
    println!("Fitting base estimators from: {}", args.train.display());
    let estimators =
        fit_base_estimators(&args.train, &args.out, &config, &mut TerminalProgress::default())?;
    println!(
        "Saved {} base estimators to: {}",
        estimators.len(),
        args.out.display()
    );
    Ok(())
}

fn run_train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args.tuning, args.folds)?;
    println!("Loading training data from: {}", args.train.display());
    let paths = TrainingPaths {
        train: &args.train,
        test: args.test.as_deref(),
        base_dir: args.base_dir.as_deref(),
        out_dir: &args.out,
    };
    let outcome = run_training(&paths, &config, &mut TerminalProgress::default())?;

    for (split, m) in [
        ("train", &outcome.train_metrics),
        ("validation", &outcome.validation_metrics),
    ] {
        println!(
            "{split:>10}: AUC {:.4}  balanced accuracy {:.4}  precision {:.4}  recall {:.4}  F1 {:.4}",
            m.roc_auc, m.balanced_accuracy, m.precision, m.recall, m.f1
        );
    }
    if let Some(rows) = outcome.test_rows {
        println!("Scored {rows} test rows");
    }
    println!(
        "Model bundle '{}' saved to: {}",
        outcome.bundle.manifest.model_version,
        args.out.display()
    );
    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let body = match &args.input {
        Some(path) => std::fs::read_to_string(path)?,
        None => std::io::read_to_string(std::io::stdin())?,
    };
    let handle = ServiceHandle::load(&args.model);
    let (status, response) = handle.respond(&body);
    println!("{response}");
    if status != 200 {
        return Err(format!("request failed with status {status}").into());
    }
    Ok(())
}

fn run_infer(args: InferArgs) -> Result<(), Box<dyn std::error::Error>> {
    let bundle = ModelBundle::load(&args.model)?;
    println!("Loading data to score from: {}", args.data.display());
    let data = load_prediction_data(&args.data)?;
    let probabilities = bundle.predict(&data.features)?;
    write_predictions(&args.output, &data.ids, probabilities.view())?;
    println!(
        "Predictions for {} rows saved to: {}",
        data.ids.len(),
        args.output.display()
    );
    Ok(())
}

fn run_health(args: HealthArgs) -> Result<(), Box<dyn std::error::Error>> {
    let health = ServiceHandle::load(&args.model).health();
    println!("{}", serde_json::to_string(&health)?);
    if health.status != "ok" {
        return Err("model bundle is unavailable".into());
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::FitBase(args)) => run_fit_base(args),
        Some(Commands::Train(args)) => run_train(args),
        Some(Commands::Predict(args)) => run_predict(args),
        Some(Commands::Infer(args)) => run_infer(args),
        Some(Commands::Health(args)) => run_health(args),
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
